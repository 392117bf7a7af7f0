//! Axum HTTP handlers.

pub mod catalog;
pub mod library;
pub mod providers;
pub mod series;

use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use gateway_core::VERSION;
use serde_json::json;

use crate::error::ApiError;
use crate::models::CONFIRM_ACTION;

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok", "version": VERSION})))
}

pub async fn version() -> impl IntoResponse {
    Json(json!({"version": VERSION}))
}

pub async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({"message": "resource not found"})))
}

/// Bulk deletes must carry `X-Confirm-Action: 1`.
pub(crate) fn confirmed(headers: &HeaderMap) -> Result<(), ApiError> {
    match headers.get(CONFIRM_ACTION).and_then(|v| v.to_str().ok()) {
        Some("1") => Ok(()),
        _ => Err(ApiError::Unconfirmed),
    }
}

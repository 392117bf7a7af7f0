//! Mapping of library errors onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gateway_core::expand::ExpandError;
use gateway_core::pattern::PatternError;
use gateway_core::query::QueryError;
use gateway_core::store::StoreError;
use gateway_core::ErrorKind;
use gateway_poller::PollerError;
use serde_json::json;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Expand(#[from] ExpandError),
    #[error(transparent)]
    Poller(#[from] PollerError),
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error("unsupported connector type {0:?}")]
    UnsupportedConnector(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("invalid request body: {0}")]
    InvalidBody(#[from] serde_json::Error),
    #[error("{0} not found")]
    NotFound(String),
    #[error("provider {0} is not running")]
    NotRunning(Uuid),
    #[error("destructive request requires the X-Confirm-Action header")]
    Unconfirmed,
}

pub type ApiResult<T> = Result<T, ApiError>;

fn kind_status(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Configuration
        | ErrorKind::Identity
        | ErrorKind::Referential
        | ErrorKind::Template => StatusCode::BAD_REQUEST,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Resolution => StatusCode::NOT_FOUND,
        ErrorKind::TransientBackend | ErrorKind::ShapeMismatch | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Store(e) => kind_status(e.kind()),
            ApiError::Query(e) => kind_status(e.kind()),
            ApiError::Expand(e) => kind_status(e.kind()),
            ApiError::Poller(e) => kind_status(e.kind()),
            ApiError::Pattern(e) => kind_status(e.kind()),
            ApiError::UnsupportedConnector(_)
            | ApiError::InvalidParameter(_)
            | ApiError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::NotRunning(_) => StatusCode::CONFLICT,
            ApiError::Unconfirmed => StatusCode::FORBIDDEN,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(json!({"message": self.to_string()}))).into_response()
    }
}

//! `/api/v1/providers/`: provider CRUD. Every change is reconciled with the
//! poller so the running workers follow the stored definitions.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use gateway_core::model::{Entity, Provider};
use gateway_core::store::ListQuery;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use super::confirmed;
use super::library::{location, new_entity, patched};
use crate::error::{ApiError, ApiResult};
use crate::models::{CreateParams, ListParams, ProviderView, TOTAL_RECORDS};
use crate::AppState;

fn check_connector(state: &AppState, provider: &Provider) -> ApiResult<()> {
    let kind = &provider.connector.kind;
    if state.poller.registry().contains(kind) {
        Ok(())
    } else {
        Err(ApiError::UnsupportedConnector(kind.clone()))
    }
}

fn view(state: &AppState, provider: Provider) -> ProviderView {
    let status = state.poller.status(provider.item.id);
    ProviderView::new(provider, status)
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> ApiResult<Response> {
    let (providers, total) = state.library.list::<Provider>(&params.query()?).await?;
    let views: Vec<ProviderView> = providers.into_iter().map(|p| view(&state, p)).collect();
    Ok(([(TOTAL_RECORDS, total.to_string())], Json(views)).into_response())
}

pub async fn show(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> ApiResult<Json<ProviderView>> {
    let provider: Provider = state.library.get_by(&key).await?;
    Ok(Json(view(&state, provider)))
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CreateParams>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let provider: Provider = new_entity(&state.library, params.inherit, body).await?;
    check_connector(&state, &provider)?;
    let saved = state.library.save(provider).await?;
    info!(provider = %saved.item.name, id = %saved.item.id, "provider created");

    if let Err(e) = state.poller.start_provider(&saved) {
        warn!(provider = %saved.item.name, error = %e, "unable to start provider");
    }
    state.searcher.apply_priorities();

    let id = saved.item.id;
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location(Provider::KIND, id))],
        Json(view(&state, saved)),
    )
        .into_response())
}

async fn replace(state: &AppState, provider: Provider) -> ApiResult<ProviderView> {
    check_connector(state, &provider)?;
    let saved = state.library.save(provider).await?;
    info!(provider = %saved.item.name, id = %saved.item.id, "provider updated, restarting");
    state.poller.stop_provider(saved.item.id, true).await?;
    Ok(view(state, saved))
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(mut provider): Json<Provider>,
) -> ApiResult<Json<ProviderView>> {
    state.library.get::<Provider>(id).await?;
    provider.item.id = id;
    Ok(Json(replace(&state, provider).await?))
}

pub async fn patch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<Value>,
) -> ApiResult<Json<ProviderView>> {
    let provider: Provider = patched(&state.library, id, body).await?;
    Ok(Json(replace(&state, provider).await?))
}

pub async fn delete(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    state.library.delete::<Provider>(id).await?;
    state.poller.stop_provider(id, false).await?;
    info!(%id, "provider deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_all(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<StatusCode> {
    confirmed(&headers)?;
    let providers: Vec<Provider> = state.library.all().await?;
    state.library.delete_matching::<Provider>(&ListQuery::new()).await?;
    for provider in &providers {
        state.poller.stop_provider(provider.item.id, false).await?;
    }
    info!(deleted = providers.len(), "providers deleted");
    Ok(StatusCode::NO_CONTENT)
}

// ------------------------------------------------------------------ //
//  Refresh                                                            //
// ------------------------------------------------------------------ //

pub async fn refresh(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    state.library.get::<Provider>(id).await?;
    if state.poller.refresh_provider(id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotRunning(id))
    }
}

pub async fn refresh_all(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let workers = state.poller.refresh().await;
    (StatusCode::ACCEPTED, Json(json!({"workers": workers})))
}

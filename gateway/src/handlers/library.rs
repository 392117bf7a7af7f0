//! `/api/v1/library/`: CRUD over graphs, collections and groups.
//!
//! Handlers are generic over the entity type; [`routes`] mounts one set per
//! kind.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use gateway_core::model::{merge_into, Collection, Entity, EntityKind, Graph, MetricGroup, SourceGroup};
use gateway_core::store::ListQuery;
use gateway_core::{Attributes, Library};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use super::confirmed;
use crate::error::{ApiError, ApiResult};
use crate::models::{CreateParams, ListParams, ShowParams, TreeRoot, TOTAL_RECORDS};
use crate::AppState;

/// Fields dropped from an inherited item before the body is applied.
const NOT_INHERITED: [&str; 4] = ["id", "created", "modified", "alias"];

pub fn routes<E: Entity>() -> Router<Arc<AppState>> {
    let base = format!("/api/v1/library/{}/", E::KIND.as_str());
    Router::new()
        .route(&base, get(list::<E>).post(create::<E>).delete(delete_all::<E>))
        .route(
            &format!("{base}:id"),
            get(show::<E>).put(update::<E>).patch(patch::<E>).delete(delete::<E>),
        )
}

pub(crate) fn location(kind: EntityKind, id: Uuid) -> String {
    match kind {
        EntityKind::Provider => format!("/api/v1/providers/{id}"),
        _ => format!("/api/v1/library/{kind}/{id}"),
    }
}

/// Applies the top-level keys of `patch` over `doc`.
pub(crate) fn overlay(doc: &mut Value, patch: Value) -> ApiResult<()> {
    match (doc.as_object_mut(), patch) {
        (Some(base), Value::Object(patch)) => {
            merge_into(base, &patch);
            Ok(())
        }
        _ => Err(ApiError::InvalidParameter("request body must be a JSON object".into())),
    }
}

/// Current state of item `id` with `patch` applied, not yet saved.
pub(crate) async fn patched<E: Entity>(library: &Library, id: Uuid, patch: Value) -> ApiResult<E> {
    let current: E = library.get(id).await?;
    let mut doc = serde_json::to_value(&current)?;
    overlay(&mut doc, patch)?;
    let mut entity: E = serde_json::from_value(doc)?;
    entity.item_mut().id = id;
    Ok(entity)
}

/// Decodes a creation body, optionally on top of an existing item.
pub(crate) async fn new_entity<E: Entity>(
    library: &Library,
    inherit: Option<Uuid>,
    body: Value,
) -> ApiResult<E> {
    let mut entity: E = match inherit {
        Some(id) => {
            let base: E = library.get(id).await?;
            let mut doc = serde_json::to_value(&base)?;
            if let Some(fields) = doc.as_object_mut() {
                for field in NOT_INHERITED {
                    fields.remove(field);
                }
            }
            overlay(&mut doc, body)?;
            serde_json::from_value(doc)?
        }
        None => serde_json::from_value(body)?,
    };
    entity.item_mut().id = Uuid::nil();
    Ok(entity)
}

// ------------------------------------------------------------------ //
//  Generic CRUD                                                       //
// ------------------------------------------------------------------ //

pub async fn list<E: Entity>(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> ApiResult<Response> {
    let (items, total) = state.library.list::<E>(&params.query()?).await?;
    Ok(([(TOTAL_RECORDS, total.to_string())], Json(items)).into_response())
}

/// By id, alias or name. `?expand=1` applies the linked template of graphs
/// and collections.
pub async fn show<E: Entity>(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(params): Query<ShowParams>,
) -> ApiResult<Response> {
    let attributes = Attributes::new();
    let body = match E::KIND {
        EntityKind::Graph if params.expand() => {
            serde_json::to_value(state.library.resolve_graph(&key, &attributes).await?)?
        }
        EntityKind::Collection if params.expand() => {
            serde_json::to_value(state.library.resolve_collection(&key, &attributes).await?)?
        }
        _ => serde_json::to_value(state.library.get_by::<E>(&key).await?)?,
    };
    Ok(Json(body).into_response())
}

pub async fn create<E: Entity>(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CreateParams>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let entity: E = new_entity(&state.library, params.inherit, body).await?;
    let saved = state.library.save(entity).await?;
    info!(kind = E::KIND.as_str(), id = %saved.item().id, name = %saved.item().name, "item created");
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location(E::KIND, saved.item().id))],
        Json(saved),
    )
        .into_response())
}

/// Replaces item `id` entirely.
pub async fn update<E: Entity>(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(mut entity): Json<E>,
) -> ApiResult<Json<E>> {
    state.library.get::<E>(id).await?;
    entity.item_mut().id = id;
    Ok(Json(state.library.save(entity).await?))
}

pub async fn patch<E: Entity>(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<Value>,
) -> ApiResult<Json<E>> {
    let entity: E = patched(&state.library, id, body).await?;
    Ok(Json(state.library.save(entity).await?))
}

pub async fn delete<E: Entity>(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    state.library.delete::<E>(id).await?;
    info!(kind = E::KIND.as_str(), %id, "item deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_all<E: Entity>(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<StatusCode> {
    confirmed(&headers)?;
    let deleted = state.library.delete_matching::<E>(&ListQuery::new()).await?;
    info!(kind = E::KIND.as_str(), deleted, "items deleted");
    Ok(StatusCode::NO_CONTENT)
}

// ------------------------------------------------------------------ //
//  Summary / tree                                                     //
// ------------------------------------------------------------------ //

pub async fn summary(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let all = ListQuery::new();
    let library = &state.library;
    Ok(Json(json!({
        "collections": library.count::<Collection>(&all).await?,
        "graphs": library.count::<Graph>(&all).await?,
        "sourcegroups": library.count::<SourceGroup>(&all).await?,
        "metricgroups": library.count::<MetricGroup>(&all).await?,
    })))
}

pub async fn collection_tree(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TreeRoot>,
) -> ApiResult<Response> {
    Ok(Json(state.library.collection_tree(params.parent).await?).into_response())
}

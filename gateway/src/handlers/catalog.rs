//! `/api/v1/catalog/`: read-only view of the merged catalogs.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use gateway_core::pattern::Pattern;

use crate::error::{ApiError, ApiResult};
use crate::models::{
    CatalogListParams, CatalogTree, MetricView, OriginView, SourceView, TreeParams, TOTAL_RECORDS,
};
use crate::AppState;

fn unknown_type(kind: &str) -> ApiError {
    ApiError::NotFound(format!("catalog type {kind:?}"))
}

/// Counts of origins, sources and metrics, or the whole tree with `?tree=1`.
pub async fn summary(State(state): State<Arc<AppState>>, Query(params): Query<TreeParams>) -> Response {
    if !params.enabled() {
        return Json(state.searcher.counts()).into_response();
    }

    let mut tree = CatalogTree::new();
    for metric in state.searcher.metrics("", "", "", -1) {
        tree.entry(metric.origin)
            .or_default()
            .entry(metric.source)
            .or_default()
            .push(metric.name);
    }
    for metrics in tree.values_mut().flat_map(|sources| sources.values_mut()) {
        metrics.sort();
        metrics.dedup();
    }
    Json(tree).into_response()
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    Query(params): Query<CatalogListParams>,
) -> ApiResult<Response> {
    let origin = params.origin.as_deref().unwrap_or_default();
    let source = params.source.as_deref().unwrap_or_default();

    let names: BTreeSet<String> = match kind.as_str() {
        "origins" => state.searcher.origins("", -1).into_iter().map(|e| e.name).collect(),
        "sources" => state.searcher.sources(origin, "", -1).into_iter().map(|e| e.name).collect(),
        "metrics" => state
            .searcher
            .metrics(origin, source, "", -1)
            .into_iter()
            .map(|e| e.name)
            .collect(),
        _ => return Err(unknown_type(&kind)),
    };

    let filter = params
        .filter
        .as_deref()
        .filter(|f| !f.is_empty())
        .map(Pattern::parse)
        .transpose()?;
    let matched: Vec<String> = names
        .into_iter()
        .filter(|name| filter.as_ref().map_or(true, |p| p.is_match(name)))
        .collect();

    let total = matched.len();
    let limit = if params.limit == 0 { usize::MAX } else { params.limit };
    let page: Vec<String> = matched.into_iter().skip(params.offset).take(limit).collect();

    Ok(([(TOTAL_RECORDS, total.to_string())], Json(page)).into_response())
}

/// One catalog entry with the entries it appears under.
pub async fn show(
    State(state): State<Arc<AppState>>,
    Path((kind, name)): Path<(String, String)>,
) -> ApiResult<Response> {
    let name = name.trim_start_matches('/');
    let missing = || ApiError::NotFound(format!("{kind} entry {name:?}"));

    match kind.as_str() {
        "origins" => {
            let providers: Vec<String> = state
                .searcher
                .catalogs()
                .iter()
                .filter(|c| c.origin(name).is_some())
                .map(|c| c.name().to_string())
                .collect();
            if providers.is_empty() {
                return Err(missing());
            }
            Ok(Json(OriginView { name: name.to_string(), providers }).into_response())
        }
        "sources" => {
            let origins: BTreeSet<String> =
                state.searcher.sources("", name, -1).into_iter().map(|e| e.origin).collect();
            if origins.is_empty() {
                return Err(missing());
            }
            Ok(Json(SourceView { name: name.to_string(), origins: origins.into_iter().collect() }).into_response())
        }
        "metrics" => {
            let entries = state.searcher.metrics("", "", name, -1);
            if entries.is_empty() {
                return Err(missing());
            }
            let origins: BTreeSet<&str> = entries.iter().map(|e| e.origin.as_str()).collect();
            let sources: BTreeSet<&str> = entries.iter().map(|e| e.source.as_str()).collect();
            Ok(Json(MetricView {
                name: name.to_string(),
                origins: origins.into_iter().map(str::to_string).collect(),
                sources: sources.into_iter().map(str::to_string).collect(),
            })
            .into_response())
        }
        _ => Err(unknown_type(&kind)),
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{read_json, send, start_provider, state};
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn summary_counts_and_tree() {
        let state = state();
        start_provider(&state, "prov").await;

        let body = read_json(send(&state, "GET", "/api/v1/catalog/", None).await).await;
        assert_eq!(body, json!({"origins": 1, "sources": 2, "metrics": 4}));

        let body = read_json(send(&state, "GET", "/api/v1/catalog/?tree=1", None).await).await;
        assert_eq!(
            body,
            json!({"prov": {
                "web01": ["cpu.user", "mem.used"],
                "web02": ["cpu.user", "mem.used"],
            }})
        );
        state.poller.shutdown().await;
    }

    #[tokio::test]
    async fn list_pages_and_filters() {
        let state = state();
        start_provider(&state, "prov").await;

        let response = send(&state, "GET", "/api/v1/catalog/sources/?limit=1", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-total-records"], "2");
        assert_eq!(read_json(response).await, json!(["web01"]));

        let response = send(&state, "GET", "/api/v1/catalog/sources/?filter=glob:*02", None).await;
        assert_eq!(response.headers()["x-total-records"], "1");
        assert_eq!(read_json(response).await, json!(["web02"]));

        let response = send(&state, "GET", "/api/v1/catalog/metrics/?source=web02&offset=1", None).await;
        assert_eq!(response.headers()["x-total-records"], "2");
        assert_eq!(read_json(response).await, json!(["mem.used"]));

        let response = send(&state, "GET", "/api/v1/catalog/metrics/?filter=regexp:(", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(&state, "GET", "/api/v1/catalog/hosts/", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        state.poller.shutdown().await;
    }

    #[tokio::test]
    async fn show_cross_references() {
        let state = state();
        start_provider(&state, "prov").await;

        let body = read_json(send(&state, "GET", "/api/v1/catalog/origins/prov", None).await).await;
        assert_eq!(body, json!({"name": "prov", "providers": ["prov"]}));

        let body = read_json(send(&state, "GET", "/api/v1/catalog/metrics/cpu.user", None).await).await;
        assert_eq!(
            body,
            json!({"name": "cpu.user", "origins": ["prov"], "sources": ["web01", "web02"]})
        );

        let response = send(&state, "GET", "/api/v1/catalog/sources/db01", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        state.poller.shutdown().await;
    }
}

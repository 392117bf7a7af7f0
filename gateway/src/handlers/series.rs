//! Group expansion and the points query.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use gateway_core::model::SeriesDef;
use gateway_core::{PointsRequest, PointsResponse};
use tracing::warn;

use crate::error::ApiResult;
use crate::AppState;

/// Expands each series of the body on its own. A series whose groups cannot
/// be resolved expands to nothing.
pub async fn expand(
    State(state): State<Arc<AppState>>,
    Json(series): Json<Vec<SeriesDef>>,
) -> Json<Vec<Vec<SeriesDef>>> {
    let mut out = Vec::with_capacity(series.len());
    for s in &series {
        match state.engine.expander().expand(s, false).await {
            Ok(expanded) => out.push(expanded),
            Err(e) => {
                warn!(source = %s.source, metric = %s.metric, error = %e, "unable to expand series");
                out.push(Vec::new());
            }
        }
    }
    Json(out)
}

pub async fn points(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PointsRequest>,
) -> ApiResult<Json<PointsResponse>> {
    Ok(Json(state.engine.points(request).await?))
}

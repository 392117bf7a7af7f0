//! HTTP request/response models for the public REST API.

use std::collections::BTreeMap;

use gateway_core::model::Provider;
use gateway_core::store::ListQuery;
use gateway_poller::{ProviderStatus, WorkerStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

/// Response header carrying the number of matches before paging.
pub const TOTAL_RECORDS: &str = "x-total-records";

/// Header that must be `1` on bulk deletes.
pub const CONFIRM_ACTION: &str = "x-confirm-action";

// ------------------------------------------------------------------ //
//  Catalog                                                            //
// ------------------------------------------------------------------ //

#[derive(Debug, Default, Deserialize)]
pub struct TreeParams {
    #[serde(default)]
    pub tree: Option<String>,
}

impl TreeParams {
    pub fn enabled(&self) -> bool {
        matches!(self.tree.as_deref(), Some("1" | "true"))
    }
}

/// `origin → source → [metrics]`.
pub type CatalogTree = BTreeMap<String, BTreeMap<String, Vec<String>>>;

#[derive(Debug, Default, Deserialize)]
pub struct CatalogListParams {
    #[serde(default)]
    pub filter: Option<String>,
    /// Restricts sources and metrics to one origin.
    #[serde(default)]
    pub origin: Option<String>,
    /// Restricts metrics to one source.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub offset: usize,
    /// 0 returns every match.
    #[serde(default)]
    pub limit: usize,
}

#[derive(Debug, Serialize)]
pub struct OriginView {
    pub name: String,
    pub providers: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SourceView {
    pub name: String,
    pub origins: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct MetricView {
    pub name: String,
    pub origins: Vec<String>,
    pub sources: Vec<String>,
}

// ------------------------------------------------------------------ //
//  Library / providers                                                //
// ------------------------------------------------------------------ //

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    /// Name pattern (`glob:`, `regexp:` or literal).
    #[serde(default)]
    pub filter: Option<String>,
    /// `raw`, `template` or `all` (graphs and collections).
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub limit: usize,
}

impl ListParams {
    pub fn query(&self) -> ApiResult<ListQuery> {
        let mut query = ListQuery::new().page(self.offset, (self.limit > 0).then_some(self.limit));
        if let Some(filter) = self.filter.as_deref().filter(|f| !f.is_empty()) {
            query = query.filter("name", filter);
        }
        match self.kind.as_deref() {
            None | Some("" | "all") => {}
            Some("raw") => query = query.filter("template", "false"),
            Some("template") => query = query.filter("template", "true"),
            Some(other) => return Err(ApiError::InvalidParameter(format!("kind {other:?}"))),
        }
        if let Some(link) = self.link.as_deref().filter(|l| !l.is_empty()) {
            query = query.filter("link", link);
        }
        if let Some(parent) = self.parent.as_deref().filter(|p| !p.is_empty()) {
            query = query.filter("parent", parent);
        }
        if let Some(sort) = self.sort.as_deref().filter(|s| !s.is_empty()) {
            query = query.sort(sort);
        }
        Ok(query)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ShowParams {
    #[serde(default)]
    pub expand: Option<String>,
}

impl ShowParams {
    pub fn expand(&self) -> bool {
        matches!(self.expand.as_deref(), Some("1" | "true"))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateParams {
    /// Id of an item to copy before applying the body.
    #[serde(default)]
    pub inherit: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TreeRoot {
    #[serde(default)]
    pub parent: Option<Uuid>,
}

/// A provider with the state of its worker.
#[derive(Debug, Serialize)]
pub struct ProviderView {
    #[serde(flatten)]
    pub provider: Provider,
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_error: Option<String>,
}

impl ProviderView {
    pub fn new(provider: Provider, status: Option<ProviderStatus>) -> Self {
        let (state, worker, worker_error) = match status {
            Some(ProviderStatus::Running(s)) => ("running", Some(s), None),
            Some(ProviderStatus::Disabled) => ("disabled", None, None),
            Some(ProviderStatus::Failed(e)) => ("failed", None, Some(e)),
            None => ("stopped", None, None),
        };
        Self { provider, state, worker, worker_error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_params_build_store_query() {
        let params = ListParams {
            filter: Some("glob:web*".into()),
            kind: Some("template".into()),
            sort: Some("-modified".into()),
            offset: 5,
            limit: 10,
            ..Default::default()
        };
        let query = params.query().unwrap();
        assert_eq!(
            query.filters,
            vec![("name".to_string(), "glob:web*".to_string()), ("template".to_string(), "true".to_string())]
        );
        assert_eq!(query.sort.as_deref(), Some("-modified"));
        assert_eq!((query.offset, query.limit), (5, Some(10)));

        let unbounded = ListParams::default().query().unwrap();
        assert_eq!(unbounded.limit, None);

        let bad = ListParams { kind: Some("other".into()), ..Default::default() };
        assert!(matches!(bad.query(), Err(ApiError::InvalidParameter(_))));
    }
}

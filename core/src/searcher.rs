//! Cross-catalog search with priority-ordered merging.
//!
//! Catalogs are kept sorted by descending priority, ties in registration
//! order. When several catalogs hold the same key, the first one in that
//! order wins and the others are hidden.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::catalog::{Catalog, Counts, MetricEntry, OriginEntry, SourceEntry};

#[derive(Debug, Default)]
pub struct Searcher {
    catalogs: RwLock<Vec<Arc<Catalog>>>,
}

impl Searcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `catalog` after every catalog of equal or higher priority.
    pub fn register(&self, catalog: Arc<Catalog>) {
        let mut catalogs = self.catalogs.write();
        if catalogs.iter().any(|c| Arc::ptr_eq(c, &catalog)) {
            return;
        }
        let priority = catalog.priority();
        let at = catalogs
            .iter()
            .position(|c| c.priority() < priority)
            .unwrap_or(catalogs.len());
        catalogs.insert(at, catalog);
    }

    pub fn unregister(&self, catalog: &Arc<Catalog>) -> bool {
        let mut catalogs = self.catalogs.write();
        let before = catalogs.len();
        catalogs.retain(|c| !Arc::ptr_eq(c, catalog));
        catalogs.len() != before
    }

    /// Re-sorts catalogs after priorities changed. The sort is stable, so
    /// registration order still breaks ties.
    pub fn apply_priorities(&self) {
        self.catalogs.write().sort_by_key(|c| std::cmp::Reverse(c.priority()));
    }

    /// Snapshot of the registered catalogs in search order.
    pub fn catalogs(&self) -> Vec<Arc<Catalog>> {
        self.catalogs.read().clone()
    }

    pub fn catalog(&self, name: &str) -> Option<Arc<Catalog>> {
        self.catalogs.read().iter().find(|c| c.name() == name).cloned()
    }

    pub fn origins(&self, name: &str, limit: i64) -> Vec<OriginEntry> {
        merge(&self.catalogs(), limit, |c, l| c.find_origins(name, l), |e| e.name.clone())
    }

    pub fn sources(&self, origin: &str, name: &str, limit: i64) -> Vec<SourceEntry> {
        merge(
            &self.catalogs(),
            limit,
            |c, l| c.find_sources(origin, name, l),
            |e| (e.origin.clone(), e.name.clone()),
        )
    }

    pub fn metrics(&self, origin: &str, source: &str, name: &str, limit: i64) -> Vec<MetricEntry> {
        merge(
            &self.catalogs(),
            limit,
            |c, l| c.find_metrics(origin, source, name, l),
            |e| (e.origin.clone(), e.source.clone(), e.name.clone()),
        )
    }

    /// Distinct origins, sources and metrics across all catalogs.
    pub fn counts(&self) -> Counts {
        Counts {
            origins: self.origins("", -1).len(),
            sources: self.sources("", "", -1).len(),
            metrics: self.metrics("", "", "", -1).len(),
        }
    }
}

fn merge<T, K, F, G>(catalogs: &[Arc<Catalog>], limit: i64, find: F, key: G) -> Vec<T>
where
    K: std::hash::Hash + Eq,
    F: Fn(&Catalog, i64) -> Vec<T>,
    G: Fn(&T) -> K,
{
    // A single best match only needs one hit from the first catalog that has
    // any; otherwise duplicates may hide entries, so fetch everything.
    let per_catalog = if limit == 1 { 1 } else { -1 };
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for catalog in catalogs {
        for entry in find(catalog, per_catalog) {
            if limit >= 0 && out.len() as i64 >= limit {
                return out;
            }
            if seen.insert(key(&entry)) {
                out.push(entry);
            }
        }
    }
    out
}

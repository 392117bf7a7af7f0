//! Per-provider in-memory index of origin → source → metric.
//!
//! Each catalog owns its tree behind one lock; lookups clone what they need
//! while holding it, so readers never observe a half-inserted node. Children
//! refer to their parents by key, which is how search results are
//! materialized with both user-facing and original names.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;

use crate::connector::{Connector, QueryMetric};
use crate::record::{Attributes, Record};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog state I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("catalog state is malformed: {0}")]
    Json(#[from] serde_json::Error),
}

// ------------------------------------------------------------------ //
//  Tree                                                               //
// ------------------------------------------------------------------ //

#[derive(Default)]
struct Tree {
    origins: BTreeMap<String, OriginNode>,
    generation: u64,
    last_updated: Option<DateTime<Utc>>,
}

struct OriginNode {
    original_name: String,
    sources: BTreeMap<String, SourceNode>,
}

struct SourceNode {
    original_name: String,
    origin: String,
    metrics: BTreeMap<String, MetricNode>,
}

struct MetricNode {
    original_name: String,
    origin: String,
    source: String,
    attributes: Attributes,
    generation: u64,
}

// ------------------------------------------------------------------ //
//  Snapshots                                                          //
// ------------------------------------------------------------------ //

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OriginEntry {
    pub catalog: String,
    pub name: String,
    pub original_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceEntry {
    pub catalog: String,
    pub origin: String,
    pub name: String,
    pub original_name: String,
}

/// A metric as seen by one catalog, with the connector that serves it.
#[derive(Clone)]
pub struct MetricEntry {
    pub catalog: String,
    pub origin: String,
    pub source: String,
    pub name: String,
    pub original_origin: String,
    pub original_source: String,
    pub original_name: String,
    pub attributes: Attributes,
    pub connector: Arc<dyn Connector>,
}

impl MetricEntry {
    /// Backend-addressable form used in points queries.
    pub fn query_metric(&self) -> QueryMetric {
        QueryMetric {
            origin: self.original_origin.clone(),
            source: self.original_source.clone(),
            metric: self.original_name.clone(),
            attributes: self.attributes.clone(),
        }
    }
}

impl fmt::Debug for MetricEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricEntry")
            .field("catalog", &self.catalog)
            .field("origin", &self.origin)
            .field("source", &self.source)
            .field("name", &self.name)
            .field("original_name", &self.original_name)
            .field("connector", &self.connector.name())
            .finish()
    }
}

/// Entity counts of a catalog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub origins: usize,
    pub sources: usize,
    pub metrics: usize,
}

// ------------------------------------------------------------------ //
//  Catalog                                                            //
// ------------------------------------------------------------------ //

pub struct Catalog {
    name: String,
    priority: AtomicI64,
    connector: Arc<dyn Connector>,
    tree: RwLock<Tree>,
}

impl fmt::Debug for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Catalog")
            .field("name", &self.name)
            .field("priority", &self.priority())
            .finish()
    }
}

fn matches_key(filter: &str, key: &str) -> bool {
    filter.is_empty() || filter == key
}

fn limit_reached(len: usize, limit: i64) -> bool {
    limit >= 0 && len as i64 >= limit
}

impl Catalog {
    pub fn new(name: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        Self {
            name: name.into(),
            priority: AtomicI64::new(0),
            connector,
            tree: RwLock::new(Tree::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn priority(&self) -> i64 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, priority: i64) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.tree.read().last_updated
    }

    /// Inserts `record`, creating missing nodes. Original names are recorded
    /// the first time a node is seen; attributes are refreshed every time.
    pub fn insert(&self, record: &Record) {
        let mut tree = self.tree.write();
        let generation = tree.generation;

        let origin = tree
            .origins
            .entry(record.origin.clone())
            .or_insert_with(|| OriginNode {
                original_name: record.original_origin.clone(),
                sources: BTreeMap::new(),
            });
        let source = origin
            .sources
            .entry(record.source.clone())
            .or_insert_with(|| SourceNode {
                original_name: record.original_source.clone(),
                origin: record.origin.clone(),
                metrics: BTreeMap::new(),
            });
        let metric = source
            .metrics
            .entry(record.metric.clone())
            .or_insert_with(|| MetricNode {
                original_name: record.original_metric.clone(),
                origin: record.origin.clone(),
                source: record.source.clone(),
                attributes: Attributes::new(),
                generation,
            });
        metric.attributes = record.attributes.clone();
        metric.generation = generation;

        tree.last_updated = Some(Utc::now());
    }

    /// Starts a new refresh generation and returns its number. Inserts made
    /// from now on are stamped with it.
    pub fn begin_generation(&self) -> u64 {
        let mut tree = self.tree.write();
        tree.generation += 1;
        tree.generation
    }

    /// Removes metrics not seen since `generation` began, then any source or
    /// origin left empty. Returns the number of metrics removed.
    pub fn prune_before(&self, generation: u64) -> usize {
        let mut tree = self.tree.write();
        let mut removed = 0;

        for origin in tree.origins.values_mut() {
            for source in origin.sources.values_mut() {
                let before = source.metrics.len();
                source.metrics.retain(|_, m| m.generation >= generation);
                removed += before - source.metrics.len();
            }
            origin.sources.retain(|_, s| !s.metrics.is_empty());
        }
        tree.origins.retain(|_, o| !o.sources.is_empty());

        removed
    }

    pub fn counts(&self) -> Counts {
        let tree = self.tree.read();
        let mut counts = Counts { origins: tree.origins.len(), ..Default::default() };
        for origin in tree.origins.values() {
            counts.sources += origin.sources.len();
            counts.metrics += origin.sources.values().map(|s| s.metrics.len()).sum::<usize>();
        }
        counts
    }

    // -------------------------------------------------------------- //
    //  Lookups                                                       //
    // -------------------------------------------------------------- //

    pub fn origin(&self, origin: &str) -> Option<OriginEntry> {
        self.find_origins(origin, 1).pop()
    }

    pub fn source(&self, origin: &str, source: &str) -> Option<SourceEntry> {
        let tree = self.tree.read();
        let node = tree.origins.get(origin)?.sources.get(source)?;
        Some(self.source_entry(source, node))
    }

    pub fn metric(&self, origin: &str, source: &str, metric: &str) -> Option<MetricEntry> {
        let tree = self.tree.read();
        let origin_node = tree.origins.get(origin)?;
        let source_node = origin_node.sources.get(source)?;
        let node = source_node.metrics.get(metric)?;
        Some(self.metric_entry(metric, node, origin_node, source_node))
    }

    /// Origins named `name` (empty = any), at most `limit` (-1 = unbounded).
    pub fn find_origins(&self, name: &str, limit: i64) -> Vec<OriginEntry> {
        let tree = self.tree.read();
        let mut out = Vec::new();
        for (key, node) in &tree.origins {
            if limit_reached(out.len(), limit) {
                break;
            }
            if matches_key(name, key) {
                out.push(OriginEntry {
                    catalog: self.name.clone(),
                    name: key.clone(),
                    original_name: node.original_name.clone(),
                });
            }
        }
        out
    }

    /// Sources named `name` under `origin`; empty strings match anything.
    pub fn find_sources(&self, origin: &str, name: &str, limit: i64) -> Vec<SourceEntry> {
        let tree = self.tree.read();
        let mut out = Vec::new();
        for (origin_key, origin_node) in &tree.origins {
            if !matches_key(origin, origin_key) {
                continue;
            }
            for (key, node) in &origin_node.sources {
                if limit_reached(out.len(), limit) {
                    return out;
                }
                if matches_key(name, key) {
                    out.push(self.source_entry(key, node));
                }
            }
        }
        out
    }

    /// Metrics named `name` under `origin`/`source`; empty strings match
    /// anything.
    pub fn find_metrics(&self, origin: &str, source: &str, name: &str, limit: i64) -> Vec<MetricEntry> {
        let tree = self.tree.read();
        let mut out = Vec::new();
        for (origin_key, origin_node) in &tree.origins {
            if !matches_key(origin, origin_key) {
                continue;
            }
            for (source_key, source_node) in &origin_node.sources {
                if !matches_key(source, source_key) {
                    continue;
                }
                for (key, node) in &source_node.metrics {
                    if limit_reached(out.len(), limit) {
                        return out;
                    }
                    if matches_key(name, key) {
                        out.push(self.metric_entry(key, node, origin_node, source_node));
                    }
                }
            }
        }
        out
    }

    fn source_entry(&self, name: &str, node: &SourceNode) -> SourceEntry {
        SourceEntry {
            catalog: self.name.clone(),
            origin: node.origin.clone(),
            name: name.to_string(),
            original_name: node.original_name.clone(),
        }
    }

    fn metric_entry(
        &self,
        name: &str,
        node: &MetricNode,
        origin: &OriginNode,
        source: &SourceNode,
    ) -> MetricEntry {
        MetricEntry {
            catalog: self.name.clone(),
            origin: node.origin.clone(),
            source: node.source.clone(),
            name: name.to_string(),
            original_origin: origin.original_name.clone(),
            original_source: source.original_name.clone(),
            original_name: node.original_name.clone(),
            attributes: node.attributes.clone(),
            connector: Arc::clone(&self.connector),
        }
    }

    // -------------------------------------------------------------- //
    //  State dump / restore                                          //
    // -------------------------------------------------------------- //

    /// Every metric as a record carrying both filtered and original names.
    pub fn records(&self) -> Vec<Record> {
        let tree = self.tree.read();
        let mut out = Vec::new();
        for (origin_key, origin) in &tree.origins {
            for (source_key, source) in &origin.sources {
                for (metric_key, metric) in &source.metrics {
                    out.push(Record {
                        origin: origin_key.clone(),
                        source: source_key.clone(),
                        metric: metric_key.clone(),
                        original_origin: origin.original_name.clone(),
                        original_source: source.original_name.clone(),
                        original_metric: metric.original_name.clone(),
                        attributes: metric.attributes.clone(),
                    });
                }
            }
        }
        out
    }

    pub async fn dump(&self, path: &Path) -> Result<usize, CatalogError> {
        let records = self.records();
        let body = serde_json::to_vec(&records)?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(path, body).await?;
        Ok(records.len())
    }

    /// Loads records written by [`Catalog::dump`]. They carry the current
    /// generation, so the first successful refresh prunes what is gone.
    pub async fn restore(&self, path: &Path) -> Result<usize, CatalogError> {
        let body = tokio::fs::read(path).await?;
        let records: Vec<Record> = serde_json::from_slice(&body)?;
        for record in &records {
            self.insert(record);
        }
        Ok(records.len())
    }
}

//! Expansion of `group:<key>` source and metric references into concrete
//! series, matched against the searcher's current view.

use std::collections::BTreeSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::error::ErrorKind;
use crate::library::Library;
use crate::model::{EntityKind, Graph, MetricGroup, SeriesDef, SourceGroup};
use crate::pattern::{Pattern, PatternError};
use crate::searcher::Searcher;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ExpandError {
    #[error("{kind} group {key:?} not found")]
    MissingGroup { kind: EntityKind, key: String },
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error(transparent)]
    Store(StoreError),
}

impl ExpandError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExpandError::MissingGroup { .. } => ErrorKind::Resolution,
            ExpandError::Pattern(_) => ErrorKind::Configuration,
            ExpandError::Store(e) => e.kind(),
        }
    }
}

impl From<StoreError> for ExpandError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, key } => ExpandError::MissingGroup { kind, key },
            other => ExpandError::Store(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GroupExpander {
    searcher: Arc<Searcher>,
    library: Library,
}

fn matches_any(patterns: &[Pattern], value: &str) -> bool {
    patterns.iter().any(|p| p.is_match(value))
}

impl GroupExpander {
    pub fn new(searcher: Arc<Searcher>, library: Library) -> Self {
        Self { searcher, library }
    }

    /// Expands one series definition. Results are sorted by source then
    /// metric. With `exist_only`, metric candidates are restricted to the
    /// expanded sources and every emitted pair exists in the catalogs.
    pub async fn expand(&self, series: &SeriesDef, exist_only: bool) -> Result<Vec<SeriesDef>, ExpandError> {
        let mut grouped = false;

        let sources: BTreeSet<String> = match series.source_group() {
            Some(key) => {
                grouped = true;
                let group: SourceGroup = self.library.get_by(key).await?;
                let patterns = group.compile()?;
                self.searcher
                    .sources(&series.origin, "", -1)
                    .into_iter()
                    .filter(|s| matches_any(&patterns, &s.name))
                    .map(|s| s.name)
                    .collect()
            }
            None => BTreeSet::from([series.source.clone()]),
        };

        let metrics: BTreeSet<String> = match series.metric_group() {
            Some(key) => {
                grouped = true;
                let group: MetricGroup = self.library.get_by(key).await?;
                let patterns = group.compile()?;
                self.searcher
                    .metrics(&series.origin, "", "", -1)
                    .into_iter()
                    .filter(|m| !exist_only || sources.contains(&m.source))
                    .filter(|m| matches_any(&patterns, &m.name))
                    .map(|m| m.name)
                    .collect()
            }
            None => BTreeSet::from([series.metric.clone()]),
        };

        if !grouped {
            return Ok(vec![series.clone()]);
        }

        let mut out = Vec::with_capacity(sources.len() * metrics.len());
        for source in &sources {
            for metric in &metrics {
                if exist_only && self.searcher.metrics(&series.origin, source, metric, 1).is_empty() {
                    continue;
                }
                out.push(SeriesDef {
                    name: series.name.clone(),
                    origin: series.origin.clone(),
                    source: source.clone(),
                    metric: metric.clone(),
                    options: series.options.clone(),
                });
            }
        }

        if out.len() > 1 || series.name.is_empty() {
            for s in &mut out {
                s.name = format!("{} ({})", s.source, s.metric);
            }
        }
        Ok(out)
    }

    /// Replaces every grouped series of `graph` with its concrete
    /// expansion. Series whose group cannot be resolved are dropped.
    pub async fn expand_graph(&self, graph: &mut Graph) -> Result<(), ExpandError> {
        for group in &mut graph.groups {
            let mut expanded = Vec::with_capacity(group.series.len());
            for series in &group.series {
                match self.expand(series, true).await {
                    Ok(list) => expanded.extend(list),
                    Err(err @ (ExpandError::MissingGroup { .. } | ExpandError::Pattern(_))) => {
                        warn!(
                            origin = %series.origin,
                            source = %series.source,
                            metric = %series.metric,
                            error = %err,
                            "unable to expand series"
                        );
                    }
                    Err(err) => return Err(err),
                }
            }
            group.series = expanded;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::catalog;
    use crate::model::SeriesGroup;
    use crate::record::Record;
    use crate::series::Operator;
    use crate::store::MemoryStore;

    async fn fixture(records: &[(&str, &str, &str)]) -> GroupExpander {
        let cat = Arc::new(catalog("p"));
        for (o, s, m) in records {
            cat.insert(&Record::new(*o, *s, *m));
        }
        let searcher = Arc::new(Searcher::new());
        searcher.register(cat);
        GroupExpander::new(searcher, Library::new(Arc::new(MemoryStore::new())))
    }

    fn triples(list: &[SeriesDef]) -> Vec<(&str, &str, &str)> {
        list.iter().map(|s| (s.origin.as_str(), s.source.as_str(), s.metric.as_str())).collect()
    }

    #[tokio::test]
    async fn source_group_glob() {
        let ex = fixture(&[("o", "host1", "m"), ("o", "host2", "m"), ("o", "other", "m")]).await;
        ex.library.save(SourceGroup::new("g1", &["glob:host*"])).await.unwrap();

        let out = ex.expand(&SeriesDef::new("", "o", "group:g1", "m"), false).await.unwrap();
        assert_eq!(triples(&out), vec![("o", "host1", "m"), ("o", "host2", "m")]);
        assert_eq!(out[0].name, "host1 (m)");

        // Same result on repeated calls.
        let again = ex.expand(&SeriesDef::new("", "o", "group:g1", "m"), false).await.unwrap();
        assert_eq!(triples(&again), triples(&out));
    }

    #[tokio::test]
    async fn group_by_id_and_cartesian_product() {
        let ex = fixture(&[
            ("o", "web01", "cpu.user"),
            ("o", "web01", "cpu.system"),
            ("o", "web02", "cpu.user"),
            ("x", "web03", "cpu.idle"),
        ])
        .await;
        let sg = ex.library.save(SourceGroup::new("web", &["regexp:^web"])).await.unwrap();
        let mg = ex.library.save(MetricGroup::new("cpu", &["glob:cpu.*"])).await.unwrap();
        let series = SeriesDef::new("", "o", &format!("group:{}", sg.item.id), &format!("group:{}", mg.item.id));

        let all = ex.expand(&series, false).await.unwrap();
        assert_eq!(all.len(), 4);

        // Only pairs present in the catalog survive on the points path.
        let existing = ex.expand(&series, true).await.unwrap();
        assert_eq!(
            triples(&existing),
            vec![("o", "web01", "cpu.system"), ("o", "web01", "cpu.user"), ("o", "web02", "cpu.user")]
        );
        for s in &existing {
            assert!(!ex.searcher.metrics(&s.origin, &s.source, &s.metric, 1).is_empty());
        }
    }

    #[tokio::test]
    async fn single_result_keeps_name() {
        let ex = fixture(&[("o", "db01", "load"), ("o", "web01", "load")]).await;
        ex.library.save(SourceGroup::new("db", &["db01"])).await.unwrap();

        let out = ex.expand(&SeriesDef::new("database", "o", "group:db", "load"), true).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "database");

        let plain = SeriesDef::new("raw", "o", "web01", "load");
        assert_eq!(ex.expand(&plain, true).await.unwrap(), vec![plain]);
    }

    #[tokio::test]
    async fn missing_group_is_resolution_error_and_dropped_from_graph() {
        let ex = fixture(&[("o", "s", "m")]).await;
        let err = ex.expand(&SeriesDef::new("", "o", "group:nope", "m"), false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resolution);

        let mut graph = Graph::new(
            "g",
            vec![SeriesGroup::new(
                "g",
                Operator::None,
                vec![SeriesDef::new("a", "o", "group:nope", "m"), SeriesDef::new("b", "o", "s", "m")],
            )],
        );
        ex.expand_graph(&mut graph).await.unwrap();
        assert_eq!(graph.groups[0].series.len(), 1);
        assert_eq!(graph.groups[0].series[0].name, "b");
    }
}

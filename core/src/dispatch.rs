//! Fan-out of points queries to connectors.
//!
//! Series of an expanded graph are bucketed by the connector serving them,
//! each bucket is sent as one [`PointsQuery`], and the answers are placed
//! back at the `(group, series)` cell they were requested for. A failed,
//! late or misshapen bucket leaves its cells empty.
//!
//! The timeout is one deadline for the whole fan-out, not a budget per
//! bucket: buckets still queued behind the concurrency limit when it passes
//! are never sent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::connector::{Connector, ConnectorError, PointsQuery, QueryMetric};
use crate::error::ErrorKind;
use crate::model::Graph;
use crate::searcher::Searcher;
use crate::series::Series;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error("expected {expected} series but got {got}")]
    ShapeMismatch { expected: usize, got: usize },
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Connector(e) => e.kind(),
            DispatchError::ShapeMismatch { .. } => ErrorKind::ShapeMismatch,
        }
    }
}

/// A bucket whose cells stayed empty.
#[derive(Debug)]
pub struct BucketFailure {
    pub connector: String,
    pub error: DispatchError,
}

/// Series shaped like the graph: `data[g][s]` answers `groups[g].series[s]`.
#[derive(Debug, Default)]
pub struct Dispatched {
    pub data: Vec<Vec<Series>>,
    pub failures: Vec<BucketFailure>,
}

struct Bucket {
    connector: Arc<dyn Connector>,
    metrics: Vec<QueryMetric>,
    cells: Vec<(usize, usize)>,
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    searcher: Arc<Searcher>,
    timeout: Duration,
    concurrency: usize,
}

impl Dispatcher {
    pub fn new(searcher: Arc<Searcher>, timeout: Duration, concurrency: usize) -> Self {
        Self { searcher, timeout, concurrency: concurrency.max(1) }
    }

    fn buckets(&self, graph: &Graph) -> Vec<Bucket> {
        let mut buckets: Vec<Bucket> = Vec::new();
        let mut by_name: HashMap<String, usize> = HashMap::new();

        for (g, group) in graph.groups.iter().enumerate() {
            for (s, series) in group.series.iter().enumerate() {
                if series.origin.is_empty() || series.source.is_empty() || series.metric.is_empty() {
                    warn!(group = g, series = s, "invalid series definition");
                    continue;
                }
                let Some(entry) = self
                    .searcher
                    .metrics(&series.origin, &series.source, &series.metric, 1)
                    .into_iter()
                    .next()
                else {
                    warn!(
                        origin = %series.origin,
                        source = %series.source,
                        metric = %series.metric,
                        "unable to find series metric"
                    );
                    continue;
                };

                let name = entry.connector.name().to_string();
                let at = *by_name.entry(name).or_insert_with(|| {
                    buckets.push(Bucket {
                        connector: Arc::clone(&entry.connector),
                        metrics: Vec::new(),
                        cells: Vec::new(),
                    });
                    buckets.len() - 1
                });
                buckets[at].metrics.push(entry.query_metric());
                buckets[at].cells.push((g, s));
            }
        }
        buckets
    }

    /// Runs every bucket with bounded parallelism and scatters results.
    pub async fn dispatch(
        &self,
        graph: &Graph,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        sample: usize,
    ) -> Dispatched {
        let mut out = Dispatched {
            data: graph.groups.iter().map(|g| vec![Series::default(); g.series.len()]).collect(),
            failures: Vec::new(),
        };

        let timeout = self.timeout;
        let deadline = Instant::now() + timeout;
        let results: Vec<_> = stream::iter(self.buckets(graph))
            .map(|bucket| async move {
                let query = PointsQuery { start, end, sample, metrics: bucket.metrics.clone() };
                let result = fetch(Arc::clone(&bucket.connector), query, deadline, timeout).await;
                (bucket, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (bucket, result) in results {
            let connector = bucket.connector.name().to_string();
            let result = result.map_err(DispatchError::from).and_then(|series| {
                if series.len() == bucket.cells.len() {
                    Ok(series)
                } else {
                    Err(DispatchError::ShapeMismatch { expected: bucket.cells.len(), got: series.len() })
                }
            });

            match result {
                Ok(series) => {
                    debug!(connector = %connector, count = series.len(), "points fetched");
                    for ((g, s), series) in bucket.cells.into_iter().zip(series) {
                        out.data[g][s] = series;
                    }
                }
                Err(err) => {
                    if err.kind() == ErrorKind::ShapeMismatch {
                        error!(connector = %connector, error = %err, "unable to fetch points");
                    } else {
                        warn!(connector = %connector, error = %err, "unable to fetch points");
                    }
                    out.failures.push(BucketFailure { connector, error: err });
                }
            }
        }
        out
    }
}

/// Runs one connector call on its own task so that a panic or the request
/// deadline only costs this bucket.
async fn fetch(
    connector: Arc<dyn Connector>,
    query: PointsQuery,
    deadline: Instant,
    timeout: Duration,
) -> Result<Vec<Series>, ConnectorError> {
    if Instant::now() >= deadline {
        return Err(ConnectorError::Timeout(timeout));
    }
    let mut handle = tokio::spawn(async move { connector.points(&query).await });
    match tokio::time::timeout_at(deadline, &mut handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) if join.is_panic() => Err(ConnectorError::Panicked(join.to_string())),
        Ok(Err(join)) => Err(ConnectorError::Backend(join.to_string())),
        Err(_) => {
            handle.abort();
            Err(ConnectorError::Timeout(timeout))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::connector::RecordSink;
    use crate::model::{SeriesDef, SeriesGroup};
    use crate::record::Record;
    use crate::series::tests::{grid, t0};
    use crate::series::Operator;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Connector answering each metric with a constant series whose value
    /// is the position of the metric name in `values`.
    pub(crate) struct ScriptedConnector {
        pub name: String,
        pub values: Vec<(String, f64)>,
        pub delay: Option<Duration>,
        pub drop_last: bool,
        pub calls: Mutex<Vec<Vec<QueryMetric>>>,
    }

    impl ScriptedConnector {
        pub(crate) fn new(name: &str, values: &[(&str, f64)]) -> Self {
            Self {
                name: name.to_string(),
                values: values.iter().map(|(m, v)| (m.to_string(), *v)).collect(),
                delay: None,
                drop_last: false,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        fn name(&self) -> &str {
            &self.name
        }

        async fn refresh(&self, _sink: RecordSink) -> Result<(), ConnectorError> {
            Ok(())
        }

        async fn points(&self, query: &PointsQuery) -> Result<Vec<Series>, ConnectorError> {
            self.calls.lock().push(query.metrics.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut out: Vec<Series> = query
                .metrics
                .iter()
                .map(|m| match self.values.iter().find(|(name, _)| *name == m.metric) {
                    Some((_, v)) => grid(&[*v; 4], 60),
                    None => Series::default(),
                })
                .collect();
            if self.drop_last {
                out.pop();
            }
            Ok(out)
        }
    }

    pub(crate) fn register(searcher: &Searcher, connector: Arc<ScriptedConnector>, records: &[Record]) {
        let name = connector.name.clone();
        let catalog = Arc::new(Catalog::new(name, connector));
        for r in records {
            catalog.insert(r);
        }
        searcher.register(catalog);
    }

    fn graph(series: Vec<Vec<SeriesDef>>) -> Graph {
        Graph::new(
            "g",
            series
                .into_iter()
                .enumerate()
                .map(|(i, s)| SeriesGroup::new(&format!("g{i}"), Operator::None, s))
                .collect(),
        )
    }

    fn first_values(d: &Dispatched) -> Vec<Vec<Option<f64>>> {
        d.data
            .iter()
            .map(|g| g.iter().map(|s| s.points.first().map(|p| p.value)).collect())
            .collect()
    }

    #[tokio::test]
    async fn scatters_back_to_request_order() {
        let searcher = Arc::new(Searcher::new());
        let a = Arc::new(ScriptedConnector::new("a", &[("m1", 1.0), ("m3", 3.0)]));
        let b = Arc::new(ScriptedConnector::new("b", &[("m2", 2.0)]));
        register(&searcher, Arc::clone(&a), &[Record::new("a", "s", "m1"), Record::new("a", "s", "m3")]);
        register(&searcher, Arc::clone(&b), &[Record::new("b", "s", "m2")]);

        let g = graph(vec![
            vec![SeriesDef::new("", "a", "s", "m3"), SeriesDef::new("", "b", "s", "m2")],
            vec![SeriesDef::new("", "a", "s", "m1"), SeriesDef::new("", "a", "s", "unknown")],
        ]);
        let d = Dispatcher::new(searcher, Duration::from_secs(5), 4)
            .dispatch(&g, t0(), t0() + chrono::Duration::minutes(4), 4)
            .await;

        assert_eq!(first_values(&d), vec![vec![Some(3.0), Some(2.0)], vec![Some(1.0), None]]);
        assert!(d.failures.is_empty());
        // One call per connector, unknown metrics never reach a backend.
        assert_eq!(a.calls.lock().len(), 1);
        assert_eq!(a.calls.lock()[0].len(), 2);
        assert_eq!(b.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn backend_queries_use_original_names() {
        let searcher = Arc::new(Searcher::new());
        let a = Arc::new(ScriptedConnector::new("a", &[("cpu_raw", 7.0)]));
        let mut r = Record::new("a", "h-1", "cpu_raw");
        r.source = "host-1".into();
        r.metric = "cpu".into();
        register(&searcher, Arc::clone(&a), &[r]);

        let g = graph(vec![vec![SeriesDef::new("", "a", "host-1", "cpu")]]);
        let d = Dispatcher::new(searcher, Duration::from_secs(5), 1)
            .dispatch(&g, t0(), t0() + chrono::Duration::minutes(4), 4)
            .await;

        assert_eq!(first_values(&d), vec![vec![Some(7.0)]]);
        let sent = &a.calls.lock()[0][0];
        assert_eq!((sent.source.as_str(), sent.metric.as_str()), ("h-1", "cpu_raw"));
    }

    #[tokio::test]
    async fn shape_mismatch_leaves_bucket_empty() {
        let searcher = Arc::new(Searcher::new());
        let mut bad = ScriptedConnector::new("bad", &[("m1", 1.0), ("m2", 2.0)]);
        bad.drop_last = true;
        register(&searcher, Arc::new(bad), &[Record::new("bad", "s", "m1"), Record::new("bad", "s", "m2")]);
        let good = Arc::new(ScriptedConnector::new("good", &[("m", 5.0)]));
        register(&searcher, good, &[Record::new("good", "s", "m")]);

        let g = graph(vec![vec![
            SeriesDef::new("", "bad", "s", "m1"),
            SeriesDef::new("", "good", "s", "m"),
            SeriesDef::new("", "bad", "s", "m2"),
        ]]);
        let d = Dispatcher::new(searcher, Duration::from_secs(5), 2)
            .dispatch(&g, t0(), t0() + chrono::Duration::minutes(4), 4)
            .await;

        assert_eq!(first_values(&d), vec![vec![None, Some(5.0), None]]);
        assert_eq!(d.failures.len(), 1);
        assert_eq!(d.failures[0].error.kind(), ErrorKind::ShapeMismatch);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_bucket_times_out() {
        let searcher = Arc::new(Searcher::new());
        let mut slow = ScriptedConnector::new("slow", &[("m", 1.0)]);
        slow.delay = Some(Duration::from_secs(60));
        register(&searcher, Arc::new(slow), &[Record::new("slow", "s", "m")]);
        let fast = Arc::new(ScriptedConnector::new("fast", &[("m", 2.0)]));
        register(&searcher, fast, &[Record::new("fast", "s", "m")]);

        let g = graph(vec![vec![SeriesDef::new("", "slow", "s", "m"), SeriesDef::new("", "fast", "s", "m")]]);
        let d = Dispatcher::new(searcher, Duration::from_secs(1), 2)
            .dispatch(&g, t0(), t0() + chrono::Duration::minutes(4), 4)
            .await;

        assert_eq!(first_values(&d), vec![vec![None, Some(2.0)]]);
        assert!(matches!(
            d.failures[0].error,
            DispatchError::Connector(ConnectorError::Timeout(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn queued_buckets_share_one_deadline() {
        let searcher = Arc::new(Searcher::new());
        let fast = Arc::new(ScriptedConnector::new("fast", &[("m", 2.0)]));
        register(&searcher, fast, &[Record::new("fast", "s", "m")]);
        let mut series = vec![SeriesDef::new("", "fast", "s", "m")];
        let mut slow_calls = Vec::new();
        for i in 0..4 {
            let name = format!("slow{i}");
            let mut slow = ScriptedConnector::new(&name, &[("m", 1.0)]);
            slow.delay = Some(Duration::from_secs(60));
            let slow = Arc::new(slow);
            slow_calls.push(Arc::clone(&slow));
            register(&searcher, slow, &[Record::new(name.as_str(), "s", "m")]);
            series.push(SeriesDef::new("", &name, "s", "m"));
        }

        let began = Instant::now();
        let d = Dispatcher::new(searcher, Duration::from_secs(1), 1)
            .dispatch(&graph(vec![series]), t0(), t0() + chrono::Duration::minutes(4), 4)
            .await;

        assert!(began.elapsed() <= Duration::from_millis(1500), "took {:?}", began.elapsed());
        assert_eq!(first_values(&d), vec![vec![Some(2.0), None, None, None, None]]);
        assert_eq!(d.failures.len(), 4);
        assert!(d
            .failures
            .iter()
            .all(|f| matches!(f.error, DispatchError::Connector(ConnectorError::Timeout(_)))));
        // Only the first slow bucket was ever sent.
        let sent: usize = slow_calls.iter().map(|c| c.calls.lock().len()).sum();
        assert_eq!(sent, 1);
    }
}

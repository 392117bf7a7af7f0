//! The points query pipeline.
//!
//! ```text
//! request -> graph (stored or inline) -> template expansion -> window
//!         -> group expansion -> dispatch -> sample clamp -> scale
//!         -> normalize -> operator -> group scale -> summaries
//! ```
//!
//! Per-provider failures only leave empty cells; the request fails when its
//! input is bad or its graph cannot be resolved.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::dispatch::Dispatcher;
use crate::error::ErrorKind;
use crate::expand::{ExpandError, GroupExpander};
use crate::library::Library;
use crate::model::{Graph, Options};
use crate::record::Attributes;
use crate::searcher::Searcher;
use crate::series::{self, Operator, Series, SeriesError};
use crate::store::StoreError;
use crate::template::TemplateError;
use crate::timerange::{self, RangeError};

pub const DEFAULT_SAMPLE: usize = 400;
pub const DEFAULT_TIME_RANGE: &str = "-1h";

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("either a graph id or an inline graph is required")]
    MissingGraph,
    #[error(transparent)]
    Template(TemplateError),
    /// A stored graph no longer expands.
    #[error("stored graph is invalid: {0}")]
    StoredTemplate(TemplateError),
    #[error(transparent)]
    Library(StoreError),
    #[error(transparent)]
    Range(#[from] RangeError),
    #[error(transparent)]
    Expand(#[from] ExpandError),
    #[error(transparent)]
    Series(#[from] SeriesError),
}

impl QueryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueryError::MissingGraph => ErrorKind::Identity,
            QueryError::Template(_) => ErrorKind::Template,
            QueryError::StoredTemplate(_) => ErrorKind::Internal,
            QueryError::Library(e) => e.kind(),
            QueryError::Range(e) => e.kind(),
            QueryError::Expand(e) => e.kind(),
            QueryError::Series(e) => e.kind(),
        }
    }

    fn from_store(err: StoreError, stored: bool) -> Self {
        match err {
            StoreError::Template(e) if stored => QueryError::StoredTemplate(e),
            StoreError::Template(e) => QueryError::Template(e),
            other => QueryError::Library(other),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct PointsRequest {
    /// Id, alias or name of a stored graph.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub graph: Option<Graph>,
    /// Reference time for `range`; now when absent.
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub range: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sample: Option<usize>,
    #[serde(default)]
    pub attributes: Attributes,
    /// When false, groups without an operator return raw series.
    #[serde(default = "default_true")]
    pub normalize: bool,
}

impl Default for PointsRequest {
    fn default() -> Self {
        Self {
            id: None,
            graph: None,
            time: None,
            range: None,
            start_time: None,
            end_time: None,
            sample: None,
            attributes: Attributes::new(),
            normalize: default_true(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseSeries {
    pub name: String,
    #[serde(flatten)]
    pub series: Series,
    pub options: Options,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointsResponse {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub series: Vec<ResponseSeries>,
    pub options: Options,
}

#[derive(Debug, Clone)]
pub struct QueryDefaults {
    pub sample: usize,
    pub time_range: String,
    pub timeout: Duration,
    pub concurrency: usize,
}

impl Default for QueryDefaults {
    fn default() -> Self {
        Self {
            sample: DEFAULT_SAMPLE,
            time_range: DEFAULT_TIME_RANGE.to_string(),
            timeout: Duration::from_secs(30),
            concurrency: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryEngine {
    library: Library,
    expander: GroupExpander,
    dispatcher: Dispatcher,
    defaults: QueryDefaults,
}

impl QueryEngine {
    pub fn new(searcher: Arc<Searcher>, library: Library, defaults: QueryDefaults) -> Self {
        Self {
            expander: GroupExpander::new(Arc::clone(&searcher), library.clone()),
            dispatcher: Dispatcher::new(searcher, defaults.timeout, defaults.concurrency),
            library,
            defaults,
        }
    }

    pub fn expander(&self) -> &GroupExpander {
        &self.expander
    }

    pub async fn points(&self, request: PointsRequest) -> Result<PointsResponse, QueryError> {
        self.points_at(request, Utc::now()).await
    }

    /// Runs `request` with `now` as the default reference time.
    pub async fn points_at(&self, request: PointsRequest, now: DateTime<Utc>) -> Result<PointsResponse, QueryError> {
        let mut graph = match (&request.id, &request.graph) {
            (Some(id), _) if !id.is_empty() => self
                .library
                .resolve_graph(id, &request.attributes)
                .await
                .map_err(|e| QueryError::from_store(e, true))?,
            (_, Some(inline)) => self
                .library
                .expand_graph(inline, &request.attributes)
                .await
                .map_err(|e| QueryError::from_store(e, false))?,
            _ => return Err(QueryError::MissingGraph),
        };

        let (start, end) = self.window(&request, &graph, now)?;
        let mut sample = request.sample.filter(|s| *s > 0).unwrap_or(self.defaults.sample);

        self.expander.expand_graph(&mut graph).await?;
        let dispatched = self.dispatcher.dispatch(&graph, start, end, sample).await;
        let mut data = dispatched.data;

        // Never resample finer than the densest input.
        let densest = data.iter().flatten().map(Series::len).max().unwrap_or(0);
        if densest > 0 && sample > densest {
            sample = densest;
        }

        let percentiles = graph.percentiles();
        let mut out = Vec::new();
        for (group, mut series) in graph.groups.iter().zip(data.drain(..)) {
            if series.is_empty() {
                continue;
            }
            let mut labels: Vec<(String, Options)> =
                group.series.iter().map(|s| (s.name.clone(), s.options.clone())).collect();

            for (s, def) in series.iter_mut().zip(&group.series) {
                if let Some(scale) = def.scale() {
                    s.scale(scale);
                }
            }

            if request.normalize || group.operator != Operator::None {
                if group.zero_nulls() {
                    series.iter_mut().for_each(Series::zero_nulls);
                }
                series = series::normalize(&series, start, end, sample, group.consolidate, group.interpolate())?;

                if series.len() > 1 {
                    let combined = match group.operator {
                        Operator::Average => Some(series::average(&series)?),
                        Operator::Sum => Some(series::sum(&series)?),
                        Operator::None | Operator::Normalize => None,
                    };
                    if let Some(combined) = combined {
                        let options = labels.swap_remove(0).1;
                        labels = vec![(group.name.clone(), options)];
                        series = vec![combined];
                    }
                }
            }

            for (mut s, (name, options)) in series.into_iter().zip(labels) {
                if let Some(scale) = group.scale() {
                    s.scale(scale);
                }
                s.summarize(&percentiles);
                out.push(ResponseSeries { name, series: s, options });
            }
        }

        let mut options = graph.options.clone();
        options
            .entry("title")
            .or_insert_with(|| Value::String(graph.item.name.clone()));

        debug!(graph = %graph.item.name, series = out.len(), sample, "points query served");
        Ok(PointsResponse { start, end, series: out, options })
    }

    fn window(
        &self,
        request: &PointsRequest,
        graph: &Graph,
        now: DateTime<Utc>,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>), RangeError> {
        let range = request.range.as_deref().filter(|r| !r.is_empty());
        if request.start_time.is_some() || request.end_time.is_some() {
            if range.is_some() {
                return Err(RangeError::Invalid("range cannot be combined with start and end time".into()));
            }
            return timerange::resolve(request.start_time, request.end_time, now, "");
        }

        let range = range
            .or_else(|| graph.options.get("range").and_then(Value::as_str))
            .unwrap_or(&self.defaults.time_range);
        timerange::resolve(None, None, request.time.unwrap_or(now), range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::connector::{Connector, ConnectorError, PointsQuery, RecordSink};
    use crate::model::{SeriesDef, SeriesGroup, SourceGroup};
    use crate::record::Record;
    use crate::series::tests::{grid, t0};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::collections::HashMap;

    /// Serves fixed series by metric name.
    struct StaticConnector {
        name: String,
        data: HashMap<String, Series>,
    }

    #[async_trait]
    impl Connector for StaticConnector {
        fn name(&self) -> &str {
            &self.name
        }

        async fn refresh(&self, _sink: RecordSink) -> Result<(), ConnectorError> {
            Ok(())
        }

        async fn points(&self, query: &PointsQuery) -> Result<Vec<Series>, ConnectorError> {
            Ok(query.metrics.iter().map(|m| self.data.get(&m.metric).cloned().unwrap_or_default()).collect())
        }
    }

    fn engine(data: &[(&str, &str, Series)]) -> QueryEngine {
        let connector = StaticConnector {
            name: "o".into(),
            data: data.iter().map(|(_, m, s)| (m.to_string(), s.clone())).collect(),
        };
        let catalog = Arc::new(Catalog::new("o", Arc::new(connector)));
        for (source, metric, _) in data {
            catalog.insert(&Record::new("o", *source, *metric));
        }
        let searcher = Arc::new(Searcher::new());
        searcher.register(catalog);
        QueryEngine::new(searcher, Library::new(Arc::new(MemoryStore::new())), QueryDefaults::default())
    }

    fn inline(groups: Vec<SeriesGroup>) -> PointsRequest {
        PointsRequest { graph: Some(Graph::new("inline", groups)), ..Default::default() }
    }

    #[test]
    fn default_request_normalizes_like_an_empty_body() {
        let parsed: PointsRequest = serde_json::from_str("{}").unwrap();
        assert!(parsed.normalize);
        assert!(PointsRequest::default().normalize);
    }

    fn values(s: &ResponseSeries) -> Vec<f64> {
        s.series.values().collect()
    }

    #[tokio::test]
    async fn single_metric_round_trip() {
        let ten: Vec<f64> = (1..=10).map(f64::from).collect();
        let qe = engine(&[("s", "m", grid(&ten, 60))]);
        let mut req = inline(vec![SeriesGroup::new("g", Operator::None, vec![SeriesDef::new("m", "o", "s", "m")])]);
        req.start_time = Some(t0());
        req.end_time = Some(t0() + ChronoDuration::seconds(600));
        req.sample = Some(10);

        let resp = qe.points(req).await.unwrap();
        assert_eq!(resp.series.len(), 1);
        let s = &resp.series[0];
        assert_eq!(s.series.len(), 10);
        assert_eq!(s.series.summary["min"], 1.0);
        assert_eq!(s.series.summary["max"], 10.0);
        assert_eq!(s.series.summary["avg"], 5.5);
        assert_eq!(s.series.summary["last"], 10.0);
        assert_eq!(resp.options["title"], json!("inline"));
    }

    #[tokio::test]
    async fn sum_operator_with_and_without_interpolation() {
        let qe = engine(&[
            ("s", "a", grid(&[1.0, 2.0, 3.0, f64::NAN], 60)),
            ("s", "b", grid(&[10.0, f64::NAN, 30.0, 40.0], 60)),
        ]);
        let mut group = SeriesGroup::new(
            "total",
            Operator::Sum,
            vec![SeriesDef::new("a", "o", "s", "a"), SeriesDef::new("b", "o", "s", "b")],
        );
        group.options.insert("interpolate".into(), json!(false));
        let mut req = inline(vec![group.clone()]);
        req.start_time = Some(t0());
        req.end_time = Some(t0() + ChronoDuration::seconds(240));
        req.sample = Some(4);

        let resp = qe.points(req.clone()).await.unwrap();
        assert_eq!(resp.series.len(), 1);
        assert_eq!(resp.series[0].name, "total");
        assert_eq!(values(&resp.series[0]), vec![11.0, 2.0, 33.0, 40.0]);
        assert_eq!(resp.series[0].series.summary["avg"], 86.0 / 4.0);

        // The bounded gap of `b` is filled; the trailing gap of `a` is not.
        group.options.remove("interpolate");
        req.graph = Some(Graph::new("inline", vec![group]));
        let resp = qe.points(req).await.unwrap();
        assert_eq!(values(&resp.series[0]), vec![11.0, 22.0, 33.0, 40.0]);
    }

    #[tokio::test]
    async fn order_and_names_follow_expansion() {
        let qe = engine(&[
            ("web01", "load", grid(&[1.0, 1.0], 60)),
            ("web02", "load", grid(&[2.0, 2.0], 60)),
            ("db01", "load", grid(&[3.0, 3.0], 60)),
        ]);
        qe.library.save(SourceGroup::new("web", &["glob:web*"])).await.unwrap();

        let mut req = inline(vec![
            SeriesGroup::new("db", Operator::None, vec![SeriesDef::new("database", "o", "db01", "load")]),
            SeriesGroup::new("web", Operator::None, vec![SeriesDef::new("", "o", "group:web", "load")]),
        ]);
        req.start_time = Some(t0());
        req.end_time = Some(t0() + ChronoDuration::seconds(120));

        let resp = qe.points(req).await.unwrap();
        let names: Vec<&str> = resp.series.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["database", "web01 (load)", "web02 (load)"]);
        // Sample is clamped to the two available points.
        assert!(resp.series.iter().all(|s| s.series.len() == 2));
    }

    #[tokio::test]
    async fn scales_percentiles_and_raw_passthrough() {
        let qe = engine(&[("s", "m", grid(&[1.0, 2.0, 3.0, 4.0], 60))]);
        let mut def = SeriesDef::new("m", "o", "s", "m");
        def.options.insert("scale".into(), json!(10.0));
        let mut group = SeriesGroup::new("g", Operator::None, vec![def]);
        group.options.insert("scale".into(), json!(0.5));
        let mut graph = Graph::new("scaled", vec![group]);
        graph.options.insert("percentiles".into(), json!([50]));

        let mut req = PointsRequest { graph: Some(graph), normalize: false, ..Default::default() };
        req.start_time = Some(t0());
        req.end_time = Some(t0() + ChronoDuration::seconds(240));

        let resp = qe.points(req).await.unwrap();
        let s = &resp.series[0];
        assert_eq!(values(s), vec![5.0, 10.0, 15.0, 20.0]);
        assert_eq!(s.series.summary["50th"], 12.5);
    }

    #[tokio::test]
    async fn stored_graph_with_template_and_range() {
        let qe = engine(&[("web01", "load", grid(&[1.0; 60], 60))]);
        let mut g = Graph::new(
            "load",
            vec![SeriesGroup::new("g", Operator::None, vec![SeriesDef::new("{{ .host }}", "o", "{{ .host }}", "load")])],
        );
        g.options.insert("title".into(), json!("{{ .host }} load"));
        g.alias = Some("host-load".into());
        qe.library.save(g).await.unwrap();

        let req = PointsRequest {
            id: Some("host-load".into()),
            attributes: json!({"host": "web01"}).as_object().cloned().unwrap(),
            normalize: true,
            ..Default::default()
        };
        let now = t0() + ChronoDuration::hours(1);
        let resp = qe.points_at(req, now).await.unwrap();
        assert_eq!((resp.start, resp.end), (t0(), now));
        assert_eq!(resp.options["title"], json!("web01 load"));
        assert_eq!(resp.series[0].name, "web01");

        let empty = PointsRequest { id: Some("host-load".into()), ..Default::default() };
        let resp = qe.points_at(empty, now).await.unwrap();
        assert_eq!(resp.options["title"], json!(" load"));
    }

    #[tokio::test]
    async fn request_errors_have_kinds() {
        let qe = engine(&[]);
        let err = qe.points(PointsRequest::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Identity);

        let missing = PointsRequest { id: Some("nope".into()), ..Default::default() };
        assert_eq!(qe.points(missing).await.unwrap_err().kind(), ErrorKind::Resolution);

        let mut both = inline(vec![]);
        both.start_time = Some(t0());
        both.end_time = Some(t0() + ChronoDuration::hours(1));
        both.range = Some("-1h".into());
        assert_eq!(qe.points(both).await.unwrap_err().kind(), ErrorKind::Identity);

        let mut bad = Graph::new("bad", vec![]);
        bad.options.insert("title".into(), json!("{{ host }}"));
        let req = PointsRequest { graph: Some(bad), ..Default::default() };
        assert_eq!(qe.points(req).await.unwrap_err().kind(), ErrorKind::Template);
    }
}

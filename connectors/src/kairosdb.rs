//! KairosDB: metric names come from `/api/v1/metricnames`, their tag
//! values from a `/tags` query. Each `(metric, aggregator)` pair is
//! published as `<metric>/<aggregator>` for every value of a source tag.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use gateway_core::connector::{RecordSink, Settings};
use gateway_core::series::Point;
use gateway_core::{Connector, ConnectorError, PointsQuery, QueryMetric, Record, Series};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::http::{self, HttpSettings};

const METRIC_NAMES_PATH: &str = "/api/v1/metricnames";
const QUERY_PATH: &str = "/api/v1/datapoints/query";
const TAGS_PATH: &str = "/api/v1/datapoints/query/tags";

const DEFAULT_SOURCE_TAGS: [&str; 3] = ["host", "server", "device"];
const DEFAULT_AGGREGATORS: [&str; 3] = ["avg", "max", "min"];

#[derive(Debug, Default, Serialize)]
struct Query {
    start_absolute: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_absolute: Option<i64>,
    metrics: Vec<QueryEntry>,
}

#[derive(Debug, Serialize)]
struct QueryEntry {
    name: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    tags: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    aggregators: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct MetricNames {
    #[serde(default)]
    results: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default)]
    queries: Vec<ResponseQuery>,
}

#[derive(Debug, Deserialize)]
struct ResponseQuery {
    #[serde(default)]
    results: Vec<ResponseResult>,
}

#[derive(Debug, Deserialize)]
struct ResponseResult {
    name: String,
    #[serde(default)]
    tags: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    values: Vec<(f64, Option<f64>)>,
}

/// Backend coordinates carried in a record's attributes.
struct Route {
    name: String,
    aggregator: String,
    tag: String,
    value: String,
}

impl Route {
    fn from_metric(metric: &QueryMetric) -> Result<Self, ConnectorError> {
        let string = |key: &str| match metric.attributes.get(key) {
            Some(Value::String(s)) => Ok(s.clone()),
            _ => Err(ConnectorError::InvalidAttribute(key.to_string())),
        };
        let (tag, value) = match metric.attributes.get("tag") {
            Some(Value::Array(pair)) => match pair.as_slice() {
                [Value::String(tag), Value::String(value)] => (tag.clone(), value.clone()),
                _ => return Err(ConnectorError::InvalidAttribute("tag".into())),
            },
            _ => return Err(ConnectorError::InvalidAttribute("tag".into())),
        };
        Ok(Self { name: string("name")?, aggregator: string("aggregator")?, tag, value })
    }
}

pub struct KairosDbConnector {
    name: String,
    http: HttpSettings,
    client: Client,
    source_tags: Vec<String>,
    aggregators: Vec<String>,
}

impl KairosDbConnector {
    pub fn new(name: &str, settings: &Settings) -> Result<Self, ConnectorError> {
        let http = HttpSettings::from_settings(settings)?;
        Ok(Self {
            name: name.to_string(),
            client: http.client()?,
            http,
            source_tags: settings.string_list_or("source_tags", &DEFAULT_SOURCE_TAGS)?,
            aggregators: settings.string_list_or("aggregators", &DEFAULT_AGGREGATORS)?,
        })
    }

    pub fn factory(name: &str, settings: &Settings) -> Result<Arc<dyn Connector>, ConnectorError> {
        Ok(Arc::new(Self::new(name, settings)?))
    }

    async fn post<T: for<'de> Deserialize<'de>>(&self, path: &str, query: &Query) -> Result<T, ConnectorError> {
        let response = self
            .client
            .post(self.http.endpoint(path))
            .json(query)
            .send()
            .await
            .map_err(|e| http::request_error(e, self.http.timeout))?;
        http::json(response, self.http.timeout).await
    }
}

#[async_trait]
impl Connector for KairosDbConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn refresh(&self, sink: RecordSink) -> Result<(), ConnectorError> {
        let response = self
            .client
            .get(self.http.endpoint(METRIC_NAMES_PATH))
            .send()
            .await
            .map_err(|e| http::request_error(e, self.http.timeout))?;
        let names: MetricNames = http::json(response, self.http.timeout).await?;

        let query = Query {
            metrics: names
                .results
                .into_iter()
                .map(|name| QueryEntry { name, tags: BTreeMap::new(), aggregators: Vec::new() })
                .collect(),
            ..Default::default()
        };
        let tags: Response = self.post(TAGS_PATH, &query).await?;

        for result in tags.queries.iter().flat_map(|q| &q.results) {
            for tag in &self.source_tags {
                let Some(values) = result.tags.get(tag) else { continue };
                for aggregator in &self.aggregators {
                    for value in values {
                        let record = Record::new(
                            self.name.as_str(),
                            value.as_str(),
                            format!("{}/{}", result.name, aggregator),
                        )
                        .with_attribute("name", result.name.as_str())
                        .with_attribute("aggregator", aggregator.as_str())
                        .with_attribute("tag", json!([tag, value]));
                        if sink.send(record).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn points(&self, query: &PointsQuery) -> Result<Vec<Series>, ConnectorError> {
        let sampling = (query.end - query.start).num_milliseconds() / query.sample.max(1) as i64;

        let metrics = query
            .metrics
            .iter()
            .map(|m| {
                let route = Route::from_metric(m)?;
                Ok(QueryEntry {
                    name: route.name,
                    tags: BTreeMap::from([(route.tag, vec![route.value])]),
                    aggregators: vec![json!({
                        "name": route.aggregator,
                        "sampling": {"value": sampling.max(1), "unit": "milliseconds"},
                    })],
                })
            })
            .collect::<Result<Vec<_>, ConnectorError>>()?;

        let body = Query {
            start_absolute: query.start.timestamp_millis(),
            end_absolute: Some(query.end.timestamp_millis()),
            metrics,
        };
        let response: Response = self.post(QUERY_PATH, &body).await?;

        Ok(response
            .queries
            .into_iter()
            .map(|q| {
                let points = q
                    .results
                    .into_iter()
                    .next()
                    .map(|r| r.values)
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|(ms, value)| {
                        chrono::DateTime::from_timestamp((ms / 1000.0) as i64, 0)
                            .map(|t| Point::new(t, value.unwrap_or(f64::NAN)))
                    })
                    .collect();
                Series::new(points)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::serve;
    use axum::routing::{get, post};
    use axum::{Json, Router};

    fn connector(url: &str, settings: Settings) -> KairosDbConnector {
        KairosDbConnector::new("kairos", &settings.with("url", url)).unwrap()
    }

    #[tokio::test]
    async fn refresh_publishes_metric_per_aggregator() {
        let app = Router::new()
            .route(METRIC_NAMES_PATH, get(|| async { Json(json!({"results": ["cpu"]})) }))
            .route(
                TAGS_PATH,
                post(|Json(req): Json<Value>| async move {
                    assert_eq!(req["metrics"][0]["name"], "cpu");
                    Json(json!({"queries": [{"results": [{
                        "name": "cpu",
                        "tags": {"host": ["web01", "web02"], "dc": ["par"]},
                        "values": []
                    }]}]}))
                }),
            );
        let url = serve(app).await;
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        connector(&url, Settings::new().with("aggregators", json!(["avg", "max"])))
            .refresh(tx)
            .await
            .unwrap();

        let mut got = Vec::new();
        while let Some(r) = rx.recv().await {
            got.push(r);
        }
        let names: Vec<_> = got.iter().map(|r| format!("{}/{}", r.source, r.metric)).collect();
        assert_eq!(names, vec!["web01/cpu/avg", "web02/cpu/avg", "web01/cpu/max", "web02/cpu/max"]);
        assert_eq!(got[0].origin, "kairos");
        assert_eq!(got[0].attributes["name"], "cpu");
        assert_eq!(got[0].attributes["aggregator"], "avg");
        assert_eq!(got[0].attributes["tag"], json!(["host", "web01"]));
    }

    #[tokio::test]
    async fn points_query_uses_routing_attributes() {
        let app = Router::new().route(
            QUERY_PATH,
            post(|Json(req): Json<Value>| async move {
                let metric = &req["metrics"][0];
                assert_eq!(metric["name"], "cpu");
                assert_eq!(metric["tags"], json!({"host": ["web01"]}));
                assert_eq!(metric["aggregators"][0]["name"], "max");
                assert_eq!(metric["aggregators"][0]["sampling"]["value"], 60_000);
                assert_eq!(req["start_absolute"], 1_704_067_200_000i64);
                Json(json!({"queries": [{"results": [{
                    "name": "cpu",
                    "tags": {},
                    "values": [[1_704_067_200_000i64, 1.0], [1_704_067_260_000i64, null]]
                }]}]}))
            }),
        );
        let url = serve(app).await;

        let start = chrono::DateTime::from_timestamp(1_704_067_200, 0).unwrap();
        let query = PointsQuery {
            start,
            end: start + chrono::Duration::minutes(10),
            sample: 10,
            metrics: vec![QueryMetric {
                origin: "kairos".into(),
                source: "web01".into(),
                metric: "cpu/max".into(),
                attributes: json!({"name": "cpu", "aggregator": "max", "tag": ["host", "web01"]})
                    .as_object()
                    .cloned()
                    .unwrap(),
            }],
        };
        let out = connector(&url, Settings::new()).points(&query).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].points[0].value, 1.0);
        assert_eq!(out[0].points[1].time.timestamp(), 1_704_067_260);
        assert!(out[0].points[1].value.is_nan());
    }

    #[tokio::test]
    async fn malformed_tag_attribute_is_rejected() {
        let query = PointsQuery {
            start: chrono::Utc::now(),
            end: chrono::Utc::now(),
            sample: 1,
            metrics: vec![QueryMetric {
                origin: "kairos".into(),
                source: "web01".into(),
                metric: "cpu/max".into(),
                attributes: json!({"name": "cpu", "aggregator": "max", "tag": "host"})
                    .as_object()
                    .cloned()
                    .unwrap(),
            }],
        };
        let err = connector("http://127.0.0.1:9", Settings::new()).points(&query).await.unwrap_err();
        assert!(matches!(err, ConnectorError::InvalidAttribute(ref a) if a == "tag"));
    }
}

//! Peer gateway instance: its catalog is mirrored origin by origin and
//! points are fetched through its query endpoint, un-normalized.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gateway_core::connector::{RecordSink, Settings};
use gateway_core::series::Point;
use gateway_core::{Connector, ConnectorError, PointsQuery, Record, Series};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::http::{self, HttpSettings};

const CATALOG_PATH: &str = "/api/v1/catalog/";
const POINTS_PATH: &str = "/api/v1/series/points";

/// origin → source → metrics.
type CatalogTree = BTreeMap<String, BTreeMap<String, Vec<String>>>;

#[derive(Debug, Serialize)]
struct PeerRequest {
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    sample: usize,
    normalize: bool,
    graph: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct PeerResponse {
    #[serde(default)]
    series: Vec<PeerSeries>,
}

#[derive(Debug, Deserialize)]
struct PeerSeries {
    name: String,
    #[serde(default)]
    points: Vec<Point>,
}

pub struct FacetteConnector {
    name: String,
    http: HttpSettings,
    client: Client,
}

impl FacetteConnector {
    pub fn new(name: &str, settings: &Settings) -> Result<Self, ConnectorError> {
        let http = HttpSettings::from_settings(settings)?;
        Ok(Self { name: name.to_string(), client: http.client()?, http })
    }

    pub fn factory(name: &str, settings: &Settings) -> Result<Arc<dyn Connector>, ConnectorError> {
        Ok(Arc::new(Self::new(name, settings)?))
    }
}

fn series_name(i: usize) -> String {
    format!("series{i}")
}

#[async_trait]
impl Connector for FacetteConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn refresh(&self, sink: RecordSink) -> Result<(), ConnectorError> {
        let response = self
            .client
            .get(self.http.endpoint(CATALOG_PATH))
            .query(&[("tree", "1")])
            .send()
            .await
            .map_err(|e| http::request_error(e, self.http.timeout))?;
        let tree: CatalogTree = http::json(response, self.http.timeout).await?;

        for (origin, sources) in tree {
            for (source, metrics) in sources {
                for metric in metrics {
                    if sink.send(Record::new(origin.as_str(), source.as_str(), metric)).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    async fn points(&self, query: &PointsQuery) -> Result<Vec<Series>, ConnectorError> {
        let series: Vec<_> = query
            .metrics
            .iter()
            .enumerate()
            .map(|(i, m)| {
                json!({
                    "name": series_name(i),
                    "origin": m.origin,
                    "source": m.source,
                    "metric": m.metric,
                })
            })
            .collect();
        let request = PeerRequest {
            start_time: query.start,
            end_time: query.end,
            sample: query.sample,
            normalize: false,
            graph: json!({"name": "peer", "groups": [{"name": "peer", "series": series}]}),
        };

        let response = self
            .client
            .post(self.http.endpoint(POINTS_PATH))
            .json(&request)
            .send()
            .await
            .map_err(|e| http::request_error(e, self.http.timeout))?;
        let body: PeerResponse = http::json(response, self.http.timeout).await?;

        let mut by_name: HashMap<String, Vec<Point>> =
            body.series.into_iter().map(|s| (s.name, s.points)).collect();
        Ok((0..query.metrics.len())
            .map(|i| Series::new(by_name.remove(&series_name(i)).unwrap_or_default()))
            .collect())
    }
}

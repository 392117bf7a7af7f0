//! Graphite: discovery through `/metrics/index.json`, points through
//! `/render`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use gateway_core::connector::{RecordSink, Settings};
use gateway_core::series::Point;
use gateway_core::{Connector, ConnectorError, PointsQuery, Record, Series};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::http::{self, HttpSettings};
use crate::pattern::SeriesPattern;

const INDEX_PATH: &str = "/metrics/index.json";
const RENDER_PATH: &str = "/render";

/// Routing attribute holding the full Graphite path.
const TARGET: &str = "target";

#[derive(Debug, Deserialize)]
struct RenderSeries {
    target: String,
    #[serde(default)]
    datapoints: Vec<(Option<f64>, i64)>,
}

pub struct GraphiteConnector {
    name: String,
    http: HttpSettings,
    client: Client,
    pattern: SeriesPattern,
}

impl GraphiteConnector {
    pub fn new(name: &str, settings: &Settings) -> Result<Self, ConnectorError> {
        let http = HttpSettings::from_settings(settings)?;
        let pattern = SeriesPattern::compile(&settings.required_string("pattern")?)?;
        Ok(Self { name: name.to_string(), client: http.client()?, http, pattern })
    }

    pub fn factory(name: &str, settings: &Settings) -> Result<Arc<dyn Connector>, ConnectorError> {
        Ok(Arc::new(Self::new(name, settings)?))
    }
}

#[async_trait]
impl Connector for GraphiteConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn refresh(&self, sink: RecordSink) -> Result<(), ConnectorError> {
        let response = self
            .client
            .get(self.http.endpoint(INDEX_PATH))
            .send()
            .await
            .map_err(|e| http::request_error(e, self.http.timeout))?;
        let paths: Vec<String> = http::json(response, self.http.timeout).await?;

        for path in paths {
            let Some((source, metric)) = self.pattern.split(&path) else {
                debug!(provider = %self.name, path = %path, "series does not match pattern, ignoring");
                continue;
            };
            let record = Record::new(self.name.as_str(), source, metric).with_attribute(TARGET, path);
            if sink.send(record).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn points(&self, query: &PointsQuery) -> Result<Vec<Series>, ConnectorError> {
        let targets = query
            .metrics
            .iter()
            .map(|m| match m.attributes.get(TARGET) {
                Some(serde_json::Value::String(t)) => Ok(t.clone()),
                None => Ok(format!("{}.{}", m.source, m.metric)),
                Some(_) => Err(ConnectorError::InvalidAttribute(TARGET.into())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut params: Vec<(&str, String)> = vec![
            ("format", "json".into()),
            ("from", query.start.timestamp().to_string()),
            ("until", query.end.timestamp().to_string()),
        ];
        params.extend(targets.iter().map(|t| ("target", t.clone())));

        let response = self
            .client
            .get(self.http.endpoint(RENDER_PATH))
            .query(&params)
            .send()
            .await
            .map_err(|e| http::request_error(e, self.http.timeout))?;
        let rendered: Vec<RenderSeries> = http::json(response, self.http.timeout).await?;

        let mut by_target: HashMap<String, Series> = rendered
            .into_iter()
            .map(|r| {
                let points = r
                    .datapoints
                    .into_iter()
                    .filter_map(|(value, ts)| {
                        chrono::DateTime::from_timestamp(ts, 0).map(|t| Point::new(t, value.unwrap_or(f64::NAN)))
                    })
                    .collect();
                (r.target, Series::new(points))
            })
            .collect();

        Ok(targets.iter().map(|t| by_target.remove(t).unwrap_or_default()).collect())
    }
}

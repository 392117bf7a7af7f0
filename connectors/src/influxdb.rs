//! InfluxDB 2.x through Flux.
//!
//! Discovery reads the last row of every table in the lookback window. A
//! table is a `(measurement, field, tag set)`; it becomes a record either by
//! matching the measurement against `pattern` or by assembling names from a
//! `mapping`. Records carry `measurement`, `field` and `tags` so that points
//! can be queried back without re-parsing names.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gateway_core::connector::{RecordSink, Settings};
use gateway_core::series::Point;
use gateway_core::{Connector, ConnectorError, PointsQuery, QueryMetric, Record, Series};
use influxdb2::models::Query;
use influxdb2::Client;
use influxdb2_structmap::value::Value;
use serde_json::json;
use tracing::debug;

use crate::pattern::SeriesPattern;

const DEFAULT_LOOKBACK: &str = "-24h";
const DEFAULT_GLUE: &str = ".";

const MEASUREMENT: &str = "_measurement";
const FIELD: &str = "_field";
const VALUE: &str = "_value";
const TIME: &str = "_time";

/// One naming component of a `mapping`.
#[derive(Debug, Clone, PartialEq)]
enum MappingItem {
    /// The measurement name.
    Name,
    /// The value of a tag.
    Column(String),
}

impl MappingItem {
    fn parse(item: &str) -> Result<Self, ConnectorError> {
        match item {
            "name" => Ok(MappingItem::Name),
            _ => match item.strip_prefix("column:") {
                Some(tag) if !tag.is_empty() => Ok(MappingItem::Column(tag.to_string())),
                _ => Err(ConnectorError::invalid_setting("mapping", format!("unknown item {item:?}"))),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Mapping {
    source: Vec<MappingItem>,
    metric: Vec<MappingItem>,
    glue: String,
}

impl Mapping {
    fn from_settings(settings: &Settings) -> Result<Option<Self>, ConnectorError> {
        let Some(map) = settings.object("mapping")? else {
            return Ok(None);
        };
        let mapping = Settings::from(map.clone());
        let items = |key: &str| -> Result<Vec<MappingItem>, ConnectorError> {
            mapping
                .string_list_or(key, &[])
                .map_err(|_| ConnectorError::invalid_setting("mapping", format!("{key:?} must be a list of strings")))?
                .iter()
                .map(|i| MappingItem::parse(i))
                .collect()
        };
        let glue = mapping.string_or("glue", DEFAULT_GLUE)?;
        Ok(Some(Self {
            source: items("source")?,
            metric: items("metric")?,
            glue: if glue.is_empty() { DEFAULT_GLUE.to_string() } else { glue },
        }))
    }

    /// Joins the non-empty parts; used tags are recorded in `terms`.
    fn assemble(
        &self,
        items: &[MappingItem],
        table: &Table,
        terms: &mut BTreeMap<String, String>,
    ) -> String {
        items
            .iter()
            .filter_map(|item| match item {
                MappingItem::Name => Some(table.measurement.clone()),
                MappingItem::Column(tag) => table.tags.get(tag).map(|v| {
                    terms.insert(tag.clone(), v.clone());
                    v.clone()
                }),
            })
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(&self.glue)
    }
}

#[derive(Debug, Clone)]
enum Naming {
    Pattern(SeriesPattern),
    Mapping(Mapping),
}

/// A discovered Flux table with a numeric value column.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Table {
    measurement: String,
    field: String,
    tags: BTreeMap<String, String>,
}

impl Table {
    fn from_values(values: &BTreeMap<String, Value>) -> Option<Self> {
        let string = |key: &str| match values.get(key) {
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        };
        numeric(values.get(VALUE)?)?;
        let tags = values
            .iter()
            .filter(|(k, _)| !k.starts_with('_') && !matches!(k.as_str(), "result" | "table"))
            .filter_map(|(k, v)| match v {
                Value::String(s) => Some((k.clone(), s.clone())),
                _ => None,
            })
            .collect();
        Some(Self { measurement: string(MEASUREMENT)?, field: string(FIELD)?, tags })
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Double(d) => Some((*d).into()),
        Value::Long(l) => Some(*l as f64),
        Value::UnsignedLong(u) => Some(*u as f64),
        _ => None,
    }
}

/// Quotes a Flux string literal.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

pub struct InfluxDbConnector {
    name: String,
    client: Client,
    bucket: String,
    lookback: String,
    timeout: Duration,
    naming: Naming,
}

impl InfluxDbConnector {
    pub fn new(name: &str, settings: &Settings) -> Result<Self, ConnectorError> {
        let url = settings.required_string("url")?;
        let bucket = settings.required_string("bucket")?;
        let org = settings.string_or("org", "")?;
        let token = settings.string_or("token", "")?;

        let pattern = settings.string("pattern")?.filter(|p| !p.is_empty());
        let naming = match (pattern, Mapping::from_settings(settings)?) {
            (Some(_), Some(_)) => {
                return Err(ConnectorError::invalid_setting("pattern", "\"pattern\" and \"mapping\" are mutually exclusive"))
            }
            (None, None) => return Err(ConnectorError::MissingSetting("pattern".into())),
            (Some(p), None) => Naming::Pattern(SeriesPattern::compile(&p)?),
            (None, Some(m)) => Naming::Mapping(m),
        };

        Ok(Self {
            name: name.to_string(),
            client: Client::new(url.trim_end_matches('/'), org, token),
            bucket,
            lookback: settings.string_or("lookback", DEFAULT_LOOKBACK)?,
            timeout: settings.timeout()?,
            naming,
        })
    }

    pub fn factory(name: &str, settings: &Settings) -> Result<Arc<dyn Connector>, ConnectorError> {
        Ok(Arc::new(Self::new(name, settings)?))
    }

    fn discovery_query(&self) -> String {
        format!(
            "from(bucket: {})\n  |> range(start: {})\n  |> last()",
            quote(&self.bucket),
            self.lookback
        )
    }

    fn points_query(&self, metric: &QueryMetric, start: DateTime<Utc>, end: DateTime<Utc>, step: i64) -> Result<String, ConnectorError> {
        let string = |key: &str| match metric.attributes.get(key) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            _ => Err(ConnectorError::InvalidAttribute(key.to_string())),
        };
        let measurement = string("measurement")?;
        let field = string("field")?;

        let mut flux = format!(
            "from(bucket: {})\n  |> range(start: {}, stop: {})\n  |> filter(fn: (r) => r._measurement == {} and r._field == {})",
            quote(&self.bucket),
            start.to_rfc3339(),
            end.to_rfc3339(),
            quote(&measurement),
            quote(&field),
        );
        match metric.attributes.get("tags") {
            None => {}
            Some(serde_json::Value::Object(tags)) => {
                for (tag, value) in tags {
                    let serde_json::Value::String(value) = value else {
                        return Err(ConnectorError::InvalidAttribute("tags".into()));
                    };
                    flux.push_str(&format!("\n  |> filter(fn: (r) => r[{}] == {})", quote(tag), quote(value)));
                }
            }
            Some(_) => return Err(ConnectorError::InvalidAttribute("tags".into())),
        }
        flux.push_str(&format!(
            "\n  |> group()\n  |> aggregateWindow(every: {step}s, fn: mean, createEmpty: false)\n  |> keep(columns: [\"{TIME}\", \"{VALUE}\"])"
        ));
        Ok(flux)
    }

    fn record(&self, table: &Table) -> Option<Record> {
        let (source, metric, tags) = match &self.naming {
            Naming::Pattern(pattern) => {
                let (source, metric) = pattern.split(&table.measurement)?;
                (source, format!("{metric}{DEFAULT_GLUE}{}", table.field), BTreeMap::new())
            }
            Naming::Mapping(mapping) => {
                let mut terms = BTreeMap::new();
                let source = mapping.assemble(&mapping.source, table, &mut terms);
                let metric = mapping.assemble(&mapping.metric, table, &mut terms);
                let metric = if metric.is_empty() {
                    table.field.clone()
                } else {
                    format!("{metric}{}{}", mapping.glue, table.field)
                };
                (source, metric, terms)
            }
        };
        if source.is_empty() {
            return None;
        }
        Some(
            Record::new(self.name.as_str(), source, metric)
                .with_attribute("measurement", table.measurement.as_str())
                .with_attribute("field", table.field.as_str())
                .with_attribute("tags", json!(tags)),
        )
    }

    async fn query(&self, flux: String) -> Result<Vec<BTreeMap<String, Value>>, ConnectorError> {
        debug!(provider = %self.name, flux = %flux, "running Flux query");
        let records = tokio::time::timeout(self.timeout, self.client.query_raw(Some(Query::new(flux))))
            .await
            .map_err(|_| ConnectorError::Timeout(self.timeout))?
            .map_err(|e| ConnectorError::Backend(e.to_string()))?;
        Ok(records.into_iter().map(|r| r.values).collect())
    }
}

fn to_points(rows: Vec<BTreeMap<String, Value>>) -> Vec<Point> {
    let mut points: Vec<Point> = rows
        .iter()
        .filter_map(|row| {
            let time = match row.get(TIME)? {
                Value::TimeRFC(t) => t.with_timezone(&Utc),
                _ => return None,
            };
            Some(Point::new(time, row.get(VALUE).and_then(numeric).unwrap_or(f64::NAN)))
        })
        .collect();
    points.sort_by_key(|p| p.time);
    points
}

#[async_trait]
impl Connector for InfluxDbConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn refresh(&self, sink: RecordSink) -> Result<(), ConnectorError> {
        let rows = self.query(self.discovery_query()).await?;
        let tables: BTreeSet<Table> = rows.iter().filter_map(Table::from_values).collect();

        // Pattern naming ignores tags, so distinct tables can collapse.
        let mut seen = BTreeSet::new();
        for table in &tables {
            let Some(record) = self.record(table) else {
                debug!(provider = %self.name, measurement = %table.measurement, "series does not map to a source, ignoring");
                continue;
            };
            if !seen.insert((record.source.clone(), record.metric.clone())) {
                continue;
            }
            if sink.send(record).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn points(&self, query: &PointsQuery) -> Result<Vec<Series>, ConnectorError> {
        let step = ((query.end - query.start).num_seconds() / query.sample.max(1) as i64).max(1);
        let mut out = Vec::with_capacity(query.metrics.len());
        for metric in &query.metrics {
            let flux = self.points_query(metric, query.start, query.end, step)?;
            out.push(Series::new(to_points(self.query(flux).await?)));
        }
        Ok(out)
    }
}

//! Connector contract and factory registry.
//!
//! A connector speaks one backend protocol. It enumerates what the backend
//! holds (`refresh`) and fetches points for an ordered list of metrics
//! (`points`). Implementations live in the `gateway-connectors` crate; the
//! registry maps a provider's connector type to a factory and is populated
//! explicitly at program start.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::ErrorKind;
use crate::pattern::PatternError;
use crate::record::{Attributes, Record};
use crate::series::Series;

/// Default backend request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a connector pushes the records it discovers during a refresh.
pub type RecordSink = mpsc::Sender<Record>;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("unsupported connector type {0:?}")]
    Unsupported(String),
    #[error("missing connector setting {0:?}")]
    MissingSetting(String),
    #[error("invalid connector setting {name:?}: {reason}")]
    InvalidSetting { name: String, reason: String },
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error("invalid metric attribute {0:?}")]
    InvalidAttribute(String),
    #[error("backend request failed: {0}")]
    Backend(String),
    #[error("unable to decode backend response: {0}")]
    Decode(String),
    #[error("backend request timed out after {0:?}")]
    Timeout(Duration),
    #[error("refresh task panicked: {0}")]
    Panicked(String),
}

impl ConnectorError {
    pub fn invalid_setting(name: &str, reason: impl Into<String>) -> Self {
        ConnectorError::InvalidSetting { name: name.to_string(), reason: reason.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectorError::Unsupported(_)
            | ConnectorError::MissingSetting(_)
            | ConnectorError::InvalidSetting { .. }
            | ConnectorError::Pattern(_) => ErrorKind::Configuration,
            ConnectorError::Panicked(_) => ErrorKind::Internal,
            _ => ErrorKind::TransientBackend,
        }
    }
}

// ------------------------------------------------------------------ //
//  Query types                                                        //
// ------------------------------------------------------------------ //

/// One metric addressed with backend (pre-filter) names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMetric {
    pub origin: String,
    pub source: String,
    pub metric: String,
    #[serde(default)]
    pub attributes: Attributes,
}

/// A batched points request for one connector.
#[derive(Debug, Clone, PartialEq)]
pub struct PointsQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Desired number of points per series; backends may return fewer.
    pub sample: usize,
    pub metrics: Vec<QueryMetric>,
}

// ------------------------------------------------------------------ //
//  Trait                                                              //
// ------------------------------------------------------------------ //

#[async_trait]
pub trait Connector: Send + Sync {
    /// Origin label published by this connector (the provider name).
    fn name(&self) -> &str;

    /// Enumerates the backend, pushing one record per metric into `sink`.
    /// Records already pushed are kept even when an error is returned.
    async fn refresh(&self, sink: RecordSink) -> Result<(), ConnectorError>;

    /// Returns exactly one series per requested metric, in request order.
    /// Unresolvable metrics yield an empty series.
    async fn points(&self, query: &PointsQuery) -> Result<Vec<Series>, ConnectorError>;
}

// ------------------------------------------------------------------ //
//  Settings                                                           //
// ------------------------------------------------------------------ //

/// Free-form connector settings of a provider, with typed accessors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings(serde_json::Map<String, Value>);

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    pub fn string(&self, key: &str) -> Result<Option<String>, ConnectorError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(ConnectorError::invalid_setting(key, "expected a string")),
        }
    }

    pub fn required_string(&self, key: &str) -> Result<String, ConnectorError> {
        match self.string(key)? {
            Some(s) if !s.is_empty() => Ok(s),
            _ => Err(ConnectorError::MissingSetting(key.to_string())),
        }
    }

    pub fn string_or(&self, key: &str, default: &str) -> Result<String, ConnectorError> {
        Ok(self.string(key)?.unwrap_or_else(|| default.to_string()))
    }

    /// Accepts JSON numbers and numeric strings.
    pub fn u64_or(&self, key: &str, default: u64) -> Result<u64, ConnectorError> {
        match self.get(key) {
            None => Ok(default),
            Some(Value::Number(n)) => n
                .as_u64()
                .ok_or_else(|| ConnectorError::invalid_setting(key, "expected a positive integer")),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map_err(|_| ConnectorError::invalid_setting(key, "expected a positive integer")),
            Some(_) => Err(ConnectorError::invalid_setting(key, "expected a positive integer")),
        }
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool, ConnectorError> {
        match self.get(key) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::String(s)) => s
                .parse()
                .map_err(|_| ConnectorError::invalid_setting(key, "expected a boolean")),
            Some(_) => Err(ConnectorError::invalid_setting(key, "expected a boolean")),
        }
    }

    pub fn string_list_or(&self, key: &str, default: &[&str]) -> Result<Vec<String>, ConnectorError> {
        match self.get(key) {
            None => Ok(default.iter().map(|s| s.to_string()).collect()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    _ => Err(ConnectorError::invalid_setting(key, "expected a list of strings")),
                })
                .collect(),
            Some(_) => Err(ConnectorError::invalid_setting(key, "expected a list of strings")),
        }
    }

    pub fn object(&self, key: &str) -> Result<Option<&serde_json::Map<String, Value>>, ConnectorError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Object(map)) => Ok(Some(map)),
            Some(_) => Err(ConnectorError::invalid_setting(key, "expected an object")),
        }
    }

    /// Request timeout from the `timeout` setting (seconds), defaulting to 10s.
    pub fn timeout(&self) -> Result<Duration, ConnectorError> {
        Ok(Duration::from_secs(self.u64_or("timeout", DEFAULT_TIMEOUT.as_secs())?))
    }
}

impl From<serde_json::Map<String, Value>> for Settings {
    fn from(map: serde_json::Map<String, Value>) -> Self {
        Self(map)
    }
}

// ------------------------------------------------------------------ //
//  Registry                                                           //
// ------------------------------------------------------------------ //

/// Builds a connector from its provider name and settings.
pub type ConnectorFactory =
    Arc<dyn Fn(&str, &Settings) -> Result<Arc<dyn Connector>, ConnectorError> + Send + Sync>;

/// Connector type → factory.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    factories: BTreeMap<String, ConnectorFactory>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, connector_type: &str, factory: F)
    where
        F: Fn(&str, &Settings) -> Result<Arc<dyn Connector>, ConnectorError> + Send + Sync + 'static,
    {
        self.factories.insert(connector_type.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, connector_type: &str) -> bool {
        self.factories.contains_key(connector_type)
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn create(
        &self,
        connector_type: &str,
        name: &str,
        settings: &Settings,
    ) -> Result<Arc<dyn Connector>, ConnectorError> {
        let factory = self
            .factories
            .get(connector_type)
            .ok_or_else(|| ConnectorError::Unsupported(connector_type.to_string()))?;
        factory(name, settings)
    }
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

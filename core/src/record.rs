//! Catalog records as produced by connectors.

use serde::{Deserialize, Serialize};

/// Ordered string → any mapping carrying connector routing hints
/// (tag terms, column names, query targets) from refresh to query time.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// One `(origin, source, metric)` triple discovered by a connector.
///
/// The `original_*` fields hold the names as the backend knows them. They are
/// captured when the record is created and survive any filter rewrite, so that
/// queries are always issued with backend-addressable names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub origin: String,
    pub source: String,
    pub metric: String,
    pub original_origin: String,
    pub original_source: String,
    pub original_metric: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: Attributes,
}

impl Record {
    pub fn new(
        origin: impl Into<String>,
        source: impl Into<String>,
        metric: impl Into<String>,
    ) -> Self {
        let origin = origin.into();
        let source = source.into();
        let metric = metric.into();
        Self {
            original_origin: origin.clone(),
            original_source: source.clone(),
            original_metric: metric.clone(),
            origin,
            source,
            metric,
            attributes: Attributes::new(),
        }
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Adds a single routing attribute.
    pub fn with_attribute(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_captures_original_names() {
        let r = Record::new("o", "s", "m");
        assert_eq!(r.original_origin, "o");
        assert_eq!(r.original_source, "s");
        assert_eq!(r.original_metric, "m");
        assert!(r.attributes.is_empty());
    }

    #[test]
    fn with_attribute_inserts_value() {
        let r = Record::new("o", "s", "m").with_attribute("target", "a.b.c");
        assert_eq!(r.attributes["target"], "a.b.c");
    }
}

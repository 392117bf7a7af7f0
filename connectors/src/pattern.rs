//! Regexps splitting a backend series name into source and metric.

use gateway_core::ConnectorError;
use regex::Regex;

const SOURCE: &str = "source";
const METRIC: &str = "metric";

/// A regexp with exactly the named groups `source` and `metric`.
#[derive(Debug, Clone)]
pub struct SeriesPattern(Regex);

impl SeriesPattern {
    pub fn compile(pattern: &str) -> Result<Self, ConnectorError> {
        let re = Regex::new(pattern).map_err(|e| ConnectorError::invalid_setting("pattern", e.to_string()))?;

        let mut has_source = false;
        let mut has_metric = false;
        for name in re.capture_names().flatten() {
            match name {
                SOURCE => has_source = true,
                METRIC => has_metric = true,
                other => {
                    return Err(ConnectorError::invalid_setting(
                        "pattern",
                        format!("unknown named group {other:?}"),
                    ))
                }
            }
        }
        if !has_source {
            return Err(ConnectorError::invalid_setting("pattern", "missing named group \"source\""));
        }
        if !has_metric {
            return Err(ConnectorError::invalid_setting("pattern", "missing named group \"metric\""));
        }
        Ok(Self(re))
    }

    /// `(source, metric)` extracted from `input`, if it matches.
    pub fn split(&self, input: &str) -> Option<(String, String)> {
        let caps = self.0.captures(input)?;
        Some((caps.name(SOURCE)?.as_str().to_string(), caps.name(METRIC)?.as_str().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_in_either_group_order() {
        let p = SeriesPattern::compile(r"^(?P<source>[^.]+)\.(?P<metric>.+)$").unwrap();
        assert_eq!(p.split("web01.cpu.user"), Some(("web01".into(), "cpu.user".into())));
        assert_eq!(p.split("nodot"), None);

        let reversed = SeriesPattern::compile(r"^(?P<metric>[^@]+)@(?P<source>.+)$").unwrap();
        assert_eq!(reversed.split("load@db01"), Some(("db01".into(), "load".into())));
    }

    #[test]
    fn rejects_missing_or_unknown_groups() {
        assert!(SeriesPattern::compile(r"^(?P<source>.+)$").is_err());
        assert!(SeriesPattern::compile(r"^(?P<metric>.+)$").is_err());
        assert!(SeriesPattern::compile(r"^(?P<source>.+)\.(?P<metric>.+)\.(?P<other>.+)$").is_err());
        assert!(SeriesPattern::compile(r"(").is_err());
    }
}

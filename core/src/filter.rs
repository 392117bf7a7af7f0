//! Provider filter chains: ordered rewrite / discard / sieve rules applied to
//! every record a connector emits, before it reaches the catalog.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;
use crate::pattern::{Pattern, PatternError};
use crate::record::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterAction {
    Rewrite,
    Discard,
    Sieve,
}

/// Which record field(s) a rule inspects. The empty target covers source and
/// metric, each evaluated on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterTarget {
    Origin,
    Source,
    Metric,
    #[default]
    #[serde(rename = "")]
    Any,
}

#[derive(Debug, Clone, Copy)]
enum Field {
    Origin,
    Source,
    Metric,
}

impl FilterTarget {
    fn fields(self) -> &'static [Field] {
        match self {
            FilterTarget::Origin => &[Field::Origin],
            FilterTarget::Source => &[Field::Source],
            FilterTarget::Metric => &[Field::Metric],
            FilterTarget::Any => &[Field::Source, Field::Metric],
        }
    }
}

impl Field {
    fn get(self, record: &Record) -> &str {
        match self {
            Field::Origin => &record.origin,
            Field::Source => &record.source,
            Field::Metric => &record.metric,
        }
    }

    fn set(self, record: &mut Record, value: String) {
        match self {
            Field::Origin => record.origin = value,
            Field::Source => record.source = value,
            Field::Metric => record.metric = value,
        }
    }
}

/// A persisted filter rule, as stored in a provider definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    pub action: FilterAction,
    #[serde(default)]
    pub target: FilterTarget,
    pub pattern: String,
    #[serde(default, alias = "into", skip_serializing_if = "String::is_empty")]
    pub replacement: String,
}

impl FilterRule {
    pub fn new(action: FilterAction, target: FilterTarget, pattern: &str, replacement: &str) -> Self {
        Self {
            action,
            target,
            pattern: pattern.to_string(),
            replacement: replacement.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filter rule #{index}: {source}")]
    Pattern {
        index: usize,
        #[source]
        source: PatternError,
    },
}

impl FilterError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    action: FilterAction,
    target: FilterTarget,
    pattern: Pattern,
    replacement: String,
}

/// Compiled, immutable filter chain.
#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    rules: Vec<CompiledRule>,
}

impl FilterChain {
    /// Compiles every rule pattern once. Unprefixed patterns are regexps.
    pub fn new(rules: &[FilterRule]) -> Result<Self, FilterError> {
        let rules = rules
            .iter()
            .enumerate()
            .map(|(index, rule)| {
                let pattern = Pattern::parse_regexp_default(&rule.pattern)
                    .map_err(|source| FilterError::Pattern { index, source })?;
                Ok(CompiledRule {
                    action: rule.action,
                    target: rule.target,
                    pattern,
                    replacement: rule.replacement.clone(),
                })
            })
            .collect::<Result<Vec<_>, FilterError>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Runs `record` through the chain, returning the rewritten copy or `None`
    /// when a discard or sieve rule drops it. Original names are never touched.
    pub fn apply(&self, record: &Record) -> Option<Record> {
        let mut out = record.clone();

        for rule in &self.rules {
            for &field in rule.target.fields() {
                match rule.action {
                    FilterAction::Rewrite => {
                        if let Some(value) = rule.pattern.rewrite(field.get(&out), &rule.replacement) {
                            field.set(&mut out, value);
                        }
                    }
                    FilterAction::Discard => {
                        if rule.pattern.is_match(field.get(&out)) {
                            return None;
                        }
                    }
                    FilterAction::Sieve => {
                        if !rule.pattern.is_match(field.get(&out)) {
                            return None;
                        }
                    }
                }
            }
        }

        Some(out)
    }
}

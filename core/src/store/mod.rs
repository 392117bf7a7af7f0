//! Persistence contract for library entities.
//!
//! A [`Store`] only moves JSON documents keyed by `(kind, id)`; typing,
//! validation and referential integrity live in [`crate::library::Library`],
//! so every backend behaves the same.

mod memory;

use std::cmp::Ordering;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::model::{EntityKind, ValidationError};
use crate::pattern::{Pattern, PatternError};
use crate::template::TemplateError;

pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} item {key:?} not found")]
    NotFound { kind: EntityKind, key: String },
    #[error("{kind} item with {field} {value:?} already exists")]
    Conflict { kind: EntityKind, field: &'static str, value: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("referenced {kind} item {id} does not exist")]
    MissingReference { kind: EntityKind, id: Uuid },
    #[error("referenced {kind} item {id} is not a template")]
    NotTemplate { kind: EntityKind, id: Uuid },
    #[error("parent {0} would create a cycle")]
    Cycle(Uuid),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error("stored {kind} item is malformed: {source}")]
    Decode {
        kind: EntityKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("store backend failure: {0:#}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn not_found(kind: EntityKind, key: impl ToString) -> Self {
        StoreError::NotFound { kind, key: key.to_string() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound { .. } => ErrorKind::Resolution,
            StoreError::Conflict { .. } => ErrorKind::Conflict,
            StoreError::Validation(e) => e.kind(),
            StoreError::MissingReference { .. }
            | StoreError::NotTemplate { .. }
            | StoreError::Cycle(_) => ErrorKind::Referential,
            StoreError::Template(_) => ErrorKind::Template,
            StoreError::Pattern(_) => ErrorKind::Configuration,
            StoreError::Decode { .. } | StoreError::Backend(_) => ErrorKind::Internal,
        }
    }
}

/// Raw document storage.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, kind: EntityKind, id: Uuid) -> Result<Option<Value>, StoreError>;

    /// Every document of `kind`, in no particular order.
    async fn list(&self, kind: EntityKind) -> Result<Vec<Value>, StoreError>;

    /// Inserts or replaces the document.
    async fn save(&self, kind: EntityKind, id: Uuid, body: Value) -> Result<(), StoreError>;

    /// Returns whether a document was removed.
    async fn delete(&self, kind: EntityKind, id: Uuid) -> Result<bool, StoreError>;
}

// ------------------------------------------------------------------ //
//  List queries                                                       //
// ------------------------------------------------------------------ //

/// Literal filter value selecting missing or null fields.
pub const NULL_FILTER: &str = "null";

/// Filter, sort and page over documents of one kind.
///
/// Filter values follow the pattern convention (`glob:`, `regexp:`, literal)
/// and `null` selects documents where the field is absent or null.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub filters: Vec<(String, String)>,
    /// Field to sort on, `-` prefixed for descending. Defaults to `name`.
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub limit: Option<usize>,
}

enum Condition {
    IsNull,
    Matches(Pattern),
}

impl ListQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, field: &str, value: &str) -> Self {
        self.filters.push((field.to_string(), value.to_string()));
        self
    }

    pub fn sort(mut self, field: &str) -> Self {
        self.sort = Some(field.to_string());
        self
    }

    pub fn page(mut self, offset: usize, limit: Option<usize>) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }

    /// Filters, sorts and pages `docs`. Returns the page and the number of
    /// documents that matched before paging.
    pub fn apply(&self, docs: Vec<Value>) -> Result<(Vec<Value>, usize), PatternError> {
        let conditions = self
            .filters
            .iter()
            .map(|(field, value)| {
                let cond = if value == NULL_FILTER {
                    Condition::IsNull
                } else {
                    Condition::Matches(Pattern::parse(value)?)
                };
                Ok((field.as_str(), cond))
            })
            .collect::<Result<Vec<_>, PatternError>>()?;

        let mut matched: Vec<Value> = docs
            .into_iter()
            .filter(|doc| conditions.iter().all(|(field, cond)| check(doc.get(*field), cond)))
            .collect();
        let total = matched.len();

        let (field, descending) = match self.sort.as_deref() {
            Some(s) if s.starts_with('-') => (&s[1..], true),
            Some(s) => (s, false),
            None => ("name", false),
        };
        matched.sort_by(|a, b| {
            let ord = compare(a.get(field), b.get(field));
            if descending {
                ord.reverse()
            } else {
                ord
            }
        });

        let page = matched
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect();
        Ok((page, total))
    }
}

fn check(value: Option<&Value>, cond: &Condition) -> bool {
    match (cond, value) {
        (Condition::IsNull, None | Some(Value::Null)) => true,
        (Condition::IsNull, _) => false,
        (Condition::Matches(p), Some(Value::String(s))) => p.is_match(s),
        (Condition::Matches(p), Some(v @ (Value::Number(_) | Value::Bool(_)))) => p.is_match(&v.to_string()),
        (Condition::Matches(_), _) => false,
    }
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

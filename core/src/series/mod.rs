//! Time series values, resampling and group arithmetic.
//!
//! Missing values are `f64::NAN` all the way through; they become JSON
//! `null` on the wire and `null` decodes back to NaN.

mod normalize;
mod ops;
mod summary;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeTuple, Serializer};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;

pub use normalize::{interpolate, normalize};
pub use ops::{average, sum};
pub use summary::{percentile, percentile_label};

#[derive(Debug, Error, PartialEq)]
pub enum SeriesError {
    #[error("sample must be greater than zero")]
    InvalidSample,
    #[error("time range is empty or inverted")]
    InvalidRange,
    #[error("series are not normalized (lengths {0} and {1} differ)")]
    Unnormalized(usize, usize),
    #[error("unknown {what} code {code}")]
    UnknownCode { what: &'static str, code: u64 },
    #[error("unknown {what} name {name:?}")]
    UnknownName { what: &'static str, name: String },
}

impl SeriesError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SeriesError::UnknownCode { .. }
            | SeriesError::UnknownName { .. }
            | SeriesError::InvalidSample
            | SeriesError::InvalidRange => ErrorKind::Identity,
            SeriesError::Unnormalized(..) => ErrorKind::Internal,
        }
    }
}

// ------------------------------------------------------------------ //
//  Point / Series                                                     //
// ------------------------------------------------------------------ //

/// A timestamped value; NaN means "no data".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub time: DateTime<Utc>,
    pub value: f64,
}

impl Point {
    pub fn new(time: DateTime<Utc>, value: f64) -> Self {
        Self { time, value }
    }
}

/// Encoded as `[epoch-seconds, value|null]`. Seconds are an integer unless
/// the time has a sub-second part, which grids with a fractional step do.
impl Serialize for Point {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        match self.time.timestamp_subsec_nanos() {
            0 => tuple.serialize_element(&self.time.timestamp())?,
            nanos => tuple.serialize_element(&(self.time.timestamp() as f64 + f64::from(nanos) / 1e9))?,
        }
        tuple.serialize_element(&finite(self.value))?;
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for Point {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PointVisitor;

        impl<'de> Visitor<'de> for PointVisitor {
            type Value = Point;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a [timestamp, value] pair")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Point, A::Error> {
                let ts: f64 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let value: Option<f64> = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let time = from_epoch(ts).ok_or_else(|| de::Error::custom("timestamp out of range"))?;
                Ok(Point::new(time, value.unwrap_or(f64::NAN)))
            }
        }

        deserializer.deserialize_tuple(2, PointVisitor)
    }
}

/// Statistic label → value.
pub type Summary = BTreeMap<String, f64>;

/// Ordered points plus their summary statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Series {
    #[serde(default)]
    pub points: Vec<Point>,
    #[serde(default, serialize_with = "serialize_summary", deserialize_with = "deserialize_summary")]
    pub summary: Summary,
}

impl Series {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points, summary: Summary::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.points.iter().map(|p| p.value)
    }

    /// Multiplies every value by `factor`; NaN stays NaN.
    pub fn scale(&mut self, factor: f64) {
        for p in &mut self.points {
            p.value *= factor;
        }
    }

    /// Replaces every NaN with zero.
    pub fn zero_nulls(&mut self) {
        for p in &mut self.points {
            if p.value.is_nan() {
                p.value = 0.0;
            }
        }
    }

    /// Fills `min`, `max`, `avg`, `last` and the requested percentiles.
    pub fn summarize(&mut self, percentiles: &[f64]) {
        self.summary = summary::summarize(&self.points, percentiles);
    }
}

fn finite(v: f64) -> Option<f64> {
    if v.is_finite() {
        Some(v)
    } else {
        None
    }
}

pub(crate) fn from_epoch(ts: f64) -> Option<DateTime<Utc>> {
    let secs = ts.floor();
    let nanos = ((ts - secs) * 1e9).round() as u32;
    Utc.timestamp_opt(secs as i64, nanos.min(999_999_999)).single()
}

fn serialize_summary<S: Serializer>(summary: &Summary, serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(summary.len()))?;
    for (k, v) in summary {
        map.serialize_entry(k, &finite(*v))?;
    }
    map.end()
}

fn deserialize_summary<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Summary, D::Error> {
    let raw: BTreeMap<String, Option<f64>> = BTreeMap::deserialize(deserializer)?;
    Ok(raw.into_iter().map(|(k, v)| (k, v.unwrap_or(f64::NAN))).collect())
}

// ------------------------------------------------------------------ //
//  Consolidation / Operator                                           //
// ------------------------------------------------------------------ //

/// Reduction applied to the raw points falling into one output bucket.
///
/// Encoded on the wire as an integer (`0` average, `1` first, `2` last,
/// `3` max, `4` min, `5` sum); names are accepted on input too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "CodeOrName", into = "u8")]
pub enum Consolidation {
    #[default]
    Average,
    First,
    Last,
    Max,
    Min,
    Sum,
}

impl Consolidation {
    const ALL: [Consolidation; 6] = [
        Consolidation::Average,
        Consolidation::First,
        Consolidation::Last,
        Consolidation::Max,
        Consolidation::Min,
        Consolidation::Sum,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Consolidation::Average => "average",
            Consolidation::First => "first",
            Consolidation::Last => "last",
            Consolidation::Max => "max",
            Consolidation::Min => "min",
            Consolidation::Sum => "sum",
        }
    }
}

impl From<Consolidation> for u8 {
    fn from(c: Consolidation) -> u8 {
        c as u8
    }
}

/// Combination applied across the series of a group after normalization.
///
/// Encoded as `0` none, `1` average, `2` sum, `3` normalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "CodeOrName", into = "u8")]
pub enum Operator {
    #[default]
    None,
    Average,
    Sum,
    Normalize,
}

impl Operator {
    const ALL: [Operator; 4] = [Operator::None, Operator::Average, Operator::Sum, Operator::Normalize];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::None => "none",
            Operator::Average => "average",
            Operator::Sum => "sum",
            Operator::Normalize => "normalize",
        }
    }
}

impl From<Operator> for u8 {
    fn from(o: Operator) -> u8 {
        o as u8
    }
}

/// Wire form of enum codes: an integer or a case-insensitive name.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CodeOrName {
    Code(u64),
    Name(String),
}

macro_rules! code_or_name {
    ($ty:ident, $what:literal) => {
        impl TryFrom<CodeOrName> for $ty {
            type Error = SeriesError;

            fn try_from(raw: CodeOrName) -> Result<Self, Self::Error> {
                match raw {
                    CodeOrName::Code(code) => $ty::ALL
                        .into_iter()
                        .find(|v| *v as u64 == code)
                        .ok_or(SeriesError::UnknownCode { what: $what, code }),
                    CodeOrName::Name(name) => $ty::ALL
                        .into_iter()
                        .find(|v| v.as_str().eq_ignore_ascii_case(&name))
                        .ok_or(SeriesError::UnknownName { what: $what, name }),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

code_or_name!(Consolidation, "consolidation");
code_or_name!(Operator, "operator");

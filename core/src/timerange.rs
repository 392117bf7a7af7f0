//! Relative time ranges such as `-1h`, `-1d 12h` or `+2mo`.

use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Duration, Months, Utc};
use regex::Regex;
use thiserror::Error;

use crate::error::ErrorKind;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("invalid time range {0:?}")]
    Invalid(String),
    #[error("time range {0:?} overflows the calendar")]
    Overflow(String),
    #[error("start time must be before end time")]
    Inverted,
}

impl RangeError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Identity
    }
}

/// A calendar-aware signed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeRange {
    negative: bool,
    months: u32,
    days: i64,
    seconds: i64,
}

fn range_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([+-]?)\s*((?:\d+\s*[a-z]+\s*)+)$").expect("time range regex is valid")
    })
}

fn unit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)\s*([a-z]+)").expect("time unit regex is valid"))
}

fn add_scaled(total: i64, n: i64, factor: i64) -> Option<i64> {
    n.checked_mul(factor).and_then(|v| total.checked_add(v))
}

impl FromStr for TimeRange {
    type Err = RangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RangeError::Invalid(s.to_string());
        let input = s.trim().to_ascii_lowercase();
        let caps = range_re().captures(&input).ok_or_else(invalid)?;

        let mut range = TimeRange { negative: &caps[1] == "-", ..Default::default() };
        for unit in unit_re().captures_iter(&caps[2]) {
            let n: u32 = unit[1].parse().map_err(|_| invalid())?;
            let n64 = i64::from(n);
            match &unit[2] {
                "y" | "year" | "years" => {
                    range.months = n.checked_mul(12).and_then(|m| range.months.checked_add(m)).ok_or_else(invalid)?
                }
                "mo" | "month" | "months" => range.months = range.months.checked_add(n).ok_or_else(invalid)?,
                "w" | "week" | "weeks" => range.days = add_scaled(range.days, n64, 7).ok_or_else(invalid)?,
                "d" | "day" | "days" => range.days = add_scaled(range.days, n64, 1).ok_or_else(invalid)?,
                "h" | "hour" | "hours" => range.seconds = add_scaled(range.seconds, n64, 3600).ok_or_else(invalid)?,
                "m" | "min" | "minute" | "minutes" => {
                    range.seconds = add_scaled(range.seconds, n64, 60).ok_or_else(invalid)?
                }
                "s" | "sec" | "second" | "seconds" => {
                    range.seconds = add_scaled(range.seconds, n64, 1).ok_or_else(invalid)?
                }
                _ => return Err(invalid()),
            }
        }

        Ok(range)
    }
}

impl TimeRange {
    pub fn is_negative(&self) -> bool {
        self.negative
    }

    /// Shifts `t` by this range (backwards when negative).
    pub fn apply(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let months = Months::new(self.months);
        let delta = Duration::try_days(self.days)?.checked_add(&Duration::try_seconds(self.seconds)?)?;
        if self.negative {
            t.checked_sub_months(months)?.checked_sub_signed(delta)
        } else {
            t.checked_add_months(months)?.checked_add_signed(delta)
        }
    }

    /// Window anchored at `reference`: a negative range ends there, a
    /// positive one starts there.
    pub fn window(&self, reference: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let other = self.apply(reference)?;
        Some(if self.negative { (other, reference) } else { (reference, other) })
    }
}

/// Resolves a request window from either explicit bounds or a reference time
/// plus range.
pub fn resolve(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    reference: DateTime<Utc>,
    range: &str,
) -> Result<(DateTime<Utc>, DateTime<Utc>), RangeError> {
    let (start, end) = match (start, end) {
        (Some(start), Some(end)) => (start, end),
        (None, None) => {
            let parsed: TimeRange = range.parse()?;
            parsed
                .window(reference)
                .ok_or_else(|| RangeError::Overflow(range.to_string()))?
        }
        _ => return Err(RangeError::Invalid("start and end time must be given together".into())),
    };

    if start >= end {
        return Err(RangeError::Inverted);
    }
    Ok((start, end))
}

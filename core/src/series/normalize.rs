use chrono::{DateTime, Duration, Utc};

use super::{Consolidation, Point, Series, SeriesError};

/// Resamples every series onto the grid `start + k * step` for
/// `k in 0..sample`, with `step = (end - start) / sample`.
///
/// A point at `t` falls into bucket `floor((t - start) / step)`; points outside
/// `[start, end)` are dropped. Each bucket is reduced with `consolidation`;
/// empty buckets are NaN. With `interpolate`, NaN runs bounded on both sides
/// are filled linearly. Empty input series stay empty.
pub fn normalize(
    series: &[Series],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    sample: usize,
    consolidation: Consolidation,
    interpolate: bool,
) -> Result<Vec<Series>, SeriesError> {
    if sample == 0 {
        return Err(SeriesError::InvalidSample);
    }
    let span = (end - start).num_nanoseconds().ok_or(SeriesError::InvalidRange)?;
    let step = span / sample as i64;
    if span <= 0 || step == 0 {
        return Err(SeriesError::InvalidRange);
    }

    Ok(series
        .iter()
        .map(|s| {
            if s.is_empty() {
                return Series::default();
            }
            resample(s, start, end, step, sample, consolidation, interpolate)
        })
        .collect())
}

fn resample(
    series: &Series,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    step: i64,
    sample: usize,
    consolidation: Consolidation,
    fill: bool,
) -> Series {
    let mut buckets: Vec<Vec<f64>> = vec![Vec::new(); sample];

    for p in &series.points {
        if p.time < start || p.time >= end {
            continue;
        }
        let Some(offset) = (p.time - start).num_nanoseconds() else {
            continue;
        };
        let idx = (offset / step) as usize;
        if idx < sample {
            buckets[idx].push(p.value);
        }
    }

    let mut values: Vec<f64> = buckets.iter().map(|b| consolidate(b, consolidation)).collect();
    if fill {
        interpolate(&mut values);
    }

    Series::new(
        values
            .into_iter()
            .enumerate()
            .map(|(i, v)| Point::new(start + Duration::nanoseconds(step * i as i64), v))
            .collect(),
    )
}

fn consolidate(values: &[f64], consolidation: Consolidation) -> f64 {
    let mut finite = values.iter().copied().filter(|v| !v.is_nan());

    match consolidation {
        Consolidation::Average => {
            let (total, count) = finite.fold((0.0, 0usize), |(t, c), v| (t + v, c + 1));
            if count == 0 {
                f64::NAN
            } else {
                total / count as f64
            }
        }
        Consolidation::Sum => finite.reduce(|a, b| a + b).unwrap_or(f64::NAN),
        Consolidation::Min => finite.reduce(f64::min).unwrap_or(f64::NAN),
        Consolidation::Max => finite.reduce(f64::max).unwrap_or(f64::NAN),
        Consolidation::First => finite.next().unwrap_or(f64::NAN),
        Consolidation::Last => finite.last().unwrap_or(f64::NAN),
    }
}

/// Fills NaN runs that have a finite value on both sides by linear
/// interpolation. Leading and trailing runs are left untouched.
pub fn interpolate(values: &mut [f64]) {
    let mut last_finite: Option<usize> = None;

    for i in 0..values.len() {
        if values[i].is_nan() {
            continue;
        }
        if let Some(prev) = last_finite {
            if i - prev > 1 {
                let (from, to) = (values[prev], values[i]);
                let span = (i - prev) as f64;
                for j in prev + 1..i {
                    values[j] = from + (to - from) * (j - prev) as f64 / span;
                }
            }
        }
        last_finite = Some(i);
    }
}

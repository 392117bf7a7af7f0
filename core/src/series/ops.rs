use super::{Point, Series, SeriesError};

/// Bucket-wise mean across normalized series. NaNs are excluded; a bucket
/// with no finite value stays NaN. Empty series are ignored.
pub fn average(series: &[Series]) -> Result<Series, SeriesError> {
    combine(series, |values| {
        let (total, count) = values
            .iter()
            .filter(|v| !v.is_nan())
            .fold((0.0, 0usize), |(t, c), v| (t + v, c + 1));
        if count == 0 {
            f64::NAN
        } else {
            total / count as f64
        }
    })
}

/// Bucket-wise sum across normalized series, with the same NaN policy as
/// [`average`].
pub fn sum(series: &[Series]) -> Result<Series, SeriesError> {
    combine(series, |values| {
        values
            .iter()
            .copied()
            .filter(|v| !v.is_nan())
            .reduce(|a, b| a + b)
            .unwrap_or(f64::NAN)
    })
}

fn combine(series: &[Series], reduce: impl Fn(&[f64]) -> f64) -> Result<Series, SeriesError> {
    let present: Vec<&Series> = series.iter().filter(|s| !s.is_empty()).collect();
    let Some(first) = present.first() else {
        return Ok(Series::default());
    };

    let len = first.len();
    if let Some(other) = present.iter().find(|s| s.len() != len) {
        return Err(SeriesError::Unnormalized(len, other.len()));
    }

    let mut column = Vec::with_capacity(present.len());
    let points = (0..len)
        .map(|i| {
            column.clear();
            column.extend(present.iter().map(|s| s.points[i].value));
            Point::new(first.points[i].time, reduce(&column))
        })
        .collect();

    Ok(Series::new(points))
}

use super::{Point, Summary};

pub(super) fn summarize(points: &[Point], percentiles: &[f64]) -> Summary {
    let mut finite: Vec<f64> = points.iter().map(|p| p.value).filter(|v| !v.is_nan()).collect();

    let mut summary = Summary::new();
    let (min, max, avg, last) = match finite.last().copied() {
        None => (f64::NAN, f64::NAN, f64::NAN, f64::NAN),
        Some(last) => (
            finite.iter().copied().fold(f64::INFINITY, f64::min),
            finite.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            finite.iter().sum::<f64>() / finite.len() as f64,
            last,
        ),
    };
    summary.insert("min".into(), min);
    summary.insert("max".into(), max);
    summary.insert("avg".into(), avg);
    summary.insert("last".into(), last);

    if !percentiles.is_empty() {
        finite.sort_by(f64::total_cmp);
        for &p in percentiles {
            summary.insert(percentile_label(p), percentile(&finite, p));
        }
    }

    summary
}

/// Linear-interpolated `p`-th percentile of an ascending slice, using rank
/// `p / 100 * (n + 1)` clamped to the slice ends. NaN when empty.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return f64::NAN;
    }

    let rank = p / 100.0 * (n as f64 + 1.0);
    if rank <= 1.0 {
        return sorted[0];
    }
    if rank >= n as f64 {
        return sorted[n - 1];
    }

    let k = rank.floor() as usize;
    let frac = rank - k as f64;
    sorted[k - 1] + frac * (sorted[k] - sorted[k - 1])
}

/// `"90th"` for integral percentiles, `"99.90th"` otherwise.
pub fn percentile_label(p: f64) -> String {
    if p.fract() == 0.0 {
        format!("{}th", p as i64)
    } else {
        format!("{p:.2}th")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::tests::grid;
    use proptest::prelude::*;

    #[test]
    fn summary_over_finite_values() {
        let mut s = grid(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0], 60);
        s.summarize(&[]);
        assert_eq!(s.summary["min"], 1.0);
        assert_eq!(s.summary["max"], 10.0);
        assert_eq!(s.summary["avg"], 5.5);
        assert_eq!(s.summary["last"], 10.0);
    }

    #[test]
    fn last_skips_trailing_nan() {
        let mut s = grid(&[1.0, 2.0, f64::NAN], 60);
        s.summarize(&[]);
        assert_eq!(s.summary["last"], 2.0);
    }

    #[test]
    fn all_nan_summary() {
        let mut s = grid(&[f64::NAN, f64::NAN], 60);
        s.summarize(&[50.0]);
        assert!(s.summary["min"].is_nan());
        assert!(s.summary["avg"].is_nan());
        assert!(s.summary["50th"].is_nan());
    }

    #[test]
    fn percentile_interpolates() {
        let v = [15.0, 20.0, 35.0, 40.0, 50.0];
        assert_eq!(percentile(&v, 50.0), 35.0);
        assert!((percentile(&v, 40.0) - 26.0).abs() < 1e-9);
        assert_eq!(percentile(&v, 1.0), 15.0);
        assert_eq!(percentile(&v, 99.0), 50.0);
        assert_eq!(percentile(&[7.0], 50.0), 7.0);
    }

    #[test]
    fn percentile_labels() {
        assert_eq!(percentile_label(90.0), "90th");
        assert_eq!(percentile_label(99.9), "99.90th");
        assert_eq!(percentile_label(33.333), "33.33th");
    }

    #[test]
    fn summary_contains_requested_percentiles() {
        let mut s = grid(&[4.0, 1.0, 3.0, 2.0], 60);
        s.summarize(&[50.0, 95.5]);
        assert_eq!(s.summary["50th"], 2.5);
        assert_eq!(s.summary["95.50th"], 4.0);
    }

    proptest! {
        #[test]
        fn percentiles_are_bounded_and_ordered(
            mut values in proptest::collection::vec(-1e6f64..1e6, 1..100)
        ) {
            values.sort_by(f64::total_cmp);
            let min = values[0];
            let max = values[values.len() - 1];
            let p25 = percentile(&values, 25.0);
            let p50 = percentile(&values, 50.0);
            let p75 = percentile(&values, 75.0);
            prop_assert!(min <= p25 && p25 <= p50 && p50 <= p75 && p75 <= max);
        }
    }
}

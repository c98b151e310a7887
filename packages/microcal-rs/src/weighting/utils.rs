// src/weighting/utils.rs

use ndarray::{Array1, ArrayView1, Axis, Zip};
use rayon::prelude::*;

/// Sum values by group for a 1D array
pub fn sum_by_group_1d(
    values: ArrayView1<f64>,
    indices: &[usize],
    n_groups: usize,
) -> Array1<f64> {
    let mut sums = Array1::zeros(n_groups);

    for (i, &group_id) in indices.iter().enumerate() {
        sums[group_id] += values[i];
    }

    sums
}

/// Sum in fixed-size chunks, then add the chunk totals in order.
///
/// The result does not depend on how many rayon workers ran.
pub fn chunked_sum(values: ArrayView1<f64>, chunk_size: usize) -> f64 {
    let partials: Vec<f64> = values
        .axis_chunks_iter(Axis(0), chunk_size.max(1))
        .into_par_iter()
        .map(|chunk| chunk.sum())
        .collect();
    partials.iter().sum()
}

/// Per-row log-space bounds `ln(w0) + ln(min_ratio)` and `ln(w0) + ln(max_ratio)`.
pub fn log_bounds(
    initial: ArrayView1<f64>,
    min_ratio: f64,
    max_ratio: f64,
) -> (Array1<f64>, Array1<f64>) {
    let (ln_min, ln_max) = (min_ratio.ln(), max_ratio.ln());
    let lower = initial.mapv(|w| w.ln() + ln_min);
    let upper = initial.mapv(|w| w.ln() + ln_max);
    (lower, upper)
}

/// First row whose `weight / initial` ratio falls outside the bounds.
pub fn check_bounds(
    weights: ArrayView1<f64>,
    initial: ArrayView1<f64>,
    min_ratio: f64,
    max_ratio: f64,
) -> Option<(usize, f64)> {
    for (row, (&w, &w0)) in weights.iter().zip(initial.iter()).enumerate() {
        if w0 > 1e-10 {
            let ratio = w / w0;
            if ratio < min_ratio || ratio > max_ratio {
                return Some((row, ratio));
            }
        }
    }
    None
}

/// `weight / initial` per row.
pub fn weight_ratios(weights: ArrayView1<f64>, initial: ArrayView1<f64>) -> Array1<f64> {
    let mut ratios = Array1::zeros(weights.len());
    Zip::from(&mut ratios)
        .and(weights)
        .and(initial)
        .for_each(|r, &w, &w0| *r = if w0 > 0.0 { w / w0 } else { 1.0 });
    ratios
}

/// Min, max, mean and population standard deviation.
pub fn summarize(values: ArrayView1<f64>) -> (f64, f64, f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0, 0.0, 0.0);
    }
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean = values.sum() / values.len() as f64;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    (min, max, mean, var.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_sum_by_group_1d() {
        let weights = array![1.0, 2.0, 3.0, 4.0];
        let indices = vec![0, 0, 1, 1];
        let sums = sum_by_group_1d(weights.view(), &indices, 2);

        assert_eq!(sums[0], 3.0);
        assert_eq!(sums[1], 7.0);
    }

    #[test]
    fn test_chunked_sum_independent_of_threads() {
        let values = Array1::from_iter((0..10_000).map(|i| 1.0 / (i as f64 + 1.0)));
        let a = chunked_sum(values.view(), 64);
        let b = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .unwrap()
            .install(|| chunked_sum(values.view(), 64));
        assert_eq!(a.to_bits(), b.to_bits());
    }

    #[test]
    fn test_check_bounds_reports_first_violation() {
        let initial = array![1.0, 2.0, 4.0];
        let weights = array![1.5, 5.0, 0.1];

        let violation = check_bounds(weights.view(), initial.view(), 0.5, 2.0);
        assert_eq!(violation, Some((1, 2.5)));
        assert!(check_bounds(initial.view(), initial.view(), 0.5, 2.0).is_none());
    }

    #[test]
    fn test_log_bounds() {
        let initial = array![1.0, 10.0];
        let (lower, upper) = log_bounds(initial.view(), 0.5, 2.0);
        assert_relative_eq!(lower[1].exp(), 5.0, epsilon = 1e-12);
        assert_relative_eq!(upper[0].exp(), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_summarize() {
        let (min, max, mean, std) = summarize(array![1.0, 3.0].view());
        assert_eq!((min, max, mean), (1.0, 3.0, 2.0));
        assert_relative_eq!(std, 1.0, epsilon = 1e-12);
    }
}

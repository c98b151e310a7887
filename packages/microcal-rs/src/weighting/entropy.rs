// src/weighting/entropy.rs

use std::time::Instant;

use ndarray::{Array1, ArrayView1, Zip};
use tracing::{info, warn};

use super::gradient::{Adam, CalibrationOutcome, CalibrationProblem, CalibrationStatus, Progress, Verdict};
use super::indicator::IndicatorMatrix;
use super::utils::check_bounds;
use crate::config::{BoundsPolicy, CalibrationConfig};
use crate::error::{CalibrationError, Result};

/// Minimum-divergence calibration through its dual.
///
/// Weights take the raking form `w0 × exp(clip(A·(s∘λ)))` with one multiplier
/// per target; `s` rescales each column to unit mean magnitude so count and
/// amount targets move at comparable rates. The multipliers follow Adam on
/// the dual gradient `(estimate - target) / (|target| + 1)`. Progress is
/// judged on the same grouped loss as the gradient calibrator.
pub fn calibrate_entropy(
    problem: &CalibrationProblem<'_>,
    config: &CalibrationConfig,
    initial_weights: ArrayView1<f64>,
) -> Result<CalibrationOutcome> {
    let matrix = problem.matrix();
    let n = matrix.n_rows();
    if initial_weights.len() != n {
        return Err(CalibrationError::DimensionMismatch {
            expected: n,
            got: initial_weights.len(),
        });
    }

    let (min_ratio, max_ratio) = config.weight_bounds;
    let (ln_min, ln_max) = (min_ratio.ln(), max_ratio.ln());
    let col_scale = column_scale(matrix);
    let targets = problem.targets();
    let deadline = config.time_limit();
    let start = Instant::now();

    let mut lambda: Array1<f64> = Array1::zeros(matrix.n_cols());
    let mut adam = Adam::new(lambda.len(), config.learning_rate);
    let mut progress = Progress::new(config);
    let mut weights = initial_weights.to_owned();
    let mut at_bound = vec![false; n];
    let mut best_weights = weights.clone();
    let mut best_at_bound = at_bound.clone();
    let mut steps = 0;
    let mut status = CalibrationStatus::MaxEpochs;

    info!(
        rows = n,
        targets = targets.len(),
        epochs = config.epochs,
        "optimizing entropy dual"
    );

    for epoch in 0..=config.epochs {
        let evaluation = problem.evaluate(weights.view());
        let (improved, verdict) = progress.observe(epoch, evaluation.loss);
        if improved {
            best_weights.assign(&weights);
            best_at_bound.copy_from_slice(&at_bound);
        }
        if let Verdict::Stop(s) = verdict {
            status = s;
            break;
        }
        if epoch == config.epochs {
            break;
        }
        if deadline.is_some_and(|limit| start.elapsed() >= limit) {
            warn!(epoch, "time limit reached");
            break;
        }

        let mut grad = Array1::zeros(lambda.len());
        Zip::from(&mut grad)
            .and(&evaluation.estimates)
            .and(&targets)
            .for_each(|g, &est, &y| *g = (est - y) / (y.abs() + 1.0));
        adam.step(&mut lambda, &grad);
        steps += 1;

        let eta = matrix.row_products((&lambda * &col_scale).view());
        if config.bounds_policy == BoundsPolicy::Fail {
            let raw = &initial_weights * &eta.mapv(f64::exp);
            if let Some((row, ratio)) = check_bounds(raw.view(), initial_weights, min_ratio, max_ratio) {
                return Err(CalibrationError::BoundsViolation {
                    row,
                    ratio,
                    min_ratio,
                    max_ratio,
                });
            }
        }
        for row in 0..n {
            let raw = eta[row];
            at_bound[row] = raw < ln_min || raw > ln_max;
            weights[row] = initial_weights[row] * raw.clamp(ln_min, ln_max).exp();
        }
    }

    let clamped_rows: Vec<usize> = (0..n).filter(|&r| best_at_bound[r]).collect();
    if status == CalibrationStatus::NonConverging {
        warn!(
            best_loss = progress.best_loss,
            "entropy calibration did not converge; returning best weights"
        );
    }
    info!(
        status = status.as_str(),
        epochs = steps,
        final_loss = progress.best_loss,
        clamped = clamped_rows.len(),
        "entropy calibration finished"
    );

    Ok(CalibrationOutcome {
        weights: best_weights,
        status,
        epochs: steps,
        best_epoch: progress.best_epoch,
        initial_loss: progress.initial_loss,
        final_loss: progress.best_loss,
        loss_history: progress.history,
        clamped_rows,
        elapsed: start.elapsed(),
    })
}

/// `1 / mean |A[:, t]|` over nonzero entries; 1 for empty columns.
fn column_scale(matrix: &IndicatorMatrix) -> Array1<f64> {
    let mut sums = vec![0.0; matrix.n_cols()];
    let mut counts = vec![0usize; matrix.n_cols()];
    for r in 0..matrix.n_rows() {
        let (cols, vals) = matrix.row(r);
        for (&c, &v) in cols.iter().zip(vals) {
            sums[c as usize] += v.abs();
            counts[c as usize] += 1;
        }
    }
    sums.iter()
        .zip(&counts)
        .map(|(&s, &n)| if n == 0 || s == 0.0 { 1.0 } else { n as f64 / s })
        .collect()
}

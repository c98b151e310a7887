// src/diagnostics.rs

use std::cmp::Ordering;

use tracing::info;

use crate::targets::{GeographyLevel, RescaleWarning, StratumId, TargetId, TargetStore};
use crate::weighting::utils::{chunked_sum, summarize, weight_ratios};
use crate::weighting::{CalibratedWeights, CalibrationStatus, IndicatorMatrix};

/// Fit of one target after calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetDiagnostic {
    pub target_id: TargetId,
    pub stratum_id: StratumId,
    pub variable: String,
    pub level: GeographyLevel,
    pub target: f64,
    pub initial_estimate: f64,
    pub estimate: f64,
    /// `(estimate - target) / (target + 1)`
    pub relative_error: f64,
    pub tolerance: f64,
    pub passed: bool,
}

/// Summary of a calibrated weight vector against its targets.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticsReport {
    pub targets: Vec<TargetDiagnostic>,
    pub max_abs_error: f64,
    pub mean_abs_error: f64,
    pub n_failed: usize,
    pub adjustment_min: f64,
    pub adjustment_max: f64,
    pub adjustment_mean: f64,
    pub adjustment_std: f64,
    pub initial_total: f64,
    pub calibrated_total: f64,
    /// `Σ weights / reference` when a reference total was given.
    pub coverage: Option<f64>,
    /// Records with a row held at a ratio bound.
    pub bound_violations: usize,
    /// `Σ w ln(w / w0)` over records.
    pub kl_divergence: f64,
    pub status: CalibrationStatus,
    pub initial_loss: f64,
    pub final_loss: f64,
    pub epochs: usize,
    pub rescale_warnings: Vec<RescaleWarning>,
}

impl DiagnosticsReport {
    pub fn all_passed(&self) -> bool {
        self.n_failed == 0
    }

    /// The `n` targets with the largest absolute relative error.
    pub fn worst(&self, n: usize) -> Vec<&TargetDiagnostic> {
        let mut sorted: Vec<&TargetDiagnostic> = self.targets.iter().collect();
        sorted.sort_by(|a, b| {
            b.relative_error
                .abs()
                .partial_cmp(&a.relative_error.abs())
                .unwrap_or(Ordering::Equal)
                .then(a.target_id.cmp(&b.target_id))
        });
        sorted.truncate(n);
        sorted
    }
}

/// Evaluates calibrated weights against the matrix columns' targets.
///
/// Pure: the same inputs always give the same report.
pub fn diagnose(
    weights: &CalibratedWeights,
    store: &TargetStore,
    matrix: &IndicatorMatrix,
    rescale_warnings: &[RescaleWarning],
    coverage_reference: Option<f64>,
) -> DiagnosticsReport {
    let before = matrix.estimates(weights.row_initial());
    let after = matrix.estimates(weights.row_weights());

    let targets: Vec<TargetDiagnostic> = matrix
        .columns()
        .iter()
        .enumerate()
        .map(|(col, &t)| {
            let target = store.target(t);
            let scale = if target.value + 1.0 == 0.0 { 1.0 } else { target.value + 1.0 };
            let relative_error = (after[col] - target.value) / scale;
            TargetDiagnostic {
                target_id: target.id,
                stratum_id: target.stratum_id,
                variable: target.variable.clone(),
                level: store.target_level(t),
                target: target.value,
                initial_estimate: before[col],
                estimate: after[col],
                relative_error,
                tolerance: target.tolerance,
                passed: relative_error.abs() <= target.tolerance,
            }
        })
        .collect();

    let abs_errors: Vec<f64> = targets.iter().map(|d| d.relative_error.abs()).collect();
    let max_abs_error = abs_errors.iter().copied().fold(0.0, f64::max);
    let mean_abs_error = if abs_errors.is_empty() {
        0.0
    } else {
        abs_errors.iter().sum::<f64>() / abs_errors.len() as f64
    };
    let n_failed = targets.iter().filter(|d| !d.passed).count();

    let ratios = weight_ratios(weights.weights(), weights.initial());
    let (adjustment_min, adjustment_max, adjustment_mean, adjustment_std) = summarize(ratios.view());

    let initial_total = chunked_sum(weights.initial(), matrix.chunk_size());
    let calibrated_total = chunked_sum(weights.weights(), matrix.chunk_size());
    let coverage = coverage_reference
        .filter(|r| *r != 0.0)
        .map(|r| calibrated_total / r);

    let kl_divergence = weights
        .weights()
        .iter()
        .zip(weights.initial().iter())
        .filter(|&(&w, &w0)| w > 0.0 && w0 > 0.0)
        .map(|(&w, &w0)| w * (w / w0).ln())
        .sum::<f64>();

    let report = DiagnosticsReport {
        targets,
        max_abs_error,
        mean_abs_error,
        n_failed,
        adjustment_min,
        adjustment_max,
        adjustment_mean,
        adjustment_std,
        initial_total,
        calibrated_total,
        coverage,
        bound_violations: weights.clamped_records().len(),
        kl_divergence,
        status: weights.status(),
        initial_loss: weights.initial_loss(),
        final_loss: weights.final_loss(),
        epochs: weights.epochs(),
        rescale_warnings: rescale_warnings.to_vec(),
    };

    info!(
        targets = report.targets.len(),
        failed = report.n_failed,
        max_abs_error = report.max_abs_error,
        mean_abs_error = report.mean_abs_error,
        bound_violations = report.bound_violations,
        "diagnostics computed"
    );

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CalibrationConfig;
    use crate::geography::assign;
    use crate::records::Record;
    use crate::targets::{Stratum, Target, TargetSelection, VariableSchema};
    use crate::weighting::{build_indicator, CalibrationOutcome};
    use approx::assert_relative_eq;
    use ndarray::array;
    use std::time::Duration;

    fn fixture(calibrated: [f64; 2]) -> (TargetStore, IndicatorMatrix, CalibratedWeights) {
        let store = TargetStore::new(
            vec![Stratum::new(1, None, "national")],
            vec![Target::count(1, 1, "returns", 4.0), Target::count(2, 1, "people", 1.0)],
            &VariableSchema::new(),
        )
        .unwrap();
        let records = vec![Record::new(1, 1.0, "06"), Record::new(2, 1.0, "06")];
        let config = CalibrationConfig::new();
        let assignment = assign(&records, None, &config).unwrap();
        let columns = store.selected_targets(&TargetSelection::default());
        let matrix =
            build_indicator(&store, &columns, &records, &assignment, "geography_id", 8).unwrap();
        let outcome = CalibrationOutcome {
            weights: array![calibrated[0], calibrated[1]],
            status: CalibrationStatus::MaxEpochs,
            epochs: 500,
            best_epoch: 480,
            initial_loss: 0.3,
            final_loss: 0.1,
            loss_history: vec![0.3, 0.1],
            clamped_rows: vec![],
            elapsed: Duration::ZERO,
        };
        let weights = CalibratedWeights::from_outcome(&records, &assignment, outcome);
        (store, matrix, weights)
    }

    #[test]
    fn test_per_target_errors() {
        let (store, matrix, weights) = fixture([1.5, 2.5]);
        let report = diagnose(&weights, &store, &matrix, &[], Some(8.0));

        let returns = &report.targets[0];
        assert_eq!(returns.initial_estimate, 2.0);
        assert_eq!(returns.estimate, 4.0);
        assert_eq!(returns.relative_error, 0.0);
        assert!(returns.passed);

        // people: estimate 4 against 1 -> (4 - 1) / 2
        let people = &report.targets[1];
        assert_relative_eq!(people.relative_error, 1.5, epsilon = 1e-12);
        assert!(!people.passed);

        assert_eq!(report.n_failed, 1);
        assert_relative_eq!(report.max_abs_error, 1.5, epsilon = 1e-12);
        assert_relative_eq!(report.mean_abs_error, 0.75, epsilon = 1e-12);
        assert_eq!(report.coverage, Some(0.5));
        assert_eq!(report.worst(1)[0].target_id, 2);
    }

    #[test]
    fn test_adjustment_summary_and_kl() {
        let (store, matrix, weights) = fixture([1.5, 2.5]);
        let report = diagnose(&weights, &store, &matrix, &[], None);

        assert_eq!(report.adjustment_min, 1.5);
        assert_eq!(report.adjustment_max, 2.5);
        assert_relative_eq!(report.adjustment_mean, 2.0, epsilon = 1e-12);
        assert_relative_eq!(report.adjustment_std, 0.5, epsilon = 1e-12);
        assert_relative_eq!(
            report.kl_divergence,
            1.5 * 1.5f64.ln() + 2.5 * 2.5f64.ln(),
            epsilon = 1e-12
        );
        assert!(report.coverage.is_none());
        assert_eq!(report.status, CalibrationStatus::MaxEpochs);
    }

    #[test]
    fn test_diagnose_is_deterministic() {
        let (store, matrix, weights) = fixture([1.2, 3.3]);
        let first = diagnose(&weights, &store, &matrix, &[], Some(10.0));
        let second = diagnose(&weights, &store, &matrix, &[], Some(10.0));
        assert_eq!(first, second);
    }
}

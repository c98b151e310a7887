// src/weighting/calibrated.rs

use std::time::Duration;

use ndarray::{Array1, ArrayView1};

use super::gradient::{CalibrationOutcome, CalibrationStatus};
use super::utils::sum_by_group_1d;
use crate::geography::GeographyAssignment;
use crate::records::{Record, RecordId};

/// Final per-record weights of one run.
///
/// Built once from the optimizer's row weights; virtual rows of a stacked
/// record are summed back onto it. Read-only afterwards.
#[derive(Debug, Clone)]
pub struct CalibratedWeights {
    record_ids: Vec<RecordId>,
    initial: Array1<f64>,
    weights: Array1<f64>,
    row_records: Vec<usize>,
    row_initial: Array1<f64>,
    row_weights: Array1<f64>,
    clamped_records: Vec<usize>,
    status: CalibrationStatus,
    initial_loss: f64,
    final_loss: f64,
    epochs: usize,
    loss_history: Vec<f64>,
    elapsed: Duration,
}

impl CalibratedWeights {
    pub fn from_outcome(
        records: &[Record],
        assignment: &GeographyAssignment,
        outcome: CalibrationOutcome,
    ) -> Self {
        let row_records = assignment.record_indices();
        let row_initial = assignment.initial_weights(records);
        let weights = sum_by_group_1d(outcome.weights.view(), &row_records, records.len());

        let mut clamped_records: Vec<usize> =
            outcome.clamped_rows.iter().map(|&r| row_records[r]).collect();
        clamped_records.sort_unstable();
        clamped_records.dedup();

        Self {
            record_ids: records.iter().map(|r| r.id).collect(),
            initial: records.iter().map(|r| r.initial_weight).collect(),
            weights,
            row_records,
            row_initial,
            row_weights: outcome.weights,
            clamped_records,
            status: outcome.status,
            initial_loss: outcome.initial_loss,
            final_loss: outcome.final_loss,
            epochs: outcome.epochs,
            loss_history: outcome.loss_history,
            elapsed: outcome.elapsed,
        }
    }

    pub fn record_ids(&self) -> &[RecordId] {
        &self.record_ids
    }

    /// Calibrated weight per record, in record order.
    pub fn weights(&self) -> ArrayView1<f64> {
        self.weights.view()
    }

    pub fn initial(&self) -> ArrayView1<f64> {
        self.initial.view()
    }

    pub fn row_weights(&self) -> ArrayView1<f64> {
        self.row_weights.view()
    }

    pub fn row_initial(&self) -> ArrayView1<f64> {
        self.row_initial.view()
    }

    pub fn row_records(&self) -> &[usize] {
        &self.row_records
    }

    pub fn get(&self, id: RecordId) -> Option<f64> {
        self.record_ids
            .iter()
            .position(|&r| r == id)
            .map(|i| self.weights[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (RecordId, f64)> + '_ {
        self.record_ids.iter().copied().zip(self.weights.iter().copied())
    }

    /// Indices of records with at least one row on a ratio bound.
    pub fn clamped_records(&self) -> &[usize] {
        &self.clamped_records
    }

    pub fn status(&self) -> CalibrationStatus {
        self.status
    }

    pub fn initial_loss(&self) -> f64 {
        self.initial_loss
    }

    pub fn final_loss(&self) -> f64 {
        self.final_loss
    }

    pub fn epochs(&self) -> usize {
        self.epochs
    }

    pub fn loss_history(&self) -> &[f64] {
        &self.loss_history
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn len(&self) -> usize {
        self.record_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.record_ids.is_empty()
    }
}

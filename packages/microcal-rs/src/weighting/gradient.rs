// src/weighting/gradient.rs

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use ndarray::{Array1, ArrayView1, Zip};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::indicator::IndicatorMatrix;
use super::utils::{check_bounds, log_bounds};
use crate::config::{BoundsPolicy, CalibrationConfig};
use crate::error::{CalibrationError, Result};

/// Loss growth over the first epoch's loss treated as divergence.
const DIVERGENCE_FACTOR: f64 = 1e6;

/// How a calibration run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationStatus {
    /// Loss reached `loss_tolerance`.
    Converged,
    /// Epoch or wall-clock budget exhausted.
    MaxEpochs,
    /// Loss became non-finite, diverged, or plateaued above tolerance.
    NonConverging,
}

impl CalibrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalibrationStatus::Converged => "converged",
            CalibrationStatus::MaxEpochs => "max_epochs",
            CalibrationStatus::NonConverging => "non_converging",
        }
    }
}

/// Loss and its ingredients at one weight vector.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub estimates: Array1<f64>,
    pub errors: Array1<f64>,
    pub loss: f64,
}

/// Grouped relative-squared-error loss over a fixed indicator matrix.
///
/// `e[t] = (estimate[t] - target[t]) / (target[t] + 1)`; each group's loss is
/// the mean of `e²` over its members and the total is the mean over groups,
/// so a group with many targets weighs as much as a group with one.
pub struct CalibrationProblem<'a> {
    matrix: &'a IndicatorMatrix,
    targets: Array1<f64>,
    scale: Array1<f64>,
    groups: Vec<usize>,
    members: Vec<Vec<usize>>,
}

impl<'a> CalibrationProblem<'a> {
    /// `groups[j]` is the group of column `j`; ids need not be contiguous and
    /// are compacted in ascending order.
    pub fn new(matrix: &'a IndicatorMatrix, targets: Array1<f64>, groups: Vec<usize>) -> Result<Self> {
        if targets.len() != matrix.n_cols() {
            return Err(CalibrationError::DimensionMismatch {
                expected: matrix.n_cols(),
                got: targets.len(),
            });
        }
        if groups.len() != matrix.n_cols() {
            return Err(CalibrationError::DimensionMismatch {
                expected: matrix.n_cols(),
                got: groups.len(),
            });
        }
        if targets.is_empty() {
            return Err(CalibrationError::InvalidInput("no targets to calibrate".to_string()));
        }

        // compact to dense ids, keeping the ascending order of the raw ids
        let mut dense_of: BTreeMap<usize, usize> = groups.iter().map(|&g| (g, 0)).collect();
        for (i, id) in dense_of.values_mut().enumerate() {
            *id = i;
        }
        let dense: Vec<usize> = groups.iter().map(|g| dense_of[g]).collect();
        let mut members: Vec<Vec<usize>> = vec![Vec::new(); dense_of.len()];
        for (col, &id) in dense.iter().enumerate() {
            members[id].push(col);
        }

        let scale = targets.mapv(|y| if y + 1.0 == 0.0 { 1.0 } else { y + 1.0 });

        Ok(Self {
            matrix,
            targets,
            scale,
            groups: dense,
            members,
        })
    }

    pub fn matrix(&self) -> &IndicatorMatrix {
        self.matrix
    }

    pub fn targets(&self) -> ArrayView1<f64> {
        self.targets.view()
    }

    pub fn n_groups(&self) -> usize {
        self.members.len()
    }

    pub fn evaluate(&self, weights: ArrayView1<f64>) -> Evaluation {
        let estimates = self.matrix.estimates(weights);
        let mut errors = Array1::zeros(estimates.len());
        Zip::from(&mut errors)
            .and(&estimates)
            .and(&self.targets)
            .and(&self.scale)
            .for_each(|e, &est, &y, &d| *e = (est - y) / d);
        let loss = self.loss_from_errors(errors.view());
        Evaluation {
            estimates,
            errors,
            loss,
        }
    }

    /// Mean over groups of the mean squared error within each group.
    pub fn loss_from_errors(&self, errors: ArrayView1<f64>) -> f64 {
        let group_losses: Vec<f64> = self
            .members
            .par_iter()
            .map(|cols| cols.iter().map(|&c| errors[c] * errors[c]).sum::<f64>() / cols.len() as f64)
            .collect();
        group_losses.iter().sum::<f64>() / self.members.len() as f64
    }

    /// `∂loss/∂estimate[t]`.
    pub fn coefficients(&self, errors: ArrayView1<f64>) -> Array1<f64> {
        let n_groups = self.members.len() as f64;
        Array1::from_iter((0..errors.len()).map(|t| {
            let size = self.members[self.groups[t]].len() as f64;
            2.0 * errors[t] / (self.scale[t] * size * n_groups)
        }))
    }

    /// `∂loss/∂log_weight[row] = weight[row] × Σ_t A[row, t] × coefficient[t]`.
    pub fn gradient(&self, weights: ArrayView1<f64>, evaluation: &Evaluation) -> Array1<f64> {
        let coef = self.coefficients(evaluation.errors.view());
        let mut grad = self.matrix.row_products(coef.view());
        Zip::from(&mut grad).and(weights).par_for_each(|g, &w| *g *= w);
        grad
    }
}

/// Adam state over the log-weight vector.
pub(crate) struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    m: Array1<f64>,
    v: Array1<f64>,
    t: i32,
}

impl Adam {
    pub(crate) fn new(n: usize, learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            m: Array1::zeros(n),
            v: Array1::zeros(n),
            t: 0,
        }
    }

    pub(crate) fn step(&mut self, params: &mut Array1<f64>, grad: &Array1<f64>) {
        self.t += 1;
        let (b1, b2, lr, eps) = (self.beta1, self.beta2, self.learning_rate, self.epsilon);
        let bias1 = 1.0 - b1.powi(self.t);
        let bias2 = 1.0 - b2.powi(self.t);

        Zip::from(params)
            .and(&mut self.m)
            .and(&mut self.v)
            .and(grad)
            .par_for_each(|p, m, v, &g| {
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                let m_hat = *m / bias1;
                let v_hat = *v / bias2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            });
    }
}

/// Result of one optimization run over row weights.
#[derive(Debug, Clone)]
pub struct CalibrationOutcome {
    /// Row weights at the best epoch.
    pub weights: Array1<f64>,
    pub status: CalibrationStatus,
    /// Optimizer steps taken.
    pub epochs: usize,
    pub best_epoch: usize,
    pub initial_loss: f64,
    pub final_loss: f64,
    pub loss_history: Vec<f64>,
    /// Rows sitting on a ratio bound in the returned weights.
    pub clamped_rows: Vec<usize>,
    pub elapsed: Duration,
}

/// Best-so-far tracking and plateau detection shared by the objectives.
pub(crate) struct Progress {
    tolerance: f64,
    patience: usize,
    min_relative_improvement: f64,
    pub(crate) best_loss: f64,
    pub(crate) best_epoch: usize,
    pub(crate) initial_loss: f64,
    pub(crate) history: Vec<f64>,
    stale: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Continue,
    Stop(CalibrationStatus),
}

impl Progress {
    pub(crate) fn new(config: &CalibrationConfig) -> Self {
        Self {
            tolerance: config.loss_tolerance,
            patience: config.patience,
            min_relative_improvement: config.min_relative_improvement,
            best_loss: f64::INFINITY,
            best_epoch: 0,
            initial_loss: f64::NAN,
            history: Vec::new(),
            stale: 0,
        }
    }

    /// Records one evaluated loss. Returns whether it is a new best and what
    /// the loop should do next.
    pub(crate) fn observe(&mut self, epoch: usize, loss: f64) -> (bool, Verdict) {
        if !loss.is_finite() {
            return (false, Verdict::Stop(CalibrationStatus::NonConverging));
        }
        if self.history.is_empty() {
            self.initial_loss = loss;
        }
        self.history.push(loss);

        let improved = loss < self.best_loss;
        if improved {
            let enough = self.best_loss.is_infinite()
                || self.best_loss - loss > self.min_relative_improvement * self.best_loss;
            self.best_loss = loss;
            self.best_epoch = epoch;
            self.stale = if enough { 0 } else { self.stale + 1 };
        } else {
            self.stale += 1;
        }

        let verdict = if loss <= self.tolerance {
            Verdict::Stop(CalibrationStatus::Converged)
        } else if self.initial_loss > 0.0 && loss > self.initial_loss * DIVERGENCE_FACTOR {
            Verdict::Stop(CalibrationStatus::NonConverging)
        } else if self.stale >= self.patience {
            if self.best_loss <= self.tolerance {
                Verdict::Stop(CalibrationStatus::Converged)
            } else {
                Verdict::Stop(CalibrationStatus::NonConverging)
            }
        } else {
            Verdict::Continue
        };
        (improved, verdict)
    }
}

/// Gradient descent in log-weight space with Adam and ratio bounds.
pub struct GroupedLossCalibrator<'a> {
    problem: &'a CalibrationProblem<'a>,
    config: &'a CalibrationConfig,
}

impl<'a> GroupedLossCalibrator<'a> {
    pub fn new(problem: &'a CalibrationProblem<'a>, config: &'a CalibrationConfig) -> Self {
        Self { problem, config }
    }

    /// Optimizes from `initial_weights` and returns the best vector seen.
    ///
    /// With `BoundsPolicy::Fail` the first row pushed outside its ratio bounds
    /// aborts the run with `BoundsViolation`.
    pub fn run(&self, initial_weights: ArrayView1<f64>) -> Result<CalibrationOutcome> {
        let n = self.problem.matrix().n_rows();
        if initial_weights.len() != n {
            return Err(CalibrationError::DimensionMismatch {
                expected: n,
                got: initial_weights.len(),
            });
        }

        let config = self.config;
        let (min_ratio, max_ratio) = config.weight_bounds;
        let (lower, upper) = log_bounds(initial_weights, min_ratio, max_ratio);
        let deadline = config.time_limit();
        let start = Instant::now();

        let mut log_w = initial_weights.mapv(f64::ln);
        let mut at_bound = vec![false; n];
        let mut best_log_w = log_w.clone();
        let mut best_at_bound = at_bound.clone();
        let mut adam = Adam::new(n, config.learning_rate);
        let mut progress = Progress::new(config);
        let mut steps = 0;
        let mut status = CalibrationStatus::MaxEpochs;

        info!(
            rows = n,
            targets = self.problem.targets().len(),
            groups = self.problem.n_groups(),
            epochs = config.epochs,
            learning_rate = config.learning_rate,
            "optimizing"
        );

        for epoch in 0..=config.epochs {
            let weights = log_w.mapv(f64::exp);
            let evaluation = self.problem.evaluate(weights.view());

            let (improved, verdict) = progress.observe(epoch, evaluation.loss);
            if improved {
                best_log_w.assign(&log_w);
                best_at_bound.copy_from_slice(&at_bound);
            }
            if epoch % 50 == 0 {
                debug!(epoch, loss = evaluation.loss, best = progress.best_loss, "epoch");
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

            let grad = self.problem.gradient(weights.view(), &evaluation);
            adam.step(&mut log_w, &grad);
            steps += 1;

            if config.bounds_policy == BoundsPolicy::Fail {
                let stepped = log_w.mapv(f64::exp);
                if let Some((row, ratio)) =
                    check_bounds(stepped.view(), initial_weights, min_ratio, max_ratio)
                {
                    return Err(CalibrationError::BoundsViolation {
                        row,
                        ratio,
                        min_ratio,
                        max_ratio,
                    });
                }
                continue;
            }
            for row in 0..n {
                let lw = log_w[row];
                if lw < lower[row] || lw > upper[row] {
                    log_w[row] = lw.clamp(lower[row], upper[row]);
                    at_bound[row] = true;
                } else {
                    at_bound[row] = lw == lower[row] || lw == upper[row];
                }
            }
        }

        let clamped_rows: Vec<usize> = (0..n).filter(|&r| best_at_bound[r]).collect();
        match status {
            CalibrationStatus::NonConverging => warn!(
                best_loss = progress.best_loss,
                best_epoch = progress.best_epoch,
                "calibration did not converge; returning best weights"
            ),
            _ if !clamped_rows.is_empty() => warn!(
                rows = clamped_rows.len(),
                "weights clamped to ratio bounds"
            ),
            _ => {}
        }
        info!(
            status = status.as_str(),
            epochs = steps,
            initial_loss = progress.initial_loss,
            final_loss = progress.best_loss,
            "calibration finished"
        );

        Ok(CalibrationOutcome {
            weights: best_log_w.mapv(f64::exp),
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
}

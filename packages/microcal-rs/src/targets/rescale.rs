// src/targets/rescale.rs

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use super::store::{StratumId, TargetSelection, TargetStore};

/// Why a parent/child level was left unscaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Children sum to zero under a nonzero parent.
    ZeroChildSum,
    /// Parent total is zero while children are not.
    ZeroParent,
    /// Children sum to the opposite sign of the parent.
    SignMismatch,
}

/// A level that could not be made consistent. Non-fatal.
#[derive(Debug, Clone, PartialEq)]
pub struct RescaleWarning {
    pub parent_stratum: StratumId,
    pub group_id: String,
    pub variable: String,
    pub period: i32,
    pub parent_value: f64,
    pub child_sum: f64,
    pub reason: SkipReason,
}

/// A level whose children were multiplied by `factor`.
#[derive(Debug, Clone, PartialEq)]
pub struct RescaleAdjustment {
    pub parent_stratum: StratumId,
    pub group_id: String,
    pub variable: String,
    pub period: i32,
    pub factor: f64,
    pub children: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RescaleReport {
    pub adjustments: Vec<RescaleAdjustment>,
    pub warnings: Vec<RescaleWarning>,
}

impl RescaleReport {
    pub fn is_consistent(&self) -> bool {
        self.adjustments.is_empty() && self.warnings.is_empty()
    }
}

/// Scales child targets so each child group sums to its parent's total.
///
/// Walks the forest top-down, so a child rescaled at one level is the parent
/// total for the level below. Children are matched to the parent target on
/// `(variable, period, reform_id)` and partitioned by their stratum's
/// `group_id`; each group is scaled independently.
pub fn rescale(store: &mut TargetStore, selection: &TargetSelection, tolerance: f64) -> RescaleReport {
    let mut report = RescaleReport::default();

    for parent in store.top_down() {
        let parent_targets: Vec<usize> = store
            .targets_of(parent)
            .iter()
            .copied()
            .filter(|&t| selection.matches(store.target(t)))
            .collect();
        if parent_targets.is_empty() {
            continue;
        }

        // child group -> child target indices, ordered for reproducible reports
        let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for &child in store.children(parent) {
            let group = store.stratum(child).group_id.clone();
            let entry = groups.entry(group).or_default();
            entry.extend(
                store
                    .targets_of(child)
                    .iter()
                    .copied()
                    .filter(|&t| selection.matches(store.target(t))),
            );
        }

        for pt in parent_targets {
            let (variable, period, reform_id, parent_value) = {
                let t = store.target(pt);
                (t.variable.clone(), t.period, t.reform_id, t.value)
            };
            let parent_stratum = store.stratum(parent).id;

            for (group_id, members) in &groups {
                let matching: Vec<usize> = members
                    .iter()
                    .copied()
                    .filter(|&t| {
                        let c = store.target(t);
                        c.variable == variable && c.period == period && c.reform_id == reform_id
                    })
                    .collect();
                if matching.is_empty() {
                    continue;
                }

                let child_sum: f64 = matching.iter().map(|&t| store.target(t).value).sum();

                let skip = if parent_value == 0.0 {
                    (child_sum != 0.0).then_some(SkipReason::ZeroParent)
                } else if child_sum == 0.0 {
                    Some(SkipReason::ZeroChildSum)
                } else if child_sum.signum() != parent_value.signum() {
                    Some(SkipReason::SignMismatch)
                } else {
                    None
                };

                if let Some(reason) = skip {
                    warn!(
                        parent = parent_stratum,
                        group = %group_id,
                        variable = %variable,
                        parent_value,
                        child_sum,
                        ?reason,
                        "level left unscaled"
                    );
                    report.warnings.push(RescaleWarning {
                        parent_stratum,
                        group_id: group_id.clone(),
                        variable: variable.clone(),
                        period,
                        parent_value,
                        child_sum,
                        reason,
                    });
                    continue;
                }

                if parent_value == 0.0
                    || (child_sum - parent_value).abs() <= tolerance * parent_value.abs()
                {
                    continue;
                }

                let factor = parent_value / child_sum;
                for &t in &matching {
                    let scaled = store.target(t).value * factor;
                    store.set_target_value(t, scaled);
                }
                debug!(
                    parent = parent_stratum,
                    group = %group_id,
                    variable = %variable,
                    factor,
                    "rescaled child targets"
                );
                report.adjustments.push(RescaleAdjustment {
                    parent_stratum,
                    group_id: group_id.clone(),
                    variable: variable.clone(),
                    period,
                    factor,
                    children: matching.len(),
                });
            }
        }
    }

    info!(
        adjustments = report.adjustments.len(),
        warnings = report.warnings.len(),
        "target rescaling finished"
    );
    report
}

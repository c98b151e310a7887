// src/geography/crosswalk.rs

use std::collections::HashMap;

use crate::error::{CalibrationError, Result};
use crate::records::{Record, RecordId};

/// Tolerance on `Σ pop_share == 1` per coarse unit.
pub const SHARE_TOLERANCE: f64 = 1e-6;

/// One fine geography a record may belong to.
#[derive(Debug, Clone, PartialEq)]
pub struct GeographyCandidate {
    pub record_id: RecordId,
    pub geography_id: String,
    pub pop_share: f64,
}

/// Coarse unit -> candidate fine geographies with population shares.
#[derive(Debug, Clone, Default)]
pub struct Crosswalk {
    units: HashMap<String, Vec<(String, f64)>>,
}

impl Crosswalk {
    /// Builds from `(coarse_geography, fine_geography_id, pop_share)` rows.
    ///
    /// Shares must be non-negative and sum to one per coarse unit within
    /// `SHARE_TOLERANCE`; they are then divided by their total so each unit
    /// sums to one exactly. Each unit's candidates are kept sorted by fine id
    /// so draws do not depend on row order.
    pub fn new<I, C, F>(rows: I) -> Result<Self>
    where
        I: IntoIterator<Item = (C, F, f64)>,
        C: Into<String>,
        F: Into<String>,
    {
        let mut units: HashMap<String, Vec<(String, f64)>> = HashMap::new();
        for (coarse, fine, share) in rows {
            let coarse = coarse.into();
            let fine = fine.into();
            if !(share.is_finite() && share >= 0.0) {
                return Err(CalibrationError::Schema(format!(
                    "crosswalk share {} for {} -> {} must be finite and non-negative",
                    share, coarse, fine
                )));
            }
            units.entry(coarse).or_default().push((fine, share));
        }

        for (coarse, candidates) in units.iter_mut() {
            candidates.sort_by(|a, b| a.0.cmp(&b.0));
            if candidates.windows(2).any(|w| w[0].0 == w[1].0) {
                return Err(CalibrationError::Schema(format!(
                    "crosswalk lists a fine geography twice under '{}'",
                    coarse
                )));
            }
            let total: f64 = candidates.iter().map(|(_, s)| s).sum();
            if (total - 1.0).abs() > SHARE_TOLERANCE {
                return Err(CalibrationError::Schema(format!(
                    "crosswalk shares for '{}' sum to {}, expected 1",
                    coarse, total
                )));
            }
            for (_, share) in candidates.iter_mut() {
                *share /= total;
            }
        }

        Ok(Self { units })
    }

    pub fn unit(&self, coarse: &str) -> Option<&[(String, f64)]> {
        self.units.get(coarse).map(|v| v.as_slice())
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Candidates for a record's coarse unit, if the unit is known.
    pub fn candidates(&self, record: &Record) -> Option<Vec<GeographyCandidate>> {
        self.unit(&record.coarse_geography).map(|unit| {
            unit.iter()
                .map(|(fine, share)| GeographyCandidate {
                    record_id: record.id,
                    geography_id: fine.clone(),
                    pop_share: *share,
                })
                .collect()
        })
    }
}

// src/geography/assign.rs

use std::collections::HashMap;

use ndarray::Array1;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::info;

use super::crosswalk::Crosswalk;
use crate::config::{AssignmentMode, CalibrationConfig};
use crate::error::{CalibrationError, Result};
use crate::records::{Record, RecordId};

/// One (possibly virtual) calibration row.
///
/// Rows point back at their record instead of copying its attributes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssignmentRow {
    pub record_index: usize,
    pub geography: u32,
    pub weight_share: f64,
}

/// Resolved fine geography for every record.
///
/// Sampling yields exactly one row per record with share 1; stacking yields
/// one row per candidate geography with the candidate's population share.
#[derive(Debug, Clone)]
pub struct GeographyAssignment {
    mode: AssignmentMode,
    rows: Vec<AssignmentRow>,
    geographies: Vec<String>,
    n_records: usize,
}

impl GeographyAssignment {
    pub fn mode(&self) -> AssignmentMode {
        self.mode
    }

    pub fn rows(&self) -> &[AssignmentRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn n_records(&self) -> usize {
        self.n_records
    }

    /// Interned fine geography ids; `AssignmentRow::geography` indexes this.
    pub fn geographies(&self) -> &[String] {
        &self.geographies
    }

    pub fn geography_of(&self, row: usize) -> &str {
        &self.geographies[self.rows[row].geography as usize]
    }

    /// Rows per record on average.
    pub fn fan_out(&self) -> f64 {
        if self.n_records == 0 {
            0.0
        } else {
            self.rows.len() as f64 / self.n_records as f64
        }
    }

    /// `initial_weight × weight_share` per row.
    pub fn initial_weights(&self, records: &[Record]) -> Array1<f64> {
        self.rows
            .iter()
            .map(|row| records[row.record_index].initial_weight * row.weight_share)
            .collect()
    }

    /// Record index of each row.
    pub fn record_indices(&self) -> Vec<usize> {
        self.rows.iter().map(|row| row.record_index).collect()
    }
}

/// Resolves every record's coarse geography.
///
/// Without a crosswalk each record keeps its coarse unit. Units missing from the
/// crosswalk fall back to `config.default_geography`, or fail.
pub fn assign(
    records: &[Record],
    crosswalk: Option<&Crosswalk>,
    config: &CalibrationConfig,
) -> Result<GeographyAssignment> {
    let chunk_size = config.chunk_size.max(1);

    let resolved: Vec<Vec<(usize, &str, f64)>> = records
        .par_chunks(chunk_size)
        .enumerate()
        .map(|(chunk_idx, chunk)| {
            let offset = chunk_idx * chunk_size;
            let mut out = Vec::with_capacity(chunk.len());
            for (i, record) in chunk.iter().enumerate() {
                resolve_record(offset + i, record, crosswalk, config, &mut out)?;
            }
            Ok(out)
        })
        .collect::<Result<Vec<_>>>()?;

    let mut lookup: HashMap<&str, u32> = HashMap::new();
    let mut geographies: Vec<String> = Vec::new();
    let mut rows = Vec::with_capacity(resolved.iter().map(|c| c.len()).sum());

    for chunk in resolved {
        for (record_index, geography, weight_share) in chunk {
            let id = *lookup.entry(geography).or_insert_with(|| {
                geographies.push(geography.to_string());
                (geographies.len() - 1) as u32
            });
            rows.push(AssignmentRow {
                record_index,
                geography: id,
                weight_share,
            });
        }
    }

    let assignment = GeographyAssignment {
        mode: config.assignment_mode,
        rows,
        geographies,
        n_records: records.len(),
    };

    info!(
        mode = ?assignment.mode,
        records = records.len(),
        rows = assignment.len(),
        geographies = assignment.geographies.len(),
        fan_out = assignment.fan_out(),
        "geography assigned"
    );

    Ok(assignment)
}

fn resolve_record<'a>(
    record_index: usize,
    record: &'a Record,
    crosswalk: Option<&'a Crosswalk>,
    config: &'a CalibrationConfig,
    out: &mut Vec<(usize, &'a str, f64)>,
) -> Result<()> {
    let Some(crosswalk) = crosswalk else {
        out.push((record_index, record.coarse_geography.as_str(), 1.0));
        return Ok(());
    };

    let unit = match crosswalk.unit(&record.coarse_geography) {
        Some(unit) if !unit.is_empty() => unit,
        _ => match &config.default_geography {
            Some(fallback) => {
                out.push((record_index, fallback.as_str(), 1.0));
                return Ok(());
            }
            None => {
                return Err(CalibrationError::GeographyAssignment {
                    record_id: record.id,
                    coarse_geography: record.coarse_geography.clone(),
                })
            }
        },
    };

    match config.assignment_mode {
        AssignmentMode::Sampling => {
            let pick = draw(unit, config.run_seed, record.id);
            out.push((record_index, unit[pick].0.as_str(), 1.0));
        }
        AssignmentMode::Stacking => {
            // zero-share rows would carry zero weight, which has no log
            for (fine, share) in unit {
                if *share > 0.0 {
                    out.push((record_index, fine.as_str(), *share));
                }
            }
        }
    }
    Ok(())
}

/// Seed for one record's draw, mixed with splitmix64 so neighbouring ids
/// give unrelated streams.
pub fn record_seed(run_seed: u64, record_id: RecordId) -> u64 {
    splitmix64(run_seed ^ splitmix64(record_id as u64))
}

fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9e3779b97f4a7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}

fn draw(unit: &[(String, f64)], run_seed: u64, record_id: RecordId) -> usize {
    let mut rng = ChaCha8Rng::seed_from_u64(record_seed(run_seed, record_id));
    let u: f64 = rng.random();

    let mut cumulative = 0.0;
    for (i, (_, share)) in unit.iter().enumerate() {
        cumulative += share;
        if u < cumulative {
            return i;
        }
    }
    // shares sum to 1 only within tolerance
    unit.iter().rposition(|(_, s)| *s > 0.0).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn crosswalk() -> Crosswalk {
        Crosswalk::new(vec![
            ("06", "06037", 0.7),
            ("06", "06075", 0.3),
            ("48", "48201", 1.0),
        ])
        .unwrap()
    }

    fn records(n: i64) -> Vec<Record> {
        (0..n).map(|i| Record::new(i, 10.0, "06")).collect()
    }

    #[test]
    fn test_stacking_splits_weight_by_share() {
        let config = CalibrationConfig::new().with_assignment_mode(AssignmentMode::Stacking);
        let records = vec![Record::new(1, 10.0, "06")];

        let assignment = assign(&records, Some(&crosswalk()), &config).unwrap();
        let weights = assignment.initial_weights(&records);

        assert_eq!(assignment.len(), 2);
        assert_relative_eq!(weights[0], 7.0, epsilon = 1e-12);
        assert_relative_eq!(weights[1], 3.0, epsilon = 1e-12);
        assert_eq!(assignment.geography_of(0), "06037");
        assert_eq!(assignment.geography_of(1), "06075");
    }

    #[test]
    fn test_stacked_shares_sum_to_one_per_record() {
        let config = CalibrationConfig::new().with_assignment_mode(AssignmentMode::Stacking);
        let mut records = records(5);
        records.push(Record::new(99, 3.0, "48"));

        let assignment = assign(&records, Some(&crosswalk()), &config).unwrap();

        let mut totals = vec![0.0; records.len()];
        for row in assignment.rows() {
            totals[row.record_index] += row.weight_share;
        }
        for total in totals {
            assert!((total - 1.0).abs() <= 1e-9);
        }
        assert_relative_eq!(assignment.fan_out(), 11.0 / 6.0, epsilon = 1e-12);
    }

    #[test]
    fn test_stacking_with_inexact_shares_keeps_record_weight() {
        let config = CalibrationConfig::new().with_assignment_mode(AssignmentMode::Stacking);
        let crosswalk =
            Crosswalk::new(vec![("06", "06037", 0.7), ("06", "06075", 0.3000009)]).unwrap();
        let records = vec![Record::new(1, 10.0, "06")];

        let assignment = assign(&records, Some(&crosswalk), &config).unwrap();
        let shares: f64 = assignment.rows().iter().map(|r| r.weight_share).sum();
        let weights = assignment.initial_weights(&records);

        assert!((shares - 1.0).abs() <= 1e-9);
        assert_relative_eq!(weights.sum(), 10.0, epsilon = 1e-9);
        assert_relative_eq!(weights[1] / weights[0], 0.3000009 / 0.7, epsilon = 1e-12);
    }

    #[test]
    fn test_sampling_is_reproducible() {
        let config = CalibrationConfig::new().with_run_seed(7);
        let records = records(200);

        let first = assign(&records, Some(&crosswalk()), &config).unwrap();
        let second = assign(&records, Some(&crosswalk()), &config).unwrap();

        assert_eq!(first.len(), 200);
        let names = |a: &GeographyAssignment| {
            (0..a.len()).map(|r| a.geography_of(r).to_string()).collect::<Vec<_>>()
        };
        assert_eq!(names(&first), names(&second));
        assert!(first.rows().iter().all(|r| r.weight_share == 1.0));
    }

    #[test]
    fn test_sampling_independent_of_chunking() {
        let records = records(300);
        let small = CalibrationConfig {
            chunk_size: 7,
            ..CalibrationConfig::new().with_run_seed(3)
        };
        let large = CalibrationConfig {
            chunk_size: 1000,
            ..CalibrationConfig::new().with_run_seed(3)
        };

        let a = assign(&records, Some(&crosswalk()), &small).unwrap();
        let b = assign(&records, Some(&crosswalk()), &large).unwrap();
        for r in 0..records.len() {
            assert_eq!(a.geography_of(r), b.geography_of(r));
        }
    }

    #[test]
    fn test_sampling_follows_shares() {
        let config = CalibrationConfig::new().with_run_seed(11);
        let records = records(10_000);

        let assignment = assign(&records, Some(&crosswalk()), &config).unwrap();
        let la = (0..assignment.len())
            .filter(|&r| assignment.geography_of(r) == "06037")
            .count() as f64
            / 10_000.0;

        assert!((la - 0.7).abs() < 0.03, "observed share {}", la);
    }

    #[test]
    fn test_seeds_change_draws() {
        let records = records(500);
        let a = assign(&records, Some(&crosswalk()), &CalibrationConfig::new().with_run_seed(1)).unwrap();
        let b = assign(&records, Some(&crosswalk()), &CalibrationConfig::new().with_run_seed(2)).unwrap();

        let differing = (0..records.len())
            .filter(|&r| a.geography_of(r) != b.geography_of(r))
            .count();
        assert!(differing > 0);
    }

    #[test]
    fn test_missing_unit_without_fallback_fails() {
        let records = vec![Record::new(5, 1.0, "36")];
        let result = assign(&records, Some(&crosswalk()), &CalibrationConfig::new());
        match result {
            Err(CalibrationError::GeographyAssignment { record_id, coarse_geography }) => {
                assert_eq!(record_id, 5);
                assert_eq!(coarse_geography, "36");
            }
            other => panic!("expected assignment error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_unit_uses_fallback() {
        let records = vec![Record::new(5, 1.0, "36")];
        let config = CalibrationConfig::new().with_default_geography("36999");

        let assignment = assign(&records, Some(&crosswalk()), &config).unwrap();
        assert_eq!(assignment.geography_of(0), "36999");
        assert_eq!(assignment.rows()[0].weight_share, 1.0);
    }

    #[test]
    fn test_no_crosswalk_keeps_coarse_unit() {
        let records = vec![Record::new(1, 2.0, "06"), Record::new(2, 3.0, "48")];
        let assignment = assign(&records, None, &CalibrationConfig::new()).unwrap();

        assert_eq!(assignment.geography_of(1), "48");
        assert_eq!(assignment.initial_weights(&records).to_vec(), vec![2.0, 3.0]);
    }
}

// src/error.rs

use polars::prelude::PolarsError;
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Stratum hierarchy contains a cycle: {}", format_chain(.0))]
    Cycle(Vec<i64>),

    #[error("No geography for record {record_id}: coarse unit '{coarse_geography}' has no crosswalk entry")]
    GeographyAssignment {
        record_id: i64,
        coarse_geography: String,
    },

    #[error("Weight ratio {ratio:.4} for row {row} is outside bounds [{min_ratio}, {max_ratio}]")]
    BoundsViolation {
        row: usize,
        ratio: f64,
        min_ratio: f64,
        max_ratio: f64,
    },

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Polars(#[from] PolarsError),
}

pub type Result<T> = std::result::Result<T, CalibrationError>;

fn format_chain(ids: &[i64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

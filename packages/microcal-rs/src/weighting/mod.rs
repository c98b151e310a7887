// src/weighting/mod.rs

pub mod calibrated;
pub mod entropy;
pub mod gradient;
pub mod indicator;
pub mod utils;

// Re-export main implementations for easier access
pub use calibrated::CalibratedWeights;
pub use entropy::calibrate_entropy;
pub use gradient::{
    CalibrationOutcome, CalibrationProblem, CalibrationStatus, Evaluation, GroupedLossCalibrator,
};
pub use indicator::{build_indicator, IndicatorMatrix};

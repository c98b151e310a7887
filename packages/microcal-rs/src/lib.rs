// src/lib.rs
//! Hierarchical calibration of survey microdata weights to administrative targets.

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod geography;
pub mod pipeline;
pub mod records;
pub mod tables;
pub mod targets;
pub mod weighting;

#[cfg(feature = "python")]
mod python;

pub use config::{
    AssignmentMode, BoundsPolicy, CalibrationConfig, ConfigError, GroupBy, Objective,
};
pub use diagnostics::{diagnose, DiagnosticsReport, TargetDiagnostic};
pub use error::{CalibrationError, Result};
pub use geography::{assign, AssignmentRow, Crosswalk, GeographyAssignment, GeographyCandidate};
pub use pipeline::{run_calibration, run_frames, CalibrationInputs, CalibrationRun};
pub use records::{infer_schema, validate_records, Record, RecordId};
pub use targets::{
    rescale, AttrValue, Constraint, GeographyLevel, GroupKey, Predicate, RescaleReport,
    RescaleWarning, Stratum, Target, TargetSelection, TargetStore, TargetType, VariableSchema,
    VariableType,
};
pub use weighting::{
    build_indicator, calibrate_entropy, CalibratedWeights, CalibrationOutcome, CalibrationProblem,
    CalibrationStatus, GroupedLossCalibrator, IndicatorMatrix,
};

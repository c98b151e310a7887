// src/geography/mod.rs

pub mod assign;
pub mod crosswalk;

pub use assign::{assign, record_seed, AssignmentRow, GeographyAssignment};
pub use crosswalk::{Crosswalk, GeographyCandidate, SHARE_TOLERANCE};

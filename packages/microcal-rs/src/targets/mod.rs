// src/targets/mod.rs

pub mod constraint;
pub mod rescale;
pub mod store;

pub use constraint::{AttrValue, Constraint, Predicate, ValueKey, VariableSchema, VariableType};
pub use rescale::{rescale, RescaleAdjustment, RescaleReport, RescaleWarning, SkipReason};
pub use store::{
    GeographyLevel, GroupKey, Stratum, StratumId, Target, TargetId, TargetSelection, TargetStore,
    TargetType,
};

// src/config.rs
//
// Run configuration, threaded by reference through every pipeline stage.
// Loadable from TOML or YAML:
//
//     epochs = 300
//     learning_rate = 0.2
//     group_by = "both"
//     assignment_mode = "stacking"
//     run_seed = 42
//     weight_bounds = [0.1, 10.0]
//     bounds_policy = "clamp"

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// How targets are partitioned into loss-normalization groups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    /// One group per geography level.
    GeographyLevel,

    /// One group per target variable.
    Variable,

    /// One group per (geography level, variable).
    #[default]
    Both,
}

/// How coarse survey geography is resolved to target geography.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentMode {
    /// Draw a single fine geography per record.
    #[default]
    Sampling,

    /// Split each record into one weighted row per candidate geography.
    Stacking,
}

/// What happens when an optimizer step leaves the weight-ratio bounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundsPolicy {
    #[default]
    Clamp,
    Fail,
}

/// Calibration objective.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    /// Grouped relative squared error, no prior on the weights.
    #[default]
    SquaredError,

    /// Legacy minimum-divergence calibration relative to the initial weights.
    Entropy,
}

/// Main calibration configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CalibrationConfig {
    /// Maximum optimizer epochs.
    pub epochs: usize,

    /// Adam step size in log-weight space.
    pub learning_rate: f64,

    pub group_by: GroupBy,

    pub assignment_mode: AssignmentMode,

    /// Seed for sampling-mode geography draws.
    pub run_seed: u64,

    /// Allowed `(min, max)` range of `weight / initial_weight`.
    pub weight_bounds: (f64, f64),

    /// Relative tolerance for parent/child target consistency.
    pub rescale_tolerance: f64,

    pub bounds_policy: BoundsPolicy,

    pub objective: Objective,

    /// Loss at or below which the run counts as converged.
    pub loss_tolerance: f64,

    /// Epochs without sufficient improvement before stopping.
    pub patience: usize,

    /// Relative loss decrease that counts as an improvement.
    pub min_relative_improvement: f64,

    /// Wall-clock budget for the optimization loop.
    pub time_limit_secs: Option<u64>,

    /// Geography used for coarse units missing from the crosswalk.
    pub default_geography: Option<String>,

    /// Attribute name under which the assigned geography is visible to constraints.
    pub geography_attribute: String,

    /// Only targets of this period take part. `None` is accepted only when
    /// the selected targets share a single period.
    pub period: Option<i32>,

    /// Reform scenario to calibrate; 0 is the baseline.
    pub reform_id: u32,

    /// Reference total for coverage, e.g. total filer count.
    pub coverage_reference: Option<f64>,

    /// Rows per parallel work unit.
    pub chunk_size: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            epochs: 500,
            learning_rate: 0.3,
            group_by: GroupBy::default(),
            assignment_mode: AssignmentMode::default(),
            run_seed: 0,
            weight_bounds: (0.1, 10.0),
            rescale_tolerance: 1e-3,
            bounds_policy: BoundsPolicy::default(),
            objective: Objective::default(),
            loss_tolerance: 1e-10,
            patience: 50,
            min_relative_improvement: 1e-6,
            time_limit_secs: None,
            default_geography: None,
            geography_attribute: "geography_id".to_string(),
            period: None,
            reform_id: 0,
            coverage_reference: None,
            chunk_size: 4096,
        }
    }
}

impl CalibrationConfig {
    /// Creates a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads and validates configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parses and validates configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates configuration from a YAML string.
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_assignment_mode(mut self, mode: AssignmentMode) -> Self {
        self.assignment_mode = mode;
        self
    }

    pub fn with_run_seed(mut self, seed: u64) -> Self {
        self.run_seed = seed;
        self
    }

    pub fn with_weight_bounds(mut self, min_ratio: f64, max_ratio: f64) -> Self {
        self.weight_bounds = (min_ratio, max_ratio);
        self
    }

    pub fn with_bounds_policy(mut self, policy: BoundsPolicy) -> Self {
        self.bounds_policy = policy;
        self
    }

    pub fn with_objective(mut self, objective: Objective) -> Self {
        self.objective = objective;
        self
    }

    pub fn with_default_geography(mut self, geography: impl Into<String>) -> Self {
        self.default_geography = Some(geography.into());
        self
    }

    pub fn with_coverage_reference(mut self, total: f64) -> Self {
        self.coverage_reference = Some(total);
        self
    }

    pub fn with_period(mut self, period: i32) -> Self {
        self.period = Some(period);
        self
    }

    pub fn with_time_limit_secs(mut self, secs: u64) -> Self {
        self.time_limit_secs = Some(secs);
        self
    }

    /// Returns the optimization time budget, if configured.
    pub fn time_limit(&self) -> Option<Duration> {
        self.time_limit_secs.map(Duration::from_secs)
    }

    /// Checks value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (min_ratio, max_ratio) = self.weight_bounds;

        if self.epochs == 0 {
            return Err(ConfigError::Invalid("epochs must be positive".to_string()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(min_ratio.is_finite() && max_ratio.is_finite())
            || min_ratio <= 0.0
            || min_ratio > 1.0
            || max_ratio < 1.0
        {
            return Err(ConfigError::Invalid(format!(
                "weight_bounds must satisfy 0 < min <= 1 <= max, got ({}, {})",
                min_ratio, max_ratio
            )));
        }
        if !(0.0..1.0).contains(&self.rescale_tolerance) {
            return Err(ConfigError::Invalid(format!(
                "rescale_tolerance must be in [0, 1), got {}",
                self.rescale_tolerance
            )));
        }
        if !(self.loss_tolerance >= 0.0) {
            return Err(ConfigError::Invalid("loss_tolerance must be non-negative".to_string()));
        }
        if self.patience == 0 {
            return Err(ConfigError::Invalid("patience must be positive".to_string()));
        }
        if !(self.min_relative_improvement >= 0.0) {
            return Err(ConfigError::Invalid(
                "min_relative_improvement must be non-negative".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be positive".to_string()));
        }
        if self.geography_attribute.is_empty() {
            return Err(ConfigError::Invalid("geography_attribute must not be empty".to_string()));
        }
        if let Some(reference) = self.coverage_reference {
            if !(reference.is_finite() && reference > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "coverage_reference must be positive, got {}",
                    reference
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CalibrationConfig::default();
        assert_eq!(config.epochs, 500);
        assert_eq!(config.weight_bounds, (0.1, 10.0));
        assert_eq!(config.rescale_tolerance, 1e-3);
        assert_eq!(config.bounds_policy, BoundsPolicy::Clamp);
        assert_eq!(config.objective, Objective::SquaredError);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let toml = r#"
            epochs = 300
            learning_rate = 0.2
            group_by = "variable"
            assignment_mode = "stacking"
            run_seed = 42
            weight_bounds = [0.5, 2.0]
            bounds_policy = "fail"
            time_limit_secs = 30
        "#;

        let config = CalibrationConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.epochs, 300);
        assert_eq!(config.group_by, GroupBy::Variable);
        assert_eq!(config.assignment_mode, AssignmentMode::Stacking);
        assert_eq!(config.run_seed, 42);
        assert_eq!(config.weight_bounds, (0.5, 2.0));
        assert_eq!(config.bounds_policy, BoundsPolicy::Fail);
        assert_eq!(config.time_limit(), Some(Duration::from_secs(30)));
        // unspecified fields keep their defaults
        assert_eq!(config.patience, 50);
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
            epochs: 100
            group_by: geography_level
            objective: entropy
            default_geography: "06999"
        "#;

        let config = CalibrationConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.epochs, 100);
        assert_eq!(config.group_by, GroupBy::GeographyLevel);
        assert_eq!(config.objective, Objective::Entropy);
        assert_eq!(config.default_geography.as_deref(), Some("06999"));
    }

    #[test]
    fn test_invalid_bounds_rejected() {
        let result = CalibrationConfig::from_toml_str("weight_bounds = [2.0, 0.5]");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let config = CalibrationConfig::new().with_weight_bounds(0.0, 10.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_learning_rate_rejected() {
        let config = CalibrationConfig::new().with_learning_rate(-1.0);
        assert!(config.validate().is_err());
    }
}

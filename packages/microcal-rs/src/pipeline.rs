// src/pipeline.rs

use std::collections::{BTreeMap, BTreeSet};

use ndarray::Array1;
use polars::prelude::DataFrame;
use tracing::info;

use crate::config::{CalibrationConfig, Objective};
use crate::diagnostics::{diagnose, DiagnosticsReport};
use crate::error::{CalibrationError, Result};
use crate::geography::{assign, Crosswalk, GeographyAssignment};
use crate::records::{validate_records, Record};
use crate::tables;
use crate::targets::{
    rescale, GroupKey, RescaleReport, Stratum, Target, TargetSelection, TargetStore,
    VariableSchema, VariableType,
};
use crate::weighting::{
    build_indicator, calibrate_entropy, CalibratedWeights, CalibrationProblem,
    GroupedLossCalibrator,
};

/// Everything a run reads, already parsed.
#[derive(Debug, Clone)]
pub struct CalibrationInputs {
    pub records: Vec<Record>,
    pub schema: VariableSchema,
    pub strata: Vec<Stratum>,
    pub targets: Vec<Target>,
    pub crosswalk: Option<Crosswalk>,
}

/// Products of one run.
#[derive(Debug, Clone)]
pub struct CalibrationRun {
    pub weights: CalibratedWeights,
    pub report: DiagnosticsReport,
    pub rescale: RescaleReport,
    pub store: TargetStore,
    pub assignment: GeographyAssignment,
}

impl CalibrationRun {
    pub fn weights_frame(&self) -> Result<DataFrame> {
        tables::weights_to_frame(&self.weights)
    }

    pub fn report_frame(&self) -> Result<DataFrame> {
        tables::report_to_frame(&self.report)
    }
}

/// Declares the geography attribute categorical, refusing a numeric record
/// column of the same name.
fn declare_geography(schema: &mut VariableSchema, config: &CalibrationConfig) -> Result<()> {
    if schema.get(&config.geography_attribute) == Some(VariableType::Numeric) {
        return Err(CalibrationError::Schema(format!(
            "geography attribute '{}' is numeric in the record table",
            config.geography_attribute
        )));
    }
    schema.declare(config.geography_attribute.clone(), VariableType::Categorical);
    Ok(())
}

/// Loads, rescales, assigns, calibrates and diagnoses.
///
/// Structural problems in the inputs fail before any optimization starts.
pub fn run_calibration(config: &CalibrationConfig, inputs: CalibrationInputs) -> Result<CalibrationRun> {
    config.validate()?;
    validate_records(&inputs.records)?;

    let CalibrationInputs {
        records,
        mut schema,
        strata,
        targets,
        crosswalk,
    } = inputs;

    declare_geography(&mut schema, config)?;

    let mut store = TargetStore::new(strata, targets, &schema)?;
    let selection = TargetSelection {
        period: config.period,
        reform_id: config.reform_id,
    };
    let rescale_report = rescale(&mut store, &selection, config.rescale_tolerance);

    let columns = store.selected_targets(&selection);
    if columns.is_empty() {
        return Err(CalibrationError::InvalidInput(format!(
            "no active targets for reform {} and period {:?}",
            config.reform_id, config.period
        )));
    }
    if config.period.is_none() {
        let periods: BTreeSet<i32> = columns.iter().map(|&t| store.target(t).period).collect();
        if periods.len() > 1 {
            return Err(CalibrationError::InvalidInput(format!(
                "selected targets span periods {:?}; set a period",
                periods
            )));
        }
    }

    let assignment = assign(&records, crosswalk.as_ref(), config)?;
    let matrix = build_indicator(
        &store,
        &columns,
        &records,
        &assignment,
        &config.geography_attribute,
        config.chunk_size,
    )?;

    let mut group_ids: BTreeMap<GroupKey, usize> = BTreeMap::new();
    for &t in &columns {
        group_ids.entry(store.group_key(t, config.group_by)).or_insert(0);
    }
    for (i, id) in group_ids.values_mut().enumerate() {
        *id = i;
    }
    let groups: Vec<usize> = columns
        .iter()
        .map(|&t| group_ids[&store.group_key(t, config.group_by)])
        .collect();
    let target_values: Array1<f64> = columns.iter().map(|&t| store.target(t).value).collect();

    info!(
        records = records.len(),
        rows = assignment.len(),
        targets = columns.len(),
        groups = group_ids.len(),
        objective = ?config.objective,
        "calibration inputs ready"
    );

    let problem = CalibrationProblem::new(&matrix, target_values, groups)?;
    let initial = assignment.initial_weights(&records);
    let outcome = match config.objective {
        Objective::SquaredError => GroupedLossCalibrator::new(&problem, config).run(initial.view())?,
        Objective::Entropy => calibrate_entropy(&problem, config, initial.view())?,
    };

    let weights = CalibratedWeights::from_outcome(&records, &assignment, outcome);
    let report = diagnose(
        &weights,
        &store,
        &matrix,
        &rescale_report.warnings,
        config.coverage_reference,
    );

    Ok(CalibrationRun {
        weights,
        report,
        rescale: rescale_report,
        store,
        assignment,
    })
}

/// `run_calibration` over polars tables.
pub fn run_frames(
    config: &CalibrationConfig,
    records: &DataFrame,
    strata: &DataFrame,
    constraints: &DataFrame,
    targets: &DataFrame,
    crosswalk: Option<&DataFrame>,
) -> Result<CalibrationRun> {
    let (records, mut schema) = tables::records_from_frame(records)?;
    declare_geography(&mut schema, config)?;
    let strata = tables::strata_from_frames(strata, constraints, &schema)?;
    let targets = tables::targets_from_frame(targets)?;
    let crosswalk = crosswalk.map(tables::crosswalk_from_frame).transpose()?;

    run_calibration(
        config,
        CalibrationInputs {
            records,
            schema,
            strata,
            targets,
            crosswalk,
        },
    )
}

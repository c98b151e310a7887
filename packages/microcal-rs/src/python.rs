// src/python.rs
use polars::prelude::*;
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3_polars::PyDataFrame;

use crate::config::CalibrationConfig;
use crate::error::CalibrationError;
use crate::pipeline::run_frames;

fn to_py_err(err: CalibrationError) -> PyErr {
    match err {
        CalibrationError::Schema(_)
        | CalibrationError::Cycle(_)
        | CalibrationError::GeographyAssignment { .. }
        | CalibrationError::InvalidInput(_)
        | CalibrationError::Config(_) => PyErr::new::<PyValueError, _>(err.to_string()),
        _ => PyErr::new::<PyRuntimeError, _>(err.to_string()),
    }
}

/// Calibrates record weights to the target hierarchy.
///
/// `config` is a TOML document; omitted keys take their defaults.
/// Returns `(weights, diagnostics)` tables.
#[pyfunction]
#[pyo3(signature = (records, strata, constraints, targets, crosswalk=None, config=None))]
fn calibrate(
    py: Python<'_>,
    records: PyDataFrame,
    strata: PyDataFrame,
    constraints: PyDataFrame,
    targets: PyDataFrame,
    crosswalk: Option<PyDataFrame>,
    config: Option<&str>,
) -> PyResult<(PyDataFrame, PyDataFrame)> {
    let config = match config {
        Some(raw) => CalibrationConfig::from_toml_str(raw)
            .map_err(|e| to_py_err(CalibrationError::Config(e)))?,
        None => CalibrationConfig::default(),
    };
    let records: DataFrame = records.into();
    let strata: DataFrame = strata.into();
    let constraints: DataFrame = constraints.into();
    let targets: DataFrame = targets.into();
    let crosswalk: Option<DataFrame> = crosswalk.map(Into::into);

    let run = py
        .allow_threads(|| {
            run_frames(
                &config,
                &records,
                &strata,
                &constraints,
                &targets,
                crosswalk.as_ref(),
            )
        })
        .map_err(to_py_err)?;

    let weights = run.weights_frame().map_err(to_py_err)?;
    let report = run.report_frame().map_err(to_py_err)?;
    Ok((PyDataFrame(weights), PyDataFrame(report)))
}

#[pymodule]
fn _internal(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(calibrate, m)?)?;
    Ok(())
}

// src/tables.rs

use std::collections::HashMap;

use polars::prelude::*;

use crate::diagnostics::DiagnosticsReport;
use crate::error::{CalibrationError, Result};
use crate::geography::Crosswalk;
use crate::records::Record;
use crate::targets::{
    AttrValue, Constraint, Stratum, StratumId, Target, TargetType, VariableSchema, VariableType,
};
use crate::weighting::CalibratedWeights;

const RECORD_COLUMNS: [&str; 3] = ["record_id", "initial_weight", "coarse_geography"];

fn has_column(df: &DataFrame, name: &str) -> bool {
    df.get_column_names().iter().any(|c| c.as_str() == name)
}

fn require<'a>(df: &'a DataFrame, table: &str, name: &str) -> Result<&'a Column> {
    if !has_column(df, name) {
        return Err(CalibrationError::Schema(format!(
            "{} table is missing column '{}'",
            table, name
        )));
    }
    Ok(df.column(name)?)
}

fn f64_values(col: &Column) -> Result<Vec<Option<f64>>> {
    let cast = col.cast(&DataType::Float64)?;
    Ok(cast.f64()?.into_iter().collect())
}

fn i64_values(col: &Column) -> Result<Vec<Option<i64>>> {
    let cast = col.cast(&DataType::Int64)?;
    Ok(cast.i64()?.into_iter().collect())
}

fn str_values(col: &Column) -> Result<Vec<Option<String>>> {
    let cast = col.cast(&DataType::String)?;
    Ok(cast.str()?.into_iter().map(|v| v.map(str::to_string)).collect())
}

fn bool_values(col: &Column) -> Result<Vec<Option<bool>>> {
    let cast = col.cast(&DataType::Boolean)?;
    Ok(cast.bool()?.into_iter().collect())
}

fn not_null<T>(value: Option<T>, table: &str, column: &str, row: usize) -> Result<T> {
    value.ok_or_else(|| {
        CalibrationError::Schema(format!("{} table has a null '{}' in row {}", table, column, row))
    })
}

/// Reads the record table.
///
/// String columns become categorical variables; integer, float and boolean
/// columns become numeric ones. Null attribute cells are left unset.
pub fn records_from_frame(df: &DataFrame) -> Result<(Vec<Record>, VariableSchema)> {
    let ids = i64_values(require(df, "record", "record_id")?)?;
    let weights = f64_values(require(df, "record", "initial_weight")?)?;
    let geos = str_values(require(df, "record", "coarse_geography")?)?;

    let mut schema = VariableSchema::new();
    let mut attributes: Vec<(String, Vec<Option<AttrValue>>)> = Vec::new();
    for name in df.get_column_names() {
        let name = name.as_str();
        if RECORD_COLUMNS.contains(&name) {
            continue;
        }
        let col = df.column(name)?;
        let dtype = col.dtype();
        let values: Vec<Option<AttrValue>> = if dtype == &DataType::String {
            schema.declare(name, VariableType::Categorical);
            str_values(col)?
                .into_iter()
                .map(|v| v.map(AttrValue::Text))
                .collect()
        } else if dtype.is_float() || dtype.is_integer() || dtype.is_bool() {
            schema.declare(name, VariableType::Numeric);
            f64_values(col)?
                .into_iter()
                .map(|v| v.map(AttrValue::Number))
                .collect()
        } else {
            return Err(CalibrationError::Schema(format!(
                "record column '{}' has unsupported type {}",
                name, dtype
            )));
        };
        attributes.push((name.to_string(), values));
    }

    let mut records = Vec::with_capacity(df.height());
    for row in 0..df.height() {
        let mut record = Record::new(
            not_null(ids[row], "record", "record_id", row)?,
            not_null(weights[row], "record", "initial_weight", row)?,
            not_null(geos[row].clone(), "record", "coarse_geography", row)?,
        );
        for (name, values) in &attributes {
            if let Some(value) = &values[row] {
                record.attributes.insert(name.clone(), value.clone());
            }
        }
        records.push(record);
    }

    Ok((records, schema))
}

/// Reads the stratum table and its long-form constraint table.
pub fn strata_from_frames(
    strata: &DataFrame,
    constraints: &DataFrame,
    schema: &VariableSchema,
) -> Result<Vec<Stratum>> {
    let ids = i64_values(require(strata, "stratum", "stratum_id")?)?;
    let parents = i64_values(require(strata, "stratum", "parent_stratum_id")?)?;
    let groups = if has_column(strata, "group_id") {
        str_values(strata.column("group_id")?)?
    } else {
        vec![None; strata.height()]
    };

    let mut out = Vec::with_capacity(strata.height());
    let mut index: HashMap<StratumId, usize> = HashMap::with_capacity(strata.height());
    for row in 0..strata.height() {
        let id = not_null(ids[row], "stratum", "stratum_id", row)?;
        index.insert(id, out.len());
        out.push(Stratum::new(id, parents[row], groups[row].clone().unwrap_or_default()));
    }

    let owners = i64_values(require(constraints, "constraint", "stratum_id")?)?;
    let variables = str_values(require(constraints, "constraint", "variable")?)?;
    let operators = str_values(require(constraints, "constraint", "operator")?)?;
    let values = str_values(require(constraints, "constraint", "value")?)?;

    for row in 0..constraints.height() {
        let owner = not_null(owners[row], "constraint", "stratum_id", row)?;
        let variable = not_null(variables[row].as_deref(), "constraint", "variable", row)?;
        let operator = not_null(operators[row].as_deref(), "constraint", "operator", row)?;
        let value = not_null(values[row].as_deref(), "constraint", "value", row)?;

        let slot = *index.get(&owner).ok_or_else(|| {
            CalibrationError::Schema(format!("constraint references missing stratum {}", owner))
        })?;
        let constraint = Constraint::parse(variable, operator, value, schema).map_err(|e| match e {
            CalibrationError::Schema(msg) => {
                CalibrationError::Schema(format!("stratum {}: {}", owner, msg))
            }
            other => other,
        })?;
        out[slot].constraints.push(constraint);
    }

    Ok(out)
}

/// Reads the target table. Optional columns take their defaults: `period` 0,
/// `reform_id` 0, `source_id` empty, `tolerance` 0.05, `active` true and
/// `target_type` count.
pub fn targets_from_frame(df: &DataFrame) -> Result<Vec<Target>> {
    let n = df.height();
    let ids = i64_values(require(df, "target", "target_id")?)?;
    let variables = str_values(require(df, "target", "variable")?)?;
    let strata = i64_values(require(df, "target", "stratum_id")?)?;
    let values = f64_values(require(df, "target", "value")?)?;

    let optional = |name: &str| has_column(df, name).then(|| df.column(name)).transpose();
    let periods = match optional("period")? {
        Some(col) => i64_values(col)?,
        None => vec![Some(0); n],
    };
    let reforms = match optional("reform_id")? {
        Some(col) => i64_values(col)?,
        None => vec![Some(0); n],
    };
    let sources = match optional("source_id")? {
        Some(col) => str_values(col)?,
        None => vec![None; n],
    };
    let tolerances = match optional("tolerance")? {
        Some(col) => f64_values(col)?,
        None => vec![None; n],
    };
    let active = match optional("active")? {
        Some(col) => bool_values(col)?,
        None => vec![Some(true); n],
    };
    let kinds = match optional("target_type")? {
        Some(col) => str_values(col)?,
        None => vec![None; n],
    };

    let mut targets = Vec::with_capacity(n);
    for row in 0..n {
        let reform = not_null(reforms[row], "target", "reform_id", row)?;
        let period = not_null(periods[row], "target", "period", row)?;
        let target_type = match &kinds[row] {
            Some(raw) => TargetType::parse(raw)?,
            None => TargetType::default(),
        };
        targets.push(Target {
            id: not_null(ids[row], "target", "target_id", row)?,
            variable: not_null(variables[row].clone(), "target", "variable", row)?,
            period: i32::try_from(period).map_err(|_| {
                CalibrationError::Schema(format!("target row {} has period {} out of range", row, period))
            })?,
            stratum_id: not_null(strata[row], "target", "stratum_id", row)?,
            reform_id: u32::try_from(reform).map_err(|_| {
                CalibrationError::Schema(format!("target row {} has reform_id {} out of range", row, reform))
            })?,
            value: not_null(values[row], "target", "value", row)?,
            source_id: sources[row].clone().unwrap_or_default(),
            tolerance: tolerances[row].unwrap_or(0.05),
            active: active[row].unwrap_or(true),
            target_type,
        });
    }
    Ok(targets)
}

/// Reads `coarse_geography, fine_geography_id, pop_share` rows.
pub fn crosswalk_from_frame(df: &DataFrame) -> Result<Crosswalk> {
    let coarse = str_values(require(df, "crosswalk", "coarse_geography")?)?;
    let fine = str_values(require(df, "crosswalk", "fine_geography_id")?)?;
    let shares = f64_values(require(df, "crosswalk", "pop_share")?)?;

    let rows = (0..df.height())
        .map(|row| {
            Ok((
                not_null(coarse[row].clone(), "crosswalk", "coarse_geography", row)?,
                not_null(fine[row].clone(), "crosswalk", "fine_geography_id", row)?,
                not_null(shares[row], "crosswalk", "pop_share", row)?,
            ))
        })
        .collect::<Result<Vec<_>>>()?;
    Crosswalk::new(rows)
}

/// `record_id, initial_weight, weight, adjustment`
pub fn weights_to_frame(weights: &CalibratedWeights) -> Result<DataFrame> {
    let initial = weights.initial().to_vec();
    let calibrated = weights.weights().to_vec();
    let adjustment: Vec<f64> = calibrated
        .iter()
        .zip(&initial)
        .map(|(w, w0)| w / w0)
        .collect();

    Ok(df![
        "record_id" => weights.record_ids().to_vec(),
        "initial_weight" => initial,
        "weight" => calibrated,
        "adjustment" => adjustment
    ]?)
}

/// One row per target, keyed by `target_id`.
pub fn report_to_frame(report: &DiagnosticsReport) -> Result<DataFrame> {
    let t = &report.targets;
    Ok(df![
        "target_id" => t.iter().map(|d| d.target_id).collect::<Vec<_>>(),
        "stratum_id" => t.iter().map(|d| d.stratum_id).collect::<Vec<_>>(),
        "variable" => t.iter().map(|d| d.variable.as_str()).collect::<Vec<_>>(),
        "level" => t.iter().map(|d| d.level.name()).collect::<Vec<_>>(),
        "target" => t.iter().map(|d| d.target).collect::<Vec<_>>(),
        "initial_estimate" => t.iter().map(|d| d.initial_estimate).collect::<Vec<_>>(),
        "estimate" => t.iter().map(|d| d.estimate).collect::<Vec<_>>(),
        "relative_error" => t.iter().map(|d| d.relative_error).collect::<Vec<_>>(),
        "tolerance" => t.iter().map(|d| d.tolerance).collect::<Vec<_>>(),
        "passed" => t.iter().map(|d| d.passed).collect::<Vec<_>>()
    ]?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::targets::Predicate;

    #[test]
    fn test_records_types_follow_dtypes() {
        let df = df![
            "record_id" => [1i64, 2],
            "initial_weight" => [1.5, 2.0],
            "coarse_geography" => ["06", "48"],
            "state_fips" => [Some("06"), None],
            "agi" => [20_000i64, -5],
            "is_joint" => [true, false]
        ]
        .unwrap();

        let (records, schema) = records_from_frame(&df).unwrap();

        assert_eq!(schema.get("state_fips"), Some(VariableType::Categorical));
        assert_eq!(schema.get("agi"), Some(VariableType::Numeric));
        assert_eq!(schema.get("is_joint"), Some(VariableType::Numeric));
        assert_eq!(records[0].attr("agi"), Some(&AttrValue::Number(20_000.0)));
        assert_eq!(records[0].attr("is_joint"), Some(&AttrValue::Number(1.0)));
        assert!(records[1].attr("state_fips").is_none());
        assert_eq!(records[1].coarse_geography, "48");
    }

    #[test]
    fn test_missing_record_column() {
        let df = df!["record_id" => [1i64], "initial_weight" => [1.0]].unwrap();
        assert!(matches!(records_from_frame(&df), Err(CalibrationError::Schema(_))));
    }

    #[test]
    fn test_strata_with_constraints() {
        let schema = VariableSchema::new()
            .with("state_fips", VariableType::Categorical)
            .with("agi", VariableType::Numeric);
        let strata = df![
            "stratum_id" => [1i64, 2],
            "parent_stratum_id" => [None, Some(1i64)],
            "group_id" => ["national", "states"]
        ]
        .unwrap();
        let constraints = df![
            "stratum_id" => [2i64, 2],
            "variable" => ["state_fips", "agi"],
            "operator" => ["==", "in-range"],
            "value" => ["06", "0,50000"]
        ]
        .unwrap();

        let out = strata_from_frames(&strata, &constraints, &schema).unwrap();

        assert_eq!(out[0].parent_id, None);
        assert_eq!(out[1].parent_id, Some(1));
        assert_eq!(out[1].constraints.len(), 2);
        assert_eq!(
            out[1].constraints[1].predicate,
            Predicate::InRange { low: 0.0, high: 50_000.0 }
        );
    }

    #[test]
    fn test_constraint_on_unknown_stratum() {
        let schema = VariableSchema::new().with("state_fips", VariableType::Categorical);
        let strata = df!["stratum_id" => [1i64], "parent_stratum_id" => [None::<i64>]].unwrap();
        let constraints = df![
            "stratum_id" => [9i64],
            "variable" => ["state_fips"],
            "operator" => ["=="],
            "value" => ["06"]
        ]
        .unwrap();
        assert!(strata_from_frames(&strata, &constraints, &schema).is_err());
    }

    #[test]
    fn test_targets_defaults() {
        let df = df![
            "target_id" => [1i64, 2],
            "variable" => ["returns", "agi"],
            "stratum_id" => [1i64, 1],
            "value" => [100.0, 5.0e6],
            "target_type" => [None, Some("sum")]
        ]
        .unwrap();

        let targets = targets_from_frame(&df).unwrap();
        assert_eq!(targets[0].target_type, TargetType::Count);
        assert_eq!(targets[1].target_type, TargetType::Sum);
        assert_eq!(targets[0].tolerance, 0.05);
        assert!(targets[0].active);
        assert_eq!(targets[1].period, 0);
    }

    #[test]
    fn test_crosswalk_frame() {
        let df = df![
            "coarse_geography" => ["06", "06"],
            "fine_geography_id" => ["06037", "06075"],
            "pop_share" => [0.7, 0.3]
        ]
        .unwrap();
        let crosswalk = crosswalk_from_frame(&df).unwrap();
        assert_eq!(crosswalk.unit("06").map(|u| u.len()), Some(2));
    }
}

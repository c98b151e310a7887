// src/targets/constraint.rs

use std::collections::HashMap;
use std::fmt;

use crate::error::{CalibrationError, Result};

/// A single attribute value of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Number(f64),
    Text(String),
}

impl AttrValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Number(x) => Some(*x),
            AttrValue::Text(_) => None,
        }
    }

    /// Hashable form used by the equality index.
    pub fn key(&self) -> ValueKey {
        match self {
            // -0.0 and 0.0 compare equal, so they must share a key
            AttrValue::Number(x) if *x == 0.0 => ValueKey::Number(0.0f64.to_bits()),
            AttrValue::Number(x) => ValueKey::Number(x.to_bits()),
            AttrValue::Text(s) => ValueKey::Text(s.clone()),
        }
    }
}

impl From<f64> for AttrValue {
    fn from(x: f64) -> Self {
        AttrValue::Number(x)
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Text(s.to_string())
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Number(x) => write!(f, "{}", x),
            AttrValue::Text(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueKey {
    Number(u64),
    Text(String),
}

/// Declared type of a record variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableType {
    Numeric,
    Categorical,
}

/// Variable name -> declared type, taken from the record table.
#[derive(Debug, Clone, Default)]
pub struct VariableSchema {
    types: HashMap<String, VariableType>,
}

impl VariableSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, name: impl Into<String>, ty: VariableType) {
        self.types.insert(name.into(), ty);
    }

    pub fn with(mut self, name: impl Into<String>, ty: VariableType) -> Self {
        self.declare(name, ty);
        self
    }

    pub fn get(&self, name: &str) -> Option<VariableType> {
        self.types.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Membership test applied to one variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Equals(AttrValue),
    NotEquals(AttrValue),
    LessThan(f64),
    AtMost(f64),
    GreaterThan(f64),
    AtLeast(f64),
    /// Half-open `[low, high)`.
    InRange { low: f64, high: f64 },
    OneOf(Vec<AttrValue>),
}

/// A predicate a record must satisfy to belong to a stratum.
#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    pub variable: String,
    pub predicate: Predicate,
}

impl Constraint {
    pub fn new(variable: impl Into<String>, predicate: Predicate) -> Self {
        Self {
            variable: variable.into(),
            predicate,
        }
    }

    /// Parses a `(variable, operator, value)` triple, typing the value by the
    /// variable's declared type.
    pub fn parse(
        variable: &str,
        operator: &str,
        value: &str,
        schema: &VariableSchema,
    ) -> Result<Self> {
        let ty = schema.get(variable).ok_or_else(|| {
            CalibrationError::Schema(format!("constraint on undeclared variable '{}'", variable))
        })?;
        let value = value.trim();

        let predicate = match operator.trim() {
            "=" | "==" => Predicate::Equals(parse_value(variable, value, ty)?),
            "!=" => Predicate::NotEquals(parse_value(variable, value, ty)?),
            "<" => Predicate::LessThan(parse_number(variable, value)?),
            "<=" => Predicate::AtMost(parse_number(variable, value)?),
            ">" => Predicate::GreaterThan(parse_number(variable, value)?),
            ">=" => Predicate::AtLeast(parse_number(variable, value)?),
            "in" => Predicate::OneOf(
                value
                    .split(',')
                    .map(|v| parse_value(variable, v.trim(), ty))
                    .collect::<Result<Vec<_>>>()?,
            ),
            "in-range" | "in_range" | "between" => {
                let (low, high) = value.split_once(',').ok_or_else(|| {
                    CalibrationError::Schema(format!(
                        "range on '{}' must be 'low,high', got '{}'",
                        variable, value
                    ))
                })?;
                Predicate::InRange {
                    low: parse_number(variable, low.trim())?,
                    high: parse_number(variable, high.trim())?,
                }
            }
            other => {
                return Err(CalibrationError::Schema(format!(
                    "unsupported operator '{}' on '{}'",
                    other, variable
                )))
            }
        };

        let constraint = Self::new(variable, predicate);
        constraint.validate(schema)?;
        Ok(constraint)
    }

    /// Checks the predicate against the variable's declared type.
    pub fn validate(&self, schema: &VariableSchema) -> Result<()> {
        let ty = schema.get(&self.variable).ok_or_else(|| {
            CalibrationError::Schema(format!(
                "constraint on undeclared variable '{}'",
                self.variable
            ))
        })?;

        let type_error = |what: &str| {
            CalibrationError::Schema(format!(
                "{} constraint is not valid for {:?} variable '{}'",
                what, ty, self.variable
            ))
        };
        let value_fits = |v: &AttrValue| {
            matches!(
                (ty, v),
                (VariableType::Numeric, AttrValue::Number(_))
                    | (VariableType::Categorical, AttrValue::Text(_))
            )
        };

        match &self.predicate {
            Predicate::Equals(v) | Predicate::NotEquals(v) => {
                if !value_fits(v) {
                    return Err(type_error("equality"));
                }
            }
            Predicate::OneOf(values) => {
                if values.is_empty() || !values.iter().all(|v| value_fits(v)) {
                    return Err(type_error("set membership"));
                }
            }
            Predicate::LessThan(x)
            | Predicate::AtMost(x)
            | Predicate::GreaterThan(x)
            | Predicate::AtLeast(x) => {
                if ty != VariableType::Numeric {
                    return Err(type_error("ordering"));
                }
                if x.is_nan() {
                    return Err(type_error("NaN bound in"));
                }
            }
            Predicate::InRange { low, high } => {
                if ty != VariableType::Numeric {
                    return Err(type_error("range"));
                }
                if !(low < high) {
                    return Err(CalibrationError::Schema(format!(
                        "empty range [{}, {}) on '{}'",
                        low, high, self.variable
                    )));
                }
            }
        }
        Ok(())
    }

    /// True when `value` satisfies the predicate. Missing values satisfy nothing.
    pub fn matches(&self, value: Option<&AttrValue>) -> bool {
        let Some(value) = value else {
            return false;
        };

        match &self.predicate {
            Predicate::Equals(expected) => value == expected,
            Predicate::NotEquals(expected) => value != expected,
            Predicate::OneOf(options) => options.iter().any(|o| o == value),
            Predicate::LessThan(bound) => value.as_f64().is_some_and(|x| x < *bound),
            Predicate::AtMost(bound) => value.as_f64().is_some_and(|x| x <= *bound),
            Predicate::GreaterThan(bound) => value.as_f64().is_some_and(|x| x > *bound),
            Predicate::AtLeast(bound) => value.as_f64().is_some_and(|x| x >= *bound),
            Predicate::InRange { low, high } => {
                value.as_f64().is_some_and(|x| x >= *low && x < *high)
            }
        }
    }

    /// Value an equality index can key this constraint on.
    pub fn equality_key(&self) -> Option<ValueKey> {
        match &self.predicate {
            Predicate::Equals(v) => Some(v.key()),
            _ => None,
        }
    }

    /// Stable textual form, used to detect duplicate stratum definitions.
    pub fn canonical(&self) -> String {
        let rendered = match &self.predicate {
            Predicate::Equals(v) => format!("=={}", v),
            Predicate::NotEquals(v) => format!("!={}", v),
            Predicate::LessThan(x) => format!("<{}", x),
            Predicate::AtMost(x) => format!("<={}", x),
            Predicate::GreaterThan(x) => format!(">{}", x),
            Predicate::AtLeast(x) => format!(">={}", x),
            Predicate::InRange { low, high } => format!("in[{},{})", low, high),
            Predicate::OneOf(values) => {
                let mut parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                parts.sort();
                format!("in{{{}}}", parts.join(","))
            }
        };
        format!("{}{}", self.variable, rendered)
    }
}

fn parse_number(variable: &str, raw: &str) -> Result<f64> {
    raw.parse::<f64>().map_err(|_| {
        CalibrationError::Schema(format!(
            "value '{}' for numeric variable '{}' is not a number",
            raw, variable
        ))
    })
}

fn parse_value(variable: &str, raw: &str, ty: VariableType) -> Result<AttrValue> {
    match ty {
        VariableType::Numeric => parse_number(variable, raw).map(AttrValue::Number),
        VariableType::Categorical => Ok(AttrValue::Text(raw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> VariableSchema {
        VariableSchema::new()
            .with("agi", VariableType::Numeric)
            .with("state_fips", VariableType::Categorical)
    }

    #[test]
    fn test_parse_equality_on_categorical() {
        let c = Constraint::parse("state_fips", "==", "06", &schema()).unwrap();
        assert_eq!(c.predicate, Predicate::Equals(AttrValue::Text("06".to_string())));
        assert!(c.matches(Some(&AttrValue::from("06"))));
        assert!(!c.matches(Some(&AttrValue::from("48"))));
        assert!(!c.matches(None));
    }

    #[test]
    fn test_range_is_half_open() {
        let c = Constraint::parse("agi", "in-range", "50000, 75000", &schema()).unwrap();
        assert!(c.matches(Some(&AttrValue::Number(50_000.0))));
        assert!(c.matches(Some(&AttrValue::Number(74_999.0))));
        assert!(!c.matches(Some(&AttrValue::Number(75_000.0))));
    }

    #[test]
    fn test_unbounded_range() {
        let c = Constraint::parse("agi", "in_range", "-inf,1", &schema()).unwrap();
        assert!(c.matches(Some(&AttrValue::Number(-1e9))));
        assert!(!c.matches(Some(&AttrValue::Number(1.0))));
    }

    #[test]
    fn test_set_membership() {
        let c = Constraint::parse("state_fips", "in", "06,48", &schema()).unwrap();
        assert!(c.matches(Some(&AttrValue::from("48"))));
        assert!(!c.matches(Some(&AttrValue::from("36"))));
    }

    #[test]
    fn test_ordering_on_categorical_rejected() {
        let result = Constraint::parse("state_fips", ">=", "06", &schema());
        assert!(matches!(result, Err(CalibrationError::Schema(_))));
    }

    #[test]
    fn test_non_numeric_value_rejected() {
        let result = Constraint::parse("agi", "<", "lots", &schema());
        assert!(matches!(result, Err(CalibrationError::Schema(_))));
    }

    #[test]
    fn test_undeclared_variable_rejected() {
        let result = Constraint::parse("age", ">", "65", &schema());
        assert!(matches!(result, Err(CalibrationError::Schema(_))));
    }

    #[test]
    fn test_unknown_operator_rejected() {
        let result = Constraint::parse("agi", "~", "1", &schema());
        assert!(matches!(result, Err(CalibrationError::Schema(_))));
    }

    #[test]
    fn test_negative_zero_shares_key() {
        assert_eq!(AttrValue::Number(-0.0).key(), AttrValue::Number(0.0).key());
    }
}

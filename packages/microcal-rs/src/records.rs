// src/records.rs

use std::collections::{HashMap, HashSet};

use crate::error::{CalibrationError, Result};
use crate::targets::{AttrValue, VariableSchema, VariableType};

pub type RecordId = i64;

/// One survey microdata record.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: RecordId,
    pub initial_weight: f64,
    pub coarse_geography: String,
    pub attributes: HashMap<String, AttrValue>,
}

impl Record {
    pub fn new(id: RecordId, initial_weight: f64, coarse_geography: impl Into<String>) -> Self {
        Self {
            id,
            initial_weight,
            coarse_geography: coarse_geography.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attributes.get(name)
    }
}

/// Rejects duplicate ids and non-positive or non-finite weights.
pub fn validate_records(records: &[Record]) -> Result<()> {
    if records.is_empty() {
        return Err(CalibrationError::InvalidInput("no records provided".to_string()));
    }

    let mut seen = HashSet::with_capacity(records.len());
    for record in records {
        if !seen.insert(record.id) {
            return Err(CalibrationError::Schema(format!(
                "duplicate record id {}",
                record.id
            )));
        }
        if !(record.initial_weight.is_finite() && record.initial_weight > 0.0) {
            return Err(CalibrationError::Schema(format!(
                "record {} has initial weight {}, must be positive and finite",
                record.id, record.initial_weight
            )));
        }
    }
    Ok(())
}

/// Declares each attribute numeric or categorical from the values present.
///
/// A variable carrying both numbers and text is a schema error.
pub fn infer_schema(records: &[Record]) -> Result<VariableSchema> {
    let mut types: HashMap<&str, VariableType> = HashMap::new();

    for record in records {
        for (name, value) in &record.attributes {
            let ty = match value {
                AttrValue::Number(_) => VariableType::Numeric,
                AttrValue::Text(_) => VariableType::Categorical,
            };
            match types.get(name.as_str()) {
                Some(&existing) if existing != ty => {
                    return Err(CalibrationError::Schema(format!(
                        "variable '{}' mixes numeric and text values",
                        name
                    )));
                }
                Some(_) => {}
                None => {
                    types.insert(name.as_str(), ty);
                }
            }
        }
    }

    let mut schema = VariableSchema::new();
    for (name, ty) in types {
        schema.declare(name, ty);
    }
    Ok(schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_zero_weight() {
        let records = vec![Record::new(1, 1.0, "06"), Record::new(2, 0.0, "06")];
        assert!(matches!(validate_records(&records), Err(CalibrationError::Schema(_))));
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let records = vec![Record::new(1, 1.0, "06"), Record::new(1, 2.0, "48")];
        assert!(validate_records(&records).is_err());
    }

    #[test]
    fn test_infer_schema() {
        let records = vec![
            Record::new(1, 1.0, "06").with_attr("agi", 100.0).with_attr("state_fips", "06"),
            Record::new(2, 1.0, "48").with_attr("agi", -5.0),
        ];
        let schema = infer_schema(&records).unwrap();
        assert_eq!(schema.get("agi"), Some(VariableType::Numeric));
        assert_eq!(schema.get("state_fips"), Some(VariableType::Categorical));
        assert_eq!(schema.get("age"), None);
    }

    #[test]
    fn test_infer_schema_rejects_mixed_types() {
        let records = vec![
            Record::new(1, 1.0, "06").with_attr("x", 1.0),
            Record::new(2, 1.0, "06").with_attr("x", "one"),
        ];
        assert!(infer_schema(&records).is_err());
    }
}

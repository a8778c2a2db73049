//! Variable codec
//!
//! Process and task variables are typed in memory but persisted as flat rows
//! with one text column and optional numeric columns. This module converts
//! between the two representations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub const TYPE_STRING: &str = "string";
pub const TYPE_INTEGER: &str = "integer";
pub const TYPE_DOUBLE: &str = "double";
pub const TYPE_BOOLEAN: &str = "boolean";
pub const TYPE_DATE: &str = "date";
pub const TYPE_JSON: &str = "json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum VariableValue {
    String(String),
    Integer(i64),
    Double(f64),
    Boolean(bool),
    Date(DateTime<Utc>),
    Json(serde_json::Value),
}

/// Flat storage row for a single variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredVariable {
    pub name: String,
    pub var_type: String,
    pub text_value: Option<String>,
    pub long_value: Option<i64>,
    pub double_value: Option<f64>,
}

#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("Variable '{name}' has malformed {var_type} value: {reason}")]
    Malformed {
        name: String,
        var_type: &'static str,
        reason: String,
    },
}

pub type VariableMap = HashMap<String, VariableValue>;

impl VariableValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            VariableValue::String(_) => TYPE_STRING,
            VariableValue::Integer(_) => TYPE_INTEGER,
            VariableValue::Double(_) => TYPE_DOUBLE,
            VariableValue::Boolean(_) => TYPE_BOOLEAN,
            VariableValue::Date(_) => TYPE_DATE,
            VariableValue::Json(_) => TYPE_JSON,
        }
    }

    /// Classify an untyped JSON value coming from an API payload.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => VariableValue::String(s),
            serde_json::Value::Bool(b) => VariableValue::Boolean(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => VariableValue::Integer(i),
                None => VariableValue::Double(n.as_f64().unwrap_or_default()),
            },
            other => VariableValue::Json(other),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            VariableValue::String(s) => serde_json::Value::String(s.clone()),
            VariableValue::Integer(i) => serde_json::Value::from(*i),
            VariableValue::Double(d) => serde_json::Value::from(*d),
            VariableValue::Boolean(b) => serde_json::Value::Bool(*b),
            VariableValue::Date(d) => serde_json::Value::String(d.to_rfc3339()),
            VariableValue::Json(v) => v.clone(),
        }
    }
}

pub fn encode(name: &str, value: &VariableValue) -> StoredVariable {
    let mut row = StoredVariable {
        name: name.to_string(),
        var_type: value.type_name().to_string(),
        text_value: None,
        long_value: None,
        double_value: None,
    };

    match value {
        VariableValue::String(s) => row.text_value = Some(s.clone()),
        VariableValue::Integer(i) => {
            row.long_value = Some(*i);
            row.text_value = Some(i.to_string());
        }
        VariableValue::Double(d) => {
            row.double_value = Some(*d);
            row.text_value = Some(d.to_string());
        }
        VariableValue::Boolean(b) => row.text_value = Some(b.to_string()),
        VariableValue::Date(d) => row.text_value = Some(d.to_rfc3339()),
        VariableValue::Json(v) => row.text_value = Some(v.to_string()),
    }

    row
}

pub fn decode(row: &StoredVariable) -> Result<VariableValue, CodecError> {
    let text = row.text_value.clone().unwrap_or_default();

    let value = match row.var_type.as_str() {
        TYPE_INTEGER => match row.long_value {
            Some(i) => VariableValue::Integer(i),
            None => VariableValue::Integer(text.parse().map_err(|e: std::num::ParseIntError| {
                CodecError::Malformed {
                    name: row.name.clone(),
                    var_type: TYPE_INTEGER,
                    reason: e.to_string(),
                }
            })?),
        },
        TYPE_DOUBLE => match row.double_value {
            Some(d) => VariableValue::Double(d),
            None => VariableValue::Double(text.parse().map_err(
                |e: std::num::ParseFloatError| CodecError::Malformed {
                    name: row.name.clone(),
                    var_type: TYPE_DOUBLE,
                    reason: e.to_string(),
                },
            )?),
        },
        TYPE_BOOLEAN => VariableValue::Boolean(text == "true"),
        TYPE_DATE => {
            let parsed = DateTime::parse_from_rfc3339(&text).map_err(|e| CodecError::Malformed {
                name: row.name.clone(),
                var_type: TYPE_DATE,
                reason: e.to_string(),
            })?;
            VariableValue::Date(parsed.with_timezone(&Utc))
        }
        TYPE_JSON => {
            let parsed = serde_json::from_str(&text).map_err(|e| CodecError::Malformed {
                name: row.name.clone(),
                var_type: TYPE_JSON,
                reason: e.to_string(),
            })?;
            VariableValue::Json(parsed)
        }
        // unknown tags degrade to their text form
        _ => VariableValue::String(text),
    };

    Ok(value)
}

pub fn encode_map(variables: &VariableMap) -> Vec<StoredVariable> {
    let mut rows: Vec<StoredVariable> = variables
        .iter()
        .map(|(name, value)| encode(name, value))
        .collect();
    rows.sort_by(|a, b| a.name.cmp(&b.name));
    rows
}

/// Decode rows into a map. Rows that fail to decode are logged and skipped.
pub fn decode_map(rows: &[StoredVariable]) -> VariableMap {
    let mut variables = VariableMap::with_capacity(rows.len());
    for row in rows {
        match decode(row) {
            Ok(value) => {
                variables.insert(row.name.clone(), value);
            }
            Err(e) => {
                tracing::warn!(variable = %row.name, error = %e, "Skipping undecodable variable");
            }
        }
    }
    variables
}

/// Convert an untyped JSON object into a typed variable map.
pub fn from_json_object(object: serde_json::Map<String, serde_json::Value>) -> VariableMap {
    object
        .into_iter()
        .map(|(k, v)| (k, VariableValue::from_json(v)))
        .collect()
}

pub fn to_json_object(variables: &VariableMap) -> serde_json::Map<String, serde_json::Value> {
    variables
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_integer_populates_long_and_text() {
        let row = encode("amount", &VariableValue::Integer(1200));
        assert_eq!(row.var_type, "integer");
        assert_eq!(row.long_value, Some(1200));
        assert_eq!(row.text_value.as_deref(), Some("1200"));
        assert_eq!(decode(&row).unwrap(), VariableValue::Integer(1200));
    }

    #[test]
    fn test_boolean_decodes_from_text_only() {
        let mut row = encode("approved", &VariableValue::Boolean(true));
        assert_eq!(row.text_value.as_deref(), Some("true"));
        assert_eq!(decode(&row).unwrap(), VariableValue::Boolean(true));

        row.text_value = Some("yes".to_string());
        assert_eq!(decode(&row).unwrap(), VariableValue::Boolean(false));
    }

    #[test]
    fn test_date_uses_rfc3339_text() {
        let when = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let row = encode("due", &VariableValue::Date(when));
        assert_eq!(row.text_value.as_deref(), Some("2024-03-01T12:30:00+00:00"));
        assert_eq!(decode(&row).unwrap(), VariableValue::Date(when));
    }

    #[test]
    fn test_unknown_type_falls_back_to_text() {
        let row = StoredVariable {
            name: "legacy".to_string(),
            var_type: "serializable".to_string(),
            text_value: Some("opaque".to_string()),
            long_value: None,
            double_value: None,
        };
        assert_eq!(
            decode(&row).unwrap(),
            VariableValue::String("opaque".to_string())
        );
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        let row = StoredVariable {
            name: "payload".to_string(),
            var_type: TYPE_JSON.to_string(),
            text_value: Some("{not json".to_string()),
            long_value: None,
            double_value: None,
        };
        assert!(matches!(decode(&row), Err(CodecError::Malformed { .. })));
    }

    #[test]
    fn test_decode_map_skips_bad_rows() {
        let mut rows = encode_map(&from_json_object(
            json!({"initiator": "alice", "count": 3})
                .as_object()
                .cloned()
                .unwrap(),
        ));
        rows.push(StoredVariable {
            name: "broken".to_string(),
            var_type: TYPE_DATE.to_string(),
            text_value: Some("yesterday".to_string()),
            long_value: None,
            double_value: None,
        });

        let decoded = decode_map(&rows);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded["count"], VariableValue::Integer(3));
        assert!(!decoded.contains_key("broken"));
    }

    #[test]
    fn test_json_classification() {
        assert_eq!(
            VariableValue::from_json(json!(2.5)),
            VariableValue::Double(2.5)
        );
        assert_eq!(
            VariableValue::from_json(json!({"a": 1})),
            VariableValue::Json(json!({"a": 1}))
        );
    }
}

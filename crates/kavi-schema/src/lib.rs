//! Declared I/O schemas for kavi skills.
//!
//! A skill declares its input and output shape as a flat map of field
//! name to type name (`"str"`, `"int"`, `"float"`, `"bool"`, `"list"`,
//! `"dict"`). Validation is strict in both directions: every declared
//! field must be present with the declared type, and no undeclared
//! field may appear.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Declared type of a single schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Str,
    Int,
    Float,
    Bool,
    List,
    Dict,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Str => "str",
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::Bool => "bool",
            FieldType::List => "list",
            FieldType::Dict => "dict",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::Str => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            // An integer is an acceptable float; the reverse is not.
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::List => value.is_array(),
            FieldType::Dict => value.is_object(),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A flat field → type map, ordered for stable serialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IoSchema {
    pub fields: BTreeMap<String, FieldType>,
}

/// Schema mismatch, reported to the caller as `InvalidInput`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("expected a JSON object, got {got}")]
    NotAnObject { got: &'static str },
    #[error("missing required field `{field}`")]
    MissingField { field: String },
    #[error("field `{field}` expected {expected}, got {got}")]
    WrongType {
        field: String,
        expected: FieldType,
        got: &'static str,
    },
    #[error("undeclared field `{field}`")]
    UnknownField { field: String },
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl IoSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a schema from `(field, type)` pairs; convenient in tests
    /// and packet framing.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, FieldType)>,
        S: Into<String>,
    {
        Self {
            fields: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Validate a JSON value against this schema.
    ///
    /// Errors report the first mismatch in field order, which keeps the
    /// message stable for identical inputs.
    pub fn validate(&self, value: &Value) -> Result<(), SchemaError> {
        let obj = value.as_object().ok_or(SchemaError::NotAnObject {
            got: json_type_name(value),
        })?;

        for (field, ty) in &self.fields {
            match obj.get(field) {
                None => {
                    return Err(SchemaError::MissingField {
                        field: field.clone(),
                    });
                }
                Some(v) if !ty.matches(v) => {
                    return Err(SchemaError::WrongType {
                        field: field.clone(),
                        expected: *ty,
                        got: json_type_name(v),
                    });
                }
                Some(_) => {}
            }
        }

        for field in obj.keys() {
            if !self.fields.contains_key(field) {
                return Err(SchemaError::UnknownField {
                    field: field.clone(),
                });
            }
        }

        Ok(())
    }

    /// Render the schema the way it appears in proposals and build
    /// packets: a single JSON object line.
    pub fn to_packet_line(&self) -> String {
        let map: BTreeMap<&str, &str> = self
            .fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        serde_json::to_string(&map).unwrap_or_else(|_| "{}".to_string())
    }
}

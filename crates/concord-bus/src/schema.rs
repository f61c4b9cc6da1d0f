//! Lightweight event payload schemas. Not a general JSON Schema
//! implementation — just enough shape-checking to catch a malformed
//! publisher before handlers see the payload.

use dashmap::DashMap;
use serde_json::Value;

/// The expected JSON type of a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Any JSON string.
    String,
    /// Any JSON number.
    Number,
    /// Any JSON boolean.
    Bool,
    /// Any JSON object.
    Object,
    /// Any JSON array.
    Array,
    /// Any value, including `null`.
    Any,
}

impl FieldType {
    fn matches(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Any => true,
        }
    }
}

/// A schema for an event payload: a flat set of required fields and their
/// expected types. The payload may carry additional fields beyond those
/// named here.
#[derive(Debug, Clone)]
pub struct Schema {
    fields: Vec<(String, FieldType)>,
}

impl Schema {
    /// Build a schema requiring an object payload with the given fields.
    pub fn object(fields: &[(&str, FieldType)]) -> Self {
        Self {
            fields: fields.iter().map(|(k, t)| (k.to_string(), *t)).collect(),
        }
    }

    /// Validate `payload` against this schema.
    pub fn validate(&self, payload: &Value) -> Result<(), SchemaError> {
        let obj = payload
            .as_object()
            .ok_or(SchemaError::NotAnObject)?;
        for (field, expected) in &self.fields {
            match obj.get(field) {
                None => return Err(SchemaError::MissingField(field.clone())),
                Some(value) if !expected.matches(value) => {
                    return Err(SchemaError::WrongType(field.clone(), *expected))
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Reason a payload failed schema validation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchemaError {
    /// The payload was not a JSON object.
    #[error("payload is not a JSON object")]
    NotAnObject,
    /// A required field was absent.
    #[error("missing required field '{0}'")]
    MissingField(String),
    /// A field was present but of the wrong type.
    #[error("field '{0}' does not match expected type {1:?}")]
    WrongType(String, FieldType),
}

/// Maps event names to their registered [`Schema`].
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: DashMap<String, Schema>,
}

impl SchemaRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            schemas: DashMap::new(),
        }
    }

    /// Register (or replace) the schema for `name`.
    pub fn register(&self, name: impl Into<String>, schema: Schema) {
        self.schemas.insert(name.into(), schema);
    }

    /// Look up the schema registered for `name`, if any.
    pub fn get(&self, name: &str) -> Option<Schema> {
        self.schemas.get(name).map(|entry| entry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_field_is_rejected() {
        let schema = Schema::object(&[("a", FieldType::String)]);
        assert!(schema.validate(&serde_json::json!({})).is_err());
    }

    #[test]
    fn wrong_type_is_rejected() {
        let schema = Schema::object(&[("a", FieldType::Number)]);
        assert!(schema.validate(&serde_json::json!({"a": "not a number"})).is_err());
    }

    #[test]
    fn extra_fields_are_allowed() {
        let schema = Schema::object(&[("a", FieldType::String)]);
        assert!(schema.validate(&serde_json::json!({"a": "x", "b": 1})).is_ok());
    }
}

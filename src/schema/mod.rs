//! Recursive schema definitions.
//!
//! A schema is a named mapping of field definitions. Field kinds are either
//! scalar (`string`, `int`, `float64`, `bool`), structured (`object`,
//! `array`, `map`) or a reference to another registered schema. References
//! are resolved at validation time, so a batch of schemas may reference
//! forward.

mod registry;

pub use registry::SchemaRegistry;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::repo::Record;
use crate::types::{GroveError, Result};

/// Scalar kinds checked with a strict type test.
pub(crate) fn is_scalar_kind(kind: &str) -> bool {
    matches!(kind, "string" | "int" | "float64" | "bool")
}

/// Kinds with structural children.
pub(crate) fn is_structured_kind(kind: &str) -> bool {
    matches!(kind, "object" | "array" | "map")
}

/// Recursive type descriptor for a single field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDefinition {
    /// Kind name: scalar, structured, or a schema reference.
    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(default)]
    pub required: bool,

    /// Nested field definitions, only for `object`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<HashMap<String, FieldDefinition>>,

    /// Element type, only for `array` and `map`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<Box<FieldDefinition>>,

    /// Schema name overriding `kind` as a cross-schema reference.
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl FieldDefinition {
    /// Enforce the structural parsing rules, recursively.
    fn check(&self, name: &str) -> Result<()> {
        if self.kind.is_empty() {
            return Err(GroveError::validation(format!("field {name} missing type")));
        }

        if let Some(fields) = &self.fields {
            if self.kind != "object" {
                return Err(GroveError::validation(format!(
                    "field {name}: fields only allowed with type 'object'"
                )));
            }
            for (nested_name, nested) in fields {
                nested.check(nested_name)?;
            }
        }

        if let Some(item) = &self.item {
            if self.kind != "array" && self.kind != "map" {
                return Err(GroveError::validation(format!(
                    "field {name}: item only allowed with type 'array' or 'map'"
                )));
            }
            item.check(&format!("{name}.item"))?;
        }

        Ok(())
    }
}

/// Parsed schema: effective field set after inheritance merging.
#[derive(Debug, Clone)]
pub struct SchemaDefinition {
    pub id: String,
    pub name: String,
    pub extends: Option<String>,
    pub fields: HashMap<String, FieldDefinition>,
}

/// Parse a raw `fields` mapping into field definitions.
pub(crate) fn parse_fields(raw: &Record) -> Result<HashMap<String, FieldDefinition>> {
    let fields: HashMap<String, FieldDefinition> =
        serde_json::from_value(serde_json::Value::Object(raw.clone()))
            .map_err(|e| GroveError::validation(format!("failed to parse fields: {e}")))?;

    for (name, def) in &fields {
        def.check(name)?;
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> Record {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_parse_scalar_fields() {
        let fields = parse_fields(&raw(json!({
            "name": { "type": "string", "required": true },
            "age": { "type": "int" },
        })))
        .unwrap();

        assert!(fields["name"].required);
        assert_eq!(fields["age"].kind, "int");
        assert!(!fields["age"].required);
    }

    #[test]
    fn test_missing_type_rejected() {
        let err = parse_fields(&raw(json!({ "name": { "required": true } }))).unwrap_err();
        assert!(err.to_string().contains("missing type"));
    }

    #[test]
    fn test_fields_require_object_kind() {
        let err = parse_fields(&raw(json!({
            "name": { "type": "string", "fields": { "x": { "type": "int" } } },
        })))
        .unwrap_err();
        assert!(err.to_string().contains("only allowed with type 'object'"));
    }

    #[test]
    fn test_item_requires_array_or_map_kind() {
        let err = parse_fields(&raw(json!({
            "name": { "type": "string", "item": { "type": "int" } },
        })))
        .unwrap_err();
        assert!(err.to_string().contains("'array' or 'map'"));

        parse_fields(&raw(json!({
            "tags": { "type": "array", "item": { "type": "string" } },
            "meta": { "type": "map", "item": { "type": "float64" } },
        })))
        .unwrap();
    }

    #[test]
    fn test_nested_object_checked_recursively() {
        let err = parse_fields(&raw(json!({
            "outer": {
                "type": "object",
                "fields": { "inner": { "type": "array", "fields": { "x": { "type": "int" } } } },
            },
        })))
        .unwrap_err();
        assert!(err.to_string().contains("only allowed with type 'object'"));
    }

    #[test]
    fn test_schema_reference_kind_parses() {
        // References resolve at validation time, not parse time.
        let fields = parse_fields(&raw(json!({
            "address": { "type": "Address" },
        })))
        .unwrap();
        assert_eq!(fields["address"].kind, "Address");
    }
}

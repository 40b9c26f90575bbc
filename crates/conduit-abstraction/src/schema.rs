//! Provider self-description: name, version and configuration schema.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Schema entry for one configuration field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    /// JSON type name (`"string"`, `"integer"`, `"number"`, ...).
    #[serde(rename = "type")]
    pub field_type: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Default value used when the field is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl FieldSchema {
    /// Creates a field schema without a default.
    pub fn new(field_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self { field_type: field_type.into(), description: description.into(), default: None }
    }

    /// Sets the default value.
    #[must_use]
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Configuration schema a provider publishes.
///
/// Serializes as `{"required": [...], "properties": {field: {type, description, default}}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSchema {
    /// Fields that must be present in a backend's configuration.
    #[serde(default)]
    pub required: Vec<String>,
    /// Every known field.
    #[serde(default)]
    pub properties: BTreeMap<String, FieldSchema>,
}

impl ConfigSchema {
    /// Creates an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a required field.
    #[must_use]
    pub fn required_field(mut self, name: impl Into<String>, field: FieldSchema) -> Self {
        let name = name.into();
        self.required.push(name.clone());
        self.properties.insert(name, field);
        self
    }

    /// Declares an optional field.
    #[must_use]
    pub fn optional_field(mut self, name: impl Into<String>, field: FieldSchema) -> Self {
        self.properties.insert(name.into(), field);
        self
    }

    /// Required fields absent from `configuration`.
    pub fn missing_fields<'a>(&'a self, configuration: &Map<String, Value>) -> Vec<&'a str> {
        self.required
            .iter()
            .filter(|field| !configuration.contains_key(field.as_str()))
            .map(String::as_str)
            .collect()
    }

    /// Required fields with no matching entry in `properties`.
    pub fn undeclared_required(&self) -> Vec<&str> {
        self.required
            .iter()
            .filter(|field| !self.properties.contains_key(field.as_str()))
            .map(String::as_str)
            .collect()
    }

    /// Returns the configured value for `field`, falling back to the schema default.
    pub fn value_or_default<'a>(
        &'a self,
        configuration: &'a Map<String, Value>,
        field: &str,
    ) -> Option<&'a Value> {
        configuration
            .get(field)
            .or_else(|| self.properties.get(field).and_then(|f| f.default.as_ref()))
    }
}

/// Static description of a provider implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    /// Display name (e.g. `"Generic HTTP Provider"`).
    pub name: String,
    /// One-line description.
    pub description: String,
    /// Semantic version of the implementation.
    pub version: String,
    /// Configuration schema.
    pub schema: ConfigSchema,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ConfigSchema {
        ConfigSchema::new()
            .required_field(
                "api_version",
                FieldSchema::new("string", "API version").with_default(json!("2024-01-01")),
            )
            .optional_field("model", FieldSchema::new("string", "Model to use"))
    }

    #[test]
    fn test_missing_fields() {
        let schema = schema();
        let empty = Map::new();
        assert_eq!(schema.missing_fields(&empty), vec!["api_version"]);

        let config = json!({"api_version": "2023-06-01"});
        assert!(schema.missing_fields(config.as_object().unwrap()).is_empty());
    }

    #[test]
    fn test_schema_serializes_in_wire_shape() {
        let value = serde_json::to_value(schema()).unwrap();
        assert_eq!(value["required"], json!(["api_version"]));
        assert_eq!(value["properties"]["api_version"]["type"], json!("string"));
        assert_eq!(value["properties"]["api_version"]["default"], json!("2024-01-01"));
        assert!(value["properties"]["model"].get("default").is_none());
    }

    #[test]
    fn test_value_or_default() {
        let schema = schema();
        let empty = Map::new();
        assert_eq!(schema.value_or_default(&empty, "api_version"), Some(&json!("2024-01-01")));
        assert_eq!(schema.value_or_default(&empty, "model"), None);
    }

    #[test]
    fn test_undeclared_required() {
        let mut schema = schema();
        schema.required.push("ghost".to_string());
        assert_eq!(schema.undeclared_required(), vec!["ghost"]);
    }
}

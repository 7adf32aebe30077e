//! Manifest types for plugin metadata
//!
//! A manifest is the declarative description of a plugin: identity, requested
//! permissions, entry point, the isolation variant it expects and an optional
//! schema for its settings. Manifests are immutable once published; a new
//! version of a plugin is a new manifest value.
//!
//! String fields deserialize with empty defaults so that an incomplete
//! manifest still parses and the validator can report exactly what is missing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Plugin settings: a flat key/value map
pub type PluginConfig = Map<String, Value>;

/// Main manifest structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub min_host_version: Option<String>,
    #[serde(default)]
    pub entry: String,
    #[serde(default)]
    pub isolation_variant: Option<IsolationVariant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_schema: Option<ConfigSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<Vec<String>>,
}

fn default_category() -> String {
    "general".to_string()
}

impl Manifest {
    /// Parse manifest from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize manifest to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Check whether the manifest declares a permission of the given kind
    pub fn requests(&self, kind: PermissionKind) -> bool {
        self.permissions.iter().any(|p| p.kind == kind)
    }

    /// Permissions of the given kind
    pub fn permissions_of(&self, kind: PermissionKind) -> impl Iterator<Item = &Permission> {
        self.permissions.iter().filter(move |p| p.kind == kind)
    }

    /// Hook names this plugin wants to receive
    pub fn hook_names(&self) -> &[String] {
        self.hooks.as_deref().unwrap_or(&[])
    }

    /// Default settings derived from the config schema
    pub fn default_config(&self) -> PluginConfig {
        self.config_schema
            .as_ref()
            .map(ConfigSchema::defaults)
            .unwrap_or_default()
    }
}

/// Permission kinds a plugin may request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionKind {
    Storage,
    Network,
    Filesystem,
    Ui,
    Api,
    System,
}

impl PermissionKind {
    /// All permission kinds, in declaration order
    pub const ALL: [PermissionKind; 6] = [
        PermissionKind::Storage,
        PermissionKind::Network,
        PermissionKind::Filesystem,
        PermissionKind::Ui,
        PermissionKind::Api,
        PermissionKind::System,
    ];

    /// Lowercase name as used in manifests
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionKind::Storage => "storage",
            PermissionKind::Network => "network",
            PermissionKind::Filesystem => "filesystem",
            PermissionKind::Ui => "ui",
            PermissionKind::Api => "api",
            PermissionKind::System => "system",
        }
    }

    /// Whether this kind is always treated as dangerous
    pub fn is_dangerous(&self) -> bool {
        matches!(self, PermissionKind::Filesystem | PermissionKind::System)
    }
}

impl std::fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declared, scoped capability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub kind: PermissionKind,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl Permission {
    /// Create a required permission
    pub fn new(kind: PermissionKind, scope: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind,
            scope: scope.into(),
            description: description.into(),
            required: true,
        }
    }

    /// Whether the scope allows everything
    pub fn is_wildcard(&self) -> bool {
        self.scope.trim() == "*"
    }
}

/// Isolation variants in strict escalation order
///
/// `Minimal` has no ambient I/O at all, `Compute` may reach storage and
/// network namespaces, `Dom` may additionally drive host UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationVariant {
    Minimal,
    Compute,
    Dom,
}

impl IsolationVariant {
    /// Human-readable isolation strength
    pub fn strength_label(&self) -> &'static str {
        match self {
            IsolationVariant::Minimal => "strict",
            IsolationVariant::Compute => "moderate",
            IsolationVariant::Dom => "relaxed",
        }
    }

    /// Lowercase name as used in manifests and config
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationVariant::Minimal => "minimal",
            IsolationVariant::Compute => "compute",
            IsolationVariant::Dom => "dom",
        }
    }
}

impl std::fmt::Display for IsolationVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value types allowed in a config schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl FieldType {
    fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Array => "array",
            FieldType::Object => "object",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
        }
    }
}

/// One setting in a config schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigField {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
    /// Minimum numeric value, or minimum length for strings and arrays
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Maximum numeric value, or maximum length for strings and arrays
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ConfigField {
    fn check(&self, key: &str, value: &Value) -> Result<(), String> {
        if !self.field_type.matches(value) {
            return Err(format!("'{}' must be of type {}", key, self.field_type.name()));
        }

        if let Some(allowed) = &self.allowed {
            if !allowed.contains(value) {
                return Err(format!("'{}' is not one of the allowed values", key));
            }
        }

        let measured = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => Some(s.chars().count() as f64),
            Value::Array(a) => Some(a.len() as f64),
            _ => None,
        };

        if let Some(measured) = measured {
            if let Some(min) = self.min {
                if measured < min {
                    return Err(format!("'{}' is below the minimum of {}", key, min));
                }
            }
            if let Some(max) = self.max {
                if measured > max {
                    return Err(format!("'{}' is above the maximum of {}", key, max));
                }
            }
        }

        Ok(())
    }
}

/// Schema for a plugin's settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigSchema {
    pub fields: BTreeMap<String, ConfigField>,
}

impl ConfigSchema {
    /// Settings populated with every declared default
    pub fn defaults(&self) -> PluginConfig {
        self.fields
            .iter()
            .filter_map(|(key, field)| field.default.clone().map(|v| (key.clone(), v)))
            .collect()
    }

    /// Validate settings, returning them with defaults applied
    ///
    /// Unknown keys, missing required keys, type mismatches, values outside
    /// the enum and values outside min/max are all reported; validation does
    /// not stop at the first problem.
    pub fn validate(&self, config: &PluginConfig) -> Result<PluginConfig, Vec<String>> {
        let mut errors = Vec::new();

        for key in config.keys() {
            if !self.fields.contains_key(key) {
                errors.push(format!("unknown setting '{}'", key));
            }
        }

        let mut resolved = PluginConfig::new();
        for (key, field) in &self.fields {
            match config.get(key) {
                Some(value) => match field.check(key, value) {
                    Ok(()) => {
                        resolved.insert(key.clone(), value.clone());
                    }
                    Err(e) => errors.push(e),
                },
                None => {
                    if let Some(default) = &field.default {
                        resolved.insert(key.clone(), default.clone());
                    } else if field.required {
                        errors.push(format!("missing required setting '{}'", key));
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(resolved)
        } else {
            Err(errors)
        }
    }

    /// Carry settings across a schema change
    ///
    /// Values that still validate are kept, everything else is dropped and
    /// replaced by the new default where one exists.
    pub fn migrate(&self, config: &PluginConfig) -> PluginConfig {
        let mut migrated = self.defaults();
        for (key, value) in config {
            if let Some(field) = self.fields.get(key) {
                if field.check(key, value).is_ok() {
                    migrated.insert(key.clone(), value.clone());
                }
            }
        }
        migrated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ConfigSchema {
        serde_json::from_value(json!({
            "units": { "type": "string", "enum": ["metric", "imperial"], "default": "metric" },
            "refresh": { "type": "integer", "min": 1, "max": 60, "required": true },
            "verbose": { "type": "boolean" }
        }))
        .unwrap()
    }

    #[test]
    fn test_manifest_parses_with_missing_fields() {
        let manifest = Manifest::from_json(r#"{"id": "demo"}"#).unwrap();
        assert_eq!(manifest.id, "demo");
        assert!(manifest.name.is_empty());
        assert_eq!(manifest.category, "general");
        assert!(manifest.permissions.is_empty());
        assert!(manifest.hook_names().is_empty());
    }

    #[test]
    fn test_manifest_camel_case_fields() {
        let manifest = Manifest::from_json(
            r#"{
                "id": "weather",
                "minHostVersion": "1.2.0",
                "isolationVariant": "compute",
                "permissions": [{"kind": "network", "scope": "api.weather.test", "description": "Fetch forecasts"}],
                "hooks": ["on_message"]
            }"#,
        )
        .unwrap();

        assert_eq!(manifest.min_host_version.as_deref(), Some("1.2.0"));
        assert_eq!(manifest.isolation_variant, Some(IsolationVariant::Compute));
        assert!(manifest.requests(PermissionKind::Network));
        assert!(manifest.permissions[0].required);
        assert_eq!(manifest.hook_names(), ["on_message".to_string()]);
    }

    #[test]
    fn test_variant_ordering() {
        assert!(IsolationVariant::Minimal < IsolationVariant::Compute);
        assert!(IsolationVariant::Compute < IsolationVariant::Dom);
    }

    #[test]
    fn test_schema_applies_defaults() {
        let mut config = PluginConfig::new();
        config.insert("refresh".into(), json!(5));
        let resolved = schema().validate(&config).unwrap();
        assert_eq!(resolved["units"], json!("metric"));
        assert_eq!(resolved["refresh"], json!(5));
        assert!(!resolved.contains_key("verbose"));
    }

    #[test]
    fn test_schema_reports_every_problem() {
        let mut config = PluginConfig::new();
        config.insert("units".into(), json!("kelvin"));
        config.insert("refresh".into(), json!(120));
        config.insert("extra".into(), json!(true));
        let errors = schema().validate(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_schema_missing_required() {
        let errors = schema().validate(&PluginConfig::new()).unwrap_err();
        assert_eq!(errors, vec!["missing required setting 'refresh'".to_string()]);
    }

    #[test]
    fn test_schema_migrate_drops_invalid_values() {
        let mut config = PluginConfig::new();
        config.insert("units".into(), json!("imperial"));
        config.insert("refresh".into(), json!("soon"));
        config.insert("removed".into(), json!(1));
        let migrated = schema().migrate(&config);
        assert_eq!(migrated["units"], json!("imperial"));
        assert!(!migrated.contains_key("refresh"));
        assert!(!migrated.contains_key("removed"));
    }
}

//! Shared plugin, security and wire types

use crate::manifest::Manifest;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Lifecycle status of an installed plugin
///
/// ```text
/// installed -> loading -> enabled <-> disabled
///                 \-> error        (any state -> error on fault)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Installed,
    Loading,
    Enabled,
    Disabled,
    Error,
}

impl PluginStatus {
    /// Whether the state machine allows moving from `self` to `to`
    pub fn can_transition_to(&self, to: PluginStatus) -> bool {
        use PluginStatus::*;
        match (self, to) {
            (_, Error) => true,
            (Installed, Loading) | (Disabled, Loading) | (Error, Loading) => true,
            (Loading, Enabled) => true,
            (Enabled, Disabled) => true,
            _ => false,
        }
    }

    /// Whether an isolation handle must exist in this state
    pub fn has_handle(&self) -> bool {
        matches!(self, PluginStatus::Loading | PluginStatus::Enabled)
    }

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginStatus::Installed => "installed",
            PluginStatus::Loading => "loading",
            PluginStatus::Enabled => "enabled",
            PluginStatus::Disabled => "disabled",
            PluginStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a finding or violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// A recorded runtime deviation from allowed behavior
///
/// Entries are immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityViolation {
    pub plugin_id: String,
    pub kind: String,
    pub severity: Severity,
    pub description: String,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Whether the offending action was blocked
    pub blocked: bool,
}

/// A single finding of the pre-install validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFinding {
    /// Stable machine-readable code (e.g. `system_permission`)
    pub code: String,
    pub severity: Severity,
    pub message: String,
}

/// Outcome of pre-install static and permission analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub plugin_id: String,
    pub valid: bool,
    /// Score in `[0, 100]`
    pub score: u8,
    pub issues: Vec<ValidationFinding>,
    pub warnings: Vec<ValidationFinding>,
    pub recommendations: Vec<String>,
}

impl ValidationReport {
    /// Whether any issue is critical
    pub fn has_critical(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Critical)
    }

    /// Find an issue by code
    pub fn issue(&self, code: &str) -> Option<&ValidationFinding> {
        self.issues.iter().find(|i| i.code == code)
    }

    /// Find a warning by code
    pub fn warning(&self, code: &str) -> Option<&ValidationFinding> {
        self.warnings.iter().find(|w| w.code == code)
    }

    /// Issue messages, for error reporting
    pub fn issue_messages(&self) -> Vec<String> {
        self.issues
            .iter()
            .map(|i| format!("[{}] {}", i.severity, i.message))
            .collect()
    }
}

/// A file shipped inside a plugin package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageFile {
    pub path: String,
    /// Size in bytes
    pub size: u64,
}

/// An installable plugin package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginPackage {
    pub manifest: Manifest,
    /// Source of the code unit named by `manifest.entry`
    pub code: String,
    #[serde(default)]
    pub files: Vec<PackageFile>,
    /// Dependency name to version
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub source_map: bool,
    /// Integrity hash of `code`, `blake3:<hex>` or `sha256:<hex>`
    #[serde(default)]
    pub checksum: Option<String>,
    /// Developer signature over `code`, `ed25519:<hex>`
    #[serde(default)]
    pub signature: Option<String>,
}

impl PluginPackage {
    /// Create a package from a manifest and a code unit
    pub fn new(manifest: Manifest, code: impl Into<String>) -> Self {
        Self {
            manifest,
            code: code.into(),
            files: Vec::new(),
            dependencies: BTreeMap::new(),
            source_map: false,
            checksum: None,
            signature: None,
        }
    }

    /// Parse a package from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Total size in bytes of the code unit and every listed file
    pub fn total_size(&self) -> u64 {
        self.code.len() as u64 + self.files.iter().map(|f| f.size).sum::<u64>()
    }
}

/// Request envelope sent across a message channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(default)]
    pub payload: Value,
}

/// Response envelope answering a request with the same `messageId`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseEnvelope {
    /// Build a response from a handler outcome
    pub fn from_outcome(message_id: String, outcome: Result<Value, String>) -> Self {
        match outcome {
            Ok(result) => Self {
                message_id,
                result: Some(result),
                error: None,
            },
            Err(error) => Self {
                message_id,
                result: None,
                error: Some(error),
            },
        }
    }

    /// Convert back into a handler outcome
    pub fn into_outcome(self) -> Result<Value, String> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Anything that travels over a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    Request(MessageEnvelope),
    Response(ResponseEnvelope),
}

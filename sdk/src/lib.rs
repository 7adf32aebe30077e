//! Enclave SDK
//!
//! Shared library providing the types and traits exchanged between the
//! Enclave host engine and plugin isolation contexts: manifests and
//! permissions, lifecycle statuses, validation reports, violations, message
//! envelopes and host namespace handles.

/// Error types and handling
pub mod errors;

/// Host API namespaces and handles
pub mod host_api;

/// Manifest, permission and config schema types
pub mod manifest;

/// Status, security and wire types
pub mod types;

// Re-export commonly used types
pub use errors::{EngineError, ErrorKind, HostErrorExt};
pub use host_api::{ApiCall, LogRecord, Namespace, NamespaceHandle, NamespaceImpl};
pub use manifest::{
    ConfigField, ConfigSchema, FieldType, IsolationVariant, Manifest, Permission, PermissionKind,
    PluginConfig,
};
pub use types::{
    Frame, MessageEnvelope, PackageFile, PluginPackage, PluginStatus, ResponseEnvelope,
    SecurityViolation, Severity, ValidationFinding, ValidationReport,
};

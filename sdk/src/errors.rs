//! Error types and handling
//!
//! This module provides the error types used throughout the Enclave host.
//! All errors implement the `HostErrorExt` trait which provides user-friendly
//! hints and indicates whether errors are recoverable.
//!
//! Every variant maps onto one [`ErrorKind`] of the host error taxonomy so the
//! host can present and log failures uniformly, whatever component raised them.
//!
//! # Security
//!
//! Error messages never carry plugin secrets or storage values. Plugin-supplied
//! text (code lines, URLs) is truncated before it is embedded in a message.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length of plugin-supplied text embedded in an error message
const MAX_EMBEDDED_TEXT: usize = 120;

/// Trait for host error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information. All engine errors implement this trait.
pub trait HostErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to display to end users and does not contain
    /// plugin data or internal implementation details.
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried or worked around. Non-recoverable
    /// errors require a new package, an unblock, or manual intervention.
    fn is_recoverable(&self) -> bool;
}

/// Error taxonomy shared by every component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Manifest, schema or code rejected at install/update time
    Validation,
    /// Capability not granted, or plugin blocked
    Permission,
    /// Behavioral or pattern issue detected at runtime
    SecurityViolation,
    /// No reply within a deadline
    Timeout,
    /// Plugin code hit an unsupported construct or failed inside a call
    Execution,
    /// Backing store failure
    Storage,
    /// Isolation context or channel failure
    Isolation,
    /// Unknown plugin or illegal state change
    Lifecycle,
    /// Host configuration problem
    Config,
    /// Local I/O failure
    Io,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Permission => "permission",
            ErrorKind::SecurityViolation => "security_violation",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Execution => "execution",
            ErrorKind::Storage => "storage",
            ErrorKind::Isolation => "isolation",
            ErrorKind::Lifecycle => "lifecycle",
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
        };
        f.write_str(name)
    }
}

/// Main engine error type
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, ErrorKind, HostErrorExt};
///
/// let error = EngineError::PermissionDenied {
///     plugin_id: "weather".to_string(),
///     capability: "http".to_string(),
/// };
/// assert_eq!(error.kind(), ErrorKind::Permission);
/// assert!(!error.user_hint().is_empty());
///
/// let blocked = EngineError::PluginBlocked("weather".to_string());
/// assert!(!blocked.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Validation errors
    #[error("Validation failed for '{plugin_id}' (score {score}): {}", .issues.join("; "))]
    ValidationRejected {
        plugin_id: String,
        score: u8,
        issues: Vec<String>,
    },

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Invalid configuration for '{plugin_id}': {}", .errors.join("; "))]
    InvalidConfig {
        plugin_id: String,
        errors: Vec<String>,
    },

    #[error("Plugin already installed: {0}")]
    AlreadyInstalled(String),

    // Permission errors
    #[error("Permission denied for '{plugin_id}': {capability} not granted")]
    PermissionDenied {
        plugin_id: String,
        capability: String,
    },

    #[error("Plugin is blocked: {0}")]
    PluginBlocked(String),

    // Runtime security errors
    #[error("Security violation by '{plugin_id}': {description}")]
    SecurityViolation {
        plugin_id: String,
        description: String,
    },

    // Timeouts
    #[error("Timed out after {millis} ms waiting for {operation}")]
    Timeout { operation: String, millis: u64 },

    // Execution errors
    #[error("Code rejected: {0}")]
    CodeRejected(String),

    #[error("Unsupported statement on line {line}: {text}")]
    UnsupportedStatement { line: usize, text: String },

    #[error("Execution error: {0}")]
    Execution(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // Isolation errors
    #[error("Isolation error: {0}")]
    Isolation(String),

    #[error("Message channel closed")]
    ChannelClosed,

    // Lifecycle errors
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Invalid transition for '{plugin_id}': {from} -> {to}")]
    InvalidTransition {
        plugin_id: String,
        from: String,
        to: String,
    },

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Taxonomy bucket for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::ValidationRejected { .. }
            | Self::InvalidManifest(_)
            | Self::InvalidConfig { .. }
            | Self::AlreadyInstalled(_) => ErrorKind::Validation,
            Self::PermissionDenied { .. } | Self::PluginBlocked(_) => ErrorKind::Permission,
            Self::SecurityViolation { .. } => ErrorKind::SecurityViolation,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::CodeRejected(_) | Self::UnsupportedStatement { .. } | Self::Execution(_) => {
                ErrorKind::Execution
            }
            Self::Storage(_) => ErrorKind::Storage,
            Self::Isolation(_) | Self::ChannelClosed => ErrorKind::Isolation,
            Self::PluginNotFound(_) | Self::InvalidTransition { .. } => ErrorKind::Lifecycle,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Build an `UnsupportedStatement` error, truncating the offending text
    pub fn unsupported_statement(line: usize, text: &str) -> Self {
        Self::UnsupportedStatement {
            line,
            text: truncate(text),
        }
    }

    /// Build a `Timeout` error
    pub fn timeout(operation: impl Into<String>, millis: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            millis,
        }
    }
}

/// Truncate plugin-supplied text before it is embedded in an error message
pub fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_EMBEDDED_TEXT {
        return text.to_string();
    }
    let mut short: String = text.chars().take(MAX_EMBEDDED_TEXT).collect();
    short.push_str("...");
    short
}

impl HostErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",

            Self::ValidationRejected { .. } => {
                "The plugin package failed security validation. Review the report"
            }
            Self::InvalidManifest(_) => "The plugin manifest is malformed",
            Self::InvalidConfig { .. } => "The plugin settings do not match its schema",
            Self::AlreadyInstalled(_) => "Plugin is already installed. Use --force to replace it",

            Self::PermissionDenied { .. } => "The plugin did not request this capability",
            Self::PluginBlocked(_) => "This plugin was blocked after a critical violation",

            Self::SecurityViolation { .. } => "The plugin misbehaved and the action was stopped",

            Self::Timeout { .. } => "The plugin took too long to respond. Try again",

            Self::CodeRejected(_) => "The plugin code contains prohibited constructs",
            Self::UnsupportedStatement { .. } => "The plugin code uses unsupported syntax",
            Self::Execution(_) => "Plugin execution failed. Check plugin logs",

            Self::Storage(_) => "Storage operation failed. Check the data directory",

            Self::Isolation(_) => "The plugin sandbox could not be started",
            Self::ChannelClosed => "The plugin sandbox is no longer running",

            Self::PluginNotFound(_) => "The requested plugin is not installed",
            Self::InvalidTransition { .. } => "The plugin cannot change to that state now",

            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Non-recoverable errors
            Self::ValidationRejected { .. }
            | Self::InvalidManifest(_)
            | Self::PluginBlocked(_)
            | Self::CodeRejected(_)
            | Self::UnsupportedStatement { .. } => false,

            // All other errors are potentially recoverable
            _ => true,
        }
    }
}

//! Enclave Engine Library
//!
//! Plugin sandboxing, permissions and lifecycle for the Enclave host.
//! It is used by both the main binary and integration tests.

/// Capability namespaces exposed to plugin code
pub mod api;

/// CLI interface module
pub mod cli;

/// Time sources
pub mod clock;

/// Configuration management module
pub mod config;

/// Database persistence module
pub mod db;

/// Command handlers module
pub mod handlers;

/// Isolation contexts and their backends
pub mod isolation;

/// Plugin lifecycle orchestration
pub mod manager;

/// Message bus for inter-component communication
pub mod message_bus;

/// Resource usage thresholds
pub mod monitor;

/// Persistent plugin registry
pub mod registry;

/// Restricted interpreter that runs inside a context
pub mod sandbox;

/// Pre-install validation, violations and trust
pub mod security;

/// Namespaced key/value persistence
pub mod storage;

/// Telemetry and Observability
pub mod telemetry;

/// Version of this host, compared against `minHostVersion`
pub const HOST_VERSION: &str = env!("CARGO_PKG_VERSION");

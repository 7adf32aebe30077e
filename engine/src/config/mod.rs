//! Configuration management
//!
//! This module handles loading, validation, and management of the Enclave host
//! configuration. Configuration is stored in TOML format at ~/.enclave/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, data directory
//! - **isolation**: Channel timeouts, destroy deadline, backend per isolation variant
//! - **sandbox**: Code size and execution bounds of the restricted interpreter
//! - **security**: Validation threshold, violation log cap, package audit rules
//! - **limits**: Per-plugin resource ceilings and sampling interval
//! - **http**: Host allow-list for the `http` namespace
//! - **registry**: Backup retention
//! - **plugins**: Restart behavior
//!
//! Every section except `core` is optional and falls back to its defaults.
//!
//! # Path Expansion
//!
//! `core.data_dir` may start with `~`, which expands to the user's home
//! directory. The data directory is created if it does not exist.
//!
//! # Examples
//!
//! ```no_run
//! use enclave_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//!
//! println!("Data directory: {:?}", config.core.data_dir);
//! println!("Send timeout: {} ms", config.isolation.send_timeout_ms);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use sdk::manifest::IsolationVariant;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core host settings
    pub core: CoreConfig,

    /// Isolation provider settings
    #[serde(default)]
    pub isolation: IsolationConfig,

    /// Secure execution engine bounds
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Validator and violation settings
    #[serde(default)]
    pub security: SecurityConfig,

    /// Per-plugin resource limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// `http` namespace settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Registry settings
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Plugin restart behavior
    #[serde(default)]
    pub plugins: PluginsConfig,
}

/// Core host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Isolation backend implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process interpreter task
    Interpreter,
    /// Child process running `enclave worker`
    Process,
}

/// Isolation provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationConfig {
    /// Deadline for a reply to any channel request
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Hard deadline for tearing down a context
    #[serde(default = "default_destroy_deadline_ms")]
    pub destroy_deadline_ms: u64,

    /// Time a context gets to acknowledge a shutdown request
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Backend used for the `minimal` variant
    #[serde(default = "default_backend")]
    pub minimal: Backend,

    /// Backend used for the `compute` variant
    #[serde(default = "default_backend")]
    pub compute: Backend,

    /// Backend used for the `dom` variant
    #[serde(default = "default_backend")]
    pub dom: Backend,

    /// Worker executable for the process backend (defaults to the running binary)
    #[serde(default)]
    pub worker_binary: Option<PathBuf>,
}

impl IsolationConfig {
    /// Backend configured for a variant
    pub fn backend_for(&self, variant: IsolationVariant) -> Backend {
        match variant {
            IsolationVariant::Minimal => self.minimal,
            IsolationVariant::Compute => self.compute,
            IsolationVariant::Dom => self.dom,
        }
    }
}

/// Secure execution engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Largest accepted code unit
    #[serde(default = "default_max_code_bytes")]
    pub max_code_bytes: usize,

    /// Wall-clock bound for one execution of a code unit
    #[serde(default = "default_max_execution_ms")]
    pub max_execution_ms: u64,

    /// Most statements accepted in one code unit
    #[serde(default = "default_max_statements")]
    pub max_statements: usize,

    /// Largest estimated size of the variable table
    #[serde(default = "default_max_variable_bytes")]
    pub max_variable_bytes: usize,
}

/// Security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Minimum score for a package to be valid (0-100)
    #[serde(default = "default_min_score")]
    pub min_score: u8,

    /// Violation log capacity; oldest entries are evicted
    #[serde(default = "default_violation_log_cap")]
    pub violation_log_cap: usize,

    /// Dependency count above which a warning is raised
    #[serde(default = "default_max_dependencies")]
    pub max_dependencies: usize,

    /// Total package size above which a warning is raised
    #[serde(default = "default_max_package_bytes")]
    pub max_package_bytes: u64,

    /// File extensions that make a package invalid
    #[serde(default = "default_disallowed_extensions")]
    pub disallowed_extensions: Vec<String>,

    /// Known-vulnerable dependencies: name to semver requirement
    #[serde(default)]
    pub vulnerable_dependencies: BTreeMap<String, String>,

    /// Developers trusted from startup: author to `ed25519:<hex>` public key
    /// (empty string when no key is known)
    #[serde(default)]
    pub trusted_developers: BTreeMap<String, String>,
}

/// Resource limits configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Memory estimate reported by a context
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: u64,

    /// Network calls since enable
    #[serde(default = "default_max_network_calls")]
    pub max_network_calls: u64,

    /// Bytes held in the plugin storage namespace
    #[serde(default = "default_max_storage_bytes")]
    pub max_storage_bytes: u64,

    /// Sampling interval of the resource monitor
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
}

/// `http` namespace configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Hosts plugins may reach at all; a plugin additionally needs a
    /// matching `network` permission scope
    #[serde(default)]
    pub allowed_hosts: Vec<String>,

    /// Request timeout in seconds
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Config backups kept per plugin
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
}

/// Plugin restart behavior
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Re-enable plugins that were enabled when the host last stopped
    #[serde(default)]
    pub restore_enabled: bool,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.enclave")
}

fn default_send_timeout_ms() -> u64 {
    5000
}

fn default_destroy_deadline_ms() -> u64 {
    2000
}

fn default_shutdown_grace_ms() -> u64 {
    250
}

fn default_backend() -> Backend {
    Backend::Interpreter
}

fn default_max_code_bytes() -> usize {
    256 * 1024
}

fn default_max_execution_ms() -> u64 {
    5000
}

fn default_max_statements() -> usize {
    10_000
}

fn default_max_variable_bytes() -> usize {
    1024 * 1024
}

fn default_min_score() -> u8 {
    60
}

fn default_violation_log_cap() -> usize {
    1000
}

fn default_max_dependencies() -> usize {
    20
}

fn default_max_package_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_disallowed_extensions() -> Vec<String> {
    [".exe", ".dll", ".so", ".dylib", ".bat", ".cmd", ".sh", ".ps1", ".scr", ".msi"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_max_memory_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_max_network_calls() -> u64 {
    1000
}

fn default_max_storage_bytes() -> u64 {
    5 * 1024 * 1024
}

fn default_sample_interval_ms() -> u64 {
    1000
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_max_backups() -> usize {
    10
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: default_send_timeout_ms(),
            destroy_deadline_ms: default_destroy_deadline_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            minimal: default_backend(),
            compute: default_backend(),
            dom: default_backend(),
            worker_binary: None,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_code_bytes: default_max_code_bytes(),
            max_execution_ms: default_max_execution_ms(),
            max_statements: default_max_statements(),
            max_variable_bytes: default_max_variable_bytes(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            min_score: default_min_score(),
            violation_log_cap: default_violation_log_cap(),
            max_dependencies: default_max_dependencies(),
            max_package_bytes: default_max_package_bytes(),
            disallowed_extensions: default_disallowed_extensions(),
            vulnerable_dependencies: BTreeMap::new(),
            trusted_developers: BTreeMap::new(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: default_max_memory_bytes(),
            max_network_calls: default_max_network_calls(),
            max_storage_bytes: default_max_storage_bytes(),
            sample_interval_ms: default_sample_interval_ms(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: Vec::new(),
            timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_backups: default_max_backups(),
        }
    }
}

impl Default for Config {
    /// Defaults with the data directory left unexpanded
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            isolation: IsolationConfig::default(),
            sandbox: SandboxConfig::default(),
            security: SecurityConfig::default(),
            limits: LimitsConfig::default(),
            http: HttpConfig::default(),
            registry: RegistryConfig::default(),
            plugins: PluginsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.enclave/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self, EngineError> {
        let mut config: Config = toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Write configuration to a path as TOML
    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))
    }

    fn create_default(path: &Path) -> Result<Self, EngineError> {
        let template = Self::default();
        template.save(path)?;

        let mut config = template;
        config.validate_and_process()?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.enclave/config.toml)
    pub fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".enclave").join("config.toml"))
    }

    /// Path of the SQLite database inside the data directory
    pub fn database_path(&self) -> PathBuf {
        self.core.data_dir.join("enclave.db")
    }

    /// Validate thresholds and expand the data directory
    pub fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if self.isolation.send_timeout_ms == 0 {
            return Err(EngineError::Config(
                "isolation.send_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.isolation.destroy_deadline_ms == 0 {
            return Err(EngineError::Config(
                "isolation.destroy_deadline_ms must be greater than 0".to_string(),
            ));
        }
        if self.isolation.shutdown_grace_ms >= self.isolation.destroy_deadline_ms {
            return Err(EngineError::Config(
                "isolation.shutdown_grace_ms must be below destroy_deadline_ms".to_string(),
            ));
        }

        if self.security.min_score > 100 {
            return Err(EngineError::Config(
                "security.min_score must be between 0 and 100".to_string(),
            ));
        }
        if self.security.violation_log_cap == 0 {
            return Err(EngineError::Config(
                "security.violation_log_cap must be greater than 0".to_string(),
            ));
        }
        for (name, requirement) in &self.security.vulnerable_dependencies {
            semver::VersionReq::parse(requirement).map_err(|e| {
                EngineError::Config(format!(
                    "Invalid version requirement for vulnerable dependency '{}': {}",
                    name, e
                ))
            })?;
        }

        if self.sandbox.max_code_bytes == 0 || self.sandbox.max_execution_ms == 0 {
            return Err(EngineError::Config(
                "sandbox bounds must be greater than 0".to_string(),
            ));
        }

        if self.limits.sample_interval_ms == 0 {
            return Err(EngineError::Config(
                "limits.sample_interval_ms must be greater than 0".to_string(),
            ));
        }

        self.core.data_dir = expand_path(&self.core.data_dir)?;

        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                EngineError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
pub(crate) fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = Config::default();

        assert_eq!(config.core.log_level, "info");
        assert_eq!(config.isolation.send_timeout_ms, 5000);
        assert_eq!(config.isolation.destroy_deadline_ms, 2000);
        assert_eq!(config.security.min_score, 60);
        assert_eq!(config.security.violation_log_cap, 1000);
        assert_eq!(config.limits.sample_interval_ms, 1000);
        assert!(!config.plugins.restore_enabled);
    }

    #[test]
    fn test_minimal_toml_fills_sections() {
        let dir = tempfile::tempdir().unwrap();
        let toml = format!(
            "[core]\ndata_dir = {:?}\n\n[isolation]\ncompute = \"process\"\n",
            dir.path().join("data")
        );

        let config = Config::from_toml(&toml).unwrap();
        assert_eq!(config.isolation.backend_for(IsolationVariant::Compute), Backend::Process);
        assert_eq!(config.isolation.backend_for(IsolationVariant::Dom), Backend::Interpreter);
        assert_eq!(config.registry.max_backups, 10);
        assert!(config.core.data_dir.is_dir());
    }

    #[test]
    fn test_rejects_bad_log_level() {
        let toml = "[core]\nlog_level = \"loud\"\n";
        assert!(matches!(Config::from_toml(toml), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_rejects_bad_vulnerable_requirement() {
        let dir = tempfile::tempdir().unwrap();
        let toml = format!(
            "[core]\ndata_dir = {:?}\n\n[security.vulnerable_dependencies]\nleftpad = \"not a req\"\n",
            dir.path()
        );
        assert!(Config::from_toml(&toml).is_err());
    }

    #[test]
    fn test_expand_path_with_tilde() {
        let path = PathBuf::from("~/test");
        let expanded = expand_path(&path).unwrap();

        let home = dirs::home_dir().unwrap();
        assert_eq!(expanded, home.join("test"));
    }

    #[test]
    fn test_expand_path_without_tilde() {
        let path = PathBuf::from("/absolute/path");
        assert_eq!(expand_path(&path).unwrap(), path);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.core.data_dir = dir.path().join("data");
        config.http.allowed_hosts = vec!["api.example.com".to_string()];
        config.save(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.http.allowed_hosts, vec!["api.example.com".to_string()]);
    }
}

//! Permission & Security Validator
//!
//! This module owns every security decision the host makes about a plugin:
//!
//! - **Pre-install validation**: [`SecurityValidator::validate`] scores a
//!   package from 100 down, auditing the manifest, permissions, code,
//!   integrity metadata, dependencies, developer reputation and contents.
//! - **Runtime violations**: an append-only, capped log of
//!   [`SecurityViolation`]s, persisted under `security/violations`.
//! - **Block list**: plugin ids that may never again move past `installed`,
//!   persisted under `security/blocked`. A critical violation blocks its
//!   plugin automatically.
//! - **Trusted developers**: authors whose packages earn a reputation bonus
//!   and whose signatures can be verified, persisted under `security/trusted`.
//!
//! # Example
//!
//! ```no_run
//! use enclave_engine::security::SecurityValidator;
//! use sdk::types::Severity;
//!
//! # async fn example(validator: &SecurityValidator) -> Result<(), sdk::errors::EngineError> {
//! validator
//!     .record_violation("weather", "unauthorized_api_access", Severity::Critical, "called http", true)
//!     .await?;
//! assert!(validator.is_blocked("weather").await);
//! # Ok(())
//! # }
//! ```

pub mod integrity;
pub mod patterns;
mod validator;

use crate::clock::Clock;
use crate::config::{SandboxConfig, SecurityConfig};
use crate::message_bus::{Event, MessageBus};
use crate::storage::KvStore;
use patterns::CodePatterns;
use sdk::errors::EngineError;
use sdk::types::{SecurityViolation, Severity};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

const VIOLATIONS_KEY: &str = "security/violations";
const BLOCKED_KEY: &str = "security/blocked";
const TRUSTED_KEY: &str = "security/trusted";

/// A developer whose packages are trusted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedDeveloper {
    pub name: String,
    /// `ed25519:<hex>` key used to verify package signatures
    #[serde(default)]
    pub public_key: Option<String>,
    pub added_at: i64,
}

#[derive(Default)]
struct SecurityState {
    violations: VecDeque<SecurityViolation>,
    blocked: BTreeSet<String>,
    trusted: BTreeMap<String, TrustedDeveloper>,
}

/// Package validator, violation log, block list and trust store
pub struct SecurityValidator {
    config: SecurityConfig,
    max_code_bytes: usize,
    patterns: Arc<CodePatterns>,
    store: Arc<dyn KvStore>,
    bus: Arc<MessageBus>,
    clock: Arc<dyn Clock>,
    state: RwLock<SecurityState>,
}

impl SecurityValidator {
    pub fn new(
        config: SecurityConfig,
        sandbox: &SandboxConfig,
        patterns: Arc<CodePatterns>,
        store: Arc<dyn KvStore>,
        bus: Arc<MessageBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            max_code_bytes: sandbox.max_code_bytes,
            patterns,
            store,
            bus,
            clock,
            state: RwLock::new(SecurityState::default()),
        }
    }

    /// Load persisted violations, block list and trusted developers
    ///
    /// Developers listed in `security.trusted_developers` are merged in
    /// without overwriting persisted entries.
    pub async fn load(&self) -> Result<(), EngineError> {
        let violations: Vec<SecurityViolation> = self.read_json(VIOLATIONS_KEY).await?.unwrap_or_default();
        let blocked: BTreeSet<String> = self.read_json(BLOCKED_KEY).await?.unwrap_or_default();
        let mut trusted: BTreeMap<String, TrustedDeveloper> =
            self.read_json(TRUSTED_KEY).await?.unwrap_or_default();

        let now = self.clock.now_millis();
        for (name, key) in &self.config.trusted_developers {
            trusted.entry(name.clone()).or_insert_with(|| TrustedDeveloper {
                name: name.clone(),
                public_key: (!key.is_empty()).then(|| key.clone()),
                added_at: now,
            });
        }

        let mut state = self.state.write().await;
        state.violations = violations.into_iter().collect();
        while state.violations.len() > self.config.violation_log_cap {
            state.violations.pop_front();
        }
        state.blocked = blocked;
        state.trusted = trusted;

        info!(
            "Security state loaded: {} violation(s), {} blocked, {} trusted",
            state.violations.len(),
            state.blocked.len(),
            state.trusted.len()
        );
        Ok(())
    }

    /// Shared denylist
    pub fn patterns(&self) -> Arc<CodePatterns> {
        Arc::clone(&self.patterns)
    }

    /// Append a violation to the log
    ///
    /// A critical violation also blocks the plugin id. The log keeps the
    /// newest `violation_log_cap` entries.
    pub async fn record_violation(
        &self,
        plugin_id: &str,
        kind: &str,
        severity: Severity,
        description: &str,
        blocked: bool,
    ) -> Result<SecurityViolation, EngineError> {
        let violation = SecurityViolation {
            plugin_id: plugin_id.to_string(),
            kind: kind.to_string(),
            severity,
            description: description.to_string(),
            timestamp: self.clock.now_millis(),
            blocked,
        };

        {
            let mut state = self.state.write().await;
            state.violations.push_back(violation.clone());
            while state.violations.len() > self.config.violation_log_cap {
                state.violations.pop_front();
            }
            let snapshot: Vec<&SecurityViolation> = state.violations.iter().collect();
            self.write_json(VIOLATIONS_KEY, &snapshot).await?;
        }

        warn!(
            "Security violation by {} [{}] {}: {}",
            plugin_id, severity, kind, description
        );
        self.bus.publish(Event::ViolationRecorded(violation.clone())).await;

        if severity == Severity::Critical {
            self.block(plugin_id, &format!("critical violation: {}", kind)).await?;
        }

        Ok(violation)
    }

    /// Violations, oldest first, optionally for one plugin
    pub async fn violations(&self, plugin_id: Option<&str>) -> Vec<SecurityViolation> {
        let state = self.state.read().await;
        state
            .violations
            .iter()
            .filter(|v| plugin_id.map_or(true, |id| v.plugin_id == id))
            .cloned()
            .collect()
    }

    /// Add a plugin id to the block list
    pub async fn block(&self, plugin_id: &str, reason: &str) -> Result<(), EngineError> {
        let newly_blocked = {
            let mut state = self.state.write().await;
            let inserted = state.blocked.insert(plugin_id.to_string());
            if inserted {
                self.write_json(BLOCKED_KEY, &state.blocked).await?;
            }
            inserted
        };

        if newly_blocked {
            warn!("Plugin {} blocked: {}", plugin_id, reason);
            self.bus
                .publish(Event::PluginBlocked {
                    plugin_id: plugin_id.to_string(),
                    reason: reason.to_string(),
                })
                .await;
        }
        Ok(())
    }

    /// Remove a plugin id from the block list, returning whether it was blocked
    pub async fn unblock(&self, plugin_id: &str) -> Result<bool, EngineError> {
        let mut state = self.state.write().await;
        let removed = state.blocked.remove(plugin_id);
        if removed {
            self.write_json(BLOCKED_KEY, &state.blocked).await?;
            info!("Plugin {} unblocked", plugin_id);
        }
        Ok(removed)
    }

    pub async fn is_blocked(&self, plugin_id: &str) -> bool {
        self.state.read().await.blocked.contains(plugin_id)
    }

    pub async fn blocked_plugins(&self) -> Vec<String> {
        self.state.read().await.blocked.iter().cloned().collect()
    }

    /// Trust a developer, optionally with a signing key
    pub async fn add_trusted_developer(
        &self,
        name: &str,
        public_key: Option<String>,
    ) -> Result<TrustedDeveloper, EngineError> {
        if let Some(key) = &public_key {
            integrity::parse_public_key(key)
                .map_err(|e| EngineError::Config(format!("Invalid developer key: {}", e)))?;
        }

        let developer = TrustedDeveloper {
            name: name.to_string(),
            public_key,
            added_at: self.clock.now_millis(),
        };

        let mut state = self.state.write().await;
        state.trusted.insert(name.to_string(), developer.clone());
        self.write_json(TRUSTED_KEY, &state.trusted).await?;
        info!("Developer {} trusted", name);
        Ok(developer)
    }

    /// Stop trusting a developer, returning whether they were trusted
    pub async fn remove_trusted_developer(&self, name: &str) -> Result<bool, EngineError> {
        let mut state = self.state.write().await;
        let removed = state.trusted.remove(name).is_some();
        if removed {
            self.write_json(TRUSTED_KEY, &state.trusted).await?;
        }
        Ok(removed)
    }

    pub async fn trusted_developers(&self) -> Vec<TrustedDeveloper> {
        self.state.read().await.trusted.values().cloned().collect()
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>, EngineError> {
        match self.store.get(key).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| EngineError::Storage(format!("Corrupt entry '{}': {}", key, e))),
            None => Ok(None),
        }
    }

    async fn write_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), EngineError> {
        let value = serde_json::to_value(value).map_err(|e| EngineError::Storage(e.to_string()))?;
        self.store.set(key, value).await
    }
}

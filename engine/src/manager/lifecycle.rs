//! Lifecycle transitions
//!
//! Every `*_locked` method expects the caller to hold the per-id lock.

use super::{ContextExit, PluginManager, UpdateOptions};
use crate::isolation::IsolationHandle;
use crate::message_bus::Event;
use crate::registry::{ImportSummary, PluginRecord, RegistrySnapshot};
use sdk::errors::EngineError;
use sdk::manifest::{Manifest, PermissionKind, PluginConfig};
use sdk::types::{PluginPackage, PluginStatus};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Permission kinds a plugin is granted: everything it declares except `system`
///
/// # Errors
///
/// Returns `PermissionDenied` if the manifest marks `system` as required.
pub fn granted_permissions(manifest: &Manifest) -> Result<Vec<PermissionKind>, EngineError> {
    let mut granted = Vec::new();
    for permission in &manifest.permissions {
        if permission.kind == PermissionKind::System {
            if permission.required {
                return Err(EngineError::PermissionDenied {
                    plugin_id: manifest.id.clone(),
                    capability: PermissionKind::System.as_str().to_string(),
                });
            }
            continue;
        }
        if !granted.contains(&permission.kind) {
            granted.push(permission.kind);
        }
    }
    Ok(granted)
}

/// Settings checked against the manifest schema
fn checked_config(record: &PluginRecord, config: &PluginConfig) -> Result<PluginConfig, EngineError> {
    match &record.manifest.config_schema {
        Some(schema) => schema.validate(config).map_err(|errors| EngineError::InvalidConfig {
            plugin_id: record.id.clone(),
            errors,
        }),
        None if config.is_empty() => Ok(PluginConfig::new()),
        None => Err(EngineError::InvalidConfig {
            plugin_id: record.id.clone(),
            errors: config
                .keys()
                .map(|key| format!("Unknown setting '{}'", key))
                .collect(),
        }),
    }
}

fn ensure_newer(plugin_id: &str, installed: &str, candidate: &str) -> Result<(), EngineError> {
    let parse = |version: &str| {
        semver::Version::parse(version).map_err(|e| {
            EngineError::InvalidManifest(format!("Invalid version '{}': {}", version, e))
        })
    };
    if parse(candidate)? <= parse(installed)? {
        return Err(EngineError::InvalidManifest(format!(
            "Version {} of '{}' is not newer than installed {}",
            candidate, plugin_id, installed
        )));
    }
    Ok(())
}

impl PluginManager {
    pub(super) async fn install_locked(
        &self,
        package: PluginPackage,
        options: super::InstallOptions,
    ) -> Result<PluginRecord, EngineError> {
        let plugin_id = package.manifest.id.clone();
        if self.security.is_blocked(&plugin_id).await {
            return Err(EngineError::PluginBlocked(plugin_id));
        }

        if options.skip_validation {
            if !self.security.patterns().is_valid_id(&plugin_id) {
                return Err(EngineError::InvalidManifest(format!(
                    "Invalid plugin id '{}'",
                    plugin_id
                )));
            }
        } else {
            let report = self.security.validate(&package).await;
            if !report.valid {
                return Err(EngineError::ValidationRejected {
                    plugin_id,
                    score: report.score,
                    issues: report.issue_messages(),
                });
            }
        }

        if self.registry.contains(&plugin_id).await {
            if !options.force {
                return Err(EngineError::AlreadyInstalled(plugin_id));
            }
            info!("Replacing installed plugin {}", plugin_id);
            self.disable_locked(&plugin_id).await?;
            self.hooks.unregister(&plugin_id).await;
            self.teardown_handle(&plugin_id).await;
            self.registry.remove(&plugin_id).await?;
        }

        let PluginPackage { manifest, code, .. } = package;
        let version = manifest.version.clone();
        let record = PluginRecord::new(manifest, code, PluginStatus::Installed, self.clock.now_millis());
        self.registry.insert(record).await?;

        info!("Installed {} v{}", plugin_id, version);
        self.bus
            .publish(Event::PluginInstalled {
                plugin_id: plugin_id.clone(),
                version,
            })
            .await;

        if options.enable_immediately {
            self.enable_locked(&plugin_id).await?;
        }
        self.record(&plugin_id).await
    }

    pub(super) async fn uninstall_locked(&self, plugin_id: &str) -> Result<(), EngineError> {
        let record = self.record(plugin_id).await?;
        if record.status == PluginStatus::Enabled {
            self.disable_locked(plugin_id).await?;
        }
        self.hooks.unregister(plugin_id).await;
        self.teardown_handle(plugin_id).await;

        self.registry.remove(plugin_id).await?;
        let removed = self.host_api.storage().clear(plugin_id).await?;
        self.host_api.release(plugin_id).await;
        self.monitor.forget(plugin_id).await;

        info!("Uninstalled {} ({} stored key(s) removed)", plugin_id, removed);
        self.bus
            .publish(Event::PluginUninstalled {
                plugin_id: plugin_id.to_string(),
            })
            .await;
        Ok(())
    }

    pub(super) async fn enable_locked(&self, plugin_id: &str) -> Result<(), EngineError> {
        let record = self.record(plugin_id).await?;
        if record.status == PluginStatus::Enabled {
            debug!("{} is already enabled", plugin_id);
            return Ok(());
        }
        if self.security.is_blocked(plugin_id).await {
            return Err(EngineError::PluginBlocked(plugin_id.to_string()));
        }

        self.transition(plugin_id, PluginStatus::Loading).await?;

        let handle = match self.start_context(&record).await {
            Ok(handle) => handle,
            Err(e) => {
                self.mark_failed(plugin_id).await;
                return Err(e);
            }
        };
        let info = handle.info();
        self.watch_context(&handle);
        self.handles
            .write()
            .await
            .insert(plugin_id.to_string(), handle);

        if let Err(e) = self.transition(plugin_id, PluginStatus::Enabled).await {
            self.teardown_handle(plugin_id).await;
            self.mark_failed(plugin_id).await;
            return Err(e);
        }

        self.hooks
            .register(plugin_id, record.manifest.hook_names())
            .await;
        let now = self.clock.now_millis();
        self.registry
            .modify(plugin_id, |r| r.last_active = Some(now))
            .await?;

        info!(
            "Enabled {} in {} context {} ({})",
            plugin_id,
            info.variant.as_str(),
            info.context_id,
            info.strength
        );
        Ok(())
    }

    /// Create a context and load the plugin's code into it
    async fn start_context(&self, record: &PluginRecord) -> Result<Arc<IsolationHandle>, EngineError> {
        let granted = granted_permissions(&record.manifest)?;
        self.interpreter.compile(&record.code)?;
        self.host_api.release(&record.id).await;

        let bridge = self.host_api.bridge(&record.manifest, &granted);
        let handle = Arc::new(
            self.isolation
                .create(&record.manifest, &granted, bridge)
                .await?,
        );

        let load = json!({ "code": record.code, "config": record.config });
        if let Err(e) = self.isolation.send(&handle, "load", load).await {
            self.destroy_handle(&handle).await;
            return Err(e);
        }
        Ok(handle)
    }

    pub(super) async fn disable_locked(&self, plugin_id: &str) -> Result<(), EngineError> {
        let record = self.record(plugin_id).await?;
        if record.status != PluginStatus::Enabled {
            debug!("{} is {}; nothing to disable", plugin_id, record.status);
            return Ok(());
        }

        self.hooks.unregister(plugin_id).await;
        self.teardown_handle(plugin_id).await;
        self.host_api.release(plugin_id).await;
        self.monitor.forget(plugin_id).await;

        self.transition(plugin_id, PluginStatus::Disabled).await?;
        info!("Disabled {}", plugin_id);
        Ok(())
    }

    /// Expects the caller to hold the lock of every id in the snapshot
    pub(super) async fn import_locked(
        &self,
        mut snapshot: RegistrySnapshot,
        overwrite: bool,
    ) -> Result<ImportSummary, EngineError> {
        snapshot.ensure_supported()?;

        let mut blocked = Vec::new();
        let mut accepted = Vec::with_capacity(snapshot.plugins.len());
        for record in snapshot.plugins {
            if self.security.is_blocked(&record.id).await {
                warn!("Skipping blocked plugin {} in snapshot", record.id);
                blocked.push(record.id);
            } else {
                accepted.push(record);
            }
        }
        snapshot.plugins = accepted;

        if overwrite {
            for record in &snapshot.plugins {
                if self.registry.contains(&record.id).await {
                    self.disable_locked(&record.id).await?;
                }
            }
        }

        let mut summary = self.registry.import(snapshot, overwrite).await?;
        summary.skipped.extend(blocked);
        Ok(summary)
    }

    pub(super) async fn update_locked(
        &self,
        plugin_id: &str,
        package: PluginPackage,
        options: UpdateOptions,
    ) -> Result<PluginRecord, EngineError> {
        let current = self.record(plugin_id).await?;
        if package.manifest.id != plugin_id {
            return Err(EngineError::InvalidManifest(format!(
                "Package id '{}' does not match '{}'",
                package.manifest.id, plugin_id
            )));
        }
        if self.security.is_blocked(plugin_id).await {
            return Err(EngineError::PluginBlocked(plugin_id.to_string()));
        }
        if !options.skip_validation {
            let report = self.security.validate(&package).await;
            if !report.valid {
                return Err(EngineError::ValidationRejected {
                    plugin_id: plugin_id.to_string(),
                    score: report.score,
                    issues: report.issue_messages(),
                });
            }
        }
        if !options.force {
            ensure_newer(plugin_id, &current.manifest.version, &package.manifest.version)?;
        }

        self.registry.backup_config(plugin_id).await?;

        let was_enabled = current.status == PluginStatus::Enabled;
        if was_enabled {
            self.disable_locked(plugin_id).await?;
        } else {
            self.teardown_handle(plugin_id).await;
        }

        let PluginPackage { manifest, code, .. } = package;
        let config = match &manifest.config_schema {
            Some(schema) => schema.migrate(&current.config),
            None => PluginConfig::new(),
        };
        let from_version = current.manifest.version.clone();
        let to_version = manifest.version.clone();

        self.registry
            .modify(plugin_id, |r| {
                r.manifest = manifest;
                r.code = code;
                r.config = config;
            })
            .await?;

        info!("Updated {} from {} to {}", plugin_id, from_version, to_version);
        self.bus
            .publish(Event::PluginUpdated {
                plugin_id: plugin_id.to_string(),
                from_version,
                to_version,
            })
            .await;

        if was_enabled {
            self.enable_locked(plugin_id).await?;
        }
        self.record(plugin_id).await
    }

    pub(super) async fn update_config_locked(
        &self,
        plugin_id: &str,
        config: PluginConfig,
    ) -> Result<PluginRecord, EngineError> {
        let record = self.record(plugin_id).await?;
        let config = checked_config(&record, &config)?;
        self.apply_config(record, config).await
    }

    pub(super) async fn restore_config_locked(
        &self,
        plugin_id: &str,
        timestamp: i64,
    ) -> Result<PluginRecord, EngineError> {
        let record = self.record(plugin_id).await?;
        let backup = self.registry.backup(plugin_id, timestamp).await?;
        let candidate = match &record.manifest.config_schema {
            Some(schema) => schema.migrate(&backup.config),
            None => PluginConfig::new(),
        };
        let config = checked_config(&record, &candidate)?;
        info!("Restoring config of {} from backup {}", plugin_id, timestamp);
        self.apply_config(record, config).await
    }

    /// Back up the current settings, store `config` and forward it if running
    async fn apply_config(&self, record: PluginRecord, config: PluginConfig) -> Result<PluginRecord, EngineError> {
        let plugin_id = record.id.as_str();
        self.registry.backup_config(plugin_id).await?;
        let updated = self.registry.set_config(plugin_id, config.clone()).await?;

        if record.status == PluginStatus::Enabled {
            if let Some(handle) = self.handle(plugin_id).await {
                self.isolation
                    .send(&handle, "config", json!({ "config": config }))
                    .await?;
            }
        }

        self.bus
            .publish(Event::ConfigUpdated {
                plugin_id: plugin_id.to_string(),
            })
            .await;
        Ok(updated)
    }

    /// Checked status change, published on the bus
    async fn transition(&self, plugin_id: &str, to: PluginStatus) -> Result<PluginRecord, EngineError> {
        let current = self.record(plugin_id).await?;
        let from = current.status;
        if from == to {
            return Ok(current);
        }
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                plugin_id: plugin_id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.write_status(plugin_id, from, to).await
    }

    /// Status change without the state machine check, for restart recovery
    pub(super) async fn write_status(
        &self,
        plugin_id: &str,
        from: PluginStatus,
        to: PluginStatus,
    ) -> Result<PluginRecord, EngineError> {
        let record = self.registry.set_status(plugin_id, to).await?;
        debug!("{}: {} -> {}", plugin_id, from, to);
        self.bus
            .publish(Event::StatusChanged {
                plugin_id: plugin_id.to_string(),
                from,
                to,
            })
            .await;
        Ok(record)
    }

    async fn mark_failed(&self, plugin_id: &str) {
        if let Err(e) = self.transition(plugin_id, PluginStatus::Error).await {
            warn!("Could not mark {} as failed: {}", plugin_id, e);
        }
    }

    /// Report the context's channel closing to the exit watcher
    ///
    /// Planned teardowns are reported too; [`PluginManager::context_lost`]
    /// ignores contexts that are no longer in the handle table.
    fn watch_context(&self, handle: &IsolationHandle) {
        let closed = handle.channel().closed();
        let exits = self.exits.clone();
        let exit = ContextExit {
            plugin_id: handle.plugin_id().to_string(),
            context_id: handle.context_id().to_string(),
        };
        tokio::spawn(async move {
            closed.await;
            // the receiver is gone once the manager stops
            let _ = exits.send(exit);
        });
    }

    /// Fail a plugin whose context went away without a teardown
    pub(super) async fn context_lost(&self, plugin_id: &str, context_id: &str) {
        let _guard = self.lock_plugin(plugin_id).await;
        let handle = {
            let mut handles = self.handles.write().await;
            let current = handles
                .get(plugin_id)
                .is_some_and(|h| h.context_id() == context_id);
            if !current {
                return;
            }
            handles.remove(plugin_id)
        };
        let Some(handle) = handle else { return };

        warn!("Context {} of {} exited unexpectedly", context_id, plugin_id);
        self.hooks.unregister(plugin_id).await;
        self.destroy_handle(&handle).await;
        self.host_api.release(plugin_id).await;
        self.monitor.forget(plugin_id).await;
        self.mark_failed(plugin_id).await;

        let error = EngineError::Isolation(format!("Context {} exited unexpectedly", context_id));
        self.report_error(Some(plugin_id), "context", &error).await;
    }

    /// Remove and destroy the live context of a plugin, if any
    pub(super) async fn teardown_handle(&self, plugin_id: &str) {
        let handle = self.handles.write().await.remove(plugin_id);
        if let Some(handle) = handle {
            self.destroy_handle(&handle).await;
        }
    }

    /// Destroy a context; failures are reported, the handle is gone either way
    pub(super) async fn destroy_handle(&self, handle: &IsolationHandle) {
        if let Err(e) = self.isolation.destroy(handle).await {
            self.report_error(Some(handle.plugin_id()), "destroy", &e).await;
        }
    }
}

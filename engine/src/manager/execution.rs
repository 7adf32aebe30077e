//! Running plugin code, violations, startup and shutdown

use super::PluginManager;
use crate::message_bus::{Event, EventType};
use crate::monitor::UsageSample;
use futures::future::join_all;
use sdk::errors::EngineError;
use sdk::types::{PluginStatus, SecurityViolation, Severity};
use serde_json::{json, Value};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Result of running one plugin for a hook or a broadcast event
#[derive(Debug)]
pub struct RunOutcome {
    pub plugin_id: String,
    pub result: Result<Value, EngineError>,
}

impl PluginManager {
    /// Run the loaded code of an enabled plugin again with `input` bound
    ///
    /// Returns the result of the last `api.*` call the code made.
    pub async fn invoke(&self, plugin_id: &str, input: Value) -> Result<Value, EngineError> {
        let result = self.execute(plugin_id, json!({ "input": input })).await;
        self.observe(Some(plugin_id), "invoke", result).await
    }

    /// Run every plugin registered for `hook`, concurrently
    pub async fn trigger_hook(&self, hook: &str, payload: Value) -> Vec<RunOutcome> {
        let plugins = self.hooks.plugins_for(hook).await;
        debug!("Triggering hook {} for {} plugin(s)", hook, plugins.len());

        let payload = &payload;
        let runs = plugins.into_iter().map(|plugin_id| async move {
            let bindings = json!({ "hook": hook, "payload": payload });
            let result = self.execute(&plugin_id, bindings).await;
            let result = self.observe(Some(&plugin_id), "hook", result).await;
            RunOutcome { plugin_id, result }
        });
        join_all(runs).await
    }

    /// Deliver an event to one plugin if it subscribed to `topic`
    ///
    /// Returns `None` when the plugin is not subscribed.
    pub async fn dispatch_event(
        &self,
        plugin_id: &str,
        topic: &str,
        data: Value,
    ) -> Result<Option<Value>, EngineError> {
        if !self.host_api.events().is_subscribed(plugin_id, topic).await {
            return Ok(None);
        }
        let bindings = json!({ "event": { "topic": topic, "data": data } });
        let result = self.execute(plugin_id, bindings).await.map(Some);
        self.observe(Some(plugin_id), "dispatch_event", result).await
    }

    async fn execute(&self, plugin_id: &str, bindings: Value) -> Result<Value, EngineError> {
        let Some(handle) = self.handle(plugin_id).await else {
            let record = self.record(plugin_id).await?;
            return Err(EngineError::Execution(format!(
                "Plugin {} is {}, not enabled",
                plugin_id, record.status
            )));
        };

        let result = self
            .isolation
            .send(&handle, "execute", json!({ "bindings": bindings }))
            .await;

        let now = self.clock.now_millis();
        if let Err(e) = self
            .registry
            .modify(plugin_id, |r| r.last_active = Some(now))
            .await
        {
            debug!("Could not record activity of {}: {}", plugin_id, e);
        }
        result
    }

    /// Record a runtime violation; a critical one blocks and disables the plugin
    pub async fn report_violation(
        &self,
        plugin_id: &str,
        kind: &str,
        severity: Severity,
        description: &str,
    ) -> Result<SecurityViolation, EngineError> {
        let critical = severity == Severity::Critical;
        let result = self
            .security
            .record_violation(plugin_id, kind, severity, description, critical)
            .await;
        let violation = self.observe(Some(plugin_id), "report_violation", result).await?;

        if critical && self.registry.contains(plugin_id).await {
            self.disable(plugin_id).await?;
        }
        Ok(violation)
    }

    /// Load persisted state and start the background tasks
    ///
    /// No context survives a restart: plugins persisted as `enabled` or
    /// `loading` become `disabled`, and previously enabled ones are enabled
    /// again when `plugins.restore_enabled` is set.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), EngineError> {
        let result = self.load_state().await;
        let restore = self.observe(None, "initialize", result).await?;

        self.start_background().await;

        for plugin_id in restore {
            if let Err(e) = self.enable(&plugin_id).await {
                warn!("Could not restore {}: {}", plugin_id, e);
            }
        }
        Ok(())
    }

    async fn load_state(&self) -> Result<Vec<String>, EngineError> {
        self.security.load().await?;
        self.registry.load().await?;

        let mut restore = Vec::new();
        for record in self.registry.list().await {
            if !record.status.has_handle() {
                continue;
            }
            let _guard = self.lock_plugin(&record.id).await;
            self.write_status(&record.id, record.status, PluginStatus::Disabled)
                .await?;
            if record.status == PluginStatus::Enabled && self.config.plugins.restore_enabled {
                restore.push(record.id);
            }
        }
        Ok(restore)
    }

    /// Spawn the resource sampler, the critical violation watcher and the
    /// context exit watcher
    async fn start_background(self: &Arc<Self>) {
        let period = Duration::from_millis(self.config.limits.sample_interval_ms.max(1));
        let weak = Arc::downgrade(self);
        let sampler = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                manager.sample_resources().await;
            }
        });

        let mut violations = self.bus.subscribe(EventType::ViolationRecorded).await;
        let weak = Arc::downgrade(self);
        let watcher = tokio::spawn(async move {
            while let Some(event) = violations.recv().await {
                let Event::ViolationRecorded(violation) = event else {
                    continue;
                };
                if violation.severity != Severity::Critical {
                    continue;
                }
                let Some(manager) = weak.upgrade() else { break };
                if manager.status(&violation.plugin_id).await == Some(PluginStatus::Enabled) {
                    info!(
                        "Disabling {} after critical violation {}",
                        violation.plugin_id, violation.kind
                    );
                    // failures are already published by disable
                    let _ = manager.disable(&violation.plugin_id).await;
                }
            }
        });

        let exits = Arc::clone(&self.exit_rx);
        let weak = Arc::downgrade(self);
        let exit_watcher = tokio::spawn(async move {
            let mut exits = exits.lock().await;
            while let Some(exit) = exits.recv().await {
                let Some(manager) = weak.upgrade() else { break };
                manager.context_lost(&exit.plugin_id, &exit.context_id).await;
            }
        });

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([sampler, watcher, exit_watcher]);
    }

    /// Take one usage sample of every live context
    pub async fn sample_resources(&self) {
        let handles: Vec<_> = self
            .handles
            .read()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), Arc::clone(handle)))
            .collect();
        let stats_timeout = Duration::from_millis(self.config.limits.sample_interval_ms)
            .min(Duration::from_millis(self.config.isolation.send_timeout_ms));

        for (plugin_id, handle) in handles {
            let memory_bytes = match handle
                .channel()
                .send_with_timeout("stats", Value::Null, stats_timeout)
                .await
            {
                Ok(stats) => stats.get("memoryBytes").and_then(Value::as_u64),
                Err(e) => {
                    debug!("No stats from {}: {}", plugin_id, e);
                    None
                }
            };
            let storage_bytes = match self.host_api.storage().bytes_used(&plugin_id).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Could not measure storage of {}: {}", plugin_id, e);
                    0
                }
            };
            let sample = UsageSample {
                network_calls: self.host_api.usage().network_calls(&plugin_id).await,
                plugin_id,
                memory_bytes,
                storage_bytes,
            };
            self.monitor.check(&sample).await;
        }
    }

    fn stop_background(&self) {
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
    }

    /// Stop background tasks and destroy every context, keeping persisted
    /// statuses so that `initialize` can restore them
    pub async fn suspend(&self) {
        self.stop_background();
        let handles: Vec<_> = self.handles.write().await.drain().collect();
        for (plugin_id, handle) in handles {
            self.hooks.unregister(&plugin_id).await;
            self.destroy_handle(&handle).await;
        }
        info!("Plugin manager suspended");
    }

    /// Stop background tasks and disable every running plugin
    pub async fn shutdown(&self) {
        self.stop_background();

        for plugin_id in self.enabled_plugins().await {
            if let Err(e) = self.disable(&plugin_id).await {
                warn!("Could not disable {} on shutdown: {}", plugin_id, e);
            }
        }

        let leftover: Vec<_> = self.handles.write().await.drain().collect();
        for (_, handle) in leftover {
            self.destroy_handle(&handle).await;
        }
        info!("Plugin manager stopped");
    }
}

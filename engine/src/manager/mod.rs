//! Plugin manager
//!
//! The `PluginManager` is the one service the host talks to. It owns the
//! registry, the security validator, the host API surface and the table of
//! live isolation handles, and drives every plugin through its lifecycle:
//!
//! ```text
//! installed -> loading -> enabled <-> disabled
//!                 \-> error
//! ```
//!
//! Lifecycle operations on one plugin id (`install`, `enable`, `disable`,
//! `update`, `update_config`, `uninstall`) are serialized by a per-id lock;
//! operations on different plugins run concurrently. Every transition
//! publishes `StatusChanged`, and every failed operation is published as
//! `Event::Error` before it is returned to the caller.
//!
//! # Examples
//!
//! ```no_run
//! use enclave_engine::clock::SystemClock;
//! use enclave_engine::config::Config;
//! use enclave_engine::isolation::IsolationRouter;
//! use enclave_engine::manager::{InstallOptions, PluginManager};
//! use enclave_engine::message_bus::MessageBus;
//! use enclave_engine::security::patterns::CodePatterns;
//! use enclave_engine::storage::MemoryKvStore;
//! use sdk::types::PluginPackage;
//! use std::sync::Arc;
//!
//! # async fn example(package: PluginPackage) -> Result<(), sdk::errors::EngineError> {
//! let config = Config::default();
//! let isolation = Arc::new(IsolationRouter::from_config(&config, Arc::new(CodePatterns::new()?))?);
//! let manager = Arc::new(PluginManager::new(
//!     config,
//!     Arc::new(MemoryKvStore::new()),
//!     isolation,
//!     Arc::new(MessageBus::new()),
//!     Arc::new(SystemClock),
//! )?);
//! manager.initialize().await?;
//!
//! let id = package.manifest.id.clone();
//! manager.install(package, InstallOptions::default()).await?;
//! manager.enable(&id).await?;
//! let result = manager.invoke(&id, serde_json::json!({"city": "Oslo"})).await?;
//! println!("{}", result);
//!
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod execution;
mod hooks;
mod lifecycle;

pub use execution::RunOutcome;
pub use hooks::HookRegistry;
pub use lifecycle::granted_permissions;

use crate::api::HostApi;
use crate::clock::Clock;
use crate::config::Config;
use crate::isolation::{HandleInfo, IsolationHandle, IsolationProvider};
use crate::message_bus::{Event, MessageBus};
use crate::monitor::ResourceMonitor;
use crate::registry::{ImportSummary, PluginRecord, Registry, RegistrySnapshot};
use crate::sandbox::{ExecutionLimits, Interpreter};
use crate::security::patterns::CodePatterns;
use crate::security::SecurityValidator;
use crate::storage::KvStore;
use sdk::errors::EngineError;
use sdk::types::{PluginPackage, PluginStatus, ValidationReport};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tracing::warn;

/// Options for [`PluginManager::install`]
#[derive(Debug, Clone, Copy, Default)]
pub struct InstallOptions {
    /// Skip the validator; the block list still applies
    pub skip_validation: bool,
    /// Replace an installed plugin with the same id
    pub force: bool,
    /// Enable right after installing
    pub enable_immediately: bool,
}

/// Options for [`PluginManager::update`]
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    pub skip_validation: bool,
    /// Accept a version that is not newer than the installed one
    pub force: bool,
}

/// An installed plugin together with its live context, if any
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInstance {
    #[serde(flatten)]
    pub record: PluginRecord,
    pub isolation: Option<HandleInfo>,
}

/// Plugin lifecycle service
pub struct PluginManager {
    config: Config,
    registry: Arc<Registry>,
    security: Arc<SecurityValidator>,
    host_api: Arc<HostApi>,
    isolation: Arc<dyn IsolationProvider>,
    /// Host-side compile pass run before code is shipped to a context
    interpreter: Interpreter,
    monitor: ResourceMonitor,
    hooks: HookRegistry,
    bus: Arc<MessageBus>,
    clock: Arc<dyn Clock>,
    handles: RwLock<HashMap<String, Arc<IsolationHandle>>>,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    exits: mpsc::UnboundedSender<ContextExit>,
    exit_rx: Arc<Mutex<mpsc::UnboundedReceiver<ContextExit>>>,
}

/// A context whose channel closed, as seen by its watcher
#[derive(Debug)]
struct ContextExit {
    plugin_id: String,
    context_id: String,
}

impl PluginManager {
    /// Build the manager and the components it owns
    ///
    /// Nothing is read from `store` until [`PluginManager::initialize`].
    ///
    /// # Errors
    ///
    /// Returns an error if the code patterns fail to compile or the HTTP
    /// client cannot be built.
    pub fn new(
        config: Config,
        store: Arc<dyn KvStore>,
        isolation: Arc<dyn IsolationProvider>,
        bus: Arc<MessageBus>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        let patterns = Arc::new(CodePatterns::new()?);
        let security = Arc::new(SecurityValidator::new(
            config.security.clone(),
            &config.sandbox,
            Arc::clone(&patterns),
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&clock),
        ));
        let registry = Arc::new(Registry::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.registry.max_backups,
        ));
        let host_api = Arc::new(HostApi::new(
            &config,
            store,
            Arc::clone(&bus),
            Arc::clone(&security),
        )?);
        let interpreter = Interpreter::new(patterns, ExecutionLimits::from(&config.sandbox));
        let monitor = ResourceMonitor::new(
            config.limits.clone(),
            Arc::clone(&bus),
            Arc::clone(&security),
        );

        let (exits, exit_rx) = mpsc::unbounded_channel();

        tracing::info!("Plugin manager created with {} isolation", isolation.name());
        Ok(Self {
            config,
            registry,
            security,
            host_api,
            isolation,
            interpreter,
            monitor,
            hooks: HookRegistry::new(),
            bus,
            clock,
            handles: RwLock::new(HashMap::new()),
            locks: StdMutex::new(HashMap::new()),
            tasks: StdMutex::new(Vec::new()),
            exits,
            exit_rx: Arc::new(Mutex::new(exit_rx)),
        })
    }

    /// Install a package
    ///
    /// Unless `skip_validation` is set the package must pass the validator.
    /// With `force` an installed plugin of the same id is stopped and replaced;
    /// its stored data is kept. With `enable_immediately` the plugin is
    /// enabled afterwards, and an enable failure is returned while the
    /// plugin stays installed in the `error` state.
    ///
    /// # Errors
    ///
    /// - `PluginBlocked` if the id is on the block list
    /// - `ValidationRejected` if the validator rejects the package
    /// - `AlreadyInstalled` if the id is taken and `force` is not set
    pub async fn install(
        &self,
        package: PluginPackage,
        options: InstallOptions,
    ) -> Result<PluginRecord, EngineError> {
        let plugin_id = package.manifest.id.clone();
        let result = async {
            let _guard = self.lock_plugin(&plugin_id).await;
            self.install_locked(package, options).await
        }
        .await;
        self.observe(Some(&plugin_id), "install", result).await
    }

    /// Stop and remove a plugin together with its stored data and backups
    pub async fn uninstall(&self, plugin_id: &str) -> Result<(), EngineError> {
        let result = async {
            let _guard = self.lock_plugin(plugin_id).await;
            self.uninstall_locked(plugin_id).await
        }
        .await;
        self.observe(Some(plugin_id), "uninstall", result).await
    }

    /// Load plugin records from a registry snapshot
    ///
    /// Records for blocked ids are skipped. With `overwrite`, a running
    /// plugin the snapshot replaces is disabled first, so no context keeps
    /// running code its record no longer describes.
    pub async fn import(
        &self,
        snapshot: RegistrySnapshot,
        overwrite: bool,
    ) -> Result<ImportSummary, EngineError> {
        let result = async {
            let mut ids: Vec<String> = snapshot.plugins.iter().map(|r| r.id.clone()).collect();
            ids.sort();
            ids.dedup();
            // sorted so that concurrent imports take the locks in one order
            let mut guards = Vec::with_capacity(ids.len());
            for id in &ids {
                guards.push(self.lock_plugin(id).await);
            }
            self.import_locked(snapshot, overwrite).await
        }
        .await;
        self.observe(None, "import", result).await
    }

    /// Parse and load a snapshot written by `Registry::export_json`
    pub async fn import_json(&self, json: &str, overwrite: bool) -> Result<ImportSummary, EngineError> {
        let snapshot = self
            .observe(None, "import", RegistrySnapshot::from_json(json))
            .await?;
        self.import(snapshot, overwrite).await
    }

    /// Start a plugin in its isolation context
    ///
    /// Does nothing if the plugin is already enabled. On failure the context
    /// is destroyed and the plugin is left in the `error` state.
    ///
    /// # Errors
    ///
    /// - `PluginBlocked` if the id is on the block list
    /// - `PermissionDenied` if a required permission cannot be granted
    /// - `CodeRejected` / `UnsupportedStatement` if the code does not compile
    /// - any error of the isolation backend or of the `load` request
    pub async fn enable(&self, plugin_id: &str) -> Result<(), EngineError> {
        let result = async {
            let _guard = self.lock_plugin(plugin_id).await;
            self.enable_locked(plugin_id).await
        }
        .await;
        self.observe(Some(plugin_id), "enable", result).await
    }

    /// Stop a plugin; does nothing unless it is enabled
    pub async fn disable(&self, plugin_id: &str) -> Result<(), EngineError> {
        let result = async {
            let _guard = self.lock_plugin(plugin_id).await;
            self.disable_locked(plugin_id).await
        }
        .await;
        self.observe(Some(plugin_id), "disable", result).await
    }

    /// Replace an installed plugin with a newer package
    ///
    /// The current settings are backed up, then migrated through the new
    /// schema. A plugin that was enabled is enabled again afterwards.
    ///
    /// # Errors
    ///
    /// - `InvalidManifest` if the package id differs or, without `force`,
    ///   its version is not strictly greater than the installed one
    /// - `ValidationRejected` if the validator rejects the package
    pub async fn update(
        &self,
        plugin_id: &str,
        package: PluginPackage,
        options: UpdateOptions,
    ) -> Result<PluginRecord, EngineError> {
        let result = async {
            let _guard = self.lock_plugin(plugin_id).await;
            self.update_locked(plugin_id, package, options).await
        }
        .await;
        self.observe(Some(plugin_id), "update", result).await
    }

    /// Replace the settings of a plugin
    ///
    /// The settings are checked against the manifest schema and the previous
    /// ones are backed up. A running plugin receives the new settings over
    /// its channel.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` listing every schema error.
    pub async fn update_config(
        &self,
        plugin_id: &str,
        config: sdk::manifest::PluginConfig,
    ) -> Result<PluginRecord, EngineError> {
        let result = async {
            let _guard = self.lock_plugin(plugin_id).await;
            self.update_config_locked(plugin_id, config).await
        }
        .await;
        self.observe(Some(plugin_id), "update_config", result).await
    }

    /// Apply a config backup through the current schema
    pub async fn restore_config(&self, plugin_id: &str, timestamp: i64) -> Result<PluginRecord, EngineError> {
        let result = async {
            let _guard = self.lock_plugin(plugin_id).await;
            self.restore_config_locked(plugin_id, timestamp).await
        }
        .await;
        self.observe(Some(plugin_id), "restore_config", result).await
    }

    /// Run the validator without installing
    pub async fn validate(&self, package: &PluginPackage) -> ValidationReport {
        self.security.validate(package).await
    }

    pub async fn get(&self, plugin_id: &str) -> Option<PluginInstance> {
        let record = self.registry.get(plugin_id).await?;
        Some(self.instance(record).await)
    }

    pub async fn status(&self, plugin_id: &str) -> Option<PluginStatus> {
        self.registry.get(plugin_id).await.map(|r| r.status)
    }

    /// Every installed plugin, ordered by id
    pub async fn list(&self) -> Vec<PluginInstance> {
        let mut instances = Vec::new();
        for record in self.registry.list().await {
            instances.push(self.instance(record).await);
        }
        instances
    }

    pub async fn list_by_status(&self, status: PluginStatus) -> Vec<PluginInstance> {
        let mut instances = Vec::new();
        for record in self.registry.list().await {
            if record.status == status {
                instances.push(self.instance(record).await);
            }
        }
        instances
    }

    /// Ids of enabled plugins
    pub async fn enabled_plugins(&self) -> Vec<String> {
        self.registry
            .list()
            .await
            .into_iter()
            .filter(|r| r.status == PluginStatus::Enabled)
            .map(|r| r.id)
            .collect()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn validator(&self) -> &Arc<SecurityValidator> {
        &self.security
    }

    pub fn host_api(&self) -> &Arc<HostApi> {
        &self.host_api
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn instance(&self, record: PluginRecord) -> PluginInstance {
        let isolation = self.handles.read().await.get(&record.id).map(|h| h.info());
        PluginInstance { record, isolation }
    }

    async fn handle(&self, plugin_id: &str) -> Option<Arc<IsolationHandle>> {
        self.handles.read().await.get(plugin_id).map(Arc::clone)
    }

    async fn record(&self, plugin_id: &str) -> Result<PluginRecord, EngineError> {
        self.registry
            .get(plugin_id)
            .await
            .ok_or_else(|| EngineError::PluginNotFound(plugin_id.to_string()))
    }

    /// Wait for exclusive lifecycle access to one plugin id
    async fn lock_plugin(&self, plugin_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(plugin_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Publish a failed result on the bus and hand it back
    async fn observe<T>(
        &self,
        plugin_id: Option<&str>,
        operation: &str,
        result: Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        if let Err(e) = &result {
            self.report_error(plugin_id, operation, e).await;
        }
        result
    }

    async fn report_error(&self, plugin_id: Option<&str>, operation: &str, error: &EngineError) {
        match plugin_id {
            Some(id) => warn!("{} of {} failed: {}", operation, id, error),
            None => warn!("{} failed: {}", operation, error),
        }
        self.bus
            .publish(Event::Error {
                plugin_id: plugin_id.map(str::to_string),
                kind: error.kind(),
                message: error.to_string(),
            })
            .await;
    }
}

//! Plugin registry
//!
//! Durable store of installed plugins. Each plugin is one [`PluginRecord`]
//! under `registry/plugins/<id>` in the injected [`KvStore`]; category, tag
//! and free-text indices are derived in memory.
//!
//! The registry also keeps point-in-time config backups under
//! `registry/backups/<id>/<timestamp>` (newest `max_backups` kept per plugin)
//! and can export or import the whole set of records as a
//! [`RegistrySnapshot`].
//!
//! # Examples
//!
//! ```no_run
//! use enclave_engine::clock::SystemClock;
//! use enclave_engine::registry::Registry;
//! use enclave_engine::storage::MemoryKvStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), sdk::errors::EngineError> {
//! let registry = Registry::new(Arc::new(MemoryKvStore::new()), Arc::new(SystemClock), 10);
//! registry.load().await?;
//!
//! for hit in registry.search("weather").await {
//!     println!("{} ({})", hit.plugin_id, hit.score);
//! }
//! # Ok(())
//! # }
//! ```

mod index;

pub use index::SearchHit;

use crate::clock::Clock;
use crate::storage::KvStore;
use index::Index;
use sdk::errors::EngineError;
use sdk::manifest::{Manifest, PluginConfig};
use sdk::types::PluginStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const PLUGINS_PREFIX: &str = "registry/plugins/";
const BACKUPS_PREFIX: &str = "registry/backups/";

/// Current snapshot format
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Durable projection of an installed plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRecord {
    pub id: String,
    pub manifest: Manifest,
    pub status: PluginStatus,
    pub config: PluginConfig,
    /// Code unit loaded into the isolation context on enable
    pub code: String,
    pub installed_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub last_active: Option<i64>,
}

impl PluginRecord {
    /// Record for a freshly installed plugin, config initialised from schema defaults
    pub fn new(manifest: Manifest, code: String, status: PluginStatus, now: i64) -> Self {
        Self {
            id: manifest.id.clone(),
            config: manifest.default_config(),
            manifest,
            status,
            code,
            installed_at: now,
            updated_at: now,
            last_active: None,
        }
    }
}

/// A saved copy of a plugin's settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigBackup {
    pub plugin_id: String,
    /// Unix milliseconds; part of the backup key
    pub timestamp: i64,
    /// Plugin version the settings belonged to
    pub version: String,
    pub config: PluginConfig,
}

/// Whole-registry export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    pub format_version: u32,
    pub exported_at: i64,
    pub plugins: Vec<PluginRecord>,
}

impl RegistrySnapshot {
    /// Parse a snapshot written by `Registry::export_json`
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let snapshot: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::Storage(format!("Invalid registry snapshot: {}", e)))?;
        snapshot.ensure_supported()?;
        Ok(snapshot)
    }

    /// Reject snapshots written by a newer format
    pub fn ensure_supported(&self) -> Result<(), EngineError> {
        if self.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(EngineError::Storage(format!(
                "Unsupported snapshot format version {}",
                self.format_version
            )));
        }
        Ok(())
    }
}

/// Outcome of an import
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Default)]
struct RegistryState {
    records: BTreeMap<String, PluginRecord>,
    index: Index,
}

impl RegistryState {
    fn put(&mut self, record: PluginRecord) {
        if let Some(old) = self.records.remove(&record.id) {
            self.index.remove(&old);
        }
        self.index.insert(&record);
        self.records.insert(record.id.clone(), record);
    }

    fn take(&mut self, id: &str) -> Option<PluginRecord> {
        let record = self.records.remove(id)?;
        self.index.remove(&record);
        Some(record)
    }
}

/// Registry of installed plugins
pub struct Registry {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    max_backups: usize,
    state: RwLock<RegistryState>,
}

fn record_key(id: &str) -> String {
    format!("{}{}", PLUGINS_PREFIX, id)
}

fn backup_prefix(id: &str) -> String {
    format!("{}{}/", BACKUPS_PREFIX, id)
}

fn backup_key(id: &str, timestamp: i64) -> String {
    // Zero padding keeps lexicographic key order equal to time order
    format!("{}{:020}", backup_prefix(id), timestamp)
}

fn decode<T: serde::de::DeserializeOwned>(key: &str, value: serde_json::Value) -> Result<T, EngineError> {
    serde_json::from_value(value)
        .map_err(|e| EngineError::Storage(format!("Corrupt entry '{}': {}", key, e)))
}

fn encode<T: Serialize>(value: &T) -> Result<serde_json::Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::Storage(e.to_string()))
}

impl Registry {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, max_backups: usize) -> Self {
        Self {
            store,
            clock,
            max_backups,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Load every persisted record and rebuild the indices
    pub async fn load(&self) -> Result<usize, EngineError> {
        let mut state = self.state.write().await;
        state.records.clear();
        state.index.clear();

        for key in self.store.list(PLUGINS_PREFIX).await? {
            let Some(value) = self.store.get(&key).await? else {
                continue;
            };
            match decode::<PluginRecord>(&key, value) {
                Ok(record) => state.put(record),
                Err(e) => warn!("Skipping unreadable registry entry: {}", e),
            }
        }

        let count = state.records.len();
        info!("Loaded {} plugin record(s) from registry", count);
        Ok(count)
    }

    /// Add a new record; fails if the id is taken
    pub async fn insert(&self, record: PluginRecord) -> Result<(), EngineError> {
        let mut state = self.state.write().await;
        if state.records.contains_key(&record.id) {
            return Err(EngineError::AlreadyInstalled(record.id));
        }
        self.store.set(&record_key(&record.id), encode(&record)?).await?;
        debug!("Registered plugin {}", record.id);
        state.put(record);
        Ok(())
    }

    /// Apply a change to an existing record and persist it
    pub async fn modify<F>(&self, id: &str, change: F) -> Result<PluginRecord, EngineError>
    where
        F: FnOnce(&mut PluginRecord),
    {
        let mut state = self.state.write().await;
        let mut record = state
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::PluginNotFound(id.to_string()))?;

        change(&mut record);
        record.updated_at = self.clock.now_millis();

        self.store.set(&record_key(id), encode(&record)?).await?;
        state.put(record.clone());
        Ok(record)
    }

    /// Set the persisted status of a plugin
    pub async fn set_status(&self, id: &str, status: PluginStatus) -> Result<PluginRecord, EngineError> {
        self.modify(id, |r| r.status = status).await
    }

    /// Replace the persisted settings of a plugin
    pub async fn set_config(&self, id: &str, config: PluginConfig) -> Result<PluginRecord, EngineError> {
        self.modify(id, |r| r.config = config).await
    }

    /// Remove a record and all of its backups
    pub async fn remove(&self, id: &str) -> Result<PluginRecord, EngineError> {
        let mut state = self.state.write().await;
        if !state.records.contains_key(id) {
            return Err(EngineError::PluginNotFound(id.to_string()));
        }

        self.store.delete(&record_key(id)).await?;
        self.store.delete_prefix(&backup_prefix(id)).await?;

        state
            .take(id)
            .ok_or_else(|| EngineError::PluginNotFound(id.to_string()))
    }

    pub async fn get(&self, id: &str) -> Option<PluginRecord> {
        self.state.read().await.records.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.state.read().await.records.contains_key(id)
    }

    /// Every record, ordered by id
    pub async fn list(&self) -> Vec<PluginRecord> {
        self.state.read().await.records.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.records.is_empty()
    }

    /// Records in a category (case-insensitive)
    pub async fn by_category(&self, category: &str) -> Vec<PluginRecord> {
        let state = self.state.read().await;
        state
            .index
            .category(category)
            .iter()
            .filter_map(|id| state.records.get(id).cloned())
            .collect()
    }

    /// Records carrying a tag (case-insensitive)
    pub async fn by_tag(&self, tag: &str) -> Vec<PluginRecord> {
        let state = self.state.read().await;
        state
            .index
            .tag(tag)
            .iter()
            .filter_map(|id| state.records.get(id).cloned())
            .collect()
    }

    /// Free-text search over name, tags, category and description
    ///
    /// Results are ordered by descending score, then by id.
    pub async fn search(&self, query: &str) -> Vec<SearchHit> {
        let state = self.state.read().await;
        let mut hits: Vec<SearchHit> = state
            .records
            .values()
            .filter_map(|record| {
                let score = index::score(record, query);
                (score > 0).then(|| SearchHit {
                    plugin_id: record.id.clone(),
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.plugin_id.cmp(&b.plugin_id)));
        hits
    }

    /// Save the current settings of a plugin as a new backup
    pub async fn backup_config(&self, id: &str) -> Result<ConfigBackup, EngineError> {
        let record = self
            .get(id)
            .await
            .ok_or_else(|| EngineError::PluginNotFound(id.to_string()))?;

        let mut timestamp = self.clock.now_millis();
        while self.store.get(&backup_key(id, timestamp)).await?.is_some() {
            timestamp += 1;
        }

        let backup = ConfigBackup {
            plugin_id: id.to_string(),
            timestamp,
            version: record.manifest.version.clone(),
            config: record.config,
        };
        self.store.set(&backup_key(id, timestamp), encode(&backup)?).await?;
        debug!("Backed up config of {} at {}", id, timestamp);

        self.prune_backups(id).await?;
        Ok(backup)
    }

    /// Backups of a plugin, newest first
    pub async fn list_backups(&self, id: &str) -> Result<Vec<ConfigBackup>, EngineError> {
        let mut backups = Vec::new();
        for key in self.store.list(&backup_prefix(id)).await?.into_iter().rev() {
            if let Some(value) = self.store.get(&key).await? {
                backups.push(decode::<ConfigBackup>(&key, value)?);
            }
        }
        Ok(backups)
    }

    /// Look up one backup
    pub async fn backup(&self, id: &str, timestamp: i64) -> Result<ConfigBackup, EngineError> {
        let key = backup_key(id, timestamp);
        let value = self.store.get(&key).await?.ok_or_else(|| {
            EngineError::Storage(format!("No backup of '{}' at {}", id, timestamp))
        })?;
        decode(&key, value)
    }

    async fn prune_backups(&self, id: &str) -> Result<(), EngineError> {
        let keys = self.store.list(&backup_prefix(id)).await?;
        if keys.len() <= self.max_backups {
            return Ok(());
        }
        let excess = keys.len() - self.max_backups;
        for key in keys.into_iter().take(excess) {
            self.store.delete(&key).await?;
        }
        Ok(())
    }

    /// Snapshot of every record
    pub async fn export(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            exported_at: self.clock.now_millis(),
            plugins: self.list().await,
        }
    }

    /// Load records from a snapshot
    ///
    /// Existing ids are skipped unless `overwrite` is set. Imported records
    /// never come back running: `loading` and `enabled` become `disabled`.
    pub async fn import(
        &self,
        snapshot: RegistrySnapshot,
        overwrite: bool,
    ) -> Result<ImportSummary, EngineError> {
        snapshot.ensure_supported()?;

        let mut summary = ImportSummary::default();
        let mut state = self.state.write().await;

        for mut record in snapshot.plugins {
            if record.id.is_empty() || record.id != record.manifest.id {
                warn!("Skipping snapshot record with inconsistent id '{}'", record.id);
                summary.skipped.push(record.id);
                continue;
            }
            if state.records.contains_key(&record.id) && !overwrite {
                summary.skipped.push(record.id);
                continue;
            }
            if record.status.has_handle() {
                record.status = PluginStatus::Disabled;
            }

            self.store.set(&record_key(&record.id), encode(&record)?).await?;
            summary.imported.push(record.id.clone());
            state.put(record);
        }

        info!(
            "Imported {} plugin record(s), skipped {}",
            summary.imported.len(),
            summary.skipped.len()
        );
        Ok(summary)
    }

    /// Export as pretty JSON
    pub async fn export_json(&self) -> Result<String, EngineError> {
        serde_json::to_string_pretty(&self.export().await)
            .map_err(|e| EngineError::Storage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryKvStore;
    use serde_json::json;

    fn manifest(id: &str, category: &str, tags: &[&str]) -> Manifest {
        serde_json::from_value(json!({
            "id": id,
            "name": id,
            "version": "1.0.0",
            "category": category,
            "tags": tags,
            "configSchema": { "level": { "type": "integer", "default": 1 } }
        }))
        .unwrap()
    }

    fn registry(store: Arc<MemoryKvStore>, clock: Arc<ManualClock>) -> Registry {
        Registry::new(store, clock, 3)
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicates() {
        let reg = registry(Arc::new(MemoryKvStore::new()), Arc::new(ManualClock::new(1)));
        let record = PluginRecord::new(manifest("a", "tools", &[]), String::new(), PluginStatus::Installed, 1);

        reg.insert(record.clone()).await.unwrap();
        assert!(matches!(
            reg.insert(record).await,
            Err(EngineError::AlreadyInstalled(id)) if id == "a"
        ));
    }

    #[tokio::test]
    async fn test_load_rebuilds_indices() {
        let store = Arc::new(MemoryKvStore::new());
        let clock = Arc::new(ManualClock::new(1));
        let reg = registry(Arc::clone(&store), Arc::clone(&clock));
        reg.insert(PluginRecord::new(manifest("a", "Tools", &["x"]), String::new(), PluginStatus::Installed, 1))
            .await
            .unwrap();

        let reopened = registry(store, clock);
        assert_eq!(reopened.load().await.unwrap(), 1);
        assert_eq!(reopened.by_category("tools").await.len(), 1);
        assert_eq!(reopened.by_tag("X").await.len(), 1);
    }

    #[tokio::test]
    async fn test_backups_are_pruned_and_ordered() {
        let clock = Arc::new(ManualClock::new(100));
        let reg = registry(Arc::new(MemoryKvStore::new()), Arc::clone(&clock));
        reg.insert(PluginRecord::new(manifest("a", "tools", &[]), String::new(), PluginStatus::Installed, 1))
            .await
            .unwrap();

        for level in 0..5 {
            let mut config = PluginConfig::new();
            config.insert("level".into(), json!(level));
            reg.set_config("a", config).await.unwrap();
            reg.backup_config("a").await.unwrap();
            clock.advance(10);
        }

        let backups = reg.list_backups("a").await.unwrap();
        assert_eq!(backups.len(), 3);
        assert_eq!(backups[0].config["level"], json!(4));
        assert_eq!(backups[2].config["level"], json!(2));
    }

    #[tokio::test]
    async fn test_same_millisecond_backups_do_not_collide() {
        let reg = registry(Arc::new(MemoryKvStore::new()), Arc::new(ManualClock::new(5)));
        reg.insert(PluginRecord::new(manifest("a", "tools", &[]), String::new(), PluginStatus::Installed, 1))
            .await
            .unwrap();

        let first = reg.backup_config("a").await.unwrap();
        let second = reg.backup_config("a").await.unwrap();
        assert_ne!(first.timestamp, second.timestamp);
    }

    #[tokio::test]
    async fn test_remove_drops_backups() {
        let store = Arc::new(MemoryKvStore::new());
        let reg = registry(Arc::clone(&store), Arc::new(ManualClock::new(5)));
        reg.insert(PluginRecord::new(manifest("a", "tools", &["t"]), String::new(), PluginStatus::Installed, 1))
            .await
            .unwrap();
        reg.backup_config("a").await.unwrap();

        reg.remove("a").await.unwrap();
        assert!(store.is_empty().await);
        assert!(reg.by_tag("t").await.is_empty());
        assert!(matches!(reg.remove("a").await, Err(EngineError::PluginNotFound(_))));
    }
}

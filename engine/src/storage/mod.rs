//! Key/value persistence
//!
//! Every durable piece of host state (registry records, config backups, the
//! violation log, the block list, trusted developers, plugin data) lives
//! behind the [`KvStore`] trait. The host picks an implementation at
//! construction time:
//!
//! - [`MemoryKvStore`]: process-local, for tests and ephemeral hosts
//! - [`SqliteKvStore`]: the `kv` table of the host database
//!
//! # Examples
//!
//! ```
//! use enclave_engine::storage::{KvStore, MemoryKvStore};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), sdk::errors::EngineError> {
//! let store = MemoryKvStore::new();
//! store.set("registry/plugins/demo", json!({"id": "demo"})).await?;
//! assert_eq!(store.list("registry/plugins/").await?, vec!["registry/plugins/demo"]);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sdk::errors::EngineError;
use serde_json::Value;

mod memory;
mod sqlite;

pub use memory::MemoryKvStore;
pub use sqlite::SqliteKvStore;

/// Injected key/value store
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Value stored under `key`
    async fn get(&self, key: &str) -> Result<Option<Value>, EngineError>;

    /// Store `value` under `key`, replacing any previous value
    async fn set(&self, key: &str, value: Value) -> Result<(), EngineError>;

    /// Remove `key`, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool, EngineError>;

    /// Keys starting with `prefix`, in ascending order
    async fn list(&self, prefix: &str) -> Result<Vec<String>, EngineError>;

    /// Remove every key starting with `prefix`, returning how many were removed
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, EngineError> {
        let keys = self.list(prefix).await?;
        let mut removed = 0;
        for key in keys {
            if self.delete(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Size in bytes of a value as stored (its JSON encoding)
pub fn stored_size(value: &Value) -> u64 {
    serde_json::to_vec(value).map(|v| v.len() as u64).unwrap_or(0)
}

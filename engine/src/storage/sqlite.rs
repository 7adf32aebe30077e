use super::KvStore;
use crate::db::{Database, KvRepository};
use async_trait::async_trait;
use sdk::errors::EngineError;
use serde_json::Value;

/// Key/value store over the host SQLite database
#[derive(Clone)]
pub struct SqliteKvStore {
    repo: KvRepository,
}

impl SqliteKvStore {
    pub fn new(db: &Database) -> Self {
        Self { repo: db.kv() }
    }
}

fn storage_error(e: anyhow::Error) -> EngineError {
    EngineError::Storage(format!("{:#}", e))
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, EngineError> {
        let entry = self.repo.get(key).await.map_err(storage_error)?;
        Ok(entry.map(|e| e.value))
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), EngineError> {
        self.repo.put(key, &value).await.map_err(storage_error)
    }

    async fn delete(&self, key: &str) -> Result<bool, EngineError> {
        self.repo.delete(key).await.map_err(storage_error)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, EngineError> {
        self.repo.keys_with_prefix(prefix).await.map_err(storage_error)
    }
}

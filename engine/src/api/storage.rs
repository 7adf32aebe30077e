//! `storage` namespace: per-plugin key/value data

use crate::storage::{stored_size, KvStore};
use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::host_api::{args, NamespaceImpl};
use serde_json::Value;
use std::sync::Arc;

/// Longest key a plugin may use
const MAX_KEY_LEN: usize = 256;

/// Prefix of every key owned by `plugin_id`
pub fn data_prefix(plugin_id: &str) -> String {
    format!("plugin-data/{}/", plugin_id)
}

/// Plugin data stored under `plugin-data/<id>/<key>`
pub struct StorageApi {
    store: Arc<dyn KvStore>,
}

impl StorageApi {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    fn key(plugin_id: &str, key: &str) -> Result<String, EngineError> {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(EngineError::Execution(format!(
                "Storage keys must be 1-{} bytes",
                MAX_KEY_LEN
            )));
        }
        Ok(format!("{}{}", data_prefix(plugin_id), key))
    }

    /// Bytes held by a plugin's data
    pub async fn bytes_used(&self, plugin_id: &str) -> Result<u64, EngineError> {
        let mut total = 0;
        for key in self.store.list(&data_prefix(plugin_id)).await? {
            if let Some(value) = self.store.get(&key).await? {
                total += key.len() as u64 + stored_size(&value);
            }
        }
        Ok(total)
    }

    /// Drop every key of a plugin
    pub async fn clear(&self, plugin_id: &str) -> Result<usize, EngineError> {
        self.store.delete_prefix(&data_prefix(plugin_id)).await
    }
}

#[async_trait]
impl NamespaceImpl for StorageApi {
    async fn call(
        &self,
        plugin_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, EngineError> {
        match method {
            "get" => {
                let key = Self::key(plugin_id, &args::string(&args, 0, "key")?)?;
                Ok(self.store.get(&key).await?.unwrap_or(Value::Null))
            }
            "set" => {
                let key = Self::key(plugin_id, &args::string(&args, 0, "key")?)?;
                self.store.set(&key, args::value(&args, 1)).await?;
                Ok(Value::Bool(true))
            }
            "remove" => {
                let key = Self::key(plugin_id, &args::string(&args, 0, "key")?)?;
                Ok(Value::Bool(self.store.delete(&key).await?))
            }
            "clear" => Ok(Value::from(self.clear(plugin_id).await?)),
            "keys" => {
                let prefix = data_prefix(plugin_id);
                let keys = self
                    .store
                    .list(&prefix)
                    .await?
                    .into_iter()
                    .filter_map(|k| k.strip_prefix(&prefix).map(|k| Value::String(k.to_string())))
                    .collect();
                Ok(Value::Array(keys))
            }
            other => Err(EngineError::Execution(format!(
                "Unknown storage method: {}",
                other
            ))),
        }
    }
}

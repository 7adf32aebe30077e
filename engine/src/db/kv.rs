/// Key/value table operations
///
/// Values are stored as JSON text. All queries use parameterized queries
/// for SQL injection prevention.
use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};
use std::time::{SystemTime, UNIX_EPOCH};

/// One stored entry
#[derive(Debug, Clone)]
pub struct KvEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub updated_at: i64,
}

/// Repository over the `kv` table
#[derive(Clone)]
pub struct KvRepository {
    pool: SqlitePool,
}

impl KvRepository {
    /// Create a new key/value repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fetch one entry
    pub async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        let row = sqlx::query("SELECT key, value, updated_at FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read key")?;

        row.map(|row| {
            let raw: String = row.get("value");
            let value = serde_json::from_str(&raw)
                .with_context(|| format!("Corrupt JSON stored under '{}'", key))?;
            Ok(KvEntry {
                key: row.get("key"),
                value,
                updated_at: row.get("updated_at"),
            })
        })
        .transpose()
    }

    /// Insert or replace one entry
    pub async fn put(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as i64;
        let raw = serde_json::to_string(value).context("Failed to encode value")?;

        sqlx::query(
            "INSERT INTO kv (key, value, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(raw)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to write key")?;

        Ok(())
    }

    /// Delete one entry, returning whether it existed
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .context("Failed to delete key")?;

        Ok(result.rows_affected() > 0)
    }

    /// Keys starting with `prefix`, in ascending order
    pub async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let keys = sqlx::query_scalar(
            "SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list keys")?;

        Ok(keys)
    }
}

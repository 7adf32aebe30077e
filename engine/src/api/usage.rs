//! Host-side usage counters sampled by the resource monitor

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Counters {
    network_calls: AtomicU64,
}

/// Per-plugin counters, reset when a plugin is enabled
#[derive(Default)]
pub struct UsageTracker {
    plugins: RwLock<HashMap<String, Arc<Counters>>>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    async fn counters(&self, plugin_id: &str) -> Arc<Counters> {
        if let Some(counters) = self.plugins.read().await.get(plugin_id) {
            return Arc::clone(counters);
        }
        let mut plugins = self.plugins.write().await;
        Arc::clone(plugins.entry(plugin_id.to_string()).or_default())
    }

    /// Count one outgoing HTTP request, returning the new total
    pub async fn record_network_call(&self, plugin_id: &str) -> u64 {
        self.counters(plugin_id)
            .await
            .network_calls
            .fetch_add(1, Ordering::Relaxed)
            + 1
    }

    pub async fn network_calls(&self, plugin_id: &str) -> u64 {
        self.plugins
            .read()
            .await
            .get(plugin_id)
            .map(|c| c.network_calls.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Forget a plugin's counters
    pub async fn reset(&self, plugin_id: &str) {
        self.plugins.write().await.remove(plugin_id);
    }
}

//! Hook registrations of enabled plugins

use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;

/// Hook name to the plugins listening on it
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<BTreeMap<String, BTreeSet<String>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, plugin_id: &str, hooks: &[String]) {
        let mut map = self.hooks.write().await;
        for hook in hooks {
            map.entry(hook.clone())
                .or_default()
                .insert(plugin_id.to_string());
        }
    }

    pub async fn unregister(&self, plugin_id: &str) {
        let mut map = self.hooks.write().await;
        for plugins in map.values_mut() {
            plugins.remove(plugin_id);
        }
        map.retain(|_, plugins| !plugins.is_empty());
    }

    /// Plugins registered for `hook`, in id order
    pub async fn plugins_for(&self, hook: &str) -> Vec<String> {
        self.hooks
            .read()
            .await
            .get(hook)
            .map(|plugins| plugins.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every hook with at least one plugin
    pub async fn hook_names(&self) -> Vec<String> {
        self.hooks.read().await.keys().cloned().collect()
    }
}

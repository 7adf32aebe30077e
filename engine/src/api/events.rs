//! `events` namespace: plugin-emitted events and topic subscriptions
//!
//! Topics are namespaced by the emitting plugin: `emit("saved")` from plugin
//! `notes` publishes `notes:saved`. Subscriptions name fully qualified topics
//! so a plugin can listen to another plugin's events.

use crate::message_bus::{Event, MessageBus};
use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::host_api::{args, NamespaceImpl};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Most subscriptions one plugin may hold
const MAX_SUBSCRIPTIONS: usize = 64;

/// Topic as seen by other plugins
pub fn qualified_topic(plugin_id: &str, topic: &str) -> String {
    format!("{}:{}", plugin_id, topic)
}

pub struct EventsApi {
    bus: Arc<MessageBus>,
    subscriptions: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl EventsApi {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self {
            bus,
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn is_subscribed(&self, plugin_id: &str, topic: &str) -> bool {
        self.subscriptions
            .read()
            .await
            .get(plugin_id)
            .is_some_and(|topics| topics.contains(topic))
    }

    /// Drop every subscription of a plugin
    pub async fn forget(&self, plugin_id: &str) {
        self.subscriptions.write().await.remove(plugin_id);
    }

    fn topic_arg(args: &[Value]) -> Result<String, EngineError> {
        let topic = args::string(args, 0, "topic")?;
        if topic.is_empty() {
            return Err(EngineError::Execution("Topic must not be empty".to_string()));
        }
        Ok(topic)
    }
}

#[async_trait]
impl NamespaceImpl for EventsApi {
    async fn call(
        &self,
        plugin_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, EngineError> {
        match method {
            "emit" => {
                let topic = Self::topic_arg(&args)?;
                self.bus
                    .publish(Event::PluginEvent {
                        plugin_id: plugin_id.to_string(),
                        topic: qualified_topic(plugin_id, &topic),
                        data: args::value(&args, 1),
                    })
                    .await;
                Ok(Value::Bool(true))
            }
            "subscribe" => {
                let topic = Self::topic_arg(&args)?;
                let mut subscriptions = self.subscriptions.write().await;
                let topics = subscriptions.entry(plugin_id.to_string()).or_default();
                if topics.len() >= MAX_SUBSCRIPTIONS && !topics.contains(&topic) {
                    return Err(EngineError::Execution(format!(
                        "At most {} subscriptions per plugin",
                        MAX_SUBSCRIPTIONS
                    )));
                }
                Ok(Value::Bool(topics.insert(topic)))
            }
            "unsubscribe" => {
                let topic = Self::topic_arg(&args)?;
                let mut subscriptions = self.subscriptions.write().await;
                let removed = subscriptions
                    .get_mut(plugin_id)
                    .is_some_and(|topics| topics.remove(&topic));
                Ok(Value::Bool(removed))
            }
            "subscriptions" => {
                let subscriptions = self.subscriptions.read().await;
                let topics = subscriptions
                    .get(plugin_id)
                    .map(|t| t.iter().cloned().map(Value::String).collect())
                    .unwrap_or_default();
                Ok(Value::Array(topics))
            }
            other => Err(EngineError::Execution(format!(
                "Unknown events method: {}",
                other
            ))),
        }
    }
}

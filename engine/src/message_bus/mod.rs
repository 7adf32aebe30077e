//! Message Bus for host observers
//!
//! The MessageBus is the single path by which components tell the host what
//! happened: lifecycle transitions, violations, blocks, resource overruns,
//! plugin output and every failed operation. Subscribers pick specific event
//! types or `EventType::All`.
//!
//! Channels are bounded. Publishing never waits on a slow subscriber: when a
//! subscriber's buffer is full the event is dropped for that subscriber and a
//! warning is logged, and closed subscribers are pruned.

use sdk::errors::ErrorKind;
use sdk::types::{PluginStatus, SecurityViolation};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};

/// Channel buffer size for bounded channels
const CHANNEL_BUFFER_SIZE: usize = 256;

/// Event types that can be published on the message bus
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum EventType {
    PluginInstalled,
    PluginUninstalled,
    PluginUpdated,
    StatusChanged,
    ConfigUpdated,
    ViolationRecorded,
    PluginBlocked,
    ResourceLimitExceeded,
    PluginLog,
    PluginEvent,
    UiRequest,
    Error,
    /// Subscribe to all event types
    All,
}

/// Events that can be published on the message bus
#[derive(Debug, Clone)]
pub enum Event {
    /// Plugin persisted to the registry
    PluginInstalled { plugin_id: String, version: String },
    /// Plugin removed from the registry
    PluginUninstalled { plugin_id: String },
    /// Plugin manifest replaced by a newer version
    PluginUpdated {
        plugin_id: String,
        from_version: String,
        to_version: String,
    },
    /// Lifecycle transition
    StatusChanged {
        plugin_id: String,
        from: PluginStatus,
        to: PluginStatus,
    },
    /// Plugin settings replaced
    ConfigUpdated { plugin_id: String },
    /// Runtime violation appended to the log
    ViolationRecorded(SecurityViolation),
    /// Plugin id added to the block list
    PluginBlocked { plugin_id: String, reason: String },
    /// A sampled resource exceeded its configured ceiling
    ResourceLimitExceeded {
        plugin_id: String,
        resource: String,
        usage: u64,
        limit: u64,
    },
    /// `console.*` output of a plugin
    PluginLog {
        plugin_id: String,
        level: String,
        message: String,
    },
    /// Event emitted through the `events` namespace (topic is `<id>:<topic>`)
    PluginEvent {
        plugin_id: String,
        topic: String,
        data: Value,
    },
    /// Request for the host UI (notification, modal, menu item...)
    UiRequest {
        plugin_id: String,
        action: String,
        payload: Value,
    },
    /// A failed operation
    Error {
        plugin_id: Option<String>,
        kind: ErrorKind,
        message: String,
    },
}

impl Event {
    /// Get the event type for this event
    pub fn event_type(&self) -> EventType {
        match self {
            Event::PluginInstalled { .. } => EventType::PluginInstalled,
            Event::PluginUninstalled { .. } => EventType::PluginUninstalled,
            Event::PluginUpdated { .. } => EventType::PluginUpdated,
            Event::StatusChanged { .. } => EventType::StatusChanged,
            Event::ConfigUpdated { .. } => EventType::ConfigUpdated,
            Event::ViolationRecorded(_) => EventType::ViolationRecorded,
            Event::PluginBlocked { .. } => EventType::PluginBlocked,
            Event::ResourceLimitExceeded { .. } => EventType::ResourceLimitExceeded,
            Event::PluginLog { .. } => EventType::PluginLog,
            Event::PluginEvent { .. } => EventType::PluginEvent,
            Event::UiRequest { .. } => EventType::UiRequest,
            Event::Error { .. } => EventType::Error,
        }
    }

    /// Plugin the event concerns, if any
    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            Event::PluginInstalled { plugin_id, .. }
            | Event::PluginUninstalled { plugin_id }
            | Event::PluginUpdated { plugin_id, .. }
            | Event::StatusChanged { plugin_id, .. }
            | Event::ConfigUpdated { plugin_id }
            | Event::PluginBlocked { plugin_id, .. }
            | Event::ResourceLimitExceeded { plugin_id, .. }
            | Event::PluginLog { plugin_id, .. }
            | Event::PluginEvent { plugin_id, .. }
            | Event::UiRequest { plugin_id, .. } => Some(plugin_id),
            Event::ViolationRecorded(v) => Some(&v.plugin_id),
            Event::Error { plugin_id, .. } => plugin_id.as_deref(),
        }
    }
}

/// Message bus for pub/sub communication between components
pub struct MessageBus {
    /// Map of event types to lists of subscribers
    channels: Arc<Mutex<HashMap<EventType, Vec<mpsc::Sender<Event>>>>>,
}

impl MessageBus {
    /// Create a new MessageBus
    pub fn new() -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribe to a specific event type, or `EventType::All`
    pub async fn subscribe(&self, event_type: EventType) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let mut channels = self.channels.lock().await;
        channels.entry(event_type).or_default().push(tx);
        rx
    }

    /// Publish an event to all subscribers
    ///
    /// The event is sent to all subscribers of the specific event type,
    /// as well as all subscribers of `EventType::All`.
    pub async fn publish(&self, event: Event) {
        let mut channels = self.channels.lock().await;
        let event_type = event.event_type();

        for key in [event_type, EventType::All] {
            if let Some(subscribers) = channels.get_mut(&key) {
                subscribers.retain(|tx| match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!("Subscriber to {:?} is lagging; event dropped", key);
                        true
                    }
                    Err(TrySendError::Closed(_)) => false,
                });
            }
        }
    }

    /// Number of live subscribers for an event type
    pub async fn subscriber_count(&self, event_type: EventType) -> usize {
        let channels = self.channels.lock().await;
        channels
            .get(&event_type)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

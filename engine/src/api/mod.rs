//! Host API surface reachable from plugin code
//!
//! [`HostApi`] owns the namespace implementations. For every context the
//! manager asks it for a [`PluginBridge`]: the request handler serving that
//! context's `api_call` and `log` requests, holding handles only for the
//! namespaces the plugin's granted permissions open.
//!
//! A call into a namespace the plugin was not granted is refused with
//! `PermissionDenied` and recorded as a medium `unauthorized_api_access`
//! violation. `ui` is the exception: without the permission, plugins get an
//! inert stub that accepts calls and shows nothing.

pub mod crypto;
pub mod events;
pub mod http;
pub mod storage;
pub mod ui;
pub mod usage;

pub use crypto::CryptoApi;
pub use events::EventsApi;
pub use http::{HttpApi, HttpGateway};
pub use storage::StorageApi;
pub use ui::{InertUi, UiApi};
pub use usage::UsageTracker;

use crate::config::Config;
use crate::isolation::RequestHandler;
use crate::message_bus::{Event, MessageBus};
use crate::security::SecurityValidator;
use crate::storage::KvStore;
use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::host_api::{ApiCall, LogRecord, Namespace, NamespaceHandle, NamespaceImpl};
use sdk::manifest::{Manifest, PermissionKind};
use sdk::types::Severity;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Violation kind recorded for refused calls
pub const UNAUTHORIZED_API_ACCESS: &str = "unauthorized_api_access";

/// Longest console line forwarded to the bus
const MAX_LOG_LINE: usize = 4096;

/// Shared namespace implementations
pub struct HostApi {
    bus: Arc<MessageBus>,
    security: Arc<SecurityValidator>,
    usage: Arc<UsageTracker>,
    storage: Arc<StorageApi>,
    ui: Arc<UiApi>,
    events: Arc<EventsApi>,
    crypto: Arc<CryptoApi>,
    http: Arc<HttpGateway>,
}

impl HostApi {
    pub fn new(
        config: &Config,
        store: Arc<dyn KvStore>,
        bus: Arc<MessageBus>,
        security: Arc<SecurityValidator>,
    ) -> Result<Self, EngineError> {
        let usage = Arc::new(UsageTracker::new());
        Ok(Self {
            storage: Arc::new(StorageApi::new(Arc::clone(&store))),
            ui: Arc::new(UiApi::new(Arc::clone(&bus))),
            events: Arc::new(EventsApi::new(Arc::clone(&bus))),
            crypto: Arc::new(CryptoApi::new(store)),
            http: Arc::new(HttpGateway::new(&config.http, Arc::clone(&usage))?),
            usage,
            bus,
            security,
        })
    }

    pub fn usage(&self) -> &Arc<UsageTracker> {
        &self.usage
    }

    pub fn storage(&self) -> &Arc<StorageApi> {
        &self.storage
    }

    pub fn events(&self) -> &Arc<EventsApi> {
        &self.events
    }

    /// Request handler for one context, scoped to `granted`
    pub fn bridge(&self, manifest: &Manifest, granted: &[PermissionKind]) -> Arc<PluginBridge> {
        let plugin_id = manifest.id.as_str();
        let mut handles = BTreeMap::new();

        for namespace in Namespace::granted_by(granted) {
            let inner: Arc<dyn NamespaceImpl> = match namespace {
                Namespace::Storage => Arc::clone(&self.storage) as Arc<dyn NamespaceImpl>,
                Namespace::Ui => Arc::clone(&self.ui) as Arc<dyn NamespaceImpl>,
                Namespace::Events => Arc::clone(&self.events) as Arc<dyn NamespaceImpl>,
                Namespace::Crypto => Arc::clone(&self.crypto) as Arc<dyn NamespaceImpl>,
                Namespace::Http => {
                    let scopes = manifest
                        .permissions_of(PermissionKind::Network)
                        .map(|p| p.scope.clone())
                        .collect();
                    Arc::new(self.http.for_plugin(scopes))
                }
            };
            handles.insert(namespace, NamespaceHandle::new(namespace, plugin_id, inner));
        }

        if !handles.contains_key(&Namespace::Ui) {
            handles.insert(
                Namespace::Ui,
                NamespaceHandle::new(Namespace::Ui, plugin_id, Arc::new(InertUi)),
            );
        }

        Arc::new(PluginBridge {
            plugin_id: plugin_id.to_string(),
            handles,
            bus: Arc::clone(&self.bus),
            security: Arc::clone(&self.security),
        })
    }

    /// Forget per-plugin host state kept outside the store
    pub async fn release(&self, plugin_id: &str) {
        self.events.forget(plugin_id).await;
        self.usage.reset(plugin_id).await;
    }
}

/// Host side of one context's channel
pub struct PluginBridge {
    plugin_id: String,
    handles: BTreeMap<Namespace, NamespaceHandle>,
    bus: Arc<MessageBus>,
    security: Arc<SecurityValidator>,
}

impl PluginBridge {
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Namespaces this context can reach
    pub fn namespaces(&self) -> Vec<Namespace> {
        self.handles.keys().copied().collect()
    }

    /// Run one API call on behalf of the plugin
    pub async fn dispatch(&self, call: ApiCall) -> Result<Value, EngineError> {
        let namespace: Namespace = call.namespace.parse()?;
        let result = match self.handles.get(&namespace) {
            Some(handle) => handle.call(&call.method, call.args).await,
            None => Err(EngineError::PermissionDenied {
                plugin_id: self.plugin_id.clone(),
                capability: format!("{} namespace", namespace),
            }),
        };

        if let Err(e @ EngineError::PermissionDenied { .. }) = &result {
            let description = format!("{}.{}: {}", namespace, call.method, e);
            if let Err(record_err) = self
                .security
                .record_violation(
                    &self.plugin_id,
                    UNAUTHORIZED_API_ACCESS,
                    Severity::Medium,
                    &description,
                    false,
                )
                .await
            {
                tracing::error!("Failed to record violation: {}", record_err);
            }
        }
        result
    }

    async fn log(&self, record: LogRecord) {
        let mut message = record.message;
        if message.len() > MAX_LOG_LINE {
            let mut cut = MAX_LOG_LINE;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }

        match record.level.as_str() {
            "error" => tracing::error!(plugin = %self.plugin_id, "{}", message),
            "warn" => tracing::warn!(plugin = %self.plugin_id, "{}", message),
            _ => tracing::info!(plugin = %self.plugin_id, "{}", message),
        }
        self.bus
            .publish(Event::PluginLog {
                plugin_id: self.plugin_id.clone(),
                level: record.level,
                message,
            })
            .await;
    }
}

#[async_trait]
impl RequestHandler for PluginBridge {
    async fn handle(&self, kind: &str, payload: Value) -> Result<Value, String> {
        match kind {
            "api_call" => {
                let call: ApiCall = serde_json::from_value(payload)
                    .map_err(|e| format!("Malformed api_call: {}", e))?;
                self.dispatch(call).await.map_err(|e| e.to_string())
            }
            "log" => {
                let record: LogRecord =
                    serde_json::from_value(payload).map_err(|e| format!("Malformed log: {}", e))?;
                self.log(record).await;
                Ok(Value::Null)
            }
            other => Err(format!("Unknown request type: {}", other)),
        }
    }
}

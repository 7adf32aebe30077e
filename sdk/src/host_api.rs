//! Host API namespaces and handles
//!
//! A plugin reaches the host only through a small set of namespaces
//! (`api.storage.get(...)`, `api.http.get(...)` and so on). Each namespace is
//! gated by one permission kind; a context receives handles only for the
//! namespaces its granted permissions open.
//!
//! Handles follow the same shape as the rest of the SDK: a cheap, clonable
//! wrapper around an `Arc<dyn ...Impl>` implemented by the engine, so the
//! sandbox side never sees engine internals.
//!
//! # Examples
//!
//! ```
//! use sdk::host_api::Namespace;
//! use sdk::manifest::PermissionKind;
//!
//! let ns: Namespace = "http".parse().unwrap();
//! assert_eq!(ns.required_permission(), PermissionKind::Network);
//! ```

use crate::errors::EngineError;
use crate::manifest::PermissionKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;

/// A host API namespace reachable from plugin code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Storage,
    Ui,
    Events,
    Http,
    Crypto,
}

impl Namespace {
    pub const ALL: [Namespace; 5] = [
        Namespace::Storage,
        Namespace::Ui,
        Namespace::Events,
        Namespace::Http,
        Namespace::Crypto,
    ];

    /// Permission kind that opens this namespace
    pub fn required_permission(&self) -> PermissionKind {
        match self {
            Namespace::Storage => PermissionKind::Storage,
            Namespace::Ui => PermissionKind::Ui,
            Namespace::Events | Namespace::Crypto => PermissionKind::Api,
            Namespace::Http => PermissionKind::Network,
        }
    }

    /// Namespaces opened by a set of granted permission kinds
    pub fn granted_by(kinds: &[PermissionKind]) -> Vec<Namespace> {
        Self::ALL
            .into_iter()
            .filter(|ns| kinds.contains(&ns.required_permission()))
            .collect()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Storage => "storage",
            Namespace::Ui => "ui",
            Namespace::Events => "events",
            Namespace::Http => "http",
            Namespace::Crypto => "crypto",
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Namespace {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|ns| ns.as_str() == s)
            .ok_or_else(|| EngineError::Execution(format!("Unknown API namespace: {}", s)))
    }
}

/// Payload of an `api_call` request sent from a context to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCall {
    pub namespace: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Payload of a `log` request sent from a context to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// One of `log`, `info`, `warn`, `error`
    pub level: String,
    pub message: String,
}

/// Handle for one namespace of one plugin
///
/// Calls are bound to the plugin the handle was issued for; the plugin id is
/// never taken from plugin-supplied data.
#[derive(Clone)]
pub struct NamespaceHandle {
    namespace: Namespace,
    plugin_id: Arc<str>,
    inner: Arc<dyn NamespaceImpl>,
}

impl NamespaceHandle {
    /// Create a new handle with the given implementation
    pub fn new(namespace: Namespace, plugin_id: &str, inner: Arc<dyn NamespaceImpl>) -> Self {
        Self {
            namespace,
            plugin_id: Arc::from(plugin_id),
            inner,
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Invoke a method of this namespace
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, EngineError> {
        self.inner.call(&self.plugin_id, method, args).await
    }
}

impl std::fmt::Debug for NamespaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceHandle")
            .field("namespace", &self.namespace)
            .field("plugin_id", &self.plugin_id)
            .finish()
    }
}

/// Trait for namespace implementation (to be implemented by engine)
#[async_trait]
pub trait NamespaceImpl: Send + Sync {
    /// Dispatch `method` with positional `args` on behalf of `plugin_id`
    async fn call(
        &self,
        plugin_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, EngineError>;
}

/// Positional argument helpers shared by namespace implementations
pub mod args {
    use super::*;

    /// Required string argument at `index`
    pub fn string(args: &[Value], index: usize, name: &str) -> Result<String, EngineError> {
        match args.get(index) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Err(EngineError::Execution(format!(
                "Argument '{}' must be a string, got {}",
                name, other
            ))),
            None => Err(EngineError::Execution(format!(
                "Missing argument '{}'",
                name
            ))),
        }
    }

    /// Optional string argument at `index`
    pub fn opt_string(args: &[Value], index: usize) -> Option<String> {
        args.get(index).and_then(|v| v.as_str()).map(String::from)
    }

    /// Argument at `index`, or null
    pub fn value(args: &[Value], index: usize) -> Value {
        args.get(index).cloned().unwrap_or(Value::Null)
    }
}

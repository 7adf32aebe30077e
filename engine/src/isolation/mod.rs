//! Isolation providers
//!
//! Every enabled plugin runs in its own isolation context, reachable only
//! through a message channel. A provider creates a context for a manifest and
//! its granted permission kinds, sends requests to it, and tears it down.
//!
//! The variant a context gets comes from [`select_variant`]; which backend
//! realizes that variant is host configuration:
//!
//! - `interpreter`: the context is a tokio task in the host process
//! - `process`: the context is an `enclave worker` child process speaking
//!   newline-delimited JSON over stdio
//!
//! The context receives only the host-side API surface handed to `create`,
//! which the manager scopes to the granted permission kinds.

pub mod channel;
pub mod interpreter;
pub mod policy;
pub mod process;
pub mod router;

pub use channel::{Endpoint, RequestHandler};
pub use interpreter::InterpreterProvider;
pub use policy::select_variant;
pub use process::{run_worker, ProcessProvider};
pub use router::IsolationRouter;

use crate::config::{Backend, IsolationConfig};
use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::manifest::{IsolationVariant, Manifest, PermissionKind};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

/// Creates, addresses and destroys isolation contexts
#[async_trait]
pub trait IsolationProvider: Send + Sync {
    /// Backend name, for logs and handle info
    fn name(&self) -> &'static str;

    /// Create a context for `manifest`, serving `host` as its API surface
    async fn create(
        &self,
        manifest: &Manifest,
        granted: &[PermissionKind],
        host: Arc<dyn RequestHandler>,
    ) -> Result<IsolationHandle, EngineError>;

    /// Tear the context down within the configured deadline
    async fn destroy(&self, handle: &IsolationHandle) -> Result<(), EngineError>;

    /// Send a request to the context and wait for its reply
    async fn send(
        &self,
        handle: &IsolationHandle,
        kind: &str,
        payload: Value,
    ) -> Result<Value, EngineError> {
        handle.channel().send(kind, payload).await
    }
}

/// Channel and teardown deadlines
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    pub send_timeout: Duration,
    pub shutdown_grace: Duration,
    pub destroy_deadline: Duration,
}

impl From<&IsolationConfig> for Timings {
    fn from(config: &IsolationConfig) -> Self {
        Self {
            send_timeout: Duration::from_millis(config.send_timeout_ms),
            shutdown_grace: Duration::from_millis(config.shutdown_grace_ms),
            destroy_deadline: Duration::from_millis(config.destroy_deadline_ms),
        }
    }
}

/// What keeps a context alive
pub(crate) enum ContextResource {
    Task(JoinHandle<()>),
    Process {
        child: Child,
        io: Vec<JoinHandle<()>>,
    },
}

/// Reportable view of a live context
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleInfo {
    pub context_id: String,
    pub variant: IsolationVariant,
    pub strength: &'static str,
    pub backend: Backend,
    pub granted: Vec<PermissionKind>,
    /// Worker process id, for the process backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// A live isolation context
pub struct IsolationHandle {
    plugin_id: String,
    context_id: String,
    variant: IsolationVariant,
    granted: Vec<PermissionKind>,
    backend: Backend,
    pid: Option<u32>,
    channel: Arc<Endpoint>,
    resource: Mutex<Option<ContextResource>>,
}

impl IsolationHandle {
    pub(crate) fn new(
        plugin_id: &str,
        variant: IsolationVariant,
        granted: &[PermissionKind],
        backend: Backend,
        channel: Arc<Endpoint>,
        resource: ContextResource,
    ) -> Self {
        let pid = match &resource {
            ContextResource::Process { child, .. } => child.id(),
            ContextResource::Task(_) => None,
        };
        Self {
            plugin_id: plugin_id.to_string(),
            context_id: uuid::Uuid::new_v4().to_string(),
            variant,
            granted: granted.to_vec(),
            backend,
            pid,
            channel,
            resource: Mutex::new(Some(resource)),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn variant(&self) -> IsolationVariant {
        self.variant
    }

    pub fn granted(&self) -> &[PermissionKind] {
        &self.granted
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn strength(&self) -> &'static str {
        self.variant.strength_label()
    }

    pub fn channel(&self) -> &Arc<Endpoint> {
        &self.channel
    }

    pub fn info(&self) -> HandleInfo {
        HandleInfo {
            context_id: self.context_id.clone(),
            variant: self.variant,
            strength: self.strength(),
            backend: self.backend,
            granted: self.granted.clone(),
            pid: self.pid,
        }
    }

    /// Whether the context has already been torn down
    pub async fn is_destroyed(&self) -> bool {
        self.resource.lock().await.is_none()
    }

    /// Ask the context to stop, then force it, never past `timings.destroy_deadline`
    ///
    /// Calling this again after a teardown is a no-op.
    pub(crate) async fn teardown(&self, timings: Timings) -> Result<(), EngineError> {
        let Some(resource) = self.resource.lock().await.take() else {
            return Ok(());
        };

        let deadline = Instant::now() + timings.destroy_deadline;
        let grace_end = (Instant::now() + timings.shutdown_grace).min(deadline);
        let grace = grace_end.saturating_duration_since(Instant::now());

        let ack = timeout_at(
            grace_end,
            self.channel.send_with_timeout("shutdown", Value::Null, grace),
        )
        .await;
        match ack {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::debug!("Context {} did not acknowledge shutdown: {}", self.context_id, e)
            }
            Err(_) => tracing::debug!("Context {} shutdown request timed out", self.context_id),
        }

        let result = match resource {
            ContextResource::Task(task) => {
                if !task.is_finished() {
                    task.abort();
                }
                match timeout_at(deadline, task).await {
                    Ok(_) => Ok(()),
                    Err(_) => Err(()),
                }
            }
            ContextResource::Process { mut child, io } => {
                let exited = matches!(timeout_at(grace_end, child.wait()).await, Ok(Ok(_)));
                let result = if exited {
                    Ok(())
                } else {
                    if let Err(e) = child.start_kill() {
                        tracing::debug!("Kill of context {} failed: {}", self.context_id, e);
                    }
                    match timeout_at(deadline, child.wait()).await {
                        Ok(_) => Ok(()),
                        Err(_) => Err(()),
                    }
                };
                for task in io {
                    task.abort();
                }
                result
            }
        };

        self.channel.close();
        tracing::debug!(
            "Destroyed {} context {} for {}",
            self.variant.as_str(),
            self.context_id,
            self.plugin_id
        );

        result.map_err(|_| {
            EngineError::timeout(
                format!("teardown of context {}", self.context_id),
                timings.destroy_deadline.as_millis() as u64,
            )
        })
    }
}

impl std::fmt::Debug for IsolationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolationHandle")
            .field("plugin_id", &self.plugin_id)
            .field("context_id", &self.context_id)
            .field("variant", &self.variant)
            .field("backend", &self.backend)
            .finish()
    }
}

/// Log when a manifest declares a different variant than its permissions need
pub(crate) fn effective_variant(manifest: &Manifest, granted: &[PermissionKind]) -> IsolationVariant {
    let variant = select_variant(granted);
    if let Some(declared) = manifest.isolation_variant {
        if declared != variant {
            tracing::warn!(
                "{} declares {} isolation; using {} for its permissions",
                manifest.id,
                declared.as_str(),
                variant.as_str()
            );
        }
    }
    variant
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::channel::FRAME_BUFFER;
    use sdk::types::{Frame, MessageEnvelope};
    use tokio::sync::mpsc;

    struct Refuse;

    #[async_trait]
    impl RequestHandler for Refuse {
        async fn handle(&self, _kind: &str, _payload: Value) -> Result<Value, String> {
            Err("refused".to_string())
        }
    }

    #[tokio::test]
    async fn test_teardown_of_unread_context_meets_deadline() {
        let (tx, _unread) = mpsc::channel(FRAME_BUFFER);
        for i in 0..FRAME_BUFFER {
            tx.try_send(Frame::Request(MessageEnvelope {
                kind: "filler".to_string(),
                message_id: i.to_string(),
                payload: Value::Null,
            }))
            .unwrap();
        }
        let (_peer_tx, rx) = mpsc::channel(FRAME_BUFFER);
        let channel = Endpoint::new(tx, Duration::from_millis(50));
        channel.start(rx, Arc::new(Refuse));

        let stuck = tokio::spawn(std::future::pending::<()>());
        let handle = IsolationHandle::new(
            "stuck",
            IsolationVariant::Minimal,
            &[],
            Backend::Interpreter,
            channel,
            ContextResource::Task(stuck),
        );

        let timings = Timings {
            send_timeout: Duration::from_millis(50),
            shutdown_grace: Duration::from_millis(50),
            destroy_deadline: Duration::from_millis(200),
        };
        let started = Instant::now();
        let finished = tokio::time::timeout(Duration::from_secs(2), handle.teardown(timings)).await;
        assert!(finished.is_ok());
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert!(handle.is_destroyed().await);
        assert!(handle.channel().is_closed());
    }
}

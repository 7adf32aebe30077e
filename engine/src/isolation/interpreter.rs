//! In-process backend: one interpreter task per context

use super::channel::{frame_pair, Endpoint, RequestHandler};
use super::{effective_variant, ContextResource, IsolationHandle, IsolationProvider, Timings};
use crate::config::Backend;
use crate::sandbox::{run_context, ContextSettings, ExecutionLimits};
use crate::security::patterns::CodePatterns;
use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::manifest::{Manifest, PermissionKind};
use std::sync::Arc;

/// Runs each context as a tokio task sharing nothing with the host but its
/// channel
pub struct InterpreterProvider {
    timings: Timings,
    limits: ExecutionLimits,
    patterns: Arc<CodePatterns>,
}

impl InterpreterProvider {
    pub fn new(timings: Timings, limits: ExecutionLimits, patterns: Arc<CodePatterns>) -> Self {
        Self {
            timings,
            limits,
            patterns,
        }
    }
}

#[async_trait]
impl IsolationProvider for InterpreterProvider {
    fn name(&self) -> &'static str {
        "interpreter"
    }

    async fn create(
        &self,
        manifest: &Manifest,
        granted: &[PermissionKind],
        host: Arc<dyn RequestHandler>,
    ) -> Result<IsolationHandle, EngineError> {
        let variant = effective_variant(manifest, granted);

        let ((host_tx, host_rx), (ctx_tx, ctx_rx)) = frame_pair();
        let channel = Endpoint::new(host_tx, self.timings.send_timeout);
        channel.start(host_rx, host);

        let settings = ContextSettings {
            plugin_id: manifest.id.clone(),
            limits: self.limits,
            reply_timeout: self.timings.send_timeout,
        };
        let task = tokio::spawn(run_context(
            ctx_tx,
            ctx_rx,
            settings,
            Arc::clone(&self.patterns),
        ));

        let handle = IsolationHandle::new(
            &manifest.id,
            variant,
            granted,
            Backend::Interpreter,
            channel,
            ContextResource::Task(task),
        );
        tracing::debug!(
            "Created {} context {} for {}",
            variant.as_str(),
            handle.context_id(),
            manifest.id
        );
        Ok(handle)
    }

    async fn destroy(&self, handle: &IsolationHandle) -> Result<(), EngineError> {
        handle.teardown(self.timings).await
    }
}

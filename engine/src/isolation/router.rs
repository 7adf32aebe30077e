//! Backend selection per isolation variant

use super::channel::RequestHandler;
use super::interpreter::InterpreterProvider;
use super::process::ProcessProvider;
use super::{select_variant, IsolationHandle, IsolationProvider, Timings};
use crate::config::{Backend, Config, IsolationConfig};
use crate::sandbox::ExecutionLimits;
use crate::security::patterns::CodePatterns;
use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::manifest::{Manifest, PermissionKind};
use std::sync::Arc;

/// Provider that realizes each variant with its configured backend
pub struct IsolationRouter {
    timings: Timings,
    isolation: IsolationConfig,
    interpreter: InterpreterProvider,
    process: Option<ProcessProvider>,
}

impl IsolationRouter {
    /// Build providers for every backend the configuration uses
    ///
    /// The process backend runs `isolation.worker_binary`, or this executable
    /// when unset.
    pub fn from_config(config: &Config, patterns: Arc<CodePatterns>) -> Result<Self, EngineError> {
        let isolation = &config.isolation;
        let timings = Timings::from(isolation);
        let limits = ExecutionLimits::from(&config.sandbox);
        let uses_process = [isolation.minimal, isolation.compute, isolation.dom]
            .contains(&Backend::Process);

        let process = if uses_process {
            let binary = match &isolation.worker_binary {
                Some(path) => path.clone(),
                None => std::env::current_exe().map_err(|e| {
                    EngineError::Config(format!("Cannot locate worker executable: {}", e))
                })?,
            };
            Some(ProcessProvider::new(timings, limits, binary))
        } else {
            None
        };

        Ok(Self {
            timings,
            isolation: isolation.clone(),
            interpreter: InterpreterProvider::new(timings, limits, patterns),
            process,
        })
    }
}

#[async_trait]
impl IsolationProvider for IsolationRouter {
    fn name(&self) -> &'static str {
        "router"
    }

    async fn create(
        &self,
        manifest: &Manifest,
        granted: &[PermissionKind],
        host: Arc<dyn RequestHandler>,
    ) -> Result<IsolationHandle, EngineError> {
        match self.isolation.backend_for(select_variant(granted)) {
            Backend::Interpreter => self.interpreter.create(manifest, granted, host).await,
            Backend::Process => match &self.process {
                Some(process) => process.create(manifest, granted, host).await,
                None => Err(EngineError::Isolation(
                    "Process backend is not configured".to_string(),
                )),
            },
        }
    }

    async fn destroy(&self, handle: &IsolationHandle) -> Result<(), EngineError> {
        handle.teardown(self.timings).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::manifest::IsolationVariant;
    use serde_json::{json, Value};
    use std::time::Duration;

    struct Silent;

    #[async_trait]
    impl RequestHandler for Silent {
        async fn handle(&self, _: &str, _: Value) -> Result<Value, String> {
            Ok(Value::Null)
        }
    }

    fn router() -> IsolationRouter {
        let mut config = Config::default();
        config.isolation.destroy_deadline_ms = 300;
        config.isolation.shutdown_grace_ms = 100;
        IsolationRouter::from_config(&config, Arc::new(CodePatterns::new().unwrap())).unwrap()
    }

    #[tokio::test]
    async fn test_variant_follows_permissions() {
        let router = router();
        let manifest = Manifest::from_json(r#"{"id": "p"}"#).unwrap();

        let handle = router
            .create(&manifest, &[PermissionKind::Storage], Arc::new(Silent))
            .await
            .unwrap();
        assert_eq!(handle.variant(), IsolationVariant::Compute);
        assert_eq!(handle.backend(), Backend::Interpreter);
        assert_eq!(handle.strength(), IsolationVariant::Compute.strength_label());
        router.destroy(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_then_destroy() {
        let router = router();
        let manifest = Manifest::from_json(r#"{"id": "p"}"#).unwrap();
        let handle = router.create(&manifest, &[], Arc::new(Silent)).await.unwrap();

        assert_eq!(router.send(&handle, "ping", Value::Null).await.unwrap(), json!("pong"));

        let started = std::time::Instant::now();
        router.destroy(&handle).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(300));
        assert!(handle.is_destroyed().await);

        // second destroy is a no-op, sends now fail
        router.destroy(&handle).await.unwrap();
        assert!(matches!(
            router.send(&handle, "ping", Value::Null).await,
            Err(EngineError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_unconfigured_process_backend() {
        let mut router = router();
        router.isolation.minimal = Backend::Process;
        let manifest = Manifest::from_json(r#"{"id": "p"}"#).unwrap();
        let err = router
            .create(&manifest, &[], Arc::new(Silent))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Isolation(_)));
    }
}

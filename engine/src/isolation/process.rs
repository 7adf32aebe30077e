//! Child-process backend
//!
//! Each context is a separate `enclave worker` process with a cleared
//! environment. Frames travel as newline-delimited JSON: host requests and
//! replies on the worker's stdin, context requests and replies on its stdout.
//! The worker logs to stderr.

use super::channel::{Endpoint, RequestHandler, FRAME_BUFFER};
use super::{effective_variant, ContextResource, IsolationHandle, IsolationProvider, Timings};
use crate::config::Backend;
use crate::sandbox::{run_context, ContextSettings, ExecutionLimits};
use crate::security::patterns::CodePatterns;
use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::manifest::{Manifest, PermissionKind};
use sdk::types::Frame;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long a worker gets to flush replies after its context stops
const WORKER_FLUSH: Duration = Duration::from_millis(500);

/// Frame channels over a byte stream pair
pub struct LineTransport {
    pub outbound: mpsc::Sender<Frame>,
    pub inbound: mpsc::Receiver<Frame>,
    pub reader: JoinHandle<()>,
    pub writer: JoinHandle<()>,
}

/// Bridge newline-delimited JSON on `reader`/`writer` to frame channels
///
/// Lines that are not frames are skipped.
pub fn line_transport<R, W>(reader: R, writer: W) -> LineTransport
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound, mut out_rx) = mpsc::channel::<Frame>(FRAME_BUFFER);
    let (in_tx, inbound) = mpsc::channel::<Frame>(FRAME_BUFFER);

    let writer = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(frame) = out_rx.recv().await {
            let mut line = match serde_json::to_string(&frame) {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!("Dropping unserializable frame: {}", e);
                    continue;
                }
            };
            line.push('\n');
            if writer.write_all(line.as_bytes()).await.is_err() || writer.flush().await.is_err()
            {
                break;
            }
        }
    });

    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Frame>(line) {
                Ok(frame) => {
                    if in_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::debug!("Skipping non-frame line: {}", e),
            }
        }
    });

    LineTransport {
        outbound,
        inbound,
        reader,
        writer,
    }
}

/// Runs each context as an `enclave worker` child process
pub struct ProcessProvider {
    timings: Timings,
    limits: ExecutionLimits,
    binary: PathBuf,
}

impl ProcessProvider {
    pub fn new(timings: Timings, limits: ExecutionLimits, binary: PathBuf) -> Self {
        Self {
            timings,
            limits,
            binary,
        }
    }

    fn command(&self, plugin_id: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("worker")
            .arg("--plugin-id")
            .arg(plugin_id)
            .arg("--max-code-bytes")
            .arg(self.limits.max_code_bytes.to_string())
            .arg("--max-execution-ms")
            .arg(self.limits.max_execution_ms.to_string())
            .arg("--max-statements")
            .arg(self.limits.max_statements.to_string())
            .arg("--max-variable-bytes")
            .arg(self.limits.max_variable_bytes.to_string())
            .arg("--reply-timeout-ms")
            .arg(self.timings.send_timeout.as_millis().to_string())
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Ok(filter) = std::env::var("RUST_LOG") {
            cmd.env("RUST_LOG", filter);
        }
        cmd
    }
}

#[async_trait]
impl IsolationProvider for ProcessProvider {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn create(
        &self,
        manifest: &Manifest,
        granted: &[PermissionKind],
        host: Arc<dyn RequestHandler>,
    ) -> Result<IsolationHandle, EngineError> {
        let variant = effective_variant(manifest, granted);

        let mut child = self.command(&manifest.id).spawn().map_err(|e| {
            EngineError::Isolation(format!(
                "Failed to spawn worker {}: {}",
                self.binary.display(),
                e
            ))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Isolation("Worker has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Isolation("Worker has no stdout".to_string()))?;

        let transport = line_transport(stdout, stdin);
        let channel = Endpoint::new(transport.outbound, self.timings.send_timeout);
        channel.start(transport.inbound, host);

        let handle = IsolationHandle::new(
            &manifest.id,
            variant,
            granted,
            Backend::Process,
            channel,
            ContextResource::Process {
                child,
                io: vec![transport.reader, transport.writer],
            },
        );

        if let Err(e) = handle.channel().send("ping", Value::Null).await {
            let _ = handle.teardown(self.timings).await;
            return Err(EngineError::Isolation(format!(
                "Worker for {} did not start: {}",
                manifest.id, e
            )));
        }

        tracing::debug!(
            "Created {} worker context {} for {}",
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

/// Serve one context on stdin/stdout until the host stops it
pub async fn run_worker(settings: ContextSettings) -> Result<(), EngineError> {
    let patterns = Arc::new(CodePatterns::new()?);
    let transport = line_transport(tokio::io::stdin(), tokio::io::stdout());

    run_context(transport.outbound, transport.inbound, settings, patterns).await;

    transport.reader.abort();
    let _ = tokio::time::timeout(WORKER_FLUSH, transport.writer).await;
    Ok(())
}

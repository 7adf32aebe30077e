use async_trait::async_trait;
use enclave_engine::clock::ManualClock;
use enclave_engine::config::{Backend, Config};
use enclave_engine::isolation::channel::{frame_pair, Endpoint};
use enclave_engine::isolation::{
    InterpreterProvider, IsolationProvider, IsolationRouter, RequestHandler, Timings,
};
use enclave_engine::manager::{InstallOptions, PluginManager};
use enclave_engine::message_bus::{Event, EventType, MessageBus};
use enclave_engine::sandbox::ExecutionLimits;
use enclave_engine::security::patterns::CodePatterns;
use enclave_engine::storage::MemoryKvStore;
use sdk::errors::{EngineError, ErrorKind};
use sdk::manifest::{IsolationVariant, Manifest, PermissionKind};
use sdk::types::{Frame, PluginPackage, PluginStatus, ResponseEnvelope};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Host side that records API calls and answers them with `true`
#[derive(Default)]
struct RecordingHost {
    calls: Mutex<Vec<Value>>,
    log_delay: Option<Duration>,
}

#[async_trait]
impl RequestHandler for RecordingHost {
    async fn handle(&self, kind: &str, payload: Value) -> Result<Value, String> {
        match kind {
            "api_call" => {
                self.calls.lock().await.push(payload);
                Ok(Value::Bool(true))
            }
            "log" => {
                if let Some(delay) = self.log_delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(Value::Null)
            }
            other => Err(format!("Unknown request type: {}", other)),
        }
    }
}

fn timings() -> Timings {
    Timings {
        send_timeout: Duration::from_millis(1_000),
        shutdown_grace: Duration::from_millis(100),
        destroy_deadline: Duration::from_millis(300),
    }
}

fn provider() -> InterpreterProvider {
    InterpreterProvider::new(
        timings(),
        ExecutionLimits::from(&enclave_engine::config::SandboxConfig::default()),
        Arc::new(CodePatterns::new().unwrap()),
    )
}

fn manifest(id: &str) -> Manifest {
    Manifest::from_json(&json!({ "id": id, "name": id, "version": "1.0.0" }).to_string()).unwrap()
}

#[tokio::test]
async fn test_interpreter_context_roundtrip() {
    let provider = provider();
    let host = Arc::new(RecordingHost::default());
    let handle = provider
        .create(&manifest("counter"), &[PermissionKind::Storage], Arc::clone(&host) as Arc<dyn RequestHandler>)
        .await
        .unwrap();
    assert_eq!(handle.variant(), IsolationVariant::Compute);
    assert_eq!(handle.backend(), Backend::Interpreter);

    let code = "api.storage.set('n', input)";
    let loaded = provider
        .send(&handle, "load", json!({ "code": code, "config": {} }))
        .await
        .unwrap();
    assert_eq!(loaded, json!(true));

    provider
        .send(&handle, "execute", json!({ "bindings": { "input": 7 } }))
        .await
        .unwrap();
    let calls = host.calls.lock().await;
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1]["args"], json!(["n", 7]));
    drop(calls);

    let stats = provider.send(&handle, "stats", Value::Null).await.unwrap();
    assert_eq!(stats["executions"], json!(2));
    assert!(stats["memoryBytes"].as_u64().unwrap() >= code.len() as u64);

    provider.destroy(&handle).await.unwrap();
    assert!(handle.is_destroyed().await);
    assert!(matches!(
        provider.send(&handle, "ping", Value::Null).await,
        Err(EngineError::ChannelClosed)
    ));
    provider.destroy(&handle).await.unwrap();
}

#[tokio::test]
async fn test_execute_before_load_fails() {
    let provider = provider();
    let handle = provider
        .create(&manifest("empty"), &[], Arc::new(RecordingHost::default()))
        .await
        .unwrap();
    assert_eq!(handle.variant(), IsolationVariant::Minimal);

    let err = provider.send(&handle, "execute", Value::Null).await.unwrap_err();
    assert!(matches!(err, EngineError::Execution(msg) if msg.contains("No code loaded")));
    provider.destroy(&handle).await.unwrap();
}

#[tokio::test]
async fn test_hung_context_is_destroyed_within_deadline() {
    let provider = provider();
    let host = Arc::new(RecordingHost {
        log_delay: Some(Duration::from_secs(30)),
        ..Default::default()
    });
    let handle = Arc::new(
        provider
            .create(&manifest("stuck"), &[], host)
            .await
            .unwrap(),
    );

    let loading = {
        let handle = Arc::clone(&handle);
        tokio::spawn(async move {
            handle
                .channel()
                .send("load", json!({ "code": "console.log('hi')" }))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let _ = provider.destroy(&handle).await;
    assert!(started.elapsed() < timings().destroy_deadline + Duration::from_millis(200));
    assert!(handle.is_destroyed().await);

    let outcome = loading.await.unwrap();
    assert!(outcome.is_err());
}

#[tokio::test]
async fn test_stray_reply_is_ignored() {
    let ((host_tx, host_rx), (ctx_tx, mut ctx_rx)) = frame_pair();
    let endpoint = Endpoint::new(host_tx, Duration::from_millis(1_000));
    endpoint.start(host_rx, Arc::new(RecordingHost::default()));

    ctx_tx
        .send(Frame::Response(ResponseEnvelope::from_outcome(
            "nobody-asked".to_string(),
            Ok(json!(1)),
        )))
        .await
        .unwrap();

    let responder = tokio::spawn(async move {
        if let Some(Frame::Request(request)) = ctx_rx.recv().await {
            let reply = ResponseEnvelope::from_outcome(request.message_id, Ok(json!("pong")));
            ctx_tx.send(Frame::Response(reply)).await.unwrap();
        }
    });

    assert_eq!(endpoint.send("ping", Value::Null).await.unwrap(), json!("pong"));
    assert_eq!(endpoint.pending_count(), 0);
    responder.await.unwrap();
}

async fn process_manager() -> Arc<PluginManager> {
    let mut config = Config::default();
    config.limits.sample_interval_ms = 60_000;
    config.isolation.minimal = Backend::Process;
    config.isolation.compute = Backend::Process;
    config.isolation.dom = Backend::Process;
    config.isolation.worker_binary = Some(PathBuf::from(env!("CARGO_BIN_EXE_enclave")));

    let isolation = Arc::new(
        IsolationRouter::from_config(&config, Arc::new(CodePatterns::new().unwrap())).unwrap(),
    );
    let manager = Arc::new(
        PluginManager::new(
            config,
            Arc::new(MemoryKvStore::new()),
            isolation,
            Arc::new(MessageBus::new()),
            Arc::new(ManualClock::new(1_000)),
        )
        .unwrap(),
    );
    manager.initialize().await.unwrap();
    manager
}

async fn install_echo(manager: &PluginManager) {
    let package = PluginPackage::from_json(
        &json!({
            "manifest": {
                "id": "echo",
                "name": "Echo",
                "version": "1.0.0",
                "author": "alice",
                "description": "Echoes its input through storage",
                "entry": "index.js",
                "permissions": [
                    { "kind": "storage", "scope": "echo", "description": "Keeps the last input" }
                ]
            },
            "code": "await api.storage.set('last', input)\napi.storage.get('last')"
        })
        .to_string(),
    )
    .unwrap();
    let options = InstallOptions {
        enable_immediately: true,
        ..Default::default()
    };
    manager.install(package, options).await.unwrap();
}

#[tokio::test]
async fn test_process_backend_runs_plugin() {
    let manager = process_manager().await;
    install_echo(&manager).await;

    let info = manager.get("echo").await.unwrap().isolation.unwrap();
    assert_eq!(info.backend, Backend::Process);
    assert_eq!(manager.invoke("echo", json!([1, 2])).await.unwrap(), json!([1, 2]));

    manager.shutdown().await;
    assert!(manager.get("echo").await.unwrap().isolation.is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn test_killed_worker_moves_plugin_to_error() {
    let manager = process_manager().await;
    let mut errors = manager.bus().subscribe(EventType::Error).await;
    install_echo(&manager).await;

    let pid = manager.get("echo").await.unwrap().isolation.unwrap().pid.unwrap();
    let status = std::process::Command::new("kill")
        .arg("-9")
        .arg(pid.to_string())
        .status()
        .unwrap();
    assert!(status.success());

    let deadline = Instant::now() + Duration::from_secs(10);
    while manager.status("echo").await != Some(PluginStatus::Error) {
        assert!(Instant::now() < deadline, "plugin never left enabled");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(manager.get("echo").await.unwrap().isolation.is_none());
    assert!(manager.enabled_plugins().await.is_empty());
    let event = tokio::time::timeout(Duration::from_secs(1), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        event,
        Event::Error { plugin_id: Some(id), kind: ErrorKind::Isolation, .. } if id == "echo"
    ));

    manager.shutdown().await;
}

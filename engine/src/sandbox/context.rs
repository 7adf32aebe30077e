//! Context side of an isolation context
//!
//! A [`SandboxContext`] owns the plugin's code unit and answers the host's
//! requests over its endpoint. Plugin side effects travel back to the host as
//! `api_call` and `log` requests through [`RemoteApi`]; nothing else leaves
//! the context.
//!
//! Requests understood:
//!
//! | type       | payload                 | result                    |
//! |------------|-------------------------|---------------------------|
//! | `load`     | `{code, config}`        | value of the initial run  |
//! | `execute`  | `{bindings?}`           | value of the last API call|
//! | `config`   | `{config}`              | `true`                    |
//! | `stats`    | none                    | usage estimate            |
//! | `ping`     | none                    | `"pong"`                  |
//! | `shutdown` | none                    | `true`, then the context stops |

use super::executor::{ApiInvoker, ExecutionLimits, Interpreter};
use super::parser::{ConsoleLevel, Program};
use crate::isolation::channel::{Endpoint, RequestHandler};
use crate::security::patterns::CodePatterns;
use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::host_api::{ApiCall, LogRecord};
use sdk::manifest::PluginConfig;
use sdk::types::Frame;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};

/// Settings a context is started with
#[derive(Debug, Clone)]
pub struct ContextSettings {
    pub plugin_id: String,
    pub limits: ExecutionLimits,
    /// Deadline for host replies to `api_call` and `log`
    pub reply_timeout: Duration,
}

#[derive(Deserialize)]
struct LoadRequest {
    code: String,
    #[serde(default)]
    config: PluginConfig,
}

#[derive(Deserialize, Default)]
struct ExecuteRequest {
    #[serde(default)]
    bindings: Map<String, Value>,
}

#[derive(Deserialize)]
struct ConfigRequest {
    config: PluginConfig,
}

struct LoadedUnit {
    program: Arc<Program>,
    code_bytes: usize,
}

#[derive(Default)]
struct ContextState {
    unit: Option<LoadedUnit>,
    config: PluginConfig,
    executions: u64,
    variable_bytes: usize,
}

/// Plugin-facing half of an isolation context
pub struct SandboxContext {
    plugin_id: String,
    interpreter: Interpreter,
    api: RemoteApi,
    state: Mutex<ContextState>,
    shutdown: Arc<Notify>,
}

impl SandboxContext {
    fn new(
        settings: ContextSettings,
        patterns: Arc<CodePatterns>,
        endpoint: Weak<Endpoint>,
        shutdown: Arc<Notify>,
    ) -> Self {
        Self {
            plugin_id: settings.plugin_id,
            interpreter: Interpreter::new(patterns, settings.limits),
            api: RemoteApi { endpoint },
            state: Mutex::new(ContextState::default()),
            shutdown,
        }
    }

    async fn load(&self, request: LoadRequest) -> Result<Value, EngineError> {
        let program = Arc::new(self.interpreter.compile(&request.code)?);
        {
            let mut state = self.state.lock().await;
            state.unit = Some(LoadedUnit {
                program: Arc::clone(&program),
                code_bytes: request.code.len(),
            });
            state.config = request.config;
        }
        tracing::debug!("Loaded {} statements for {}", program.len(), self.plugin_id);
        self.run(&program, Map::new()).await
    }

    async fn execute(&self, request: ExecuteRequest) -> Result<Value, EngineError> {
        let program = {
            let state = self.state.lock().await;
            match &state.unit {
                Some(unit) => Arc::clone(&unit.program),
                None => return Err(EngineError::Execution("No code loaded".to_string())),
            }
        };
        self.run(&program, request.bindings).await
    }

    async fn run(&self, program: &Program, bindings: Map<String, Value>) -> Result<Value, EngineError> {
        let config = self.state.lock().await.config.clone();
        let outcome = self
            .interpreter
            .run(program, &config, bindings, &self.api)
            .await?;

        let mut state = self.state.lock().await;
        state.executions += 1;
        state.variable_bytes = outcome.variable_bytes();
        Ok(outcome.result)
    }

    async fn stats(&self) -> Value {
        let state = self.state.lock().await;
        let code_bytes = state.unit.as_ref().map(|u| u.code_bytes).unwrap_or(0);
        let config_bytes = Value::Object(state.config.clone()).to_string().len();
        json!({
            "memoryBytes": code_bytes + config_bytes + state.variable_bytes,
            "codeBytes": code_bytes,
            "variableBytes": state.variable_bytes,
            "executions": state.executions,
        })
    }

    async fn dispatch(&self, kind: &str, payload: Value) -> Result<Value, EngineError> {
        match kind {
            "load" => self.load(parse_payload(payload)?).await,
            "execute" => {
                let request = if payload.is_null() {
                    ExecuteRequest::default()
                } else {
                    parse_payload(payload)?
                };
                self.execute(request).await
            }
            "config" => {
                let request: ConfigRequest = parse_payload(payload)?;
                self.state.lock().await.config = request.config;
                Ok(Value::Bool(true))
            }
            "stats" => Ok(self.stats().await),
            "ping" => Ok(json!("pong")),
            "shutdown" => {
                self.shutdown.notify_one();
                Ok(Value::Bool(true))
            }
            other => Err(EngineError::Execution(format!(
                "Unknown request type: {}",
                other
            ))),
        }
    }
}

#[async_trait]
impl RequestHandler for SandboxContext {
    async fn handle(&self, kind: &str, payload: Value) -> Result<Value, String> {
        self.dispatch(kind, payload).await.map_err(|e| e.to_string())
    }
}

fn parse_payload<T: for<'de> Deserialize<'de>>(payload: Value) -> Result<T, EngineError> {
    serde_json::from_value(payload)
        .map_err(|e| EngineError::Execution(format!("Malformed request: {}", e)))
}

/// Forwards plugin side effects to the host
pub struct RemoteApi {
    endpoint: Weak<Endpoint>,
}

impl RemoteApi {
    fn endpoint(&self) -> Result<Arc<Endpoint>, EngineError> {
        self.endpoint.upgrade().ok_or(EngineError::ChannelClosed)
    }
}

#[async_trait]
impl ApiInvoker for RemoteApi {
    async fn call(
        &self,
        namespace: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, EngineError> {
        let call = ApiCall {
            namespace: namespace.to_string(),
            method: method.to_string(),
            args,
        };
        let payload = serde_json::to_value(call)
            .map_err(|e| EngineError::Execution(format!("Unserializable call: {}", e)))?;
        self.endpoint()?.send("api_call", payload).await
    }

    async fn log(&self, level: ConsoleLevel, message: String) -> Result<(), EngineError> {
        let record = LogRecord {
            level: level.as_str().to_string(),
            message,
        };
        let payload = serde_json::to_value(record)
            .map_err(|e| EngineError::Execution(format!("Unserializable log: {}", e)))?;
        self.endpoint()?.send("log", payload).await.map(|_| ())
    }
}

/// Serve one context until the host asks it to stop or hangs up
pub async fn run_context(
    outbound: mpsc::Sender<Frame>,
    inbound: mpsc::Receiver<Frame>,
    settings: ContextSettings,
    patterns: Arc<CodePatterns>,
) {
    let plugin_id = settings.plugin_id.clone();
    let endpoint = Endpoint::new(outbound, settings.reply_timeout);
    let shutdown = Arc::new(Notify::new());
    let context = Arc::new(SandboxContext::new(
        settings,
        patterns,
        Arc::downgrade(&endpoint),
        Arc::clone(&shutdown),
    ));
    endpoint.start(inbound, context);

    tokio::select! {
        _ = shutdown.notified() => tracing::debug!("Context for {} shutting down", plugin_id),
        _ = endpoint.closed() => tracing::debug!("Host hung up on {}", plugin_id),
    }
    endpoint.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::isolation::channel::frame_pair;

    /// Host side that records calls and answers them
    #[derive(Default)]
    struct FakeHost {
        calls: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl RequestHandler for FakeHost {
        async fn handle(&self, kind: &str, payload: Value) -> Result<Value, String> {
            self.calls.lock().await.push((kind.to_string(), payload.clone()));
            match kind {
                "api_call" if payload["namespace"] == "crypto" => {
                    Err("Permission denied for 'p': crypto not granted".to_string())
                }
                "api_call" => Ok(json!({"echo": payload["args"]})),
                "log" => Ok(Value::Null),
                _ => Err("unexpected".to_string()),
            }
        }
    }

    fn start(host: Arc<FakeHost>) -> (Arc<Endpoint>, tokio::task::JoinHandle<()>) {
        let ((host_tx, host_rx), (ctx_tx, ctx_rx)) = frame_pair();
        let endpoint = Endpoint::new(host_tx, Duration::from_secs(2));
        endpoint.start(host_rx, host);
        let settings = ContextSettings {
            plugin_id: "p".to_string(),
            limits: ExecutionLimits::from(&SandboxConfig::default()),
            reply_timeout: Duration::from_secs(2),
        };
        let patterns = Arc::new(CodePatterns::new().unwrap());
        let task = tokio::spawn(run_context(ctx_tx, ctx_rx, settings, patterns));
        (endpoint, task)
    }

    #[tokio::test]
    async fn test_load_and_execute() {
        let host = Arc::new(FakeHost::default());
        let (endpoint, _task) = start(Arc::clone(&host));

        let result = endpoint
            .send(
                "load",
                json!({"code": "console.info('up', config.n)\napi.storage.get(config.n)", "config": {"n": 3}}),
            )
            .await
            .unwrap();
        assert_eq!(result, json!({"echo": [3]}));

        let calls = host.calls.lock().await.clone();
        assert_eq!(calls[0].0, "log");
        assert_eq!(calls[0].1, json!({"level": "info", "message": "up 3"}));

        endpoint
            .send("config", json!({"config": {"n": 4}}))
            .await
            .unwrap();
        let result = endpoint.send("execute", Value::Null).await.unwrap();
        assert_eq!(result, json!({"echo": [4]}));

        let stats = endpoint.send("stats", Value::Null).await.unwrap();
        assert_eq!(stats["executions"], json!(2));
    }

    #[tokio::test]
    async fn test_rejected_code_is_reported() {
        let host = Arc::new(FakeHost::default());
        let (endpoint, _task) = start(host);

        let err = endpoint
            .send("load", json!({"code": "result = 1 + 2"}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Execution(msg) if msg.contains("line 1")));
    }

    #[tokio::test]
    async fn test_host_denial_fails_the_run() {
        let host = Arc::new(FakeHost::default());
        let (endpoint, _task) = start(host);

        let err = endpoint
            .send("load", json!({"code": "api.crypto.hash('x')"}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Execution(msg) if msg.contains("Permission denied")));
    }

    #[tokio::test]
    async fn test_execute_before_load() {
        let host = Arc::new(FakeHost::default());
        let (endpoint, _task) = start(host);
        assert!(endpoint.send("execute", Value::Null).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_stops_context() {
        let host = Arc::new(FakeHost::default());
        let (endpoint, task) = start(host);

        assert_eq!(endpoint.send("shutdown", Value::Null).await.unwrap(), json!(true));
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}

//! Bounded execution of parsed plugin code
//!
//! A code unit is screened against the denylist, parsed into a [`Program`],
//! and run statement by statement. `api.*` and `console.*` statements are
//! delegated to an [`ApiInvoker`]; everything else only touches the local
//! variable table. The result of a run is the value of the last API call.

use super::parser::{self, ConsoleLevel, Expr, Program, Statement};
use crate::config::SandboxConfig;
use crate::security::patterns::CodePatterns;
use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::manifest::PluginConfig;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// Receiver of the side effects a program may have
#[async_trait]
pub trait ApiInvoker: Send + Sync {
    /// `api.<namespace>.<method>(args)`
    async fn call(&self, namespace: &str, method: &str, args: Vec<Value>)
        -> Result<Value, EngineError>;

    /// `console.<level>(message)`
    async fn log(&self, level: ConsoleLevel, message: String) -> Result<(), EngineError>;
}

/// Execution ceilings applied to every run
#[derive(Debug, Clone, Copy)]
pub struct ExecutionLimits {
    pub max_code_bytes: usize,
    pub max_execution_ms: u64,
    pub max_statements: usize,
    pub max_variable_bytes: usize,
}

impl From<&SandboxConfig> for ExecutionLimits {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            max_code_bytes: config.max_code_bytes,
            max_execution_ms: config.max_execution_ms,
            max_statements: config.max_statements,
            max_variable_bytes: config.max_variable_bytes,
        }
    }
}

/// What a completed run produced
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    /// Value of the last API call, null when there was none
    pub result: Value,
    pub variables: Map<String, Value>,
    pub api_calls: usize,
    pub statements: usize,
}

impl ExecutionOutcome {
    /// Approximate bytes held by the variable table
    pub fn variable_bytes(&self) -> usize {
        variable_bytes(&self.variables)
    }
}

/// Restricted interpreter for plugin code
#[derive(Clone)]
pub struct Interpreter {
    patterns: Arc<CodePatterns>,
    limits: ExecutionLimits,
}

impl Interpreter {
    pub fn new(patterns: Arc<CodePatterns>, limits: ExecutionLimits) -> Self {
        Self { patterns, limits }
    }

    pub fn limits(&self) -> ExecutionLimits {
        self.limits
    }

    /// Screen and parse a code unit
    ///
    /// Rejected before any statement runs when the code is too large, matches
    /// the denylist, contains an unsupported line or has too many statements.
    pub fn compile(&self, code: &str) -> Result<Program, EngineError> {
        if code.len() > self.limits.max_code_bytes {
            return Err(EngineError::CodeRejected(format!(
                "code is {} bytes, limit is {}",
                code.len(),
                self.limits.max_code_bytes
            )));
        }

        if let Some(hit) = self.patterns.first_hit(code) {
            return Err(EngineError::CodeRejected(format!(
                "{} on line {}",
                hit.label, hit.line
            )));
        }

        let program = parser::parse(code)?;
        if program.len() > self.limits.max_statements {
            return Err(EngineError::CodeRejected(format!(
                "{} statements, limit is {}",
                program.len(),
                self.limits.max_statements
            )));
        }
        Ok(program)
    }

    /// Run a compiled program under the execution time bound
    ///
    /// `bindings` seeds the variable table (hook payloads, event data).
    pub async fn run(
        &self,
        program: &Program,
        config: &PluginConfig,
        bindings: Map<String, Value>,
        api: &dyn ApiInvoker,
    ) -> Result<ExecutionOutcome, EngineError> {
        let millis = self.limits.max_execution_ms;
        tokio::time::timeout(
            Duration::from_millis(millis),
            self.run_unbounded(program, config, bindings, api),
        )
        .await
        .map_err(|_| EngineError::timeout("plugin code execution", millis))?
    }

    /// Compile and run in one step
    pub async fn execute(
        &self,
        code: &str,
        config: &PluginConfig,
        api: &dyn ApiInvoker,
    ) -> Result<ExecutionOutcome, EngineError> {
        let program = self.compile(code)?;
        self.run(&program, config, Map::new(), api).await
    }

    async fn run_unbounded(
        &self,
        program: &Program,
        config: &PluginConfig,
        bindings: Map<String, Value>,
        api: &dyn ApiInvoker,
    ) -> Result<ExecutionOutcome, EngineError> {
        let mut outcome = ExecutionOutcome {
            variables: bindings,
            ..Default::default()
        };

        for line in &program.lines {
            outcome.statements += 1;
            match &line.statement {
                Statement::Console { level, args } => {
                    let message = args
                        .iter()
                        .map(|arg| render(&resolve(arg, &outcome.variables, config)))
                        .collect::<Vec<_>>()
                        .join(" ");
                    api.log(*level, message).await?;
                }
                Statement::ApiCall {
                    namespace,
                    method,
                    args,
                } => {
                    let args = args
                        .iter()
                        .map(|arg| resolve(arg, &outcome.variables, config))
                        .collect();
                    outcome.result = api.call(namespace, method, args).await?;
                    outcome.api_calls += 1;
                }
                Statement::Assign { name, value } => {
                    let value = resolve(value, &outcome.variables, config);
                    outcome.variables.insert(name.clone(), value);
                    let used = variable_bytes(&outcome.variables);
                    if used > self.limits.max_variable_bytes {
                        return Err(EngineError::Execution(format!(
                            "variables use {} bytes on line {}, limit is {}",
                            used, line.number, self.limits.max_variable_bytes
                        )));
                    }
                }
            }
        }

        Ok(outcome)
    }
}

/// Evaluate an expression against the variable table and plugin config
///
/// Unknown identifiers evaluate to their own name; unknown config keys to null.
pub fn resolve(expr: &Expr, variables: &Map<String, Value>, config: &PluginConfig) -> Value {
    match expr {
        Expr::Literal(value) => value.clone(),
        Expr::Ident(name) => variables
            .get(name)
            .cloned()
            .unwrap_or_else(|| Value::String(name.clone())),
        Expr::Config(None) => Value::Object(config.clone()),
        Expr::Config(Some(key)) => config.get(key).cloned().unwrap_or(Value::Null),
        Expr::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve(item, variables, config))
                .collect(),
        ),
        Expr::Object(entries) => Value::Object(
            entries
                .iter()
                .map(|(key, value)| (key.clone(), resolve(value, variables, config)))
                .collect(),
        ),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn variable_bytes(variables: &Map<String, Value>) -> usize {
    variables
        .iter()
        .map(|(name, value)| name.len() + value.to_string().len())
        .sum()
}

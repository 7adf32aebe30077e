//! Secure execution engine
//!
//! Plugin code runs through a restricted interpreter rather than a general
//! evaluator: a line-oriented statement recognizer ([`parser`]), a bounded
//! executor ([`executor`]) and the context-side request loop ([`context`])
//! that every isolation backend runs.

pub mod context;
pub mod executor;
pub mod parser;

pub use context::{run_context, ContextSettings, SandboxContext};
pub use executor::{ApiInvoker, ExecutionLimits, ExecutionOutcome, Interpreter};
pub use parser::{parse, ConsoleLevel, Expr, Program, Statement};

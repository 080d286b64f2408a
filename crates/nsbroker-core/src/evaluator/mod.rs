//! Code execution capability.
//!
//! The broker never interprets code itself; it hands code and expression text
//! to an [`Evaluator`] together with a [`Scope`] over the target namespace.
//! [`ScriptEvaluator`] is the built-in implementation, a small line-oriented
//! language:
//!
//! ```text
//! counter = counter + 1        # assignment, also += and -=
//! items = [1, 2.5, "three"]; m = {"k": items}
//! del m["k"]
//! rv = broker.read_rv("1700000000.000001-1", -1)
//! ```
//!
//! Expressions support arithmetic, comparisons, `and`/`or`/`not`, indexing
//! and the builtins `len str int float type sleep fail`.

mod interpreter;
mod lexer;
mod parser;

pub use interpreter::ScriptEvaluator;

use crate::engine::Scope;
use crate::value::Value;
use std::fmt;

/// Runs code and evaluates expressions against a namespace.
///
/// Implementations report failures as formatted text; the execution engine
/// stores that text in the reply, it never travels as a live error object.
/// Calls happen on blocking threads and may take arbitrarily long.
pub trait Evaluator: Send + Sync + 'static {
    /// Run statements for their side effects on the scope.
    fn run(&self, scope: &mut Scope<'_>, code: &str) -> Result<(), String>;

    /// Evaluate one expression.
    fn eval(&self, scope: &mut Scope<'_>, expr: &str) -> Result<Value, String>;
}

/// A failure inside the script language, formatted `<Kind>Error: <message> (line N)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptError {
    pub kind: &'static str,
    pub message: String,
    pub line: usize,
}

impl ScriptError {
    pub fn new(kind: &'static str, message: impl Into<String>, line: usize) -> Self {
        Self {
            kind,
            message: message.into(),
            line,
        }
    }

    pub fn syntax(message: impl Into<String>, line: usize) -> Self {
        Self::new("Syntax", message, line)
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Error: {} (line {})", self.kind, self.message, self.line)
    }
}

impl std::error::Error for ScriptError {}

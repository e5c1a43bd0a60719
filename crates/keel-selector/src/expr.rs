//! Expression evaluator seam
//!
//! The engine treats the expression language as an opaque boolean/value
//! evaluator over a named-root object graph. Hosts plug a full CEL
//! implementation here; [`crate::basic::BasicEvaluator`] ships as the
//! default.

use crate::error::ExpressionError;
use serde_json::Value;
use std::collections::BTreeMap;

/// Named roots an expression can reference, e.g. `resource`,
/// `environment`, `version`, `from`, `to`.
#[derive(Debug, Clone, Default)]
pub struct ExpressionContext {
    roots: BTreeMap<String, Value>,
}

impl ExpressionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a root object.
    pub fn with_root(mut self, name: impl Into<String>, value: Value) -> Self {
        self.roots.insert(name.into(), value);
        self
    }

    pub fn root(&self, name: &str) -> Option<&Value> {
        self.roots.get(name)
    }
}

/// Opaque boolean/value evaluator over a named-root object graph.
///
/// Implementations must be pure: the same expression and context always
/// produce the same result, with no side effects.
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluate to a value.
    fn evaluate(&self, expression: &str, context: &ExpressionContext)
        -> Result<Value, ExpressionError>;

    /// Evaluate to a boolean; non-boolean results are an error.
    fn evaluate_bool(
        &self,
        expression: &str,
        context: &ExpressionContext,
    ) -> Result<bool, ExpressionError> {
        match self.evaluate(expression, context)? {
            Value::Bool(b) => Ok(b),
            _ => Err(ExpressionError::NotABoolean),
        }
    }
}

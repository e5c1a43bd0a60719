//! Selector evaluation errors

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SelectorError>;

/// Errors surfaced by selector evaluation. Callers on the reconcile
/// path treat any of these as "does not match" and keep going.
#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("expression error: {0}")]
    Expression(#[from] ExpressionError),
}

/// Errors from the expression evaluator seam.
#[derive(Debug, Error)]
pub enum ExpressionError {
    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("unknown root `{0}`")]
    UnknownRoot(String),

    #[error("unknown function `{0}`")]
    UnknownFunction(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("expression did not evaluate to a boolean")]
    NotABoolean,
}

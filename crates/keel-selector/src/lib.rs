//! KEEL Selector - Selector evaluation engine
//!
//! Evaluates the two selector representations ([`keel_types::Selector`])
//! against entities:
//!
//! - **Condition trees** are walked directly against a uniform subject
//!   view (id, name, kind, metadata).
//! - **Expressions** go through the [`ExpressionEvaluator`] seam. The
//!   engine treats the expression language as opaque; hosts plug a full
//!   CEL implementation, and [`BasicEvaluator`] ships as the default.
//!
//! Failure semantics: a selector that fails to compile or evaluate
//! admits nothing. The failure is logged and reported to the caller's
//! trace; it never propagates.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod basic;
pub mod engine;
pub mod error;
pub mod expr;
pub mod subject;

// Re-exports
pub use basic::BasicEvaluator;
pub use engine::SelectorEngine;
pub use error::{ExpressionError, Result, SelectorError};
pub use expr::{ExpressionContext, ExpressionEvaluator};
pub use subject::SelectorSubject;

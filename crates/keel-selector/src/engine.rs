//! Selector engine
//!
//! Evaluates both selector variants against subjects, caches compiled
//! selectors by hash, and never lets an evaluation failure escape the
//! reconcile path: `admits` degrades to `false` with a warning.

use crate::basic::BasicEvaluator;
use crate::error::{Result, SelectorError};
use crate::expr::{ExpressionContext, ExpressionEvaluator};
use crate::subject::SelectorSubject;
use dashmap::DashMap;
use keel_types::{ConditionNode, Selector};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::warn;

/// Compiled selector kept in the cache.
enum CompiledSelector {
    Tree(Arc<ConditionNode>),
    Cel(Arc<str>),
}

/// Shared selector evaluation service.
pub struct SelectorEngine {
    evaluator: Arc<dyn ExpressionEvaluator>,
    cache: DashMap<String, Arc<CompiledSelector>>,
}

impl SelectorEngine {
    /// Create an engine backed by a host-provided expression evaluator.
    pub fn new(evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        Self {
            evaluator,
            cache: DashMap::new(),
        }
    }

    /// Create an engine backed by the built-in evaluator.
    pub fn with_basic_evaluator() -> Self {
        Self::new(Arc::new(BasicEvaluator::new()))
    }

    /// The underlying expression evaluator (shared with verification).
    pub fn evaluator(&self) -> Arc<dyn ExpressionEvaluator> {
        self.evaluator.clone()
    }

    /// Evaluate a selector against a subject.
    pub fn evaluate(&self, selector: &Selector, subject: &SelectorSubject) -> Result<bool> {
        match self.compile(selector).as_ref() {
            CompiledSelector::Tree(root) => Ok(eval_node(root, subject)),
            CompiledSelector::Cel(expression) => {
                let context =
                    ExpressionContext::new().with_root(subject.root, subject.json.clone());
                self.evaluator
                    .evaluate_bool(expression, &context)
                    .map_err(SelectorError::from)
            }
        }
    }

    /// Evaluate, degrading failures to `false`. The standard entry
    /// point on the reconcile path: selectors never crash the host.
    pub fn admits(&self, selector: &Selector, subject: &SelectorSubject) -> bool {
        match self.evaluate(selector, subject) {
            Ok(matched) => matched,
            Err(error) => {
                warn!(
                    root = subject.root,
                    subject_id = %subject.id,
                    %error,
                    "selector evaluation failed; treating as non-match"
                );
                false
            }
        }
    }

    /// Evaluate an optional selector; absent selectors admit everything.
    pub fn admits_opt(&self, selector: Option<&Selector>, subject: &SelectorSubject) -> bool {
        match selector {
            Some(selector) => self.admits(selector, subject),
            None => true,
        }
    }

    /// Evaluate a pair expression with `from`/`to` roots (relationship
    /// matchers).
    pub fn evaluate_pair(&self, expression: &str, from: &Value, to: &Value) -> Result<bool> {
        let context = ExpressionContext::new()
            .with_root("from", from.clone())
            .with_root("to", to.clone());
        self.evaluator
            .evaluate_bool(expression, &context)
            .map_err(SelectorError::from)
    }

    fn compile(&self, selector: &Selector) -> Arc<CompiledSelector> {
        let key = selector_hash(selector);
        if let Some(compiled) = self.cache.get(&key) {
            return compiled.clone();
        }
        let compiled = Arc::new(match selector {
            Selector::Tree { root } => CompiledSelector::Tree(Arc::new(root.clone())),
            Selector::Cel { expression } => CompiledSelector::Cel(Arc::from(expression.as_str())),
        });
        self.cache.insert(key, compiled.clone());
        compiled
    }

    /// Number of cached compiled selectors.
    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }
}

fn selector_hash(selector: &Selector) -> String {
    let encoded = serde_json::to_vec(selector).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    format!("{:x}", hasher.finalize())
}

fn eval_node(node: &ConditionNode, subject: &SelectorSubject) -> bool {
    match node {
        ConditionNode::And { conditions } => conditions.iter().all(|c| eval_node(c, subject)),
        ConditionNode::Or { conditions } => conditions.iter().any(|c| eval_node(c, subject)),
        ConditionNode::Not { condition } => !eval_node(condition, subject),
        ConditionNode::Metadata {
            key,
            operator,
            value,
        } => subject
            .metadata
            .get(key)
            .map(|candidate| operator.matches(candidate, value))
            .unwrap_or(false),
        ConditionNode::Name { operator, value } => operator.matches(&subject.name, value),
        ConditionNode::Kind { operator, value } => operator.matches(&subject.kind, value),
        ConditionNode::Id { operator, value } => operator.matches(&subject.id, value),
    }
}

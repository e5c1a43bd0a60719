//! Selector types
//!
//! Selectors scope deployments, environments, policies, and relationship
//! rules to sets of entities. Two representations exist: a CEL expression
//! evaluated against a named root object, and a recursive condition tree.
//! Evaluation lives in `keel-selector`; only the shapes are defined here.

use serde::{Deserialize, Serialize};

/// A selector over entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Selector {
    /// CEL expression evaluated against a named root (`resource`,
    /// `environment`, `deployment`, `version`, `from`, `to`).
    Cel {
        expression: String,
    },

    /// Recursive condition tree.
    Tree {
        root: ConditionNode,
    },
}

impl Selector {
    /// Shorthand for a CEL selector.
    pub fn cel(expression: impl Into<String>) -> Self {
        Self::Cel {
            expression: expression.into(),
        }
    }

    /// Shorthand for a condition-tree selector.
    pub fn tree(root: ConditionNode) -> Self {
        Self::Tree { root }
    }
}

/// One node of a condition tree: a combinator or a leaf predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionNode {
    /// All children must match.
    And { conditions: Vec<ConditionNode> },

    /// At least one child must match.
    Or { conditions: Vec<ConditionNode> },

    /// Child must not match.
    Not { condition: Box<ConditionNode> },

    /// Match against a metadata entry.
    Metadata {
        key: String,
        operator: ConditionOperator,
        value: String,
    },

    /// Match against the entity name.
    Name {
        operator: ConditionOperator,
        value: String,
    },

    /// Match against the entity kind.
    Kind {
        operator: ConditionOperator,
        value: String,
    },

    /// Match against the entity id.
    Id {
        operator: ConditionOperator,
        value: String,
    },
}

impl ConditionNode {
    pub fn and(conditions: Vec<ConditionNode>) -> Self {
        Self::And { conditions }
    }

    pub fn or(conditions: Vec<ConditionNode>) -> Self {
        Self::Or { conditions }
    }

    pub fn not(condition: ConditionNode) -> Self {
        Self::Not {
            condition: Box::new(condition),
        }
    }

    pub fn metadata(
        key: impl Into<String>,
        operator: ConditionOperator,
        value: impl Into<String>,
    ) -> Self {
        Self::Metadata {
            key: key.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn name(operator: ConditionOperator, value: impl Into<String>) -> Self {
        Self::Name {
            operator,
            value: value.into(),
        }
    }

    pub fn kind_equals(value: impl Into<String>) -> Self {
        Self::Kind {
            operator: ConditionOperator::Equals,
            value: value.into(),
        }
    }

    pub fn id_equals(value: impl Into<String>) -> Self {
        Self::Id {
            operator: ConditionOperator::Equals,
            value: value.into(),
        }
    }
}

/// Leaf comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    StartsWith,
    EndsWith,
    Contains,
}

impl ConditionOperator {
    /// Apply the operator to a candidate value.
    pub fn matches(&self, candidate: &str, value: &str) -> bool {
        match self {
            Self::Equals => candidate == value,
            Self::StartsWith => candidate.starts_with(value),
            Self::EndsWith => candidate.ends_with(value),
            Self::Contains => candidate.contains(value),
        }
    }
}

/// Selector scoping a policy to (deployment, environment, resource)
/// triples. Absent members admit everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetSelector {
    /// Scope by deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<Selector>,

    /// Scope by environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Selector>,

    /// Scope by resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Selector>,
}

impl TargetSelector {
    /// A selector admitting every target.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_environment(mut self, selector: Selector) -> Self {
        self.environment = Some(selector);
        self
    }

    pub fn with_deployment(mut self, selector: Selector) -> Self {
        self.deployment = Some(selector);
        self
    }

    pub fn with_resource(mut self, selector: Selector) -> Self {
        self.resource = Some(selector);
        self
    }
}

//! Relationship rules
//!
//! Rules derive named edges between entities. The relationship index
//! in `keel-index` materializes them; variable references and policy
//! contexts traverse them.

use crate::selector::Selector;
use crate::{RelationshipRuleId, WorkspaceId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Entity classes a relationship rule can connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipEntityType {
    Resource,
    Deployment,
    Environment,
}

impl fmt::Display for RelationshipEntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Resource => "resource",
            Self::Deployment => "deployment",
            Self::Environment => "environment",
        };
        f.write_str(name)
    }
}

/// How candidate pairs are matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelationshipMatcher {
    /// A property on the `from` entity equals a property on the `to`
    /// entity, both addressed by JSON path.
    Property {
        from_path: Vec<String>,
        to_path: Vec<String>,
        operator: PropertyOperator,
    },

    /// CEL expression over roots `from` and `to`.
    Cel { expression: String },
}

/// Property matcher operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyOperator {
    Equals,
}

/// Declarative rule producing `(from, reference_name) -> to` edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRule {
    /// Unique rule identifier
    pub id: RelationshipRuleId,

    /// Owning workspace
    pub workspace_id: WorkspaceId,

    /// Entity class on the `from` side
    pub from_type: RelationshipEntityType,

    /// Entity class on the `to` side
    pub to_type: RelationshipEntityType,

    /// Edge name, e.g. "vpc"
    pub reference_name: String,

    /// Restricts `from` candidates; absent admits all of `from_type`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_selector: Option<Selector>,

    /// Restricts `to` candidates; absent admits all of `to_type`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_selector: Option<Selector>,

    /// Pair matcher
    pub matcher: RelationshipMatcher,
}

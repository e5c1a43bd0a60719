//! Deployment and resource variables
//!
//! Variables feed the frozen variable snapshot of a release. Values are
//! either literals or references resolved through the relationship graph
//! at materialization time.

use crate::selector::Selector;
use crate::{DeploymentId, ResourceId, VariableId, VariableValueId, WorkspaceId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A variable value: a literal, or a reference following a named
/// relationship edge and reading a path off the related entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VariableValue {
    Literal {
        value: Value,
    },
    Reference {
        reference_name: String,
        path: Vec<String>,
    },
}

impl VariableValue {
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal {
            value: value.into(),
        }
    }

    pub fn reference(reference_name: impl Into<String>, path: Vec<&str>) -> Self {
        Self::Reference {
            reference_name: reference_name.into(),
            path: path.into_iter().map(str::to_string).collect(),
        }
    }
}

/// A variable key declared on a deployment, with an optional default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentVariable {
    /// Unique variable identifier
    pub id: VariableId,

    /// Owning workspace
    pub workspace_id: WorkspaceId,

    /// Deployment the key is declared on
    pub deployment_id: DeploymentId,

    /// Variable key
    pub key: String,

    /// Fallback when no value's selector admits the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

/// One candidate value for a deployment variable, scoped by a resource
/// selector and ranked by priority (higher wins).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentVariableValue {
    /// Unique value identifier
    pub id: VariableValueId,

    /// Owning workspace
    pub workspace_id: WorkspaceId,

    /// Variable this value belongs to
    pub variable_id: VariableId,

    /// The value
    pub value: VariableValue,

    /// Which resources this value applies to; absent admits all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_selector: Option<Selector>,

    /// Higher priority wins among admitting values
    #[serde(default)]
    pub priority: i64,
}

/// A variable pinned directly on a resource; beats every
/// deployment-level value for the same key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceVariable {
    /// Owning workspace
    pub workspace_id: WorkspaceId,

    /// Resource the variable is pinned on
    pub resource_id: ResourceId,

    /// Variable key
    pub key: String,

    /// The value
    pub value: VariableValue,
}

impl ResourceVariable {
    /// Store key: one variable per (resource, key).
    pub fn store_key(resource_id: &ResourceId, key: &str) -> String {
        format!("{resource_id}:{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_variable_value_serde() {
        let literal = VariableValue::literal(json!({"port": 8080}));
        let json = serde_json::to_value(&literal).unwrap();
        assert_eq!(json["type"], "literal");

        let reference = VariableValue::reference("vpc", vec!["metadata", "cidr"]);
        let json = serde_json::to_value(&reference).unwrap();
        assert_eq!(json["type"], "reference");
        assert_eq!(json["path"], json!(["metadata", "cidr"]));
    }
}

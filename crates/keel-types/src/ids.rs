//! Typed identifiers for all engine entities
//!
//! Ids arrive as opaque strings on external events; the newtypes keep
//! the different entity spaces from being mixed up at compile time.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an externally supplied id.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a fresh random id.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Root aggregate id; every entity carries one.
    WorkspaceId
);
string_id!(SystemId);
string_id!(DeploymentId);
string_id!(EnvironmentId);
string_id!(ResourceId);
string_id!(ResourceProviderId);
string_id!(JobAgentId);
string_id!(VersionId);
string_id!(VariableId);
string_id!(VariableValueId);
string_id!(PolicyId);
string_id!(RuleId);
string_id!(SkipId);
string_id!(RelationshipRuleId);
string_id!(ReleaseId);
string_id!(JobId);
string_id!(VerificationId);
string_id!(WorkflowId);
string_id!(WorkflowTemplateId);
string_id!(WorkflowRunId);
string_id!(WorkflowStepId);
string_id!(UserId);

//! Systems group deployments and environments
//!
//! Membership is editable via link/unlink events; deployments and
//! environments record their owning system plus any additional links.

use crate::{SystemId, WorkspaceId};
use serde::{Deserialize, Serialize};

/// Logical grouping of deployments and environments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct System {
    /// Unique system identifier
    pub id: SystemId,

    /// Owning workspace
    pub workspace_id: WorkspaceId,

    /// Display name
    pub name: String,

    /// Optional description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl System {
    pub fn new(
        id: impl Into<SystemId>,
        workspace_id: impl Into<WorkspaceId>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            workspace_id: workspace_id.into(),
            name: name.into(),
            description: None,
        }
    }
}

//! Environments

use crate::selector::Selector;
use crate::{EnvironmentId, SystemId, WorkspaceId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A deployment stage (staging, production, ...). Its resource selector
/// scopes which resources belong to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    /// Unique environment identifier
    pub id: EnvironmentId,

    /// Owning workspace
    pub workspace_id: WorkspaceId,

    /// Owning system
    pub system_id: SystemId,

    /// Display name
    pub name: String,

    /// Which resources belong to this environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_selector: Option<Selector>,

    /// Additional systems this environment is linked into
    #[serde(default)]
    pub linked_systems: BTreeSet<SystemId>,
}

impl Environment {
    pub fn new(
        id: impl Into<EnvironmentId>,
        workspace_id: impl Into<WorkspaceId>,
        system_id: impl Into<SystemId>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            workspace_id: workspace_id.into(),
            system_id: system_id.into(),
            name: name.into(),
            resource_selector: None,
            linked_systems: BTreeSet::new(),
        }
    }

    /// Systems this environment belongs to: the owner plus explicit links.
    pub fn system_ids(&self) -> impl Iterator<Item = &SystemId> {
        std::iter::once(&self.system_id).chain(self.linked_systems.iter())
    }
}

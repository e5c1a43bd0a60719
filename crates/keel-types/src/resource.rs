//! Resources and resource providers

use crate::config::ConfigMap;
use crate::{ResourceId, ResourceProviderId, WorkspaceId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A target of deployment: a cluster, a VM, an account, anything a
/// selector can address by kind, name, identifier, or metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Unique resource identifier
    pub id: ResourceId,

    /// Owning workspace
    pub workspace_id: WorkspaceId,

    /// Display name
    pub name: String,

    /// Resource kind, e.g. "Kubernetes"
    pub kind: String,

    /// External identifier within the provider's namespace
    pub identifier: String,

    /// Selector-addressable metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// Schemaless resource config; unknown keys round-trip
    #[serde(default)]
    pub config: ConfigMap,

    /// Provider that registered this resource, if any. Nulled when the
    /// provider is deleted; the resource itself survives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<ResourceProviderId>,
}

impl Resource {
    pub fn new(
        id: impl Into<ResourceId>,
        workspace_id: impl Into<WorkspaceId>,
        name: impl Into<String>,
        kind: impl Into<String>,
        identifier: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            workspace_id: workspace_id.into(),
            name: name.into(),
            kind: kind.into(),
            identifier: identifier.into(),
            metadata: BTreeMap::new(),
            config: ConfigMap::new(),
            provider_id: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Registers and owns resources on behalf of an external scanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceProvider {
    /// Unique provider identifier
    pub id: ResourceProviderId,

    /// Owning workspace
    pub workspace_id: WorkspaceId,

    /// Display name
    pub name: String,

    /// Free-form metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ResourceProvider {
    pub fn new(
        id: impl Into<ResourceProviderId>,
        workspace_id: impl Into<WorkspaceId>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            workspace_id: workspace_id.into(),
            name: name.into(),
            metadata: BTreeMap::new(),
        }
    }
}

//! GitHub installation entities

use crate::WorkspaceId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A GitHub org/repo installation backing github-kind job agents.
/// Compound key: `(slug, installation_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GithubEntity {
    /// Owning workspace
    pub workspace_id: WorkspaceId,

    /// Org or repo slug
    pub slug: String,

    /// GitHub app installation id
    pub installation_id: i64,

    /// Free-form metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl GithubEntity {
    /// Store key combining the compound key parts.
    pub fn store_key(slug: &str, installation_id: i64) -> String {
        format!("{slug}:{installation_id}")
    }

    pub fn key(&self) -> String {
        Self::store_key(&self.slug, self.installation_id)
    }
}

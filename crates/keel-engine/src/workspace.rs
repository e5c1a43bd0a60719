//! Workspace aggregate
//!
//! One workspace = the fact store plus its derived indexes, guarded by
//! a single lock owned by the registry. Everything here runs under that
//! lock.

use chrono::{DateTime, Utc};
use keel_index::{RelationshipIndex, ReleaseTargetIndex};
use keel_selector::SelectorEngine;
use keel_store::{WorkspaceSnapshot, WorkspaceStore};
use keel_types::WorkspaceId;

/// A workspace's store and derived indexes.
pub struct Workspace {
    pub store: WorkspaceStore,
    pub relationships: RelationshipIndex,
    pub targets: ReleaseTargetIndex,
}

impl Workspace {
    /// Fresh, empty workspace.
    pub fn new(workspace_id: impl Into<WorkspaceId>) -> Self {
        Self {
            store: WorkspaceStore::new(workspace_id),
            relationships: RelationshipIndex::new(),
            targets: ReleaseTargetIndex::new(),
        }
    }

    /// Rebuild from a snapshot. Derived indexes are not serialized;
    /// they start fully dirty and rematerialize on the first recompute.
    pub fn from_snapshot(
        snapshot: &WorkspaceSnapshot,
        selectors: &SelectorEngine,
    ) -> keel_store::Result<Self> {
        let store = snapshot.restore()?;
        let mut workspace = Self {
            store,
            relationships: RelationshipIndex::new(),
            targets: ReleaseTargetIndex::new(),
        };
        workspace.relationships.recompute(&workspace.store, selectors);
        workspace.targets.recompute(&workspace.store, selectors);
        // Index rebuilds themselves never count as fact changes.
        workspace.store.drain_changes();
        Ok(workspace)
    }

    /// Capture a snapshot of the store.
    pub fn snapshot(&self, now: DateTime<Utc>) -> keel_store::Result<WorkspaceSnapshot> {
        WorkspaceSnapshot::capture(&self.store, now)
    }

    pub fn workspace_id(&self) -> &WorkspaceId {
        self.store.workspace_id()
    }
}

//! Workspace registry
//!
//! Owns workspace lifecycle for the host process: `get_or_load` brings
//! a workspace into memory (restoring its snapshot when one exists),
//! `remove` drains and snapshots it back out. Each workspace is guarded
//! by one `tokio::sync::Mutex`; event handlers hold it for the full
//! event including recompute.

use crate::workspace::Workspace;
use chrono::Utc;
use dashmap::DashMap;
use keel_selector::SelectorEngine;
use keel_store::{SnapshotStorage, WorkspaceSnapshot};
use keel_types::WorkspaceId;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Shared handle to one workspace.
pub type WorkspaceHandle = Arc<Mutex<Workspace>>;

/// Registry of live workspaces.
pub struct WorkspaceRegistry {
    workspaces: DashMap<WorkspaceId, WorkspaceHandle>,
    storage: Arc<dyn SnapshotStorage>,
}

impl WorkspaceRegistry {
    pub fn new(storage: Arc<dyn SnapshotStorage>) -> Self {
        Self {
            workspaces: DashMap::new(),
            storage,
        }
    }

    /// Fetch a live workspace, loading it from storage on first touch.
    /// Absent snapshots produce a fresh, empty workspace.
    pub async fn get_or_load(
        &self,
        workspace_id: &WorkspaceId,
        selectors: &SelectorEngine,
    ) -> keel_store::Result<WorkspaceHandle> {
        if let Some(handle) = self.workspaces.get(workspace_id) {
            return Ok(handle.clone());
        }

        let workspace = match self.storage.load(workspace_id).await? {
            Some(snapshot) => {
                info!(%workspace_id, entities = snapshot.metadata.entity_count, "restoring workspace from snapshot");
                Workspace::from_snapshot(&snapshot, selectors)?
            }
            None => Workspace::new(workspace_id.clone()),
        };

        // A concurrent load may have won; keep the first handle.
        let handle = self
            .workspaces
            .entry(workspace_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(workspace)))
            .clone();
        Ok(handle)
    }

    /// The live handle, if the workspace is loaded.
    pub fn get(&self, workspace_id: &WorkspaceId) -> Option<WorkspaceHandle> {
        self.workspaces.get(workspace_id).map(|h| h.clone())
    }

    /// Snapshot a live workspace to storage without evicting it.
    pub async fn snapshot(&self, workspace_id: &WorkspaceId) -> keel_store::Result<Option<WorkspaceSnapshot>> {
        let Some(handle) = self.get(workspace_id) else {
            return Ok(None);
        };
        let snapshot = {
            let workspace = handle.lock().await;
            workspace.snapshot(Utc::now())?
        };
        self.storage.save(snapshot.clone()).await?;
        Ok(Some(snapshot))
    }

    /// Drain a workspace out of memory: snapshot, persist, evict.
    pub async fn remove(&self, workspace_id: &WorkspaceId) -> keel_store::Result<()> {
        if let Some(handle) = self.get(workspace_id) {
            let snapshot = {
                let workspace = handle.lock().await;
                workspace.snapshot(Utc::now())?
            };
            self.storage.save(snapshot).await?;
        }
        self.workspaces.remove(workspace_id);
        info!(%workspace_id, "workspace removed from registry");
        Ok(())
    }

    /// Number of live workspaces.
    pub fn len(&self) -> usize {
        self.workspaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workspaces.is_empty()
    }

    /// Ids of every live workspace.
    pub fn workspace_ids(&self) -> Vec<WorkspaceId> {
        self.workspaces.iter().map(|e| e.key().clone()).collect()
    }
}

//! Evaluation context

use chrono::{DateTime, Utc};
use keel_index::ReleaseTargetIndex;
use keel_selector::SelectorEngine;
use keel_store::WorkspaceStore;

/// Read access a policy evaluation needs: the fact store (approvals,
/// job history, skips), the materialized targets, the selector engine,
/// and the evaluation instant.
pub struct PolicyEvalContext<'a> {
    pub store: &'a WorkspaceStore,
    pub targets: &'a ReleaseTargetIndex,
    pub selectors: &'a SelectorEngine,
    pub now: DateTime<Utc>,
}

impl<'a> PolicyEvalContext<'a> {
    pub fn new(
        store: &'a WorkspaceStore,
        targets: &'a ReleaseTargetIndex,
        selectors: &'a SelectorEngine,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            store,
            targets,
            selectors,
            now,
        }
    }
}

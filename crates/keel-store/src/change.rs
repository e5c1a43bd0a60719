//! Change records and the per-event changeset
//!
//! Every store mutation produces a change record. The recompute loop
//! drains the changeset at the end of each event and translates the
//! records into dirty marks on the derived indexes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Entity classes the store tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    System,
    Deployment,
    Environment,
    Resource,
    ResourceProvider,
    JobAgent,
    DeploymentVersion,
    DeploymentVariable,
    DeploymentVariableValue,
    ResourceVariable,
    Policy,
    PolicySkip,
    UserApprovalRecord,
    RelationshipRule,
    GithubEntity,
    Release,
    Job,
    JobVerification,
    WorkflowTemplate,
    Workflow,
    WorkflowRun,
    WorkflowStep,
}

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// One store mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Entity class
    pub entity_type: EntityType,

    /// Store key of the mutated entity
    pub key: String,

    /// Mutation kind
    pub kind: ChangeKind,

    /// Entity state before the mutation, absent on create
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,

    /// Entity state after the mutation, absent on delete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
}

impl ChangeRecord {
    pub fn created(entity_type: EntityType, key: impl Into<String>, after: Value) -> Self {
        Self {
            entity_type,
            key: key.into(),
            kind: ChangeKind::Created,
            before: None,
            after: Some(after),
        }
    }

    pub fn updated(
        entity_type: EntityType,
        key: impl Into<String>,
        before: Value,
        after: Value,
    ) -> Self {
        Self {
            entity_type,
            key: key.into(),
            kind: ChangeKind::Updated,
            before: Some(before),
            after: Some(after),
        }
    }

    pub fn deleted(entity_type: EntityType, key: impl Into<String>, before: Value) -> Self {
        Self {
            entity_type,
            key: key.into(),
            kind: ChangeKind::Deleted,
            before: Some(before),
            after: None,
        }
    }
}

/// Mutation log for the event currently being applied.
#[derive(Debug, Default)]
pub struct ChangeSet {
    records: Vec<ChangeRecord>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: ChangeRecord) {
        self.records.push(record);
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn records(&self) -> &[ChangeRecord] {
        &self.records
    }

    /// Take all records, leaving the changeset empty.
    pub fn drain(&mut self) -> Vec<ChangeRecord> {
        std::mem::take(&mut self.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_changeset_drain_empties() {
        let mut changeset = ChangeSet::new();
        changeset.push(ChangeRecord::created(
            EntityType::Resource,
            "res-1",
            json!({"id": "res-1"}),
        ));
        assert_eq!(changeset.len(), 1);

        let drained = changeset.drain();
        assert_eq!(drained.len(), 1);
        assert!(changeset.is_empty());
    }
}

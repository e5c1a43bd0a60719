//! Tracing spine
//!
//! Every reconciliation records a hierarchical trace explaining why a
//! target did or did not progress: a `Reconciliation` root, well-known
//! `Planning`/`Eligibility`/`Execution` phase children, and nested
//! `Decision`/`Check`/`Action` nodes. Spans carry a monotonically
//! increasing sequence number; tests assert ordering with it. Traces
//! leave the engine through the [`TraceSink`] seam.

use chrono::{DateTime, Utc};
use keel_policy::RuleCheck;
use keel_types::WorkspaceId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Span node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    /// Root or well-known phase
    Phase,
    /// A conclusion reached, e.g. "no desired release"
    Decision,
    /// A per-policy-rule verdict
    Check,
    /// A side effect taken, e.g. "job created"
    Action,
}

/// One recorded span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSpan {
    /// Id unique within the trace
    pub id: u64,

    /// Parent span; the root has none
    pub parent_id: Option<u64>,

    /// Span name
    pub name: String,

    /// Node kind
    pub kind: SpanKind,

    /// Free-form attributes
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    /// Monotonically increasing creation order
    pub seq: u64,

    /// Recording time
    pub at: DateTime<Utc>,
}

/// A complete reconciliation trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationTrace {
    pub workspace_id: WorkspaceId,
    pub release_target_key: String,
    pub trigger: String,
    pub spans: Vec<TraceSpan>,
}

impl ReconciliationTrace {
    /// Spans of one kind, in sequence order.
    pub fn spans_of(&self, kind: SpanKind) -> Vec<&TraceSpan> {
        self.spans.iter().filter(|s| s.kind == kind).collect()
    }
}

/// Export seam for reconciliation traces.
pub trait TraceSink: Send + Sync {
    fn export(&self, trace: ReconciliationTrace);
}

/// Discards every trace.
#[derive(Debug, Default)]
pub struct NoopTraceSink;

impl TraceSink for NoopTraceSink {
    fn export(&self, _trace: ReconciliationTrace) {}
}

/// Buffers traces for inspection in tests.
#[derive(Debug, Default)]
pub struct InMemoryTraceSink {
    traces: Mutex<Vec<ReconciliationTrace>>,
}

impl InMemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn traces(&self) -> Vec<ReconciliationTrace> {
        self.traces.lock().expect("trace sink poisoned").clone()
    }

    pub fn clear(&self) {
        self.traces.lock().expect("trace sink poisoned").clear();
    }
}

impl TraceSink for InMemoryTraceSink {
    fn export(&self, trace: ReconciliationTrace) {
        self.traces.lock().expect("trace sink poisoned").push(trace);
    }
}

/// Builds one reconciliation trace with sequenced spans.
pub struct TraceBuilder {
    workspace_id: WorkspaceId,
    release_target_key: String,
    trigger: String,
    spans: Vec<TraceSpan>,
    next_id: u64,
    now: DateTime<Utc>,
}

impl TraceBuilder {
    pub fn new(
        workspace_id: WorkspaceId,
        release_target_key: impl Into<String>,
        trigger: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let release_target_key = release_target_key.into();
        let trigger = trigger.into();
        let mut builder = Self {
            workspace_id: workspace_id.clone(),
            release_target_key: release_target_key.clone(),
            trigger: trigger.clone(),
            spans: Vec::new(),
            next_id: 0,
            now,
        };
        let mut attributes = BTreeMap::new();
        attributes.insert("workspace_id".to_string(), workspace_id.to_string());
        attributes.insert("release_target_key".to_string(), release_target_key);
        attributes.insert("trigger".to_string(), trigger);
        builder.push(None, SpanKind::Phase, "Reconciliation", attributes);
        builder
    }

    /// Root span id.
    pub fn root(&self) -> u64 {
        0
    }

    /// Open a well-known phase under the root.
    pub fn phase(&mut self, name: &str) -> u64 {
        self.push(Some(0), SpanKind::Phase, name, BTreeMap::new())
    }

    /// Record a decision node.
    pub fn decision(&mut self, parent: u64, message: impl Into<String>) -> u64 {
        self.push(Some(parent), SpanKind::Decision, &message.into(), BTreeMap::new())
    }

    /// Record a per-rule check node.
    pub fn check(&mut self, parent: u64, check: &RuleCheck) -> u64 {
        let mut attributes = BTreeMap::new();
        attributes.insert("policy_id".to_string(), check.policy_id.to_string());
        attributes.insert("rule_id".to_string(), check.rule_id.to_string());
        attributes.insert("waived".to_string(), check.waived.to_string());
        let verdict = if check.verdict.is_allowed() {
            "allow".to_string()
        } else if let Some(until) = check.verdict.until() {
            format!("pending until {until}")
        } else {
            format!("block: {}", check.verdict.reason().unwrap_or("unspecified"))
        };
        attributes.insert("verdict".to_string(), verdict);
        self.push(Some(parent), SpanKind::Check, check.rule_kind, attributes)
    }

    /// Record an action node.
    pub fn action(&mut self, parent: u64, message: impl Into<String>) -> u64 {
        self.push(Some(parent), SpanKind::Action, &message.into(), BTreeMap::new())
    }

    pub fn finish(self) -> ReconciliationTrace {
        ReconciliationTrace {
            workspace_id: self.workspace_id,
            release_target_key: self.release_target_key,
            trigger: self.trigger,
            spans: self.spans,
        }
    }

    fn push(
        &mut self,
        parent_id: Option<u64>,
        kind: SpanKind,
        name: &str,
        attributes: BTreeMap<String, String>,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.spans.push(TraceSpan {
            id,
            parent_id,
            name: name.to_string(),
            kind,
            attributes,
            seq: id,
            at: self.now,
        });
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_numbers_increase_in_recording_order() {
        let mut builder = TraceBuilder::new("ws-1".into(), "res-env-dep", "test", Utc::now());
        let planning = builder.phase("Planning");
        builder.decision(planning, "no ready versions");
        let execution = builder.phase("Execution");
        builder.action(execution, "nothing to do");

        let trace = builder.finish();
        let seqs: Vec<u64> = trace.spans.iter().map(|s| s.seq).collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted);
        assert_eq!(trace.spans[0].name, "Reconciliation");
        assert_eq!(
            trace.spans[0].attributes["release_target_key"],
            "res-env-dep"
        );
    }

    #[test]
    fn test_in_memory_sink_buffers() {
        let sink = InMemoryTraceSink::new();
        let builder = TraceBuilder::new("ws-1".into(), "key", "test", Utc::now());
        sink.export(builder.finish());
        assert_eq!(sink.traces().len(), 1);
    }
}

//! KEEL Store - Fact store, change tracking, and snapshots
//!
//! The fact store is the only shared state in the engine: one keyed
//! collection per entity type, owned by the workspace and mutated
//! strictly under the workspace lock. Every mutation produces a
//! [`ChangeRecord`]; the per-event [`ChangeSet`] drives the recompute
//! loop's dirty marking.
//!
//! Snapshots serialize every collection with an integrity hash. Derived
//! indexes are never persisted; the engine rebuilds them on load.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod change;
pub mod error;
pub mod snapshot;
pub mod store;

// Re-exports
pub use change::{ChangeKind, ChangeRecord, ChangeSet, EntityType};
pub use error::{Result, SnapshotError};
pub use snapshot::{
    InMemorySnapshotStorage, SnapshotData, SnapshotMetadata, SnapshotStorage, WorkspaceSnapshot,
    SNAPSHOT_VERSION,
};
pub use store::WorkspaceStore;

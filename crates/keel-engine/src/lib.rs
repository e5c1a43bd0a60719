//! KEEL Engine - Workspace engine for the control plane
//!
//! Ties the subsystem crates into one event-driven state machine:
//! inbound [`keel_types::WorkspaceEvent`]s are dispatched to typed
//! handlers, the fact store's changeset drives a dirty-slice recompute
//! of the derived indexes, and the release manager reconciles every
//! affected target, all under one lock per workspace.
//!
//! ## Concurrency model
//!
//! Single-threaded cooperative per workspace, parallel across
//! workspaces. The only paths that run outside the workspace lock are
//! verification measurement tasks and policy wake-up timers; both
//! re-enter the engine over channels and re-acquire the lock like any
//! other event.
//!
//! ## Entry points
//!
//! - [`Engine::handle_event`]: apply one inbound event atomically
//! - [`Engine::start`] / [`Engine::run`]: pump verification resolutions
//!   and policy wake-ups
//! - [`Engine::subscribe`]: the observability stream
//! - [`WorkspaceRegistry`]: workspace lifecycle (load, snapshot, evict)

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod engine;
pub mod error;
pub mod handlers;
pub mod recompute;
pub mod registry;
pub mod trace;
pub mod workspace;

// Re-exports
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use handlers::AppliedEvent;
pub use recompute::{DirtyTargets, RecomputeStats};
pub use registry::{WorkspaceHandle, WorkspaceRegistry};
pub use trace::{
    InMemoryTraceSink, NoopTraceSink, ReconciliationTrace, SpanKind, TraceBuilder, TraceSink,
    TraceSpan,
};
pub use workspace::Workspace;

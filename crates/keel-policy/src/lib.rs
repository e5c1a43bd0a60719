//! KEEL Policy - Policy evaluation for release progression
//!
//! Policies gate which version a release target may converge to. Each
//! policy scopes itself to targets via a [`keel_types::TargetSelector`]
//! and carries rules; a target is permitted a version only when every
//! applicable rule of every applicable policy allows it.
//!
//! ## Rule kinds
//!
//! - **AnyApproval**: distinct approved records for (version,
//!   environment) must reach a minimum
//! - **VersionSelector**: the candidate version must match a selector
//! - **EnvironmentProgression**: the version must already have
//!   succeeded in a dependency environment, with optional soak,
//!   success-percentage, and freshness windows
//! - **GradualRollout**: targets open one interval apart in
//!   lexicographic key order
//!
//! ## Verdicts
//!
//! A rule emits [`RuleVerdict::Allow`], [`RuleVerdict::Block`] (only a
//! fact change can clear it), or [`RuleVerdict::Pending`] with the
//! earliest instant it can allow; pending verdicts become timer
//! wake-ups. A matching, unexpired [`keel_types::PolicySkip`] converts
//! a non-allow verdict to allow.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod context;
pub mod evaluator;
pub mod rules;
pub mod verdict;

// Re-exports
pub use context::PolicyEvalContext;
pub use evaluator::PolicyEvaluator;
pub use verdict::{RuleCheck, RuleVerdict, TargetDecision};

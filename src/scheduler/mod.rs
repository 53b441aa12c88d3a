//! Concurrent multi-path step scheduling (spec.md §4.F)
//!
//! Each execution runs one or more *paths* concurrently; a path is a
//! single cursor moving through the workflow graph. A step whose outgoing
//! edges have two or more matching conditions branches the path into
//! children, one per match, each continuing independently as its own
//! `tokio::spawn`ed task. The scheduler itself only tracks liveness and
//! aggregates the final outcome — it never touches step semantics, which
//! belong to [`crate::dispatcher::StepDispatcher`].

mod coordinator;
mod path;

pub use coordinator::{PathScheduler, SchedulerError, SchedulerOutcome};
pub use path::{PathRecord, PathStatus};

//! Event model: typed payloads for the append-only execution log
//!
//! This module contains the core event primitives:
//! - [`Event`] envelope (id, execution id, sequence, timestamp, payload)
//! - [`EventKind`] closed tagged-union of everything that can happen during
//!   an execution
//! - [`ExecutionError`] shared error shape carried by failure events

mod types;

pub use types::{
    ChildPathDescriptor, Event, EventKind, EventValidationError, ExecutionError,
    LegacyDecodeError, StateMutation,
};

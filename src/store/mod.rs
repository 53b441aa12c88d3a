//! Event store: append-only event history plus advisory per-execution
//! snapshots (spec.md §4.B)
//!
//! Two implementations are provided:
//! - [`memory::InMemoryEventStore`] — used pervasively in tests
//! - [`sqlite::SqliteEventStore`] — the reference persistent backend,
//!   a two-table schema (`events`, `snapshots`) each append run inside
//!   one transaction

mod memory;
mod model;
mod sqlite;

pub use memory::InMemoryEventStore;
pub use model::{ExecutionFilter, ExecutionStatus, ExecutionSummary, Snapshot};
pub use sqlite::SqliteEventStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::event::Event;

/// Error type for event store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("validation error: {0}")]
    Validation(String),

    /// The lowest sequence in an `append_events` batch was not strictly
    /// greater than the store's current high-water-mark for that execution.
    #[error("sequence conflict for execution {execution_id}: expected next sequence > {current_max}, got {attempted}")]
    SequenceConflict {
        execution_id: Uuid,
        current_max: i64,
        attempted: i64,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Append-only event history plus mutable advisory snapshot, shared across
/// executions (spec.md §3 "Ownership": the store is the one thing that
/// isn't exclusively owned by a single execution).
#[async_trait]
pub trait EventStore: Send + Sync {
    /// All-or-nothing: every event in `events` must belong to `execution_id`
    /// with strictly increasing sequences, and the lowest sequence must be
    /// greater than the store's current high-water-mark for that execution.
    /// On success, every event is durably visible to subsequent readers; on
    /// failure, none is.
    async fn append_events(&self, execution_id: Uuid, events: &[Event]) -> Result<(), StoreError>;

    /// Events with `sequence >= from_seq`, ascending.
    async fn get_events(&self, execution_id: Uuid, from_seq: i64) -> Result<Vec<Event>, StoreError>;

    /// Equivalent to `get_events(execution_id, 0)`.
    async fn get_history(&self, execution_id: Uuid) -> Result<Vec<Event>, StoreError> {
        self.get_events(execution_id, 0).await
    }

    /// Upsert by `execution_id`; last write wins.
    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError>;

    /// Fails with [`StoreError::NotFound`] if absent.
    async fn get_snapshot(&self, execution_id: Uuid) -> Result<Snapshot, StoreError>;

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionSummary>, StoreError>;

    /// Removes events and snapshot for `execution_id`. Idempotent: deleting
    /// an execution with no rows is a success, not a `NotFound`.
    async fn delete_execution(&self, execution_id: Uuid) -> Result<(), StoreError>;

    /// Deletes terminal-state executions whose snapshot `updated_at` is
    /// strictly before `older_than`. Returns the number of executions removed.
    async fn cleanup_completed(
        &self,
        older_than: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64, StoreError>;
}

pub(crate) fn validate_filter(filter: &ExecutionFilter) -> Result<(), StoreError> {
    if filter.limit < 0 {
        return Err(StoreError::Validation(format!(
            "limit must be non-negative, got {}",
            filter.limit
        )));
    }
    if filter.offset < 0 {
        return Err(StoreError::Validation(format!(
            "offset must be non-negative, got {}",
            filter.offset
        )));
    }
    Ok(())
}

pub(crate) fn validate_append_batch(
    execution_id: Uuid,
    events: &[Event],
    current_max: i64,
) -> Result<(), StoreError> {
    if events.is_empty() {
        return Ok(());
    }
    for e in events {
        if e.execution_id != execution_id {
            return Err(StoreError::Validation(format!(
                "event {} belongs to execution {}, not {}",
                e.event_id, e.execution_id, execution_id
            )));
        }
        e.validate()
            .map_err(|err| StoreError::Validation(err.to_string()))?;
    }
    for pair in events.windows(2) {
        if pair[1].sequence <= pair[0].sequence {
            return Err(StoreError::Validation(format!(
                "events in one append_events call must have strictly increasing sequences, got {} then {}",
                pair[0].sequence, pair[1].sequence
            )));
        }
    }
    let lowest = events[0].sequence;
    if lowest <= current_max {
        return Err(StoreError::SequenceConflict {
            execution_id,
            current_max,
            attempted: lowest,
        });
    }
    Ok(())
}

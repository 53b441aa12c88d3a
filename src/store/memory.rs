//! In-memory implementation of [`EventStore`], used pervasively in tests

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{validate_append_batch, validate_filter, EventStore, ExecutionFilter, ExecutionSummary, Snapshot, StoreError};
use crate::event::Event;

struct ExecutionRecord {
    events: Vec<Event>,
    snapshot: Option<Snapshot>,
}

/// In-memory [`EventStore`]. Stores everything behind a single `RwLock`;
/// fine for tests and small embedded deployments, not for anything that
/// needs to survive a process restart — use [`super::SqliteEventStore`]
/// for that.
pub struct InMemoryEventStore {
    executions: RwLock<HashMap<Uuid, ExecutionRecord>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self {
            executions: RwLock::new(HashMap::new()),
        }
    }

    /// Number of executions with at least one event or a snapshot.
    pub fn execution_count(&self) -> usize {
        self.executions.read().len()
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append_events(&self, execution_id: Uuid, events: &[Event]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut executions = self.executions.write();
        let current_max = executions
            .get(&execution_id)
            .and_then(|r| r.events.last())
            .map(|e| e.sequence)
            .unwrap_or(0);

        validate_append_batch(execution_id, events, current_max)?;

        let record = executions.entry(execution_id).or_insert_with(|| ExecutionRecord {
            events: Vec::new(),
            snapshot: None,
        });
        record.events.extend_from_slice(events);
        Ok(())
    }

    async fn get_events(&self, execution_id: Uuid, from_seq: i64) -> Result<Vec<Event>, StoreError> {
        let executions = self.executions.read();
        Ok(executions
            .get(&execution_id)
            .map(|r| {
                r.events
                    .iter()
                    .filter(|e| e.sequence >= from_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let mut executions = self.executions.write();
        let record = executions
            .entry(snapshot.id)
            .or_insert_with(|| ExecutionRecord {
                events: Vec::new(),
                snapshot: None,
            });
        record.snapshot = Some(snapshot.clone());
        Ok(())
    }

    async fn get_snapshot(&self, execution_id: Uuid) -> Result<Snapshot, StoreError> {
        let executions = self.executions.read();
        executions
            .get(&execution_id)
            .and_then(|r| r.snapshot.clone())
            .ok_or_else(|| StoreError::NotFound(format!("snapshot for execution {execution_id}")))
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionSummary>, StoreError> {
        validate_filter(filter)?;
        if filter.limit == 0 {
            return Ok(Vec::new());
        }
        let executions = self.executions.read();
        let mut rows: Vec<ExecutionSummary> = executions
            .values()
            .filter_map(|r| {
                let snap = r.snapshot.as_ref()?;
                if let Some(status) = filter.status {
                    if snap.status != status {
                        return None;
                    }
                }
                if let Some(name) = &filter.workflow_name {
                    if &snap.workflow_name != name {
                        return None;
                    }
                }
                Some(ExecutionSummary {
                    id: snap.id,
                    workflow_name: snap.workflow_name.clone(),
                    status: snap.status,
                    created_at: snap.created_at,
                    updated_at: snap.updated_at,
                })
            })
            .collect();

        rows.sort_by_key(|r| r.created_at);

        let offset = filter.offset as usize;
        let limit = filter.limit as usize;
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn delete_execution(&self, execution_id: Uuid) -> Result<(), StoreError> {
        self.executions.write().remove(&execution_id);
        Ok(())
    }

    async fn cleanup_completed(
        &self,
        older_than: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64, StoreError> {
        let mut executions = self.executions.write();
        let to_remove: Vec<Uuid> = executions
            .iter()
            .filter_map(|(id, r)| {
                let snap = r.snapshot.as_ref()?;
                if snap.status.is_terminal() && snap.updated_at < older_than {
                    Some(*id)
                } else {
                    None
                }
            })
            .collect();
        let count = to_remove.len() as u64;
        for id in to_remove {
            executions.remove(&id);
        }
        Ok(count)
    }
}

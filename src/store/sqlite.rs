//! SQLite implementation of [`EventStore`]
//!
//! The reference persistent backend named in spec.md §4.B: a two-table
//! schema, `events` keyed `(execution_id, sequence)` and `snapshots` keyed
//! `execution_id`, with every append run inside one transaction.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::{validate_append_batch, validate_filter, EventStore, ExecutionFilter, ExecutionStatus, ExecutionSummary, Snapshot, StoreError};
use crate::event::Event;

/// SQLite-backed [`EventStore`].
///
/// # Example
///
/// ```ignore
/// use durable_agent_engine::store::SqliteEventStore;
///
/// let store = SqliteEventStore::connect("sqlite::memory:").await?;
/// ```
#[derive(Clone)]
pub struct SqliteEventStore {
    pool: SqlitePool,
}

impl SqliteEventStore {
    /// Connect and create the schema if it doesn't already exist.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(url)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Wrap an already-connected pool (schema must already exist).
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                execution_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                event_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                path_id TEXT,
                step_name TEXT,
                kind TEXT NOT NULL,
                PRIMARY KEY (execution_id, sequence)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                execution_id TEXT PRIMARY KEY,
                workflow_name TEXT NOT NULL,
                workflow_hash TEXT NOT NULL,
                inputs_hash TEXT NOT NULL,
                status TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_event_seq INTEGER NOT NULL,
                workflow_data BLOB NOT NULL,
                inputs TEXT NOT NULL,
                outputs TEXT NOT NULL,
                error TEXT,
                continued_from TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }

    async fn current_max_sequence(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        execution_id: Uuid,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT MAX(sequence) as m FROM events WHERE execution_id = ?1")
            .bind(execution_id.to_string())
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let max: Option<i64> = row.try_get("m").map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(max.unwrap_or(0))
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    #[instrument(skip(self, events), fields(execution_id = %execution_id, count = events.len()))]
    async fn append_events(&self, execution_id: Uuid, events: &[Event]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let current_max = self.current_max_sequence(&mut tx, execution_id).await?;
        validate_append_batch(execution_id, events, current_max)?;

        for event in events {
            let kind_json = serde_json::to_string(&event.kind)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            sqlx::query(
                r#"
                INSERT INTO events (execution_id, sequence, event_id, timestamp, path_id, step_name, kind)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(event.execution_id.to_string())
            .bind(event.sequence)
            .bind(event.event_id.to_string())
            .bind(event.timestamp.to_rfc3339())
            .bind(event.path_id.map(|p| p.to_string()))
            .bind(&event.step_name)
            .bind(kind_json)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!("failed to insert event: {e}");
                StoreError::Database(e.to_string())
            })?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!("appended {} events", events.len());
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_events(&self, execution_id: Uuid, from_seq: i64) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, execution_id, sequence, timestamp, path_id, step_name, kind
            FROM events
            WHERE execution_id = ?1 AND sequence >= ?2
            ORDER BY sequence ASC
            "#,
        )
        .bind(execution_id.to_string())
        .bind(from_seq)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.into_iter().map(row_to_event).collect()
    }

    #[instrument(skip(self, snapshot), fields(execution_id = %snapshot.id))]
    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let inputs = serde_json::to_string(&snapshot.inputs)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let outputs = serde_json::to_string(&snapshot.outputs)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO snapshots (
                execution_id, workflow_name, workflow_hash, inputs_hash, status,
                start_time, end_time, created_at, updated_at, last_event_seq,
                workflow_data, inputs, outputs, error, continued_from
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            ON CONFLICT(execution_id) DO UPDATE SET
                workflow_name = excluded.workflow_name,
                workflow_hash = excluded.workflow_hash,
                inputs_hash = excluded.inputs_hash,
                status = excluded.status,
                start_time = excluded.start_time,
                end_time = excluded.end_time,
                updated_at = excluded.updated_at,
                last_event_seq = excluded.last_event_seq,
                workflow_data = excluded.workflow_data,
                inputs = excluded.inputs,
                outputs = excluded.outputs,
                error = excluded.error,
                continued_from = excluded.continued_from
            "#,
        )
        .bind(snapshot.id.to_string())
        .bind(&snapshot.workflow_name)
        .bind(&snapshot.workflow_hash)
        .bind(&snapshot.inputs_hash)
        .bind(snapshot.status.as_str())
        .bind(snapshot.start_time.to_rfc3339())
        .bind(snapshot.end_time.map(|t| t.to_rfc3339()))
        .bind(snapshot.created_at.to_rfc3339())
        .bind(snapshot.updated_at.to_rfc3339())
        .bind(snapshot.last_event_seq)
        .bind(&snapshot.workflow_data)
        .bind(inputs)
        .bind(outputs)
        .bind(&snapshot.error)
        .bind(snapshot.continued_from.map(|id| id.to_string()))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_snapshot(&self, execution_id: Uuid) -> Result<Snapshot, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT execution_id, workflow_name, workflow_hash, inputs_hash, status,
                   start_time, end_time, created_at, updated_at, last_event_seq,
                   workflow_data, inputs, outputs, error, continued_from
            FROM snapshots WHERE execution_id = ?1
            "#,
        )
        .bind(execution_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or_else(|| StoreError::NotFound(format!("snapshot for execution {execution_id}")))?;

        row_to_snapshot(row)
    }

    #[instrument(skip(self))]
    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionSummary>, StoreError> {
        validate_filter(filter)?;
        if filter.limit == 0 {
            return Ok(Vec::new());
        }

        let mut query = String::from(
            "SELECT execution_id, workflow_name, status, created_at, updated_at FROM snapshots WHERE 1=1",
        );
        if filter.status.is_some() {
            query.push_str(" AND status = ?");
        }
        if filter.workflow_name.is_some() {
            query.push_str(" AND workflow_name = ?");
        }
        query.push_str(" ORDER BY created_at ASC LIMIT ? OFFSET ?");

        let mut q = sqlx::query(&query);
        if let Some(status) = filter.status {
            q = q.bind(status.as_str());
        }
        if let Some(name) = &filter.workflow_name {
            q = q.bind(name);
        }
        q = q.bind(filter.limit).bind(filter.offset);

        let rows = q
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let status_str: String = row.try_get("status").map_err(|e| StoreError::Database(e.to_string()))?;
                let status = ExecutionStatus::from_str(&status_str)
                    .ok_or_else(|| StoreError::Database(format!("unknown status {status_str}")))?;
                let id_str: String = row.try_get("execution_id").map_err(|e| StoreError::Database(e.to_string()))?;
                let created_at: String = row.try_get("created_at").map_err(|e| StoreError::Database(e.to_string()))?;
                let updated_at: String = row.try_get("updated_at").map_err(|e| StoreError::Database(e.to_string()))?;
                Ok(ExecutionSummary {
                    id: Uuid::parse_str(&id_str).map_err(|e| StoreError::Database(e.to_string()))?,
                    workflow_name: row.try_get("workflow_name").map_err(|e| StoreError::Database(e.to_string()))?,
                    status,
                    created_at: parse_rfc3339(&created_at)?,
                    updated_at: parse_rfc3339(&updated_at)?,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn delete_execution(&self, execution_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query("DELETE FROM events WHERE execution_id = ?1")
            .bind(execution_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        sqlx::query("DELETE FROM snapshots WHERE execution_id = ?1")
            .bind(execution_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn cleanup_completed(
        &self,
        older_than: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64, StoreError> {
        let terminal = [
            ExecutionStatus::Completed.as_str(),
            ExecutionStatus::Failed.as_str(),
            ExecutionStatus::Continued.as_str(),
        ];

        let rows = sqlx::query(
            "SELECT execution_id FROM snapshots WHERE status IN (?1, ?2, ?3) AND updated_at < ?4",
        )
        .bind(terminal[0])
        .bind(terminal[1])
        .bind(terminal[2])
        .bind(older_than.to_rfc3339())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let mut count = 0u64;
        for row in rows {
            let id_str: String = row.try_get("execution_id").map_err(|e| StoreError::Database(e.to_string()))?;
            let id = Uuid::parse_str(&id_str).map_err(|e| StoreError::Database(e.to_string()))?;
            self.delete_execution(id).await?;
            count += 1;
        }
        Ok(count)
    }
}

fn parse_rfc3339(s: &str) -> Result<chrono::DateTime<chrono::Utc>, StoreError> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| StoreError::Database(e.to_string()))
}

fn row_to_event(row: sqlx::sqlite::SqliteRow) -> Result<Event, StoreError> {
    let event_id: String = row.try_get("event_id").map_err(|e| StoreError::Database(e.to_string()))?;
    let execution_id: String = row.try_get("execution_id").map_err(|e| StoreError::Database(e.to_string()))?;
    let sequence: i64 = row.try_get("sequence").map_err(|e| StoreError::Database(e.to_string()))?;
    let timestamp: String = row.try_get("timestamp").map_err(|e| StoreError::Database(e.to_string()))?;
    let path_id: Option<String> = row.try_get("path_id").map_err(|e| StoreError::Database(e.to_string()))?;
    let step_name: Option<String> = row.try_get("step_name").map_err(|e| StoreError::Database(e.to_string()))?;
    let kind_json: String = row.try_get("kind").map_err(|e| StoreError::Database(e.to_string()))?;

    Ok(Event {
        event_id: Uuid::parse_str(&event_id).map_err(|e| StoreError::Database(e.to_string()))?,
        execution_id: Uuid::parse_str(&execution_id).map_err(|e| StoreError::Database(e.to_string()))?,
        sequence,
        timestamp: parse_rfc3339(&timestamp)?,
        path_id: path_id
            .map(|p| Uuid::parse_str(&p))
            .transpose()
            .map_err(|e| StoreError::Database(e.to_string()))?,
        step_name,
        kind: serde_json::from_str(&kind_json).map_err(|e| StoreError::Serialization(e.to_string()))?,
    })
}

fn row_to_snapshot(row: sqlx::sqlite::SqliteRow) -> Result<Snapshot, StoreError> {
    let id: String = row.try_get("execution_id").map_err(|e| StoreError::Database(e.to_string()))?;
    let status_str: String = row.try_get("status").map_err(|e| StoreError::Database(e.to_string()))?;
    let start_time: String = row.try_get("start_time").map_err(|e| StoreError::Database(e.to_string()))?;
    let end_time: Option<String> = row.try_get("end_time").map_err(|e| StoreError::Database(e.to_string()))?;
    let created_at: String = row.try_get("created_at").map_err(|e| StoreError::Database(e.to_string()))?;
    let updated_at: String = row.try_get("updated_at").map_err(|e| StoreError::Database(e.to_string()))?;
    let inputs: String = row.try_get("inputs").map_err(|e| StoreError::Database(e.to_string()))?;
    let outputs: String = row.try_get("outputs").map_err(|e| StoreError::Database(e.to_string()))?;
    let continued_from: Option<String> = row.try_get("continued_from").map_err(|e| StoreError::Database(e.to_string()))?;

    Ok(Snapshot {
        id: Uuid::parse_str(&id).map_err(|e| StoreError::Database(e.to_string()))?,
        workflow_name: row.try_get("workflow_name").map_err(|e| StoreError::Database(e.to_string()))?,
        workflow_hash: row.try_get("workflow_hash").map_err(|e| StoreError::Database(e.to_string()))?,
        inputs_hash: row.try_get("inputs_hash").map_err(|e| StoreError::Database(e.to_string()))?,
        status: ExecutionStatus::from_str(&status_str)
            .ok_or_else(|| StoreError::Database(format!("unknown status {status_str}")))?,
        start_time: parse_rfc3339(&start_time)?,
        end_time: end_time.map(|t| parse_rfc3339(&t)).transpose()?,
        created_at: parse_rfc3339(&created_at)?,
        updated_at: parse_rfc3339(&updated_at)?,
        last_event_seq: row.try_get("last_event_seq").map_err(|e| StoreError::Database(e.to_string()))?,
        workflow_data: row.try_get("workflow_data").map_err(|e| StoreError::Database(e.to_string()))?,
        inputs: serde_json::from_str(&inputs).map_err(|e| StoreError::Serialization(e.to_string()))?,
        outputs: serde_json::from_str(&outputs).map_err(|e| StoreError::Serialization(e.to_string()))?,
        error: row.try_get("error").map_err(|e| StoreError::Database(e.to_string()))?,
        continued_from: continued_from
            .map(|id| Uuid::parse_str(&id))
            .transpose()
            .map_err(|e| StoreError::Database(e.to_string()))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    async fn fresh_store() -> SqliteEventStore {
        SqliteEventStore::connect("sqlite::memory:").await.unwrap()
    }

    fn sample_event(execution_id: Uuid, sequence: i64) -> Event {
        Event::new(execution_id, sequence, None, None, EventKind::PathCompleted)
    }

    #[tokio::test]
    async fn test_append_and_get_history() {
        let store = fresh_store().await;
        let execution_id = Uuid::now_v7();
        let events = vec![sample_event(execution_id, 1), sample_event(execution_id, 2)];
        store.append_events(execution_id, &events).await.unwrap();

        let history = store.get_history(execution_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].sequence, 1);
    }

    #[tokio::test]
    async fn test_sequence_conflict_leaves_nothing_committed() {
        let store = fresh_store().await;
        let execution_id = Uuid::now_v7();
        store
            .append_events(execution_id, &[sample_event(execution_id, 1)])
            .await
            .unwrap();

        let result = store
            .append_events(
                execution_id,
                &[sample_event(execution_id, 1), sample_event(execution_id, 2)],
            )
            .await;
        assert!(matches!(result, Err(StoreError::SequenceConflict { .. })));

        let history = store.get_history(execution_id).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_upsert_last_write_wins() {
        let store = fresh_store().await;
        let execution_id = Uuid::now_v7();
        let mut snapshot = Snapshot {
            id: execution_id,
            workflow_name: "greet".into(),
            workflow_hash: "h1".into(),
            inputs_hash: "ih1".into(),
            status: ExecutionStatus::Running,
            start_time: chrono::Utc::now(),
            end_time: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            last_event_seq: 0,
            workflow_data: vec![],
            inputs: serde_json::json!({}),
            outputs: serde_json::json!({}),
            error: None,
            continued_from: None,
        };
        store.save_snapshot(&snapshot).await.unwrap();

        snapshot.status = ExecutionStatus::Completed;
        snapshot.last_event_seq = 5;
        store.save_snapshot(&snapshot).await.unwrap();

        let loaded = store.get_snapshot(execution_id).await.unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
        assert_eq!(loaded.last_event_seq, 5);
    }

    #[tokio::test]
    async fn test_snapshot_continued_from_round_trips() {
        let store = fresh_store().await;
        let original_id = Uuid::now_v7();
        let successor_id = Uuid::now_v7();
        let snapshot = Snapshot {
            id: successor_id,
            workflow_name: "greet".into(),
            workflow_hash: "h1".into(),
            inputs_hash: "ih1".into(),
            status: ExecutionStatus::Pending,
            start_time: chrono::Utc::now(),
            end_time: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            last_event_seq: 0,
            workflow_data: vec![],
            inputs: serde_json::json!({}),
            outputs: serde_json::json!(null),
            error: None,
            continued_from: Some(original_id),
        };
        store.save_snapshot(&snapshot).await.unwrap();

        let loaded = store.get_snapshot(successor_id).await.unwrap();
        assert_eq!(loaded.continued_from, Some(original_id));
    }

    #[tokio::test]
    async fn test_delete_execution_removes_events_and_snapshot() {
        let store = fresh_store().await;
        let execution_id = Uuid::now_v7();
        store
            .append_events(execution_id, &[sample_event(execution_id, 1)])
            .await
            .unwrap();
        store.delete_execution(execution_id).await.unwrap();
        assert!(store.get_history(execution_id).await.unwrap().is_empty());
    }
}

//! Deterministic operation IDs, result caching, and record-vs-replay
//! dispatch (spec.md §4.D) — the key primitive that makes replay safe.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::instrument;
use uuid::Uuid;

use crate::event::{Event, EventKind, ExecutionError};
use crate::recorder::{Recorder, RecorderError};

/// A unit of non-deterministic side effect. `operation_id()` is a stable
/// hash over `(op_type, step_name, path_id, canonicalized parameters)`;
/// two operations with equal fields MUST produce the same id on any
/// platform (spec.md §3, §4.D).
#[derive(Debug, Clone)]
pub struct Operation {
    pub op_type: String,
    pub step_name: String,
    pub path_id: Uuid,
    pub parameters: serde_json::Value,
}

impl Operation {
    pub fn new(
        op_type: impl Into<String>,
        step_name: impl Into<String>,
        path_id: Uuid,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            op_type: op_type.into(),
            step_name: step_name.into(),
            path_id,
            parameters,
        }
    }

    /// 128-bit id (truncated 256-bit digest), hex-encoded. Parameter key
    /// ordering does not affect the result: `serde_json::Value`'s map is
    /// a `BTreeMap` (this crate does not enable `preserve_order`), so
    /// `serde_json::to_string` already renders object keys sorted
    /// lexicographically, recursively.
    pub fn operation_id(&self) -> String {
        let canonical_params =
            serde_json::to_string(&self.parameters).unwrap_or_else(|_| "null".to_string());
        let mut hasher = Sha256::new();
        hasher.update(self.op_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.step_name.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.path_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical_params.as_bytes());
        let digest = hasher.finalize();
        hex::encode(&digest[..16])
    }
}

#[derive(Debug, Clone)]
enum CachedOutcome {
    Value(serde_json::Value),
    Error(ExecutionError),
}

/// Error surfaced by [`OperationLedger::execute_operation`].
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// `body()` itself failed (spec.md §7 `OperationFailure`).
    #[error("operation failed: {0}")]
    Operation(#[from] ExecutionError),

    #[error(transparent)]
    Recorder(#[from] RecorderError),
}

/// Per-execution cache of operation results, keyed by deterministic
/// operation id. Populated from two sources: live execution (written as
/// operations run) and replay ([`OperationLedger::hydrate_from_history`]
/// scans recorded `operation_completed`/`operation_failed` events before
/// any `body()` is invoked).
pub struct OperationLedger {
    recorder: Arc<Recorder>,
    cache: DashMap<String, CachedOutcome>,
}

impl OperationLedger {
    pub fn new(recorder: Arc<Recorder>) -> Self {
        Self {
            recorder,
            cache: DashMap::new(),
        }
    }

    /// Prime the cache from history. Idempotent; safe to call once before
    /// live execution, or again as a replay cursor advances.
    pub fn hydrate_from_history(&self, events: &[Event]) {
        for event in events {
            match &event.kind {
                EventKind::OperationCompleted {
                    operation_id,
                    result,
                    ..
                } => {
                    self.cache
                        .insert(operation_id.clone(), CachedOutcome::Value(result.clone()));
                }
                EventKind::OperationFailed {
                    operation_id,
                    error,
                    ..
                } => {
                    self.cache
                        .insert(operation_id.clone(), CachedOutcome::Error(error.clone()));
                }
                _ => {}
            }
        }
    }

    pub fn is_cached(&self, operation_id: &str) -> bool {
        self.cache.contains_key(operation_id)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// `cache[id]` exists -> replay path, `body` is never invoked.
    /// Otherwise: record `operation_started`, run `body`, record
    /// `operation_completed`/`operation_failed`, populate the cache, and
    /// propagate `body`'s result.
    #[instrument(skip(self, body), fields(op_type = %op.op_type, step = %op.step_name))]
    pub async fn execute_operation<F, Fut>(
        &self,
        op: &Operation,
        body: F,
    ) -> Result<serde_json::Value, LedgerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, ExecutionError>>,
    {
        let id = op.operation_id();

        if let Some(entry) = self.cache.get(&id) {
            return match entry.value() {
                CachedOutcome::Value(v) => Ok(v.clone()),
                CachedOutcome::Error(e) => Err(LedgerError::Operation(e.clone())),
            };
        }

        self.recorder
            .record(
                EventKind::OperationStarted {
                    operation_id: id.clone(),
                    operation_type: op.op_type.clone(),
                },
                Some(op.path_id),
                Some(op.step_name.clone()),
            )
            .await?;

        let start = Instant::now();
        let outcome = body().await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match &outcome {
            Ok(value) => {
                self.recorder
                    .record(
                        EventKind::OperationCompleted {
                            operation_id: id.clone(),
                            result: value.clone(),
                            duration_ms,
                        },
                        Some(op.path_id),
                        Some(op.step_name.clone()),
                    )
                    .await?;
                self.cache.insert(id, CachedOutcome::Value(value.clone()));
            }
            Err(err) => {
                self.recorder
                    .record(
                        EventKind::OperationFailed {
                            operation_id: id.clone(),
                            error: err.clone(),
                            duration_ms,
                        },
                        Some(op.path_id),
                        Some(op.step_name.clone()),
                    )
                    .await?;
                self.cache.insert(id, CachedOutcome::Error(err.clone()));
            }
        }

        outcome.map_err(LedgerError::Operation)
    }
}

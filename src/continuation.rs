//! Continue-as-new lifecycle: bounded-history chaining across executions
//! (spec.md §4.I). Monitors a live execution against configurable
//! thresholds and, on breach, hands off to a freshly minted execution
//! that preserves whatever sub-state the caller chose to carry forward.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::event::{EventKind, ExecutionError};
use crate::recorder::Recorder;
use crate::scheduler::PathRecord;
use crate::store::{EventStore, Snapshot, StoreError};
use crate::workflow_def::WorkflowDefinition;

/// Thresholds that trigger continue-as-new (spec.md §4.I, §6 defaults:
/// 10,000 events / 24h / 100 MiB).
#[derive(Clone)]
pub struct ContinuationThresholds {
    pub max_events: u64,
    pub max_duration: Duration,
    pub max_event_size_bytes: u64,
    /// Optional custom trigger the source declared but never evaluated;
    /// this spec leaves it as an optional predicate implementations MAY
    /// plug in (spec.md §9 "Open questions").
    pub custom_predicate: Option<Arc<dyn Fn(&ContinuationSnapshot) -> bool + Send + Sync>>,
    /// How often the timer-driven check runs.
    pub poll_interval: Duration,
}

impl std::fmt::Debug for ContinuationThresholds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContinuationThresholds")
            .field("max_events", &self.max_events)
            .field("max_duration", &self.max_duration)
            .field("max_event_size_bytes", &self.max_event_size_bytes)
            .field("has_custom_predicate", &self.custom_predicate.is_some())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl Default for ContinuationThresholds {
    fn default() -> Self {
        Self {
            max_events: 10_000,
            max_duration: Duration::from_secs(24 * 60 * 60),
            max_event_size_bytes: 100 * 1024 * 1024,
            custom_predicate: None,
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// Whether continue-as-new carries preserved state forward (spec.md §6,
/// default true/true for both).
#[derive(Debug, Clone, Copy)]
pub struct PreservationPolicy {
    pub preserve_paths: bool,
    pub preserve_globals: bool,
}

impl Default for PreservationPolicy {
    fn default() -> Self {
        Self {
            preserve_paths: true,
            preserve_globals: true,
        }
    }
}

/// What the controller measures a running execution against.
#[derive(Debug, Clone)]
pub struct ContinuationSnapshot {
    pub event_count: u64,
    pub elapsed: Duration,
    pub approx_event_bytes: u64,
}

/// Sub-state carried into the fresh execution when a continuation fires
/// (spec.md §4.I).
#[derive(Debug, Clone, Default)]
pub struct PreservedState {
    pub workflow_state: HashMap<String, serde_json::Value>,
    pub active_paths: HashMap<Uuid, PathRecord>,
    pub completed_steps: HashMap<String, serde_json::Value>,
    pub new_inputs: Option<serde_json::Value>,
}

/// Decision produced when a threshold is breached.
#[derive(Debug, Clone)]
pub struct ContinueAsNewDecision {
    pub reason: String,
    pub preserved_state: PreservedState,
}

#[derive(Debug, thiserror::Error)]
pub enum ContinuationError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Recorder(#[from] crate::recorder::RecorderError),
}

/// Checks a running execution's accumulated history against
/// [`ContinuationThresholds`] and orchestrates the handoff when breached.
pub struct ContinuationController {
    thresholds: ContinuationThresholds,
    policy: PreservationPolicy,
    store: Arc<dyn EventStore>,
}

impl ContinuationController {
    pub fn new(
        thresholds: ContinuationThresholds,
        policy: PreservationPolicy,
        store: Arc<dyn EventStore>,
    ) -> Self {
        Self {
            thresholds,
            policy,
            store,
        }
    }

    /// Checked on a timer and also pushed on every recorder flush
    /// (spec.md §4.I). Returns `Some(reason)` the first threshold that
    /// trips, checked in the order listed in spec.md §4.I.
    pub fn should_continue(&self, snapshot: &ContinuationSnapshot) -> Option<String> {
        if snapshot.event_count >= self.thresholds.max_events {
            return Some(format!(
                "event count {} reached max_events {}",
                snapshot.event_count, self.thresholds.max_events
            ));
        }
        if snapshot.elapsed >= self.thresholds.max_duration {
            return Some(format!(
                "elapsed {:?} reached max_duration {:?}",
                snapshot.elapsed, self.thresholds.max_duration
            ));
        }
        if snapshot.approx_event_bytes >= self.thresholds.max_event_size_bytes {
            return Some(format!(
                "event log size {} bytes reached max_event_size_bytes {}",
                snapshot.approx_event_bytes, self.thresholds.max_event_size_bytes
            ));
        }
        if let Some(predicate) = &self.thresholds.custom_predicate {
            if predicate(snapshot) {
                return Some("custom predicate triggered".to_string());
            }
        }
        None
    }

    /// Decide what to preserve given the policy and current execution
    /// state. Does not itself perform the handoff — see
    /// [`ContinuationController::execute_continuation`].
    pub fn decide(
        &self,
        reason: String,
        workflow_state: HashMap<String, serde_json::Value>,
        active_paths: HashMap<Uuid, PathRecord>,
        completed_steps: HashMap<String, serde_json::Value>,
        new_inputs: Option<serde_json::Value>,
    ) -> ContinueAsNewDecision {
        ContinueAsNewDecision {
            reason,
            preserved_state: PreservedState {
                workflow_state: if self.policy.preserve_globals {
                    workflow_state
                } else {
                    HashMap::new()
                },
                active_paths: if self.policy.preserve_paths {
                    active_paths
                } else {
                    HashMap::new()
                },
                completed_steps,
                new_inputs,
            },
        }
    }

    /// Perform the handoff described in spec.md §4.I:
    /// 1. Emit `execution_continue_as_new` into the current log.
    /// 2. Mint a fresh execution id.
    /// 3. Write a pending snapshot for the new id referencing the same
    ///    workflow hash.
    /// 4. Emit `execution_started` into the new execution, linking back
    ///    through the chain.
    pub async fn execute_continuation(
        &self,
        current_recorder: &Recorder,
        new_recorder: &Recorder,
        workflow: &WorkflowDefinition,
        decision: &ContinueAsNewDecision,
        original_execution_id: Uuid,
    ) -> Result<Uuid, ContinuationError> {
        let new_execution_id = new_recorder.execution_id();

        current_recorder
            .record(
                EventKind::ExecutionContinueAsNew {
                    reason: decision.reason.clone(),
                    new_execution_id,
                },
                None,
                None,
            )
            .await?;
        current_recorder.flush().await?;

        let inputs = decision
            .preserved_state
            .new_inputs
            .clone()
            .unwrap_or_else(|| serde_json::json!({}));

        let now = Utc::now();
        let snapshot = Snapshot {
            id: new_execution_id,
            workflow_name: workflow.name.clone(),
            workflow_hash: workflow.hash.clone(),
            inputs_hash: content_hash(&inputs),
            status: crate::store::ExecutionStatus::Pending,
            start_time: now,
            end_time: None,
            created_at: now,
            updated_at: now,
            last_event_seq: 0,
            workflow_data: Vec::new(),
            inputs: inputs.clone(),
            outputs: serde_json::json!(null),
            error: None,
            continued_from: Some(original_execution_id),
        };
        self.store.save_snapshot(&snapshot).await?;

        new_recorder
            .record(
                EventKind::ExecutionStarted {
                    workflow_name: workflow.name.clone(),
                    workflow_hash: workflow.hash.clone(),
                    inputs,
                },
                None,
                None,
            )
            .await?;
        new_recorder.flush().await?;

        Ok(new_execution_id)
    }
}

fn content_hash(value: &serde_json::Value) -> String {
    use sha2::{Digest, Sha256};
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Tracks the chain a continuation belongs to: every execution after the
/// first carries `continued_from` pointing at its immediate predecessor
/// and `original_execution_id` pointing at the very first in the chain
/// (spec.md §4.I).
#[derive(Debug, Clone)]
pub struct ContinuationLink {
    pub continued_from: Option<Uuid>,
    pub original_execution_id: Uuid,
}

impl ContinuationLink {
    pub fn root(execution_id: Uuid) -> Self {
        Self {
            continued_from: None,
            original_execution_id: execution_id,
        }
    }

    pub fn chained(previous: &ContinuationLink, previous_execution_id: Uuid) -> Self {
        Self {
            continued_from: Some(previous_execution_id),
            original_execution_id: previous.original_execution_id,
        }
    }
}

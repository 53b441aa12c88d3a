//! Lifecycle facade: create / resume / retry / cancel (spec.md §4.J).
//!
//! Mirrors `engine::WorkflowExecutor`'s role (start/process/replay a
//! workflow against a store) but generalized to this spec's path-based
//! execution model: every entrypoint here composes the Recorder, Ledger,
//! Workflow State, Path Scheduler, and Replayer rather than driving a
//! single compiled `Workflow` trait object.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::continuation::{ContinuationController, ContinuationError, ContinuationSnapshot};
use crate::dispatcher::StepDispatcher;
use crate::event::{Event, EventKind, ExecutionError};
use crate::expr::ExpressionEvaluator;
use crate::ledger::OperationLedger;
use crate::operations::{ActionExecutor, AgentClient};
use crate::recorder::{Recorder, RecorderConfig};
use crate::replayer::{ReplayMismatch, Replayer};
use crate::scheduler::{PathRecord, PathScheduler, PathStatus};
use crate::state::WorkflowState;
use crate::store::{EventStore, ExecutionFilter, ExecutionStatus, ExecutionSummary, Snapshot, StoreError};
use crate::workflow_def::WorkflowDefinition;

/// Strategy for [`Orchestrator::retry`] (spec.md §4.J).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Mint a new execution id with the same workflow + inputs.
    FromStart,
    /// Mint a new execution, copy events up to the last successful step,
    /// then resume at the failed step.
    FromFailure,
    /// Resume from the most recent snapshot's `last_event_seq`, falling
    /// back to a full replay if no snapshot exists.
    FromCheckpoint,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Recorder(#[from] crate::recorder::RecorderError),

    #[error(transparent)]
    Replay(#[from] ReplayMismatch),

    #[error("execution {0} already completed")]
    AlreadyTerminal(Uuid),

    #[error("execution {0} has no successful step to retry from")]
    NoCheckpoint(Uuid),

    #[error(transparent)]
    Continuation(#[from] ContinuationError),
}

/// Collaborators every execution needs but that this spec treats as
/// external (spec.md §1): the agent client, action executor, and
/// expression evaluator.
#[derive(Clone)]
pub struct Collaborators {
    pub agent_client: Arc<dyn AgentClient>,
    pub action_executor: Arc<dyn ActionExecutor>,
    pub evaluator: Arc<dyn ExpressionEvaluator>,
}

/// A running or completed execution, returned by every [`Orchestrator`]
/// entrypoint. Exposes `id()/status()/run(ctx)/force_flush()` per
/// spec.md §6 "Orchestrator API".
pub struct Execution {
    id: Uuid,
    workflow: Arc<WorkflowDefinition>,
    recorder: Arc<Recorder>,
    recorder_config: RecorderConfig,
    ledger: Arc<OperationLedger>,
    state: Arc<WorkflowState>,
    scheduler: Arc<PathScheduler>,
    cancellation: CancellationToken,
    store: Arc<dyn EventStore>,
    continuation: Arc<ContinuationController>,
    status: tokio::sync::RwLock<ExecutionStatus>,
    terminal_error: tokio::sync::RwLock<Option<String>>,
    /// Paths already reconstructed by replay, if this handle was produced
    /// by resume/retry rather than a fresh `create`.
    resume_from: tokio::sync::Mutex<Option<Vec<(Uuid, String, HashMap<String, serde_json::Value>)>>>,
    inputs: serde_json::Value,
    /// Predecessor execution id, if this handle itself was minted by a
    /// continue-as-new handoff.
    continued_from: Option<Uuid>,
}

impl Execution {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn status(&self) -> ExecutionStatus {
        *self.status.read().await
    }

    pub async fn error(&self) -> Option<String> {
        self.terminal_error.read().await.clone()
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub async fn force_flush(&self) -> Result<(), OrchestratorError> {
        self.recorder.flush().await.map_err(Into::into)
    }

    /// Drive every live path to completion, emitting the execution's own
    /// lifecycle events (spec.md §4.F control flow: "J creates a run ...
    /// F launches ... every transition emits events through C into B").
    #[instrument(skip(self), fields(execution_id = %self.id))]
    pub async fn run(&self) -> Result<(), OrchestratorError> {
        {
            let mut status = self.status.write().await;
            if status.is_terminal() {
                return Err(OrchestratorError::AlreadyTerminal(self.id));
            }
            *status = ExecutionStatus::Running;
        }

        if !self.recorder.is_replay_mode() {
            let already_started = {
                let resume = self.resume_from.lock().await;
                resume.is_some()
            };
            if !already_started {
                self.recorder
                    .record(
                        EventKind::ExecutionStarted {
                            workflow_name: self.workflow.name.clone(),
                            workflow_hash: self.workflow.hash.clone(),
                            inputs: self.inputs.clone(),
                        },
                        None,
                        None,
                    )
                    .await?;
            }
        }

        // Re-checked on every recorder flush (spec.md §4.I): the watcher
        // trips this execution's own cancellation token the moment a
        // threshold breaches, so `run()` bounds its own history instead of
        // only reporting the breach after every path has already finished.
        let continuation_reason: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let watcher = {
            let recorder = self.recorder.clone();
            let continuation = self.continuation.clone();
            let cancellation = self.cancellation.clone();
            let reason_slot = continuation_reason.clone();
            tokio::spawn(async move {
                loop {
                    recorder.wait_for_flush().await;
                    let snapshot = ContinuationSnapshot {
                        event_count: recorder.current_sequence() as u64,
                        elapsed: Duration::from_secs(0),
                        approx_event_bytes: 0,
                    };
                    if let Some(reason) = continuation.should_continue(&snapshot) {
                        *reason_slot.lock() = Some(reason);
                        cancellation.cancel();
                        return;
                    }
                }
            })
        };

        let resume_plan = self.resume_from.lock().await.take();
        let scheduler_result = match resume_plan {
            Some(plan) => self.scheduler.resume(plan).await,
            None => self.scheduler.run().await,
        };
        watcher.abort();

        if let Some(reason) = continuation_reason.lock().take() {
            return self.continue_as_new(reason).await;
        }

        let outcome = scheduler_result
            .map_err(|e| OrchestratorError::Recorder(crate::recorder::RecorderError::Validation(e.to_string())))?;

        if outcome.succeeded {
            self.recorder
                .record(
                    EventKind::ExecutionCompleted {
                        outputs: serde_json::to_value(&outcome.outputs).unwrap_or(serde_json::json!({})),
                    },
                    None,
                    None,
                )
                .await?;
            *self.status.write().await = ExecutionStatus::Completed;
        } else {
            let error = outcome
                .error
                .unwrap_or_else(|| ExecutionError::new("unspecified path failure"));
            self.recorder
                .record(EventKind::ExecutionFailed { error: error.clone() }, None, None)
                .await?;
            *self.status.write().await = ExecutionStatus::Failed;
            *self.terminal_error.write().await = Some(error.message.clone());
        }

        self.recorder.flush().await?;
        self.save_snapshot(&outcome.outputs).await?;

        Ok(())
    }

    /// Hand this execution off to a freshly minted successor once a
    /// continuation threshold breaches mid-run (spec.md §4.I, §8 scenario
    /// 6): emits `execution_continue_as_new` into this execution's own
    /// log, mints the successor, and marks this execution `Continued`
    /// rather than completed or failed.
    async fn continue_as_new(&self, reason: String) -> Result<(), OrchestratorError> {
        info!(reason = %reason, "continuation threshold breached, handing off to a new execution");
        self.recorder.flush().await?;

        let active_paths: HashMap<Uuid, PathRecord> = self
            .scheduler
            .path_records()
            .await
            .into_iter()
            .filter(|(_, record)| record.status != PathStatus::Completed && record.status != PathStatus::Failed)
            .collect();

        let decision = self.continuation.decide(
            reason,
            self.state.snapshot(),
            active_paths,
            HashMap::new(),
            Some(self.inputs.clone()),
        );

        let new_execution_id = Uuid::now_v7();
        let new_recorder = Recorder::new(new_execution_id, self.store.clone(), self.recorder_config.clone());

        self.continuation
            .execute_continuation(&self.recorder, &new_recorder, &self.workflow, &decision, self.id)
            .await?;

        *self.status.write().await = ExecutionStatus::Continued;
        self.save_snapshot(&HashMap::new()).await?;
        Ok(())
    }

    async fn save_snapshot(&self, outputs: &HashMap<String, serde_json::Value>) -> Result<(), OrchestratorError> {
        let now = Utc::now();
        let status = *self.status.read().await;
        let snapshot = Snapshot {
            id: self.id,
            workflow_name: self.workflow.name.clone(),
            workflow_hash: self.workflow.hash.clone(),
            inputs_hash: content_hash(&self.inputs),
            status,
            start_time: now,
            end_time: if status.is_terminal() { Some(now) } else { None },
            created_at: now,
            updated_at: now,
            last_event_seq: self.recorder.current_sequence(),
            workflow_data: Vec::new(),
            inputs: self.inputs.clone(),
            outputs: serde_json::to_value(outputs).unwrap_or(serde_json::json!({})),
            error: self.terminal_error.read().await.clone(),
            continued_from: self.continued_from,
        };
        self.store.save_snapshot(&snapshot).await?;
        Ok(())
    }
}

fn content_hash(value: &serde_json::Value) -> String {
    use sha2::{Digest, Sha256};
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Thin façade over the store + collaborators. All entrypoints are
/// idempotent with respect to the event log (spec.md §4.J).
pub struct Orchestrator {
    store: Arc<dyn EventStore>,
    config: EngineConfig,
    collaborators: Collaborators,
    active_cancellation: DashMap<Uuid, CancellationToken>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn EventStore>, config: EngineConfig, collaborators: Collaborators) -> Self {
        Self {
            store,
            config,
            collaborators,
            active_cancellation: DashMap::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_execution(
        &self,
        execution_id: Uuid,
        workflow: Arc<WorkflowDefinition>,
        inputs: serde_json::Value,
        replay_mode: bool,
        resume_from: Option<Vec<(Uuid, String, HashMap<String, serde_json::Value>)>>,
        restored_globals: Option<HashMap<String, serde_json::Value>>,
        initial_status: ExecutionStatus,
        continued_from: Option<Uuid>,
    ) -> Execution {
        let recorder_config = self.config.recorder_config();
        let recorder = Arc::new(Recorder::new(execution_id, self.store.clone(), recorder_config.clone()));
        recorder.set_replay_mode(replay_mode);

        let state = Arc::new(match &restored_globals {
            Some(_) => WorkflowState::new(recorder.clone()),
            None => WorkflowState::with_inputs(recorder.clone(), &inputs),
        });
        if let Some(globals) = restored_globals {
            state.restore(globals);
        }

        let ledger = Arc::new(OperationLedger::new(recorder.clone()));
        let cancellation = CancellationToken::new();
        self.active_cancellation.insert(execution_id, cancellation.clone());

        let dispatcher = Arc::new(StepDispatcher::new(
            execution_id,
            ledger.clone(),
            recorder.clone(),
            state.clone(),
            self.collaborators.evaluator.clone(),
            self.collaborators.agent_client.clone(),
            self.collaborators.action_executor.clone(),
            cancellation.clone(),
        ));

        let scheduler = Arc::new(PathScheduler::new(
            workflow.clone(),
            dispatcher,
            recorder.clone(),
            state.clone(),
            cancellation.clone(),
        ));

        let continuation = Arc::new(ContinuationController::new(
            self.config.continuation_thresholds(),
            self.config.preservation_policy(),
            self.store.clone(),
        ));

        Execution {
            id: execution_id,
            workflow,
            recorder,
            recorder_config,
            ledger,
            state,
            scheduler,
            cancellation,
            store: self.store.clone(),
            continuation,
            status: tokio::sync::RwLock::new(initial_status),
            terminal_error: tokio::sync::RwLock::new(None),
            resume_from: tokio::sync::Mutex::new(resume_from),
            inputs,
            continued_from,
        }
    }

    /// Mint a fresh execution id and build its runtime, but do not run it
    /// — call [`Execution::run`] to drive it.
    #[instrument(skip(self, workflow, inputs), fields(workflow = %workflow.name))]
    pub fn create(&self, workflow: Arc<WorkflowDefinition>, inputs: serde_json::Value) -> Execution {
        let execution_id = Uuid::now_v7();
        info!(execution_id = %execution_id, "creating execution");
        self.build_execution(execution_id, workflow, inputs, false, None, None, ExecutionStatus::Pending, None)
    }

    /// Replay an execution's history, then return a handle ready to
    /// continue live (mints no new id; replaying is idempotent).
    #[instrument(skip(self, workflow), fields(execution_id = %execution_id))]
    pub async fn resume(
        &self,
        execution_id: Uuid,
        workflow: Arc<WorkflowDefinition>,
    ) -> Result<Execution, OrchestratorError> {
        let history = self.store.get_history(execution_id).await?;
        let replayer = Replayer::new(&workflow);
        let replayed = replayer.replay(&history)?;

        if replayed.status.is_terminal() {
            return Err(OrchestratorError::AlreadyTerminal(execution_id));
        }

        let inputs = replayed
            .script_globals
            .get("inputs")
            .cloned()
            .unwrap_or(serde_json::json!({}));

        // A continue-as-new successor's own snapshot already carries
        // `continued_from`; preserve it across resume rather than losing
        // the chain the first time this handle saves its own snapshot.
        let continued_from = match self.store.get_snapshot(execution_id).await {
            Ok(snapshot) => snapshot.continued_from,
            Err(_) => None,
        };

        let execution = self.build_execution(
            execution_id,
            workflow,
            inputs,
            false,
            Some(active_paths_to_plan(&replayed.active_paths)),
            Some(replayed.script_globals.clone()),
            ExecutionStatus::Running,
            continued_from,
        );

        execution.recorder.fast_forward_sequence(replayed.last_sequence);
        execution.ledger.hydrate_from_history(&history);
        for (path_id, record) in &replayed.active_paths {
            execution.scheduler.seed_path(*path_id, record.clone()).await;
        }

        Ok(execution)
    }

    /// Feed a previously captured history into a fresh, replay-mode
    /// execution without touching the store — used by scenario 4
    /// (replay determinism): the resulting handle's `run()` must record
    /// zero new `operation_started` events.
    pub async fn replay_only(&self, history: &[Event], workflow: Arc<WorkflowDefinition>) -> Result<Execution, OrchestratorError> {
        let replayer = Replayer::new(&workflow);
        let replayed = replayer.replay(history)?;
        let inputs = replayed
            .script_globals
            .get("inputs")
            .cloned()
            .unwrap_or(serde_json::json!({}));

        let execution_id = history
            .first()
            .map(|e| e.execution_id)
            .unwrap_or_else(Uuid::now_v7);

        let execution = self.build_execution(
            execution_id,
            workflow,
            inputs,
            true,
            Some(active_paths_to_plan(&replayed.active_paths)),
            Some(replayed.script_globals.clone()),
            ExecutionStatus::Running,
            None,
        );
        execution.recorder.fast_forward_sequence(replayed.last_sequence);
        execution.ledger.hydrate_from_history(history);
        for (path_id, record) in &replayed.active_paths {
            execution.scheduler.seed_path(*path_id, record.clone()).await.ok();
        }
        Ok(execution)
    }

    #[instrument(skip(self, workflow), fields(execution_id = %execution_id, ?strategy))]
    pub async fn retry(
        &self,
        execution_id: Uuid,
        workflow: Arc<WorkflowDefinition>,
        strategy: RetryStrategy,
    ) -> Result<Execution, OrchestratorError> {
        match strategy {
            RetryStrategy::FromStart => self.retry_from_start(execution_id, workflow).await,
            RetryStrategy::FromFailure => self.retry_from_failure(execution_id, workflow).await,
            RetryStrategy::FromCheckpoint => self.retry_from_checkpoint(execution_id, workflow).await,
        }
    }

    async fn retry_from_start(
        &self,
        execution_id: Uuid,
        workflow: Arc<WorkflowDefinition>,
    ) -> Result<Execution, OrchestratorError> {
        let snapshot = self.store.get_snapshot(execution_id).await?;
        Ok(self.create(workflow, snapshot.inputs))
    }

    async fn retry_from_failure(
        &self,
        execution_id: Uuid,
        workflow: Arc<WorkflowDefinition>,
    ) -> Result<Execution, OrchestratorError> {
        let history = self.store.get_history(execution_id).await?;
        let cutoff = history
            .iter()
            .rposition(|e| matches!(e.kind, EventKind::StepCompleted { .. } | EventKind::ExecutionStarted { .. }))
            .ok_or(OrchestratorError::NoCheckpoint(execution_id))?;

        let new_execution_id = Uuid::now_v7();
        let copied: Vec<Event> = history[..=cutoff]
            .iter()
            .map(|e| rehome_event(e, new_execution_id))
            .collect();
        self.store.append_events(new_execution_id, &copied).await?;

        let replayer = Replayer::new(&workflow);
        let replayed = replayer.reconstruct(&copied);
        let inputs = replayed
            .script_globals
            .get("inputs")
            .cloned()
            .unwrap_or(serde_json::json!({}));

        let execution = self.build_execution(
            new_execution_id,
            workflow,
            inputs,
            false,
            Some(active_paths_to_plan(&replayed.active_paths)),
            Some(replayed.script_globals.clone()),
            ExecutionStatus::Running,
            None,
        );
        execution.recorder.fast_forward_sequence(replayed.last_sequence);
        execution.ledger.hydrate_from_history(&copied);
        for (path_id, record) in &replayed.active_paths {
            execution.scheduler.seed_path(*path_id, record.clone()).await;
        }
        Ok(execution)
    }

    /// Resume from the most recent snapshot's `last_event_seq`; falls
    /// back to a full replay if no snapshot exists (DESIGN.md Open
    /// Question decision 5).
    async fn retry_from_checkpoint(
        &self,
        execution_id: Uuid,
        workflow: Arc<WorkflowDefinition>,
    ) -> Result<Execution, OrchestratorError> {
        // A snapshot's `last_event_seq` only bounds how much of the log a
        // *store* implementation needs to scan to reconstruct state; the
        // replayer itself always needs the full history to rebuild path
        // topology correctly, so this reduces to `resume` with the
        // snapshot probe only deciding whether one exists at all
        // (DESIGN.md Open Question decision 5).
        match self.store.get_snapshot(execution_id).await {
            Ok(_) | Err(StoreError::NotFound(_)) => self.resume(execution_id, workflow).await,
            Err(other) => Err(other.into()),
        }
    }

    /// Cancel a live execution by id. Aborts all path workers at their
    /// next suspension point (spec.md §5 "Cancellation").
    pub fn cancel(&self, execution_id: Uuid) {
        if let Some(token) = self.active_cancellation.get(&execution_id) {
            token.cancel();
        }
    }

    pub async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionSummary>, OrchestratorError> {
        self.store.list_executions(filter).await.map_err(Into::into)
    }

    pub async fn get_snapshot(&self, execution_id: Uuid) -> Result<Snapshot, OrchestratorError> {
        self.store.get_snapshot(execution_id).await.map_err(Into::into)
    }

    pub async fn get_history(&self, execution_id: Uuid) -> Result<Vec<Event>, OrchestratorError> {
        self.store.get_history(execution_id).await.map_err(Into::into)
    }
}

fn active_paths_to_plan(
    active_paths: &HashMap<Uuid, PathRecord>,
) -> Vec<(Uuid, String, HashMap<String, serde_json::Value>)> {
    active_paths
        .iter()
        .filter(|(_, record)| record.status != PathStatus::Completed && record.status != PathStatus::Failed)
        .map(|(id, record)| (*id, record.current_step.clone(), record.outputs.clone()))
        .collect()
}

fn rehome_event(event: &Event, new_execution_id: Uuid) -> Event {
    Event::new(
        new_execution_id,
        event.sequence,
        event.path_id,
        event.step_name.clone(),
        event.kind.clone(),
    )
}

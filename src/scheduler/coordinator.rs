//! The concurrency heart: maintains the live path set, spawns one worker
//! per path, mediates branch creation, and detects termination
//! (spec.md §4.F).
//!
//! Each live path runs on its own `tokio::spawn`ed task; a central
//! coordinator owns the path map under a `RwLock` and is notified of
//! completions and spawn requests over an mpsc channel, mirroring
//! `worker::WorkerPool`'s semaphore + channel shape but keyed by path
//! rather than by task claim.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::dispatcher::StepDispatcher;
use crate::event::{ChildPathDescriptor, EventKind, ExecutionError};
use crate::recorder::{Recorder, RecorderError};
use crate::scheduler::path::{PathRecord, PathStatus};
use crate::state::WorkflowState;
use crate::workflow_def::WorkflowDefinition;

/// Error surfaced by the path scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Recorder(#[from] RecorderError),

    #[error("condition evaluation failed: {0}")]
    Condition(String),

    #[error("execution was cancelled")]
    Cancelled,
}

/// What the execution produced once its live path set emptied.
#[derive(Debug, Clone)]
pub struct SchedulerOutcome {
    /// Union of per-path step outputs. Conflicts (two paths storing the
    /// same variable) are resolved last-event-wins by sequence — in
    /// practice this is whichever store the Workflow State's own
    /// `state_mutated` ordering landed last, so this map just mirrors
    /// `WorkflowState::snapshot()` filtered to step-output keys.
    pub outputs: HashMap<String, serde_json::Value>,
    /// Whether every path completed successfully.
    pub succeeded: bool,
    /// First failure observed, if any path failed.
    pub error: Option<ExecutionError>,
}

/// A request to spawn a new child path, sent from a running path worker
/// to the coordinator.
struct SpawnRequest {
    descriptor: ChildPathDescriptor,
    parent_outputs: HashMap<String, serde_json::Value>,
}

enum WorkerMessage {
    Spawn(SpawnRequest),
    Finished {
        path_id: Uuid,
        status: PathStatus,
        outputs: HashMap<String, serde_json::Value>,
        error: Option<ExecutionError>,
    },
}

/// Owns the live path set for one execution and drives every path to
/// completion (spec.md §4.F). One instance per execution; never shared
/// across executions (spec.md §3 "Ownership").
pub struct PathScheduler {
    workflow: Arc<WorkflowDefinition>,
    dispatcher: Arc<StepDispatcher>,
    recorder: Arc<Recorder>,
    state: Arc<WorkflowState>,
    cancellation: CancellationToken,
    paths: RwLock<HashMap<Uuid, PathRecord>>,
}

impl PathScheduler {
    pub fn new(
        workflow: Arc<WorkflowDefinition>,
        dispatcher: Arc<StepDispatcher>,
        recorder: Arc<Recorder>,
        state: Arc<WorkflowState>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            workflow,
            dispatcher,
            recorder,
            state,
            cancellation,
            paths: RwLock::new(HashMap::new()),
        }
    }

    /// Current status of every tracked path (including terminal ones).
    pub async fn path_records(&self) -> HashMap<Uuid, PathRecord> {
        self.paths.read().await.clone()
    }

    pub async fn seed_path(&self, path_id: Uuid, record: PathRecord) {
        self.paths.write().await.insert(path_id, record);
    }

    /// Launch the initial path at the workflow's entry step and run every
    /// path (including ones it branches into) to completion.
    #[instrument(skip(self), fields(execution_id = %self.recorder.execution_id()))]
    pub async fn run(&self) -> Result<SchedulerOutcome, SchedulerError> {
        let initial_path = Uuid::now_v7();
        self.paths.write().await.insert(
            initial_path,
            PathRecord::new(self.workflow.entry_step.clone(), HashMap::new()),
        );
        self.drive(vec![(initial_path, self.workflow.entry_step.clone(), HashMap::new())])
            .await
    }

    /// Resume driving a set of paths already present in `paths` (used by
    /// the orchestrator after replay reconstructs `active_paths`).
    #[instrument(skip(self, resume_from), fields(execution_id = %self.recorder.execution_id()))]
    pub async fn resume(
        &self,
        resume_from: Vec<(Uuid, String, HashMap<String, serde_json::Value>)>,
    ) -> Result<SchedulerOutcome, SchedulerError> {
        self.drive(resume_from).await
    }

    async fn drive(
        &self,
        initial: Vec<(Uuid, String, HashMap<String, serde_json::Value>)>,
    ) -> Result<SchedulerOutcome, SchedulerError> {
        let (tx, mut rx) = mpsc::channel::<WorkerMessage>(256);
        let mut live = 0usize;

        for (path_id, start_step, outputs) in initial {
            live += 1;
            self.spawn_path_worker(path_id, start_step, outputs, tx.clone());
        }

        let mut any_failed = false;
        let mut first_error = None;

        while live > 0 {
            let Some(message) = rx.recv().await else {
                break;
            };
            match message {
                WorkerMessage::Spawn(req) => {
                    let child_id = req.descriptor.path_id;
                    let inherited = if req.descriptor.inherit_outputs {
                        req.parent_outputs
                    } else {
                        HashMap::new()
                    };
                    self.paths.write().await.insert(
                        child_id,
                        PathRecord::new(req.descriptor.start_step.clone(), inherited.clone()),
                    );
                    live += 1;
                    self.spawn_path_worker(child_id, req.descriptor.start_step, inherited, tx.clone());
                }
                WorkerMessage::Finished {
                    path_id,
                    status,
                    outputs,
                    error,
                } => {
                    live -= 1;
                    let mut paths = self.paths.write().await;
                    if let Some(record) = paths.get_mut(&path_id) {
                        record.status = status;
                        record.outputs = outputs;
                        record.error = error.clone();
                    }
                    drop(paths);
                    if status == PathStatus::Failed {
                        any_failed = true;
                        if first_error.is_none() {
                            first_error = error;
                        }
                    }
                }
            }
        }

        drop(tx);
        let outputs = self.aggregate_outputs().await;
        Ok(SchedulerOutcome {
            outputs,
            succeeded: !any_failed,
            error: first_error,
        })
    }

    async fn aggregate_outputs(&self) -> HashMap<String, serde_json::Value> {
        let snapshot = self.state.snapshot();
        let paths = self.paths.read().await;
        let mut outputs = HashMap::new();
        for record in paths.values() {
            for (k, v) in &record.outputs {
                outputs.insert(k.clone(), v.clone());
            }
        }
        // Stored variables are promoted to Workflow State; last-sequence-wins
        // is whatever the state map currently holds, which supersedes raw
        // path-local output for any key both sides agree on.
        for (k, v) in snapshot {
            outputs.insert(k, v);
        }
        outputs
    }

    fn spawn_path_worker(
        &self,
        path_id: Uuid,
        start_step: String,
        inherited_outputs: HashMap<String, serde_json::Value>,
        tx: mpsc::Sender<WorkerMessage>,
    ) {
        let workflow = self.workflow.clone();
        let dispatcher = self.dispatcher.clone();
        let recorder = self.recorder.clone();
        let state = self.state.clone();
        let cancellation = self.cancellation.clone();

        tokio::spawn(async move {
            let result = run_path(
                path_id,
                start_step,
                inherited_outputs,
                workflow,
                dispatcher,
                recorder,
                state,
                cancellation,
                tx.clone(),
            )
            .await;

            let message = match result {
                Ok(outputs) => WorkerMessage::Finished {
                    path_id,
                    status: PathStatus::Completed,
                    outputs,
                    error: None,
                },
                Err(PathFailure { outputs, error }) => WorkerMessage::Finished {
                    path_id,
                    status: PathStatus::Failed,
                    outputs,
                    error: Some(error),
                },
            };
            let _ = tx.send(message).await;
        });
    }
}

struct PathFailure {
    outputs: HashMap<String, serde_json::Value>,
    error: ExecutionError,
}

/// Per-path loop (spec.md §4.F): emit `path_started`, then repeatedly
/// dispatch the current step, evaluate outgoing edges, and either advance
/// in place, branch, or terminate.
#[allow(clippy::too_many_arguments)]
async fn run_path(
    path_id: Uuid,
    start_step: String,
    inherited_outputs: HashMap<String, serde_json::Value>,
    workflow: Arc<WorkflowDefinition>,
    dispatcher: Arc<StepDispatcher>,
    recorder: Arc<Recorder>,
    state: Arc<WorkflowState>,
    cancellation: CancellationToken,
    tx: mpsc::Sender<WorkerMessage>,
) -> Result<HashMap<String, serde_json::Value>, PathFailure> {
    let mut outputs = inherited_outputs;
    let mut current_step = start_step.clone();

    let emit = |kind: EventKind, step_name: Option<String>| {
        let recorder = recorder.clone();
        async move {
            recorder
                .record(kind, Some(path_id), step_name)
                .await
                .map_err(|e| PathFailure {
                    outputs: HashMap::new(),
                    error: ExecutionError::retryable(e.to_string()),
                })
        }
    };

    emit(
        EventKind::PathStarted {
            current_step: current_step.clone(),
            inherited_outputs: !outputs.is_empty(),
        },
        None,
    )
    .await?;

    loop {
        if cancellation.is_cancelled() {
            let error = ExecutionError::new("cancelled");
            emit(EventKind::PathFailed { error: error.clone() }, Some(current_step.clone()))
                .await
                .ok();
            return Err(PathFailure { outputs, error });
        }

        let Some(step) = workflow.get_step(&current_step) else {
            let error = ExecutionError::new(format!("step not found: {current_step}"));
            emit(EventKind::PathFailed { error: error.clone() }, Some(current_step.clone()))
                .await
                .ok();
            return Err(PathFailure { outputs, error });
        };

        recorder
            .record(
                EventKind::StepStarted {
                    step_type: step.step_type().to_string(),
                },
                Some(path_id),
                Some(current_step.clone()),
            )
            .await
            .map_err(|e| PathFailure {
                outputs: outputs.clone(),
                error: ExecutionError::retryable(e.to_string()),
            })?;

        match dispatcher.dispatch(path_id, step, &outputs).await {
            Ok(outcome) => {
                recorder
                    .record(
                        EventKind::StepCompleted {
                            output: outcome.output.clone(),
                            stored_variable: outcome.stored_variable.clone(),
                        },
                        Some(path_id),
                        Some(current_step.clone()),
                    )
                    .await
                    .map_err(|e| PathFailure {
                        outputs: outputs.clone(),
                        error: ExecutionError::retryable(e.to_string()),
                    })?;

                outputs.insert(current_step.clone(), outcome.output.clone());

                if let Some(var) = &outcome.stored_variable {
                    state
                        .set(var.clone(), outcome.output.clone())
                        .await
                        .map_err(|e| PathFailure {
                            outputs: outputs.clone(),
                            error: ExecutionError::retryable(e.to_string()),
                        })?;
                }
            }
            Err(error) => {
                recorder
                    .record(
                        EventKind::StepFailed { error: error.clone() },
                        Some(path_id),
                        Some(current_step.clone()),
                    )
                    .await
                    .ok();
                emit(EventKind::PathFailed { error: error.clone() }, Some(current_step.clone()))
                    .await
                    .ok();
                return Err(PathFailure { outputs, error });
            }
        }

        let scope = build_condition_scope(&state, &outputs);
        let matched = match evaluate_matching_edges(&dispatcher, &workflow, &current_step, &scope) {
            Ok(edges) => edges,
            Err(msg) => {
                let error = ExecutionError::new(msg);
                emit(EventKind::PathFailed { error: error.clone() }, Some(current_step.clone()))
                    .await
                    .ok();
                return Err(PathFailure { outputs, error });
            }
        };

        match matched.len() {
            0 => {
                emit(EventKind::PathCompleted, None).await.ok();
                return Ok(outputs);
            }
            1 => {
                current_step = matched[0].clone();
            }
            _ => {
                let mut children = Vec::new();
                for target in matched.iter().skip(1) {
                    children.push(ChildPathDescriptor {
                        path_id: Uuid::now_v7(),
                        start_step: target.clone(),
                        inherit_outputs: true,
                    });
                }
                recorder
                    .record(
                        EventKind::PathBranched {
                            children: children.clone(),
                        },
                        Some(path_id),
                        Some(current_step.clone()),
                    )
                    .await
                    .map_err(|e| PathFailure {
                        outputs: outputs.clone(),
                        error: ExecutionError::retryable(e.to_string()),
                    })?;

                for descriptor in children {
                    let _ = tx
                        .send(WorkerMessage::Spawn(SpawnRequest {
                            descriptor,
                            parent_outputs: outputs.clone(),
                        }))
                        .await;
                }

                current_step = matched[0].clone();
            }
        }
    }
}

fn build_condition_scope(
    state: &WorkflowState,
    path_outputs: &HashMap<String, serde_json::Value>,
) -> serde_json::Value {
    let mut scope = state.snapshot();
    for (k, v) in path_outputs {
        scope.insert(k.clone(), v.clone());
    }
    serde_json::Value::Object(scope.into_iter().collect())
}

/// Evaluate every outgoing edge of `step_name` in declaration order,
/// collecting the targets whose condition is absent or evaluates truthy
/// (spec.md §4.F "Tie-breaks").
fn evaluate_matching_edges(
    dispatcher: &StepDispatcher,
    workflow: &WorkflowDefinition,
    step_name: &str,
    scope: &serde_json::Value,
) -> Result<Vec<String>, String> {
    let mut matched = Vec::new();
    for edge in workflow.outgoing_edges(step_name) {
        let truthy = match &edge.condition {
            None => true,
            Some(expr) => dispatcher
                .evaluator()
                .evaluate_condition(expr, scope)
                .map_err(|e| e.to_string())?,
        };
        if truthy {
            matched.push(edge.to.clone());
        }
    }
    Ok(matched)
}

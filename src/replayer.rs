//! Rebuilds path topology, step outputs, and script variables from an
//! event stream (spec.md §4.H). Used on recovery (after loading a
//! snapshot) and to drive scenario 4's replay-determinism check: feeding
//! a captured history back through a second execution with
//! `replay_mode=true` must produce zero new `operation_started` events.

use std::collections::HashMap;

use uuid::Uuid;

use crate::event::{Event, EventKind, ExecutionError};
use crate::ledger::OperationLedger;
use crate::scheduler::{PathRecord, PathStatus};
use crate::state::WorkflowState;
use crate::store::ExecutionStatus;
use crate::workflow_def::WorkflowDefinition;

/// Error raised when replay validation fails (spec.md §4.H "Validation
/// pass"). Non-retriable at the same execution id (spec.md §7).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReplayMismatch {
    #[error("history is empty")]
    EmptyHistory,

    #[error("first event must be execution_started, got {0}")]
    FirstEventNotStart(String),

    #[error("sequence numbers must be strictly increasing: {0} then {1}")]
    SequenceNotIncreasing(i64, i64),

    #[error("step `{0}` referenced in history no longer exists in the workflow")]
    UnknownStep(String),

    #[error("step `{step}` was recorded with type `{recorded}` but the workflow now declares `{current}`")]
    StepTypeChanged {
        step: String,
        recorded: String,
        current: String,
    },
}

/// Reconstructed in-memory projection of an execution (spec.md §4.H
/// "Output").
#[derive(Debug, Clone)]
pub struct ReplayedExecution {
    pub status: ExecutionStatus,
    pub active_paths: HashMap<Uuid, PathRecord>,
    pub completed_steps: HashMap<String, serde_json::Value>,
    pub script_globals: HashMap<String, serde_json::Value>,
    pub last_sequence: i64,
    pub terminal_error: Option<ExecutionError>,
    pub continued_to: Option<Uuid>,
}

impl ReplayedExecution {
    fn empty() -> Self {
        Self {
            status: ExecutionStatus::Pending,
            active_paths: HashMap::new(),
            completed_steps: HashMap::new(),
            script_globals: HashMap::new(),
            last_sequence: 0,
            terminal_error: None,
            continued_to: None,
        }
    }
}

/// Validates an event stream against the current workflow definition,
/// then linearly scans it to rebuild execution state (spec.md §4.H).
pub struct Replayer<'a> {
    workflow: &'a WorkflowDefinition,
}

impl<'a> Replayer<'a> {
    pub fn new(workflow: &'a WorkflowDefinition) -> Self {
        Self { workflow }
    }

    /// Every referenced step name must still exist; if `step_type` was
    /// recorded, it must match; sequences must be strictly increasing;
    /// the first event must be `execution_started`.
    pub fn validate(&self, events: &[Event]) -> Result<(), ReplayMismatch> {
        let Some(first) = events.first() else {
            return Err(ReplayMismatch::EmptyHistory);
        };
        if !matches!(first.kind, EventKind::ExecutionStarted { .. }) {
            return Err(ReplayMismatch::FirstEventNotStart(first.type_tag().to_string()));
        }

        for pair in events.windows(2) {
            if pair[1].sequence <= pair[0].sequence {
                return Err(ReplayMismatch::SequenceNotIncreasing(
                    pair[0].sequence,
                    pair[1].sequence,
                ));
            }
        }

        for event in events {
            if let Some(step_name) = &event.step_name {
                // `each` sub-steps are addressed as `parent[index]`; only
                // the parent name is declared in the workflow graph.
                let base_name = step_name.split('[').next().unwrap_or(step_name);
                if self.workflow.get_step(base_name).is_none() {
                    return Err(ReplayMismatch::UnknownStep(step_name.clone()));
                }
            }
            if let EventKind::StepStarted { step_type } = &event.kind {
                if let Some(step_name) = &event.step_name {
                    let base_name = step_name.split('[').next().unwrap_or(step_name);
                    if let Some(step) = self.workflow.get_step(base_name) {
                        if step.step_type() != step_type {
                            return Err(ReplayMismatch::StepTypeChanged {
                                step: step_name.clone(),
                                recorded: step_type.clone(),
                                current: step.step_type().to_string(),
                            });
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Linear scan (spec.md §4.H table). Does not itself validate; call
    /// [`Replayer::validate`] first (or use [`Replayer::replay`], which
    /// does both).
    pub fn reconstruct(&self, events: &[Event]) -> ReplayedExecution {
        let mut result = ReplayedExecution::empty();

        for event in events {
            result.last_sequence = event.sequence;
            match &event.kind {
                EventKind::ExecutionStarted { inputs, .. } => {
                    result.status = ExecutionStatus::Running;
                    result.script_globals.insert("inputs".to_string(), inputs.clone());
                    if let serde_json::Value::Object(map) = inputs {
                        for (k, v) in map {
                            result.script_globals.insert(k.clone(), v.clone());
                        }
                    }
                }
                EventKind::PathStarted { current_step, .. } => {
                    if let Some(path_id) = event.path_id {
                        result
                            .active_paths
                            .insert(path_id, PathRecord::new(current_step.clone(), HashMap::new()));
                    }
                }
                EventKind::StepStarted { .. } => {
                    if let (Some(path_id), Some(step_name)) = (event.path_id, &event.step_name) {
                        if let Some(path) = result.active_paths.get_mut(&path_id) {
                            path.current_step = step_name.clone();
                        }
                    }
                }
                EventKind::StepCompleted {
                    output,
                    stored_variable,
                } => {
                    if let (Some(path_id), Some(step_name)) = (event.path_id, &event.step_name) {
                        if let Some(path) = result.active_paths.get_mut(&path_id) {
                            path.outputs.insert(step_name.clone(), output.clone());
                        }
                        result.completed_steps.insert(step_name.clone(), output.clone());
                        if let Some(var) = stored_variable {
                            // Preserve the original value type observed during
                            // the original run (spec.md §4.H table).
                            result.script_globals.insert(var.clone(), output.clone());
                        }
                    }
                }
                EventKind::StepFailed { error } => {
                    if let Some(path_id) = event.path_id {
                        if let Some(path) = result.active_paths.get_mut(&path_id) {
                            path.error = Some(error.clone());
                        }
                    }
                }
                EventKind::PathBranched { children } => {
                    if let Some(parent_id) = event.path_id {
                        let parent_outputs = result
                            .active_paths
                            .get(&parent_id)
                            .map(|p| p.outputs.clone())
                            .unwrap_or_default();
                        for child in children {
                            let inherited = if child.inherit_outputs {
                                parent_outputs.clone()
                            } else {
                                HashMap::new()
                            };
                            result
                                .active_paths
                                .insert(child.path_id, PathRecord::new(child.start_step.clone(), inherited));
                        }
                    }
                }
                EventKind::PathCompleted => {
                    if let Some(path_id) = event.path_id {
                        if let Some(path) = result.active_paths.get_mut(&path_id) {
                            path.status = PathStatus::Completed;
                        }
                    }
                }
                EventKind::PathFailed { error } => {
                    if let Some(path_id) = event.path_id {
                        if let Some(path) = result.active_paths.get_mut(&path_id) {
                            path.status = PathStatus::Failed;
                            path.error = Some(error.clone());
                        }
                    }
                }
                EventKind::ExecutionCompleted { .. } => {
                    result.status = ExecutionStatus::Completed;
                }
                EventKind::ExecutionFailed { error } => {
                    result.status = ExecutionStatus::Failed;
                    result.terminal_error = Some(error.clone());
                }
                EventKind::ExecutionContinueAsNew { new_execution_id, .. } => {
                    result.status = ExecutionStatus::Continued;
                    result.continued_to = Some(*new_execution_id);
                }
                EventKind::StateMutated { mutations } => {
                    for mutation in mutations {
                        match mutation {
                            crate::event::StateMutation::Set { key, value } => {
                                result.script_globals.insert(key.clone(), value.clone());
                            }
                            crate::event::StateMutation::Delete { key } => {
                                result.script_globals.remove(key);
                            }
                        }
                    }
                }
                // Operation and determinism events are consumed by the
                // Operation Ledger's own hydration pass, not here.
                EventKind::OperationStarted { .. }
                | EventKind::OperationCompleted { .. }
                | EventKind::OperationFailed { .. }
                | EventKind::TimeAccessed { .. }
                | EventKind::RandomGenerated { .. }
                | EventKind::IterationStarted { .. }
                | EventKind::IterationCompleted { .. }
                | EventKind::SignalReceived { .. }
                | EventKind::VersionDecision { .. } => {}
            }
        }

        // Only paths that never reached a terminal status are "active".
        result
            .active_paths
            .retain(|_, p| !matches!(p.status, PathStatus::Completed | PathStatus::Failed));

        result
    }

    /// Validate then reconstruct in one call.
    pub fn replay(&self, events: &[Event]) -> Result<ReplayedExecution, ReplayMismatch> {
        self.validate(events)?;
        Ok(self.reconstruct(events))
    }

    /// Convenience: reconstruct and simultaneously hydrate an
    /// [`OperationLedger`]'s cache, so a resumed execution never re-runs
    /// an operation already present in history (spec.md §8 invariant 5).
    pub fn replay_with_ledger(
        &self,
        events: &[Event],
        ledger: &OperationLedger,
    ) -> Result<ReplayedExecution, ReplayMismatch> {
        ledger.hydrate_from_history(events);
        self.replay(events)
    }

    /// Apply a reconstructed projection onto a live [`WorkflowState`],
    /// used after replay to seed the in-memory state the scheduler will
    /// continue mutating.
    pub fn apply_to_state(replayed: &ReplayedExecution, state: &WorkflowState) {
        state.restore(replayed.script_globals.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChildPathDescriptor;
    use crate::workflow_def::{EdgeSpec, StepKind, StepSpec, WorkflowDefinitionSpec};

    fn workflow() -> WorkflowDefinition {
        WorkflowDefinition::from_spec(WorkflowDefinitionSpec {
            name: "greet_and_print".into(),
            entry: None,
            steps: vec![
                StepSpec {
                    name: "greet".into(),
                    kind: StepKind::Prompt {
                        prompt: "Say hello".into(),
                        store: Some("greet".into()),
                    },
                },
                StepSpec {
                    name: "print".into(),
                    kind: StepKind::Action {
                        action: "Print".into(),
                        parameters: serde_json::json!({}),
                        store: None,
                    },
                },
            ],
            edges: vec![EdgeSpec {
                from: "greet".into(),
                to: "print".into(),
                condition: None,
            }],
        })
        .unwrap()
    }

    fn event(execution_id: Uuid, seq: i64, path_id: Option<Uuid>, step: Option<&str>, kind: EventKind) -> Event {
        Event::new(execution_id, seq, path_id, step.map(|s| s.to_string()), kind)
    }

    #[test]
    fn test_validate_rejects_empty_history() {
        let replayer = Replayer::new(&workflow());
        assert_eq!(replayer.validate(&[]), Err(ReplayMismatch::EmptyHistory));
    }

    #[test]
    fn test_validate_requires_execution_started_first() {
        let replayer = Replayer::new(&workflow());
        let execution_id = Uuid::now_v7();
        let events = vec![event(execution_id, 1, None, None, EventKind::PathCompleted)];
        assert!(matches!(
            replayer.validate(&events),
            Err(ReplayMismatch::FirstEventNotStart(_))
        ));
    }

    #[test]
    fn test_validate_rejects_non_increasing_sequence() {
        let replayer = Replayer::new(&workflow());
        let execution_id = Uuid::now_v7();
        let events = vec![
            event(
                execution_id,
                1,
                None,
                None,
                EventKind::ExecutionStarted {
                    workflow_name: "greet_and_print".into(),
                    workflow_hash: "h".into(),
                    inputs: serde_json::json!({}),
                },
            ),
            event(execution_id, 1, None, None, EventKind::PathCompleted),
        ];
        assert_eq!(
            replayer.validate(&events),
            Err(ReplayMismatch::SequenceNotIncreasing(1, 1))
        );
    }

    #[test]
    fn test_validate_rejects_unknown_step() {
        let replayer = Replayer::new(&workflow());
        let execution_id = Uuid::now_v7();
        let events = vec![
            event(
                execution_id,
                1,
                None,
                None,
                EventKind::ExecutionStarted {
                    workflow_name: "greet_and_print".into(),
                    workflow_hash: "h".into(),
                    inputs: serde_json::json!({}),
                },
            ),
            event(
                execution_id,
                2,
                Some(Uuid::now_v7()),
                Some("does_not_exist"),
                EventKind::StepStarted {
                    step_type: "prompt".into(),
                },
            ),
        ];
        assert!(matches!(replayer.validate(&events), Err(ReplayMismatch::UnknownStep(_))));
    }

    #[test]
    fn test_reconstruct_linear_history() {
        let wf = workflow();
        let replayer = Replayer::new(&wf);
        let execution_id = Uuid::now_v7();
        let path_id = Uuid::now_v7();

        let events = vec![
            event(
                execution_id,
                1,
                None,
                None,
                EventKind::ExecutionStarted {
                    workflow_name: "greet_and_print".into(),
                    workflow_hash: wf.hash.clone(),
                    inputs: serde_json::json!({"name": "Ada"}),
                },
            ),
            event(
                execution_id,
                2,
                Some(path_id),
                None,
                EventKind::PathStarted {
                    current_step: "greet".into(),
                    inherited_outputs: false,
                },
            ),
            event(
                execution_id,
                3,
                Some(path_id),
                Some("greet"),
                EventKind::StepStarted { step_type: "prompt".into() },
            ),
            event(
                execution_id,
                4,
                Some(path_id),
                Some("greet"),
                EventKind::StepCompleted {
                    output: serde_json::json!("Hello Ada"),
                    stored_variable: Some("greet".into()),
                },
            ),
            event(execution_id, 5, Some(path_id), None, EventKind::PathCompleted),
            event(
                execution_id,
                6,
                None,
                None,
                EventKind::ExecutionCompleted {
                    outputs: serde_json::json!({"greet": "Hello Ada"}),
                },
            ),
        ];

        let replayed = replayer.replay(&events).unwrap();
        assert_eq!(replayed.status, ExecutionStatus::Completed);
        assert!(replayed.active_paths.is_empty());
        assert_eq!(
            replayed.completed_steps.get("greet"),
            Some(&serde_json::json!("Hello Ada"))
        );
        assert_eq!(
            replayed.script_globals.get("greet"),
            Some(&serde_json::json!("Hello Ada"))
        );
        assert_eq!(replayed.last_sequence, 6);
    }

    #[test]
    fn test_reconstruct_branch_inherits_parent_outputs() {
        let wf = WorkflowDefinition::from_spec(WorkflowDefinitionSpec {
            name: "branch".into(),
            entry: Some("start".into()),
            steps: vec![
                StepSpec {
                    name: "start".into(),
                    kind: StepKind::Action {
                        action: "Noop".into(),
                        parameters: serde_json::json!({}),
                        store: None,
                    },
                },
                StepSpec {
                    name: "p1".into(),
                    kind: StepKind::Action {
                        action: "Noop".into(),
                        parameters: serde_json::json!({}),
                        store: None,
                    },
                },
                StepSpec {
                    name: "p2".into(),
                    kind: StepKind::Action {
                        action: "Noop".into(),
                        parameters: serde_json::json!({}),
                        store: None,
                    },
                },
            ],
            edges: vec![
                EdgeSpec { from: "start".into(), to: "p1".into(), condition: None },
                EdgeSpec { from: "start".into(), to: "p2".into(), condition: None },
            ],
        })
        .unwrap();
        let replayer = Replayer::new(&wf);
        let execution_id = Uuid::now_v7();
        let parent = Uuid::now_v7();
        let child = Uuid::now_v7();

        let events = vec![
            event(
                execution_id,
                1,
                None,
                None,
                EventKind::ExecutionStarted {
                    workflow_name: "branch".into(),
                    workflow_hash: wf.hash.clone(),
                    inputs: serde_json::json!({}),
                },
            ),
            event(
                execution_id,
                2,
                Some(parent),
                None,
                EventKind::PathStarted {
                    current_step: "start".into(),
                    inherited_outputs: false,
                },
            ),
            event(
                execution_id,
                3,
                Some(parent),
                Some("start"),
                EventKind::StepCompleted {
                    output: serde_json::json!("ok"),
                    stored_variable: None,
                },
            ),
            event(
                execution_id,
                4,
                Some(parent),
                Some("start"),
                EventKind::PathBranched {
                    children: vec![ChildPathDescriptor {
                        path_id: child,
                        start_step: "p2".into(),
                        inherit_outputs: true,
                    }],
                },
            ),
        ];

        let replayed = replayer.reconstruct(&events);
        assert!(replayed.active_paths.contains_key(&parent));
        let child_path = replayed.active_paths.get(&child).unwrap();
        assert_eq!(child_path.outputs.get("start"), Some(&serde_json::json!("ok")));
    }
}

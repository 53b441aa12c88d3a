//! Typed event payloads for the execution log

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A child path produced by a branch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChildPathDescriptor {
    /// Identifier of the newly created path
    pub path_id: Uuid,

    /// Step the child path starts at
    pub start_step: String,

    /// Whether the child inherits a snapshot of the parent's step outputs
    pub inherit_outputs: bool,
}

/// A single `set`/`delete` entry within a `state_mutated` batch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StateMutation {
    /// Assign a value to a key
    Set { key: String, value: serde_json::Value },
    /// Remove a key
    Delete { key: String },
}

/// Error captured when a step or execution fails
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionError {
    /// Human-readable error message
    pub message: String,

    /// Error code for programmatic handling
    pub code: Option<String>,

    /// Whether the failure is retryable
    pub retryable: bool,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: false,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: true,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ExecutionError {}

/// Closed set of event kinds persisted in the execution log.
///
/// This is a tagged union (`#[serde(tag = "type")]`) rather than a
/// bag-of-attributes payload: adding a variant forces every `match` on
/// `EventKind` to be updated, which is the point (see `Replayer` and
/// `Recorder`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------
    ExecutionStarted {
        workflow_name: String,
        workflow_hash: String,
        inputs: serde_json::Value,
    },
    ExecutionCompleted {
        outputs: serde_json::Value,
    },
    ExecutionFailed {
        error: ExecutionError,
    },
    ExecutionContinueAsNew {
        reason: String,
        new_execution_id: Uuid,
    },

    // ---------------------------------------------------------------
    // Path
    // ---------------------------------------------------------------
    PathStarted {
        current_step: String,
        inherited_outputs: bool,
    },
    PathCompleted,
    PathFailed {
        error: ExecutionError,
    },
    PathBranched {
        children: Vec<ChildPathDescriptor>,
    },

    // ---------------------------------------------------------------
    // Step
    // ---------------------------------------------------------------
    StepStarted {
        step_type: String,
    },
    StepCompleted {
        output: serde_json::Value,
        stored_variable: Option<String>,
    },
    StepFailed {
        error: ExecutionError,
    },

    // ---------------------------------------------------------------
    // Operation
    // ---------------------------------------------------------------
    OperationStarted {
        operation_id: String,
        operation_type: String,
    },
    OperationCompleted {
        operation_id: String,
        result: serde_json::Value,
        duration_ms: u64,
    },
    OperationFailed {
        operation_id: String,
        error: ExecutionError,
        duration_ms: u64,
    },

    // ---------------------------------------------------------------
    // State
    // ---------------------------------------------------------------
    StateMutated {
        mutations: Vec<StateMutation>,
    },

    // ---------------------------------------------------------------
    // Determinism
    // ---------------------------------------------------------------
    TimeAccessed {
        call_site: String,
        value: chrono::DateTime<chrono::Utc>,
    },
    RandomGenerated {
        call_site: String,
        value: f64,
    },

    // ---------------------------------------------------------------
    // Iteration
    // ---------------------------------------------------------------
    IterationStarted {
        index: usize,
        item: serde_json::Value,
    },
    IterationCompleted {
        index: usize,
        output: serde_json::Value,
    },

    // ---------------------------------------------------------------
    // Control
    // ---------------------------------------------------------------
    SignalReceived {
        signal_type: String,
        payload: serde_json::Value,
    },
    VersionDecision {
        workflow_version: i64,
    },
}

impl EventKind {
    /// Stable string tag, matching the `#[serde(tag = "type")]` discriminant.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::ExecutionStarted { .. } => "execution_started",
            Self::ExecutionCompleted { .. } => "execution_completed",
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::ExecutionContinueAsNew { .. } => "execution_continue_as_new",
            Self::PathStarted { .. } => "path_started",
            Self::PathCompleted => "path_completed",
            Self::PathFailed { .. } => "path_failed",
            Self::PathBranched { .. } => "path_branched",
            Self::StepStarted { .. } => "step_started",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::OperationStarted { .. } => "operation_started",
            Self::OperationCompleted { .. } => "operation_completed",
            Self::OperationFailed { .. } => "operation_failed",
            Self::StateMutated { .. } => "state_mutated",
            Self::TimeAccessed { .. } => "time_accessed",
            Self::RandomGenerated { .. } => "random_generated",
            Self::IterationStarted { .. } => "iteration_started",
            Self::IterationCompleted { .. } => "iteration_completed",
            Self::SignalReceived { .. } => "signal_received",
            Self::VersionDecision { .. } => "version_decision",
        }
    }

    /// Whether this event ends an execution's lifecycle.
    pub fn is_execution_terminal(&self) -> bool {
        matches!(
            self,
            Self::ExecutionCompleted { .. }
                | Self::ExecutionFailed { .. }
                | Self::ExecutionContinueAsNew { .. }
        )
    }

    /// Whether this event ends a path's lifecycle.
    pub fn is_path_terminal(&self) -> bool {
        matches!(self, Self::PathCompleted | Self::PathFailed { .. })
    }

    /// One-way adapter for reading pre-migration, untyped "bag of
    /// attributes" events. New events are never emitted in this shape;
    /// this exists only so old logs stay readable (spec.md §9).
    pub fn from_legacy(
        type_tag: &str,
        mut attrs: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, LegacyDecodeError> {
        let take = |attrs: &mut serde_json::Map<String, serde_json::Value>, key: &str| {
            attrs.remove(key).unwrap_or(serde_json::Value::Null)
        };

        Ok(match type_tag {
            "execution_started" | "workflow_started" => Self::ExecutionStarted {
                workflow_name: take(&mut attrs, "workflow_name")
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                workflow_hash: take(&mut attrs, "workflow_hash")
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                inputs: take(&mut attrs, "inputs"),
            },
            "execution_completed" | "workflow_completed" => Self::ExecutionCompleted {
                outputs: take(&mut attrs, "outputs"),
            },
            other => return Err(LegacyDecodeError::UnknownTag(other.to_string())),
        })
    }
}

/// Error decoding a legacy untyped event
#[derive(Debug, thiserror::Error)]
pub enum LegacyDecodeError {
    #[error("unrecognized legacy event tag: {0}")]
    UnknownTag(String),
}

/// An immutable record in an execution's append-only log.
///
/// `sequence` is strictly monotonic per execution, starting at 1,
/// assigned atomically by the [`crate::recorder::Recorder`] at emission
/// time (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub event_id: Uuid,
    pub execution_id: Uuid,
    pub sequence: i64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub path_id: Option<Uuid>,
    pub step_name: Option<String>,
    pub kind: EventKind,
}

/// Error returned by [`Event::validate`]
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EventValidationError {
    #[error("event sequence must be > 0, got {0}")]
    NonPositiveSequence(i64),

    #[error("event execution_id must not be nil")]
    NilExecutionId,

    #[error("event id must not be nil")]
    NilEventId,
}

impl Event {
    /// Construct a new event envelope. Does not validate; see [`Event::validate`].
    pub fn new(
        execution_id: Uuid,
        sequence: i64,
        path_id: Option<Uuid>,
        step_name: Option<String>,
        kind: EventKind,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            execution_id,
            sequence,
            timestamp: chrono::Utc::now(),
            path_id,
            step_name,
            kind,
        }
    }

    /// An event is valid iff sequence > 0, and both ids are non-nil.
    /// The payload's own shape is enforced by the type system (it can't
    /// fail to deserialize into a variant it wasn't tagged as).
    pub fn validate(&self) -> Result<(), EventValidationError> {
        if self.sequence <= 0 {
            return Err(EventValidationError::NonPositiveSequence(self.sequence));
        }
        if self.execution_id.is_nil() {
            return Err(EventValidationError::NilExecutionId);
        }
        if self.event_id.is_nil() {
            return Err(EventValidationError::NilEventId);
        }
        Ok(())
    }

    pub fn type_tag(&self) -> &'static str {
        self.kind.tag()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_round_trip() {
        let event = Event::new(
            Uuid::now_v7(),
            1,
            None,
            None,
            EventKind::ExecutionStarted {
                workflow_name: "greet".into(),
                workflow_hash: "abc123".into(),
                inputs: serde_json::json!({}),
            },
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"execution_started\""));

        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_validate_rejects_zero_sequence() {
        let event = Event::new(Uuid::now_v7(), 0, None, None, EventKind::PathCompleted);
        assert_eq!(
            event.validate(),
            Err(EventValidationError::NonPositiveSequence(0))
        );
    }

    #[test]
    fn test_validate_rejects_nil_execution_id() {
        let event = Event::new(Uuid::nil(), 1, None, None, EventKind::PathCompleted);
        assert_eq!(event.validate(), Err(EventValidationError::NilExecutionId));
    }

    #[test]
    fn test_is_execution_terminal() {
        assert!(EventKind::ExecutionCompleted {
            outputs: serde_json::json!({})
        }
        .is_execution_terminal());
        assert!(EventKind::ExecutionFailed {
            error: ExecutionError::new("boom")
        }
        .is_execution_terminal());
        assert!(!EventKind::PathStarted {
            current_step: "a".into(),
            inherited_outputs: false
        }
        .is_execution_terminal());
    }

    #[test]
    fn test_unknown_legacy_tag_is_decode_error() {
        let result = EventKind::from_legacy("not_a_real_tag", serde_json::Map::new());
        assert!(matches!(result, Err(LegacyDecodeError::UnknownTag(_))));
    }

    #[test]
    fn test_legacy_adapter_maps_known_tag() {
        let mut attrs = serde_json::Map::new();
        attrs.insert("workflow_name".into(), serde_json::json!("greet"));
        attrs.insert("workflow_hash".into(), serde_json::json!("h1"));
        attrs.insert("inputs".into(), serde_json::json!({"a": 1}));

        let kind = EventKind::from_legacy("workflow_started", attrs).unwrap();
        assert!(matches!(kind, EventKind::ExecutionStarted { .. }));
    }
}

use std::collections::HashMap;

use crate::event::ExecutionError;

/// Lifecycle state of a single path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Tracked state for one path, owned by the [`super::PathScheduler`] while
/// the path's task is live and left in place (read-only) once it finishes.
#[derive(Debug, Clone)]
pub struct PathRecord {
    pub status: PathStatus,
    pub current_step: String,
    pub outputs: HashMap<String, serde_json::Value>,
    pub error: Option<ExecutionError>,
}

impl PathRecord {
    pub fn new(start_step: impl Into<String>, inherited_outputs: HashMap<String, serde_json::Value>) -> Self {
        Self {
            status: PathStatus::Pending,
            current_step: start_step.into(),
            outputs: inherited_outputs,
            error: None,
        }
    }
}

//! Scoped key-value store for script globals (spec.md §4.E)

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::event::{EventKind, StateMutation};
use crate::recorder::{Recorder, RecorderError};

/// Thread-safe map of script globals shared across all paths of one
/// execution. Every mutating call emits a `state_mutated` event carrying
/// the batch of changes, unless the recorder is in replay mode (the
/// in-memory map is still updated; only the emission is suppressed).
pub struct WorkflowState {
    recorder: Arc<Recorder>,
    data: RwLock<HashMap<String, serde_json::Value>>,
}

impl WorkflowState {
    pub fn new(recorder: Arc<Recorder>) -> Self {
        Self {
            recorder,
            data: RwLock::new(HashMap::new()),
        }
    }

    /// Construct with `inputs` pre-populated both under the `inputs` key
    /// and mirrored into top-level keys, per spec.md §4.E.
    pub fn with_inputs(recorder: Arc<Recorder>, inputs: &serde_json::Value) -> Self {
        let state = Self::new(recorder);
        {
            let mut data = state.data.write();
            data.insert("inputs".to_string(), inputs.clone());
            if let serde_json::Value::Object(map) = inputs {
                for (k, v) in map {
                    data.insert(k.clone(), v.clone());
                }
            }
        }
        state
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.data.read().get(key).cloned()
    }

    /// Set a single key, emitting a one-entry `state_mutated` batch.
    pub async fn set(&self, key: impl Into<String>, value: serde_json::Value) -> Result<(), RecorderError> {
        let key = key.into();
        {
            let mut data = self.data.write();
            data.insert(key.clone(), value.clone());
        }
        self.emit_mutations(vec![StateMutation::Set { key, value }], None, None)
            .await
    }

    /// Delete a single key, emitting a one-entry `state_mutated` batch.
    /// Deleting an absent key is not an error.
    pub async fn delete(&self, key: impl Into<String>) -> Result<(), RecorderError> {
        let key = key.into();
        {
            let mut data = self.data.write();
            data.remove(&key);
        }
        self.emit_mutations(vec![StateMutation::Delete { key }], None, None)
            .await
    }

    /// Apply several mutations as one event, preserving their order.
    pub async fn apply_batch(
        &self,
        mutations: Vec<StateMutation>,
        path_id: Option<Uuid>,
        step_name: Option<String>,
    ) -> Result<(), RecorderError> {
        {
            let mut data = self.data.write();
            for m in &mutations {
                match m {
                    StateMutation::Set { key, value } => {
                        data.insert(key.clone(), value.clone());
                    }
                    StateMutation::Delete { key } => {
                        data.remove(key);
                    }
                }
            }
        }
        self.emit_mutations(mutations, path_id, step_name).await
    }

    /// Apply a previously-recorded `state_mutated` batch during replay:
    /// updates in-memory state without emitting a new event (the
    /// recorder's replay-mode gate would no-op the emission anyway, but
    /// this path skips the recorder entirely for clarity).
    pub fn apply_replayed(&self, mutations: &[StateMutation]) {
        let mut data = self.data.write();
        for m in mutations {
            match m {
                StateMutation::Set { key, value } => {
                    data.insert(key.clone(), value.clone());
                }
                StateMutation::Delete { key } => {
                    data.remove(key);
                }
            }
        }
    }

    async fn emit_mutations(
        &self,
        mutations: Vec<StateMutation>,
        path_id: Option<Uuid>,
        step_name: Option<String>,
    ) -> Result<(), RecorderError> {
        if mutations.is_empty() {
            return Ok(());
        }
        self.recorder
            .record(EventKind::StateMutated { mutations }, path_id, step_name)
            .await
    }

    /// Full snapshot of current globals, used to seed child-path scopes
    /// and continuation snapshots.
    pub fn snapshot(&self) -> HashMap<String, serde_json::Value> {
        self.data.read().clone()
    }

    /// Restore from a previously captured snapshot (continuation resume).
    pub fn restore(&self, snapshot: HashMap<String, serde_json::Value>) {
        *self.data.write() = snapshot;
    }
}

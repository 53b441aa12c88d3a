//! The static workflow graph: steps and edges, loaded once per execution
//! and never mutated (spec.md §3 "Workflow", GLOSSARY).
//!
//! This is a data-driven graph rather than the teacher's compiled
//! trait-based state machine, since the step types here (`prompt`,
//! `action`, `each`, conditional edges) are interpreted at runtime against
//! an event-sourced execution, not implemented per-workflow in Rust.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: StepKind,
}

/// Per-step-type payload (spec.md §4.G). `conditional edge` is not a step
/// type — it's handled by [`EdgeSpec::condition`] during edge selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Template-expand `prompt` against scope, invoke an `agent_response`
    /// operation, result is the agent's response text.
    Prompt {
        prompt: String,
        #[serde(default)]
        store: Option<String>,
    },
    /// Template-expand `parameters`, invoke an `action_execution`
    /// operation against the named action.
    Action {
        action: String,
        #[serde(default)]
        parameters: serde_json::Value,
        #[serde(default)]
        store: Option<String>,
    },
    /// Iterate `items` (an expression resolving to a list); run `inner`
    /// once per element, emitting `iteration_started`/`iteration_completed`
    /// around it. Output is the list of inner results.
    Each {
        items: String,
        #[serde(rename = "do")]
        inner: Box<StepSpec>,
        #[serde(default)]
        store: Option<String>,
    },
}

impl StepSpec {
    pub fn store_variable(&self) -> Option<&str> {
        match &self.kind {
            StepKind::Prompt { store, .. } => store.as_deref(),
            StepKind::Action { store, .. } => store.as_deref(),
            StepKind::Each { store, .. } => store.as_deref(),
        }
    }

    pub fn step_type(&self) -> &'static str {
        match &self.kind {
            StepKind::Prompt { .. } => "prompt",
            StepKind::Action { .. } => "action",
            StepKind::Each { .. } => "each",
        }
    }
}

/// A directed edge out of a step. `condition`, if present, is evaluated
/// against the expression contract (§4.G); `None` always matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub condition: Option<String>,
}

/// Wire/on-disk shape, parsed directly from YAML/JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinitionSpec {
    pub name: String,
    #[serde(default)]
    pub entry: Option<String>,
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

/// Error constructing a [`WorkflowDefinition`] from its spec.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowDefError {
    #[error("workflow has no steps")]
    Empty,

    #[error("duplicate step name: {0}")]
    DuplicateStep(String),

    #[error("entry step not found: {0}")]
    UnknownEntry(String),

    #[error("edge references unknown step: {0}")]
    UnknownEdgeEndpoint(String),

    #[error("invalid yaml: {0}")]
    Yaml(String),
}

/// The validated, content-hashed workflow graph. Immutable for the
/// lifetime of an execution; a workflow's identity is `(name, hash)`
/// (spec.md §3 "Execution").
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub name: String,
    pub hash: String,
    pub entry_step: String,
    steps: HashMap<String, StepSpec>,
    edges_by_source: HashMap<String, Vec<EdgeSpec>>,
}

impl WorkflowDefinition {
    pub fn from_spec(spec: WorkflowDefinitionSpec) -> Result<Self, WorkflowDefError> {
        if spec.steps.is_empty() {
            return Err(WorkflowDefError::Empty);
        }

        let mut steps = HashMap::new();
        for step in &spec.steps {
            if steps.insert(step.name.clone(), step.clone()).is_some() {
                return Err(WorkflowDefError::DuplicateStep(step.name.clone()));
            }
        }

        let entry_step = spec
            .entry
            .clone()
            .unwrap_or_else(|| spec.steps[0].name.clone());
        if !steps.contains_key(&entry_step) {
            return Err(WorkflowDefError::UnknownEntry(entry_step));
        }

        let mut edges_by_source: HashMap<String, Vec<EdgeSpec>> = HashMap::new();
        for edge in &spec.edges {
            if !steps.contains_key(&edge.from) {
                return Err(WorkflowDefError::UnknownEdgeEndpoint(edge.from.clone()));
            }
            if !steps.contains_key(&edge.to) {
                return Err(WorkflowDefError::UnknownEdgeEndpoint(edge.to.clone()));
            }
            edges_by_source
                .entry(edge.from.clone())
                .or_default()
                .push(edge.clone());
        }

        let canonical = serde_json::to_string(&spec)
            .map_err(|e| WorkflowDefError::Yaml(e.to_string()))?;
        let hash = hex::encode(Sha256::digest(canonical.as_bytes()));

        Ok(Self {
            name: spec.name,
            hash,
            entry_step,
            steps,
            edges_by_source,
        })
    }

    pub fn parse_yaml(source: &str) -> Result<Self, WorkflowDefError> {
        let spec: WorkflowDefinitionSpec =
            serde_yaml::from_str(source).map_err(|e| WorkflowDefError::Yaml(e.to_string()))?;
        Self::from_spec(spec)
    }

    pub fn get_step(&self, name: &str) -> Option<&StepSpec> {
        self.steps.get(name)
    }

    /// Outgoing edges in declaration order (spec.md §4.F "Tie-breaks":
    /// branch children are spawned in edge-declaration order).
    pub fn outgoing_edges(&self, step_name: &str) -> &[EdgeSpec] {
        self.edges_by_source
            .get(step_name)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_spec() -> WorkflowDefinitionSpec {
        WorkflowDefinitionSpec {
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
                        parameters: serde_json::json!({"Message": "${greet}"}),
                        store: None,
                    },
                },
            ],
            edges: vec![EdgeSpec {
                from: "greet".into(),
                to: "print".into(),
                condition: None,
            }],
        }
    }

    #[test]
    fn test_entry_defaults_to_first_step() {
        let def = WorkflowDefinition::from_spec(linear_spec()).unwrap();
        assert_eq!(def.entry_step, "greet");
    }

    #[test]
    fn test_outgoing_edges_in_declaration_order() {
        let mut spec = linear_spec();
        spec.edges.push(EdgeSpec {
            from: "greet".into(),
            to: "greet".into(),
            condition: Some("false".into()),
        });
        let def = WorkflowDefinition::from_spec(spec).unwrap();
        let edges = def.outgoing_edges("greet");
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].to, "print");
        assert_eq!(edges[1].to, "greet");
    }

    #[test]
    fn test_duplicate_step_name_rejected() {
        let mut spec = linear_spec();
        spec.steps.push(spec.steps[0].clone());
        assert!(matches!(
            WorkflowDefinition::from_spec(spec),
            Err(WorkflowDefError::DuplicateStep(_))
        ));
    }

    #[test]
    fn test_edge_to_unknown_step_rejected() {
        let mut spec = linear_spec();
        spec.edges.push(EdgeSpec {
            from: "greet".into(),
            to: "does_not_exist".into(),
            condition: None,
        });
        assert!(matches!(
            WorkflowDefinition::from_spec(spec),
            Err(WorkflowDefError::UnknownEdgeEndpoint(_))
        ));
    }

    #[test]
    fn test_hash_is_stable_for_identical_definitions() {
        let a = WorkflowDefinition::from_spec(linear_spec()).unwrap();
        let b = WorkflowDefinition::from_spec(linear_spec()).unwrap();
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
name: greet_and_print
steps:
  - name: greet
    type: prompt
    prompt: "Say hello"
    store: greet
  - name: print
    type: action
    action: Print
    parameters:
      Message: "${greet}"
edges:
  - from: greet
    to: print
"#;
        let def = WorkflowDefinition::parse_yaml(yaml).unwrap();
        assert_eq!(def.name, "greet_and_print");
        assert_eq!(def.entry_step, "greet");
        assert!(def.get_step("print").is_some());
    }
}

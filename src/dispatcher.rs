//! Per-step-type execution (spec.md §4.G)

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::{EventKind, ExecutionError};
use crate::expr::ExpressionEvaluator;
use crate::ledger::{LedgerError, Operation, OperationLedger};
use crate::operations::{ActionExecutor, AgentClient, OperationContext};
use crate::recorder::Recorder;
use crate::state::WorkflowState;
use crate::workflow_def::{StepKind, StepSpec};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outcome of dispatching one step: its output value and, if the step
/// declares a `store` variable, the variable name to promote it under.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub output: serde_json::Value,
    pub stored_variable: Option<String>,
}

fn ledger_err_to_execution_error(err: LedgerError) -> ExecutionError {
    match err {
        LedgerError::Operation(e) => e,
        LedgerError::Recorder(e) => ExecutionError::retryable(e.to_string()),
    }
}

/// Resolves one step's typed payload into an [`Operation`], invokes the
/// matching collaborator through the [`OperationLedger`], and returns the
/// step's output. Conditional edges are not dispatched here — they are
/// evaluated by the Path Scheduler during edge selection.
pub struct StepDispatcher {
    execution_id: Uuid,
    ledger: Arc<OperationLedger>,
    recorder: Arc<Recorder>,
    state: Arc<WorkflowState>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    agent_client: Arc<dyn AgentClient>,
    action_executor: Arc<dyn ActionExecutor>,
    cancellation: CancellationToken,
}

impl StepDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        execution_id: Uuid,
        ledger: Arc<OperationLedger>,
        recorder: Arc<Recorder>,
        state: Arc<WorkflowState>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        agent_client: Arc<dyn AgentClient>,
        action_executor: Arc<dyn ActionExecutor>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            execution_id,
            ledger,
            recorder,
            state,
            evaluator,
            agent_client,
            action_executor,
            cancellation,
        }
    }

    pub fn evaluator(&self) -> &Arc<dyn ExpressionEvaluator> {
        &self.evaluator
    }

    fn build_scope(&self, path_outputs: &HashMap<String, serde_json::Value>) -> serde_json::Value {
        let mut scope = self.state.snapshot();
        for (k, v) in path_outputs {
            scope.insert(k.clone(), v.clone());
        }
        serde_json::Value::Object(scope.into_iter().collect())
    }

    fn operation_context(&self, path_id: Uuid, step_name: &str) -> OperationContext {
        OperationContext {
            execution_id: self.execution_id,
            path_id,
            step_name: step_name.to_string(),
            cancellation: self.cancellation.clone(),
        }
    }

    /// Recursively template-expand every string leaf of a JSON value
    /// against `scope`; objects/arrays are walked, other scalars pass
    /// through unchanged.
    fn expand_value(
        &self,
        value: &serde_json::Value,
        scope: &serde_json::Value,
    ) -> Result<serde_json::Value, ExecutionError> {
        match value {
            serde_json::Value::String(s) => self
                .evaluator
                .expand_template(s, scope)
                .map(serde_json::Value::String)
                .map_err(|e| ExecutionError::new(e.to_string())),
            serde_json::Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), self.expand_value(v, scope)?);
                }
                Ok(serde_json::Value::Object(out))
            }
            serde_json::Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.expand_value(item, scope)?);
                }
                Ok(serde_json::Value::Array(out))
            }
            other => Ok(other.clone()),
        }
    }

    pub fn dispatch<'a>(
        &'a self,
        path_id: Uuid,
        step: &'a StepSpec,
        path_outputs: &'a HashMap<String, serde_json::Value>,
    ) -> BoxFuture<'a, Result<StepOutcome, ExecutionError>> {
        Box::pin(async move {
            match &step.kind {
                StepKind::Prompt { prompt, store } => {
                    let scope = self.build_scope(path_outputs);
                    let expanded = self
                        .evaluator
                        .expand_template(prompt, &scope)
                        .map_err(|e| ExecutionError::new(e.to_string()))?;

                    let op = Operation::new(
                        "agent_response",
                        step.name.clone(),
                        path_id,
                        serde_json::json!({ "prompt": expanded }),
                    );
                    let ctx = self.operation_context(path_id, &step.name);
                    let agent = self.agent_client.clone();
                    let prompt_text = expanded.clone();
                    let result = self
                        .ledger
                        .execute_operation(&op, move || async move {
                            agent
                                .respond(&ctx, &prompt_text)
                                .await
                                .map(|text| serde_json::json!(text))
                        })
                        .await
                        .map_err(ledger_err_to_execution_error)?;

                    Ok(StepOutcome {
                        output: result,
                        stored_variable: store.clone(),
                    })
                }

                StepKind::Action {
                    action,
                    parameters,
                    store,
                } => {
                    let scope = self.build_scope(path_outputs);
                    let expanded_params = self.expand_value(parameters, &scope)?;

                    let op = Operation::new(
                        "action_execution",
                        step.name.clone(),
                        path_id,
                        expanded_params.clone(),
                    );
                    let ctx = self.operation_context(path_id, &step.name);
                    let executor = self.action_executor.clone();
                    let action_name = action.clone();
                    let params_for_call = expanded_params.clone();
                    let result = self
                        .ledger
                        .execute_operation(&op, move || async move {
                            executor.execute(&ctx, &action_name, &params_for_call).await
                        })
                        .await
                        .map_err(ledger_err_to_execution_error)?;

                    Ok(StepOutcome {
                        output: result,
                        stored_variable: store.clone(),
                    })
                }

                StepKind::Each { items, inner, store } => {
                    let scope = self.build_scope(path_outputs);
                    let list_value = self
                        .evaluator
                        .evaluate_value(items, &scope)
                        .map_err(|e| ExecutionError::new(e.to_string()))?;
                    let elements = list_value.as_array().cloned().ok_or_else(|| {
                        ExecutionError::new(format!("`{items}` did not resolve to a list"))
                    })?;

                    let mut results = Vec::with_capacity(elements.len());
                    for (index, item) in elements.into_iter().enumerate() {
                        self.recorder
                            .record(
                                EventKind::IterationStarted {
                                    index,
                                    item: item.clone(),
                                },
                                Some(path_id),
                                Some(step.name.clone()),
                            )
                            .await
                            .map_err(|e| ExecutionError::retryable(e.to_string()))?;

                        // Sub-operations inherit the parent step name plus
                        // iteration index so their operation ids stay stable
                        // across replay (spec.md §4.G).
                        let mut inner_step = (**inner).clone();
                        inner_step.name = format!("{}[{}]", step.name, index);

                        let mut iter_outputs = path_outputs.clone();
                        iter_outputs.insert("item".to_string(), item);

                        let inner_outcome = self.dispatch(path_id, &inner_step, &iter_outputs).await?;

                        self.recorder
                            .record(
                                EventKind::IterationCompleted {
                                    index,
                                    output: inner_outcome.output.clone(),
                                },
                                Some(path_id),
                                Some(step.name.clone()),
                            )
                            .await
                            .map_err(|e| ExecutionError::retryable(e.to_string()))?;

                        results.push(inner_outcome.output);
                    }

                    Ok(StepOutcome {
                        output: serde_json::Value::Array(results),
                        stored_variable: store.clone(),
                    })
                }
            }
        })
    }
}

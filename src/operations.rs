//! Operation collaborator traits: the external, non-deterministic
//! implementations the Step Dispatcher (§4.G) invokes through the
//! Operation Ledger. Out of scope per spec.md §1 ("Agent implementations
//! ... addressed only by the operation interface they plug into"); this
//! module is the interface, not an implementation.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::ExecutionError;

/// Carried into every operation body so long-running collaborators can
/// observe cancellation at their own suspension points (spec.md §5
/// "Cancellation").
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub execution_id: Uuid,
    pub path_id: Uuid,
    pub step_name: String,
    pub cancellation: CancellationToken,
}

impl OperationContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Resolves a `prompt` step's expanded prompt text to an agent response.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn respond(&self, ctx: &OperationContext, prompt: &str) -> Result<String, ExecutionError>;
}

/// Resolves an `action` step's name + expanded parameters to a result
/// value.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(
        &self,
        ctx: &OperationContext,
        action_name: &str,
        parameters: &serde_json::Value,
    ) -> Result<serde_json::Value, ExecutionError>;
}

/// Stub collaborators for tests and examples that don't need a real LLM
/// or action environment wired up.
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use parking_lot::Mutex;

    /// Returns a fixed response regardless of prompt, recording every
    /// prompt it was asked to answer for assertions.
    #[derive(Default)]
    pub struct StaticAgentClient {
        pub response: String,
        pub seen_prompts: Mutex<Vec<String>>,
    }

    impl StaticAgentClient {
        pub fn new(response: impl Into<String>) -> Self {
            Self {
                response: response.into(),
                seen_prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AgentClient for StaticAgentClient {
        async fn respond(&self, _ctx: &OperationContext, prompt: &str) -> Result<String, ExecutionError> {
            self.seen_prompts.lock().push(prompt.to_string());
            Ok(self.response.clone())
        }
    }

    /// Echoes its parameters back as the result, keyed by action name.
    #[derive(Default)]
    pub struct EchoActionExecutor {
        pub calls: Mutex<Vec<(String, serde_json::Value)>>,
        pub failing_actions: HashMap<String, String>,
    }

    #[async_trait]
    impl ActionExecutor for EchoActionExecutor {
        async fn execute(
            &self,
            _ctx: &OperationContext,
            action_name: &str,
            parameters: &serde_json::Value,
        ) -> Result<serde_json::Value, ExecutionError> {
            self.calls
                .lock()
                .push((action_name.to_string(), parameters.clone()));
            if let Some(msg) = self.failing_actions.get(action_name) {
                return Err(ExecutionError::new(msg.clone()));
            }
            Ok(serde_json::json!({"action": action_name, "parameters": parameters}))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn ctx() -> OperationContext {
        OperationContext {
            execution_id: Uuid::now_v7(),
            path_id: Uuid::now_v7(),
            step_name: "greet".into(),
            cancellation: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_static_agent_client_records_prompt() {
        let client = StaticAgentClient::new("Hello");
        let response = client.respond(&ctx(), "Say hello").await.unwrap();
        assert_eq!(response, "Hello");
        assert_eq!(client.seen_prompts.lock().as_slice(), ["Say hello"]);
    }

    #[tokio::test]
    async fn test_echo_action_executor_echoes_parameters() {
        let executor = EchoActionExecutor::default();
        let params = serde_json::json!({"Message": "hi"});
        let result = executor.execute(&ctx(), "Print", &params).await.unwrap();
        assert_eq!(result["parameters"], params);
    }

    #[tokio::test]
    async fn test_operation_context_cancellation() {
        let token = CancellationToken::new();
        let c = OperationContext {
            execution_id: Uuid::now_v7(),
            path_id: Uuid::now_v7(),
            step_name: "s".into(),
            cancellation: token.clone(),
        };
        assert!(!c.is_cancelled());
        token.cancel();
        assert!(c.is_cancelled());
    }
}

//! # Durable Agent Engine
//!
//! A SQLite-backed, event-sourced execution engine for durable AI-agent
//! workflows. A workflow is a directed graph of steps (prompt / action /
//! conditional branch / iteration); every execution is recorded as an
//! ordered, append-only event log, which makes crash recovery, replay,
//! retry-from-checkpoint and continue-as-new migration all fall out of
//! the same log instead of needing separate mechanisms.
//!
//! ## Features
//!
//! - **Event-sourced executions**: every state change is an [`event::Event`]
//!   appended through a [`recorder::Recorder`]; nothing is mutated in place.
//! - **Deterministic replay**: [`replayer::Replayer`] reconstructs in-memory
//!   state from history and validates it against the live workflow
//!   definition before resuming.
//! - **Operation caching**: [`ledger::OperationLedger`] memoizes
//!   non-deterministic calls (agent responses, actions) by content hash so
//!   replay never re-invokes them.
//! - **Cooperative parallelism**: [`scheduler::PathScheduler`] runs one
//!   branch of the workflow graph per path, fanning out and joining as the
//!   graph dictates.
//! - **Continue-as-new**: [`continuation::ContinuationController`] bounds
//!   history growth by migrating long-running executions to a fresh one.
//! - **Retries and backpressure**: [`reliability::RetryPolicy`] and
//!   [`reliability::CircuitBreakerConfig`] are reused by the recorder's
//!   flush path; the recorder also applies watermark-based backpressure.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Orchestrator                           │
//! │   (create / resume / retry / cancel executions)             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │   PathScheduler ──── StepDispatcher ──── OperationLedger     │
//! │   (branch fan-out)   (prompt/action/each)  (replay cache)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            Recorder ──── EventStore (SQLite / in-memory)     │
//! │   (buffered, backpressured append)                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use durable_agent_engine::prelude::*;
//!
//! let store = Arc::new(InMemoryEventStore::new());
//! let orchestrator = Orchestrator::new(store, EngineConfig::default(), collaborators);
//! let workflow = Arc::new(WorkflowDefinition::parse_yaml(&yaml)?);
//! let execution = orchestrator.create(workflow, inputs);
//! execution.run().await?;
//! ```

pub mod bench;
pub mod config;
pub mod continuation;
pub mod dispatcher;
pub mod event;
pub mod expr;
pub mod ledger;
pub mod operations;
pub mod orchestrator;
pub mod recorder;
pub mod reliability;
pub mod replayer;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod workflow_def;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{from_env, EngineConfig};
    pub use crate::continuation::{
        ContinuationController, ContinuationThresholds, PreservationPolicy,
    };
    pub use crate::dispatcher::StepDispatcher;
    pub use crate::event::{Event, EventKind};
    pub use crate::expr::{ExpressionEvaluator, MinijinjaEvaluator};
    pub use crate::ledger::OperationLedger;
    pub use crate::operations::{ActionExecutor, AgentClient, OperationContext};
    pub use crate::orchestrator::{Execution, Orchestrator, OrchestratorError, RetryStrategy};
    pub use crate::recorder::{Recorder, RecorderConfig};
    pub use crate::reliability::{CircuitBreakerConfig, RetryPolicy};
    pub use crate::scheduler::{PathScheduler, SchedulerOutcome};
    pub use crate::state::WorkflowState;
    pub use crate::store::{EventStore, InMemoryEventStore, SqliteEventStore, StoreError};
    pub use crate::workflow_def::{WorkflowDefinition, WorkflowDefinitionSpec};
}

// Re-export key types at crate root
pub use config::EngineConfig;
pub use event::{Event, EventKind};
pub use ledger::OperationLedger;
pub use operations::{ActionExecutor, AgentClient};
pub use orchestrator::{Execution, Orchestrator, OrchestratorError, RetryStrategy};
pub use recorder::Recorder;
pub use reliability::{CircuitBreakerConfig, RetryPolicy};
pub use scheduler::PathScheduler;
pub use state::WorkflowState;
pub use store::{EventStore, InMemoryEventStore, SqliteEventStore, StoreError};
pub use workflow_def::WorkflowDefinition;

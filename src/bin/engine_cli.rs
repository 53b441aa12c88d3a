//! Command-line shell over [`Orchestrator`]: every subcommand loads a
//! workflow and/or history and calls straight into the library. `anyhow`
//! is used only at this boundary; the library itself never returns
//! `anyhow::Error`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use durable_agent_engine::config::EngineConfig;
use durable_agent_engine::expr::MinijinjaEvaluator;
use durable_agent_engine::operations::testing::{EchoActionExecutor, StaticAgentClient};
use durable_agent_engine::orchestrator::{Collaborators, Orchestrator};
use durable_agent_engine::store::{EventStore, InMemoryEventStore, SqliteEventStore};
use durable_agent_engine::workflow_def::WorkflowDefinition;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "engine-cli")]
#[command(about = "Drive durable-agent-engine executions from the command line")]
#[command(version)]
struct Cli {
    /// SQLite connection string; omit to use an ephemeral in-memory store
    #[arg(long, env = "ENGINE_DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and drive a new execution to completion
    Run {
        /// Path to a workflow definition YAML file
        workflow: PathBuf,

        /// JSON-encoded execution inputs
        #[arg(long, default_value = "{}")]
        input: String,
    },

    /// Replay an existing execution's history and continue driving it
    Resume {
        /// Execution id to resume
        execution_id: Uuid,

        /// Path to the workflow definition the execution was created from
        workflow: PathBuf,
    },

    /// Print an execution's event history as JSON
    History {
        /// Execution id to inspect
        execution_id: Uuid,
    },
}

async fn build_store(database_url: Option<&str>) -> Result<Arc<dyn EventStore>> {
    match database_url {
        Some(url) => {
            let store = SqliteEventStore::connect(url)
                .await
                .with_context(|| format!("connecting to {url}"))?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(InMemoryEventStore::new())),
    }
}

fn default_collaborators() -> Collaborators {
    // The engine has no opinion on how prompts/actions are actually
    // fulfilled — an embedding application supplies its own `AgentClient`/
    // `ActionExecutor`. These fakes let the CLI drive a workflow
    // end-to-end for local testing without one.
    Collaborators {
        agent_client: Arc::new(StaticAgentClient::new("(engine-cli: no agent client configured)")),
        action_executor: Arc::new(EchoActionExecutor::default()),
        evaluator: Arc::new(MinijinjaEvaluator::new()),
    }
}

fn load_workflow(path: &PathBuf) -> Result<Arc<WorkflowDefinition>> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("reading workflow file {}", path.display()))?;
    let workflow = WorkflowDefinition::parse_yaml(&source)
        .with_context(|| format!("parsing workflow file {}", path.display()))?;
    Ok(Arc::new(workflow))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let store = build_store(cli.database_url.as_deref()).await?;
    let orchestrator = Orchestrator::new(store, EngineConfig::default(), default_collaborators());

    match cli.command {
        Commands::Run { workflow, input } => {
            let workflow = load_workflow(&workflow)?;
            let inputs: serde_json::Value =
                serde_json::from_str(&input).context("parsing --input as JSON")?;

            let execution = orchestrator.create(workflow, inputs);
            println!("execution {} created", execution.id());
            execution.run().await.context("running execution")?;

            let status = execution.status().await;
            println!("execution {} finished: {status}", execution.id());
            if let Some(error) = execution.error().await {
                println!("error: {error}");
            }
        }
        Commands::Resume { execution_id, workflow } => {
            let workflow = load_workflow(&workflow)?;
            let execution = orchestrator
                .resume(execution_id, workflow)
                .await
                .context("resuming execution")?;
            execution.run().await.context("running resumed execution")?;

            let status = execution.status().await;
            println!("execution {} finished: {status}", execution.id());
        }
        Commands::History { execution_id } => {
            let history = orchestrator
                .get_history(execution_id)
                .await
                .context("fetching execution history")?;
            println!("{}", serde_json::to_string_pretty(&history)?);
        }
    }

    Ok(())
}

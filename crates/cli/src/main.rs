//! `dagflow` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate` — check a workflow JSON file and list every conflict.
//! - `order`    — print the deterministic topological order.
//! - `run`      — submit, validate and execute a workflow with shell nodes.
//! - `resume`   — continue a workflow from its latest checkpoint.
//! - `status`   — print the latest recorded state of a workflow.
//! - `history`  — list the checkpoint log of a workflow.
//! - `migrate`  — run pending database migrations.

mod logging;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

use engine::{
    EngineConfig, EngineError, ExecutionState, SqliteCheckpointStore, StateManager, Workflow,
    WorkflowEngine, WorkflowStatus,
};
use nodes::shell::ShellExecutor;

#[derive(Parser)]
#[command(
    name = "dagflow",
    about = "Dependency-aware workflow engine with durable checkpoints",
    version
)]
struct Cli {
    /// SQLite database holding definitions and checkpoints.
    #[arg(long, global = true, env = "DATABASE_URL", default_value = "sqlite://dagflow.db")]
    database_url: String,

    /// Log filter (overrides DAGFLOW_LOG), e.g. `debug` or `engine=trace`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
    /// Print the topological order of a workflow definition.
    Order {
        path: PathBuf,
    },
    /// Run a workflow to completion. Ctrl-C cancels it.
    Run {
        path: PathBuf,
        /// Retries for retryable node failures (nodes may override).
        #[arg(long, default_value_t = 3)]
        max_retries: u32,
        /// Deadline in milliseconds for nodes without `timeout_ms`.
        #[arg(long)]
        node_timeout_ms: Option<u64>,
    },
    /// Resume a workflow from its latest checkpoint after a restart.
    Resume {
        workflow_id: Uuid,
        #[arg(long, default_value_t = 3)]
        max_retries: u32,
    },
    /// Show the latest recorded state of a workflow.
    Status {
        workflow_id: Uuid,
    },
    /// List checkpoints of a workflow, oldest first.
    History {
        workflow_id: Uuid,
        /// Only versions greater than this one.
        #[arg(long)]
        since: Option<u64>,
    },
    /// Run pending database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.log_level.as_deref())?;

    match cli.command {
        Command::Validate { path } => {
            let workflow = read_workflow(&path)?;
            match engine::validate(&workflow) {
                Ok(graph) => {
                    println!("✅ Workflow is valid. Execution order: {:?}", graph.order());
                }
                Err(conflicts) => {
                    eprintln!("❌ Validation failed with {} conflict(s):", conflicts.len());
                    for conflict in &conflicts {
                        eprintln!("   {conflict}");
                    }
                    std::process::exit(1);
                }
            }
        }
        Command::Order { path } => {
            let workflow = read_workflow(&path)?;
            match engine::topological_order(&workflow) {
                Ok(order) => {
                    for id in order {
                        println!("{id}");
                    }
                }
                Err(conflicts) => {
                    eprintln!("❌ Workflow has {} conflict(s); no order exists", conflicts.len());
                    std::process::exit(1);
                }
            }
        }
        Command::Run { path, max_retries, node_timeout_ms } => {
            let workflow = read_workflow(&path)?;
            let config = EngineConfig {
                max_retries,
                default_node_timeout: node_timeout_ms.map(Duration::from_millis),
                ..EngineConfig::default()
            };
            let engine = open_engine(&cli.database_url, config).await?;

            let id = match engine.submit_workflow(workflow).await {
                Ok(id) => id,
                Err(EngineError::Validation { workflow_id, conflicts }) => {
                    eprintln!("❌ Workflow {workflow_id} rejected:");
                    for conflict in &conflicts {
                        eprintln!("   {conflict}");
                    }
                    std::process::exit(1);
                }
                Err(e) => return Err(e).context("submitting workflow"),
            };
            println!("Workflow id: {id}");
            engine.start(id).await.context("starting workflow")?;

            let state = wait_or_cancel(&engine, id).await?;
            report(&state);
        }
        Command::Resume { workflow_id, max_retries } => {
            let config = EngineConfig { max_retries, ..EngineConfig::default() };
            let engine = open_engine(&cli.database_url, config).await?;
            engine
                .restore(workflow_id)
                .await
                .with_context(|| format!("restoring workflow {workflow_id}"))?;
            let status = engine.get_status(workflow_id).await?.status;
            if matches!(status, WorkflowStatus::Pending | WorkflowStatus::Validating) {
                bail!("workflow {workflow_id} was never started (status {status})");
            }

            let state = wait_or_cancel(&engine, workflow_id).await?;
            report(&state);
        }
        Command::Status { workflow_id } => {
            let engine = open_engine(&cli.database_url, EngineConfig::default()).await?;
            let state = engine.get_status(workflow_id).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Command::History { workflow_id, since } => {
            let engine = open_engine(&cli.database_url, EngineConfig::default()).await?;
            for checkpoint in engine.get_history(workflow_id, since).await? {
                let state = &checkpoint.state;
                let finished = state.nodes.values().filter(|r| r.state.is_terminal()).count();
                println!(
                    "v{:<4} {}  {:<10} {}/{} nodes finished",
                    checkpoint.version,
                    checkpoint.created_at.to_rfc3339(),
                    state.status.to_string(),
                    finished,
                    state.nodes.len()
                );
            }
        }
        Command::Migrate => {
            info!("Running migrations against {}", cli.database_url);
            let pool = db::pool::create_pool(&cli.database_url, 2)
                .await
                .context("failed to connect to database")?;
            db::pool::run_migrations(&pool).await.context("migration failed")?;
            info!("Migrations applied successfully");
        }
    }

    Ok(())
}

fn read_workflow(path: &Path) -> Result<Workflow> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid workflow JSON in {}", path.display()))
}

async fn open_engine(database_url: &str, config: EngineConfig) -> Result<WorkflowEngine> {
    let pool = db::pool::create_pool(database_url, 5)
        .await
        .context("failed to connect to database")?;
    db::pool::run_migrations(&pool).await.context("migration failed")?;

    let store = Arc::new(SqliteCheckpointStore::new(pool));
    Ok(WorkflowEngine::new(
        Arc::new(ShellExecutor::new()),
        StateManager::new(store),
        config,
    ))
}

async fn wait_or_cancel(engine: &WorkflowEngine, id: Uuid) -> Result<ExecutionState> {
    let state = tokio::select! {
        result = engine.wait(id) => result?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Cancelling workflow {id}; waiting for running nodes to stop");
            engine.cancel(id).await?;
            engine.wait(id).await?
        }
    };
    Ok(state)
}

fn report(state: &ExecutionState) {
    for (id, record) in &state.nodes {
        match record.reason {
            Some(reason) => println!("  {id:<20} {} ({reason:?})", record.state),
            None => println!("  {id:<20} {}", record.state),
        }
    }
    if let Some(detail) = &state.detail {
        println!("  detail: {detail}");
    }
    if state.status == WorkflowStatus::Completed {
        println!("✅ Workflow {} completed", state.workflow_id);
    } else {
        eprintln!("❌ Workflow {} ended {}", state.workflow_id, state.status);
        std::process::exit(1);
    }
}

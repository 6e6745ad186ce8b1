//! Workflow Engine — lifecycle façade over validation, scheduling and
//! persistence.
//!
//! Per workflow: `PENDING → VALIDATING → (RUNNING ⇄ PAUSED) →
//! {COMPLETED | FAILED | CANCELLED}`. Terminal states are final.
//!
//! Each engine instance owns its workflows; several engines in one process
//! share nothing but the store they are given.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use nodes::NodeExecutor;

use crate::config::EngineConfig;
use crate::dag::{self, DependencyGraph};
use crate::error::EngineError;
use crate::models::Workflow;
use crate::scheduler::{ExecutionControl, Scheduler};
use crate::state::{ExecutionState, FailureReason, NodeState, WorkflowStatus};
use crate::state_manager::StateManager;
use crate::store::Checkpoint;

type RunHandle = JoinHandle<Result<ExecutionState, EngineError>>;

struct WorkflowEntry {
    workflow: Arc<Workflow>,
    graph: Option<Arc<DependencyGraph>>,
    snapshots: Arc<watch::Sender<ExecutionState>>,
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
    task: Option<RunHandle>,
    started: bool,
}

impl WorkflowEntry {
    fn new(workflow: Arc<Workflow>, state: ExecutionState) -> Self {
        let (snapshots, _) = watch::channel(state);
        let (pause, _) = watch::channel(false);
        Self {
            workflow,
            graph: None,
            snapshots: Arc::new(snapshots),
            cancel: CancellationToken::new(),
            pause,
            task: None,
            started: false,
        }
    }

    fn status(&self) -> WorkflowStatus {
        self.snapshots.borrow().status
    }

    fn snapshot(&self) -> ExecutionState {
        self.snapshots.borrow().clone()
    }
}

/// Lifecycle API for submitting, running and observing workflows.
#[derive(Clone)]
pub struct WorkflowEngine {
    scheduler: Scheduler,
    state_manager: StateManager,
    workflows: Arc<RwLock<HashMap<Uuid, WorkflowEntry>>>,
}

impl WorkflowEngine {
    pub fn new(executor: Arc<dyn NodeExecutor>, state_manager: StateManager, config: EngineConfig) -> Self {
        Self {
            scheduler: Scheduler::new(executor, state_manager.clone(), config),
            state_manager,
            workflows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a definition. The workflow starts out PENDING.
    #[instrument(skip_all, fields(workflow_id = %workflow.id, name = %workflow.name))]
    pub async fn submit(&self, workflow: Workflow) -> Result<Uuid, EngineError> {
        let id = workflow.id;
        let mut workflows = self.workflows.write().await;
        if let Some(existing) = workflows.get(&id) {
            return Err(EngineError::InvalidTransition {
                workflow_id: id,
                status: existing.status(),
                action: "submit",
            });
        }

        let state = ExecutionState::new(&workflow);
        self.state_manager
            .save_definition(&workflow)
            .await
            .map_err(EngineError::Persistence)?;
        self.state_manager
            .persist(&state)
            .await
            .map_err(EngineError::Persistence)?;

        workflows.insert(id, WorkflowEntry::new(Arc::new(workflow), state));
        info!("workflow submitted");
        Ok(id)
    }

    /// Check the definition. On success the workflow waits in VALIDATING
    /// for [`Self::start`]; on conflicts it becomes FAILED.
    ///
    /// # Errors
    /// `Validation` with every conflict found.
    #[instrument(skip(self))]
    pub async fn validate(&self, workflow_id: Uuid) -> Result<(), EngineError> {
        let mut workflows = self.workflows.write().await;
        let entry = workflows
            .get_mut(&workflow_id)
            .ok_or(EngineError::WorkflowNotFound(workflow_id))?;
        require(entry, workflow_id, "validate", |s| s == WorkflowStatus::Pending)?;

        let mut state = entry.snapshot();
        state.set_status(WorkflowStatus::Validating);
        self.record(entry, &state).await?;

        match dag::validate(&entry.workflow) {
            Ok(graph) => {
                info!(order = ?graph.order(), "workflow validated");
                entry.graph = Some(Arc::new(graph));
                Ok(())
            }
            Err(conflicts) => {
                warn!(conflicts = conflicts.len(), "workflow rejected");
                state.conflicts = conflicts.clone();
                state.set_status(WorkflowStatus::Failed);
                self.record(entry, &state).await?;
                Err(EngineError::Validation { workflow_id, conflicts })
            }
        }
    }

    /// [`Self::submit`] followed by [`Self::validate`].
    pub async fn submit_workflow(&self, workflow: Workflow) -> Result<Uuid, EngineError> {
        let id = self.submit(workflow).await?;
        self.validate(id).await?;
        Ok(id)
    }

    /// Begin execution of a validated workflow in the background.
    #[instrument(skip(self))]
    pub async fn start(&self, workflow_id: Uuid) -> Result<(), EngineError> {
        let mut workflows = self.workflows.write().await;
        let entry = workflows
            .get_mut(&workflow_id)
            .ok_or(EngineError::WorkflowNotFound(workflow_id))?;
        require(entry, workflow_id, "start", |s| s == WorkflowStatus::Validating)?;

        let mut state = entry.snapshot();
        state.set_status(WorkflowStatus::Running);
        self.record(entry, &state).await?;
        self.launch(entry, state)
    }

    /// Latest published state. Workflows this engine never loaded are read
    /// from the checkpoint log.
    pub async fn get_status(&self, workflow_id: Uuid) -> Result<ExecutionState, EngineError> {
        if let Some(entry) = self.workflows.read().await.get(&workflow_id) {
            return Ok(entry.snapshot());
        }
        match self.state_manager.load_latest(workflow_id).await {
            Ok(checkpoint) => Ok(checkpoint.state),
            Err(EngineError::CheckpointNotFound(id)) => Err(EngineError::WorkflowNotFound(id)),
            Err(e) => Err(e),
        }
    }

    /// Stop dispatching new nodes. In-flight nodes keep running.
    #[instrument(skip(self))]
    pub async fn pause(&self, workflow_id: Uuid) -> Result<(), EngineError> {
        let workflows = self.workflows.read().await;
        let entry = workflows
            .get(&workflow_id)
            .ok_or(EngineError::WorkflowNotFound(workflow_id))?;
        let paused = *entry.pause.borrow();
        require(entry, workflow_id, "pause", |s| {
            s == WorkflowStatus::Running && !paused
        })?;
        entry.pause.send_replace(true);
        info!("pause requested");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn resume(&self, workflow_id: Uuid) -> Result<(), EngineError> {
        let workflows = self.workflows.read().await;
        let entry = workflows
            .get(&workflow_id)
            .ok_or(EngineError::WorkflowNotFound(workflow_id))?;
        let paused = *entry.pause.borrow();
        require(entry, workflow_id, "resume", |s| !s.is_terminal() && paused)?;
        entry.pause.send_replace(false);
        info!("resume requested");
        Ok(())
    }

    /// Cooperative cancellation. A workflow that never started is cancelled
    /// on the spot; a running one reaches CANCELLED once its in-flight nodes
    /// have stopped.
    #[instrument(skip(self))]
    pub async fn cancel(&self, workflow_id: Uuid) -> Result<(), EngineError> {
        let mut workflows = self.workflows.write().await;
        let entry = workflows
            .get_mut(&workflow_id)
            .ok_or(EngineError::WorkflowNotFound(workflow_id))?;
        require(entry, workflow_id, "cancel", |s| !s.is_terminal())?;

        if entry.started {
            entry.cancel.cancel();
            info!("cancellation signalled");
            return Ok(());
        }

        let mut state = entry.snapshot();
        for record in state.nodes.values_mut() {
            record.state = NodeState::Skipped;
            record.reason = Some(FailureReason::Cancelled);
        }
        state.set_status(WorkflowStatus::Cancelled);
        self.record(entry, &state).await?;
        info!("workflow cancelled before start");
        Ok(())
    }

    /// Wait for the workflow to reach a terminal state.
    ///
    /// # Errors
    /// The error that halted the run (e.g. `Persistence`). Only the first
    /// waiter receives it; later callers see the FAILED snapshot, which is
    /// never written to the log.
    pub async fn wait(&self, workflow_id: Uuid) -> Result<ExecutionState, EngineError> {
        let (task, mut snapshots) = {
            let mut workflows = self.workflows.write().await;
            let entry = workflows
                .get_mut(&workflow_id)
                .ok_or(EngineError::WorkflowNotFound(workflow_id))?;
            if entry.status().is_terminal() {
                return Ok(entry.snapshot());
            }
            if !entry.started {
                return Err(EngineError::InvalidTransition {
                    workflow_id,
                    status: entry.status(),
                    action: "wait for",
                });
            }
            (entry.task.take(), entry.snapshots.subscribe())
        };

        match task {
            Some(handle) => handle.await.map_err(|e| EngineError::Join {
                workflow_id,
                message: e.to_string(),
            })?,
            None => snapshots
                .wait_for(|s| s.status.is_terminal())
                .await
                .map(|s| s.clone())
                .map_err(|_| EngineError::Join {
                    workflow_id,
                    message: "run ended without a terminal state".into(),
                }),
        }
    }

    /// Checkpoint log of the workflow, oldest first.
    pub async fn get_history(&self, workflow_id: Uuid, since: Option<u64>) -> Result<Vec<Checkpoint>, EngineError> {
        self.state_manager.list_checkpoints(workflow_id, since).await
    }

    /// Pick a workflow back up from the store after a restart.
    ///
    /// Only a RUNNING or PAUSED workflow is relaunched; nodes that were
    /// RUNNING at the last checkpoint run again. A workflow that was never
    /// started comes back PENDING or VALIDATING and waits for the usual
    /// lifecycle calls. A terminal checkpoint is adopted as-is. An unreadable checkpoint marks the
    /// workflow FAILED with the reason in `detail`.
    #[instrument(skip(self))]
    pub async fn restore(&self, workflow_id: Uuid) -> Result<(), EngineError> {
        let mut workflows = self.workflows.write().await;
        if let Some(existing) = workflows.get(&workflow_id) {
            return Err(EngineError::InvalidTransition {
                workflow_id,
                status: existing.status(),
                action: "restore",
            });
        }

        let workflow = Arc::new(self.state_manager.load_definition(workflow_id).await?);
        let mut state = match self.state_manager.recover(workflow_id).await {
            Ok(state) => state,
            Err(EngineError::Recovery { workflow_id, detail }) => {
                let mut failed = ExecutionState::new(&workflow);
                failed.detail = Some(detail.clone());
                failed.set_status(WorkflowStatus::Failed);
                self.state_manager
                    .persist(&failed)
                    .await
                    .map_err(EngineError::Persistence)?;
                error!(%detail, "workflow marked failed");
                workflows.insert(workflow_id, WorkflowEntry::new(workflow, failed));
                return Err(EngineError::Recovery { workflow_id, detail });
            }
            Err(e) => return Err(e),
        };

        if state.status.is_terminal() {
            info!(status = %state.status, "workflow already finished");
            workflows.insert(workflow_id, WorkflowEntry::new(workflow, state));
            return Ok(());
        }
        if state.status == WorkflowStatus::Pending {
            info!("workflow restored unstarted");
            workflows.insert(workflow_id, WorkflowEntry::new(workflow, state));
            return Ok(());
        }

        let graph = match dag::validate(&workflow) {
            Ok(graph) => graph,
            Err(conflicts) => {
                state.conflicts = conflicts.clone();
                state.set_status(WorkflowStatus::Failed);
                self.state_manager
                    .persist(&state)
                    .await
                    .map_err(EngineError::Persistence)?;
                workflows.insert(workflow_id, WorkflowEntry::new(workflow, state));
                return Err(EngineError::Validation { workflow_id, conflicts });
            }
        };

        if state.status == WorkflowStatus::Validating {
            let mut entry = WorkflowEntry::new(workflow, state);
            entry.graph = Some(Arc::new(graph));
            workflows.insert(workflow_id, entry);
            info!("workflow restored awaiting start");
            return Ok(());
        }

        let resume_paused = state.status == WorkflowStatus::Paused;
        state.set_status(WorkflowStatus::Running);
        self.state_manager
            .persist(&state)
            .await
            .map_err(EngineError::Persistence)?;

        let mut entry = WorkflowEntry::new(workflow, state.clone());
        entry.graph = Some(Arc::new(graph));
        if resume_paused {
            entry.pause.send_replace(true);
        }
        self.launch(&mut entry, state)?;
        workflows.insert(workflow_id, entry);
        info!("workflow restored");
        Ok(())
    }

    /// Persist `state` and publish it as the entry's snapshot.
    async fn record(&self, entry: &WorkflowEntry, state: &ExecutionState) -> Result<(), EngineError> {
        self.state_manager
            .persist(state)
            .await
            .map_err(EngineError::Persistence)?;
        entry.snapshots.send_replace(state.clone());
        Ok(())
    }

    fn launch(&self, entry: &mut WorkflowEntry, state: ExecutionState) -> Result<(), EngineError> {
        let graph = entry.graph.clone().ok_or(EngineError::InvalidTransition {
            workflow_id: entry.workflow.id,
            status: state.status,
            action: "start an unvalidated",
        })?;
        entry.snapshots.send_replace(state.clone());

        let scheduler = self.scheduler.clone();
        let workflow = entry.workflow.clone();
        let snapshots = entry.snapshots.clone();
        let control = ExecutionControl {
            cancel: entry.cancel.clone(),
            pause: entry.pause.subscribe(),
        };

        entry.task = Some(tokio::spawn(async move {
            let result = scheduler.execute(&workflow, &graph, state, control, &snapshots).await;
            if let Err(e) = &result {
                error!(workflow_id = %workflow.id, error = %e, "execution halted");
                snapshots.send_modify(|s| {
                    s.detail = Some(e.to_string());
                    s.set_status(WorkflowStatus::Failed);
                });
            }
            result
        }));
        entry.started = true;
        Ok(())
    }
}

/// Reject `action` unless the entry's current status satisfies `allowed`.
fn require(
    entry: &WorkflowEntry,
    workflow_id: Uuid,
    action: &'static str,
    allowed: impl FnOnce(WorkflowStatus) -> bool,
) -> Result<(), EngineError> {
    let status = entry.status();
    if allowed(status) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition { workflow_id, status, action })
    }
}

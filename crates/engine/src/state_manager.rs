//! State Manager — sole writer of the checkpoint log.
//!
//! Every persisted [`ExecutionState`] becomes a new [`Checkpoint`]; nothing
//! is ever overwritten. `recover` turns the latest checkpoint back into a
//! state the scheduler can run.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{EngineError, StoreError};
use crate::models::Workflow;
use crate::state::{ExecutionState, NodeState};
use crate::store::{Checkpoint, CheckpointStore};

#[derive(Clone)]
pub struct StateManager {
    store: Arc<dyn CheckpointStore>,
}

impl StateManager {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    /// Write `state` as a new checkpoint version.
    pub async fn persist(&self, state: &ExecutionState) -> Result<Checkpoint, StoreError> {
        let checkpoint = self.store.append(state).await?;
        debug!(
            workflow_id = %state.workflow_id,
            version = checkpoint.version,
            status = %state.status,
            "checkpoint written"
        );
        Ok(checkpoint)
    }

    pub async fn save_definition(&self, workflow: &Workflow) -> Result<(), StoreError> {
        self.store.save_workflow(workflow).await
    }

    pub async fn load_definition(&self, workflow_id: Uuid) -> Result<Workflow, EngineError> {
        match self.store.load_workflow(workflow_id).await {
            Ok(workflow) => Ok(workflow),
            Err(StoreError::WorkflowNotFound(id)) => Err(EngineError::WorkflowNotFound(id)),
            Err(e) => Err(EngineError::Persistence(e)),
        }
    }

    /// Latest checkpoint of the workflow.
    ///
    /// # Errors
    /// `CheckpointNotFound` when nothing has been persisted yet.
    pub async fn load_latest(&self, workflow_id: Uuid) -> Result<Checkpoint, EngineError> {
        self.store
            .latest(workflow_id)
            .await
            .map_err(EngineError::Persistence)?
            .ok_or(EngineError::CheckpointNotFound(workflow_id))
    }

    /// Rebuild a runnable state from the latest checkpoint.
    ///
    /// Nodes caught RUNNING (or READY but never dispatched) go back to
    /// WAITING so the scheduler recomputes their readiness; they may run a
    /// second time. A terminal checkpoint is returned unchanged.
    ///
    /// # Errors
    /// `Recovery` when the checkpoint cannot be decoded.
    #[instrument(skip(self))]
    pub async fn recover(&self, workflow_id: Uuid) -> Result<ExecutionState, EngineError> {
        let checkpoint = match self.store.latest(workflow_id).await {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => return Err(EngineError::CheckpointNotFound(workflow_id)),
            Err(StoreError::Corrupt { version, message, .. }) => {
                warn!(version, %message, "latest checkpoint is unreadable");
                return Err(EngineError::Recovery {
                    workflow_id,
                    detail: format!("checkpoint {version} is unreadable: {message}"),
                });
            }
            Err(e) => return Err(EngineError::Persistence(e)),
        };

        let mut state = checkpoint.state;
        if state.workflow_id != workflow_id {
            return Err(EngineError::Recovery {
                workflow_id,
                detail: format!(
                    "checkpoint {} belongs to workflow {}",
                    checkpoint.version, state.workflow_id
                ),
            });
        }
        if state.status.is_terminal() {
            info!(status = %state.status, "latest checkpoint is terminal");
            return Ok(state);
        }

        let mut reset = 0usize;
        for (id, record) in state.nodes.iter_mut() {
            if matches!(record.state, NodeState::Running | NodeState::Ready) {
                debug!(node = %id, from = %record.state, "resetting node to WAITING");
                record.state = NodeState::Waiting;
                reset += 1;
            }
        }
        info!(version = checkpoint.version, reset, "state recovered");
        Ok(state)
    }

    pub async fn list_checkpoints(
        &self,
        workflow_id: Uuid,
        since: Option<u64>,
    ) -> Result<Vec<Checkpoint>, EngineError> {
        self.store
            .list(workflow_id, since)
            .await
            .map_err(EngineError::Persistence)
    }
}

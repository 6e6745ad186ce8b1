//! Checkpoint storage.
//!
//! [`CheckpointStore`] is the seam between the State Manager and whatever
//! durably holds the append-only checkpoint log. Two implementations ship
//! with the engine:
//!
//! - [`SqliteCheckpointStore`] — wraps the `db` crate's repository functions.
//! - [`MemoryCheckpointStore`] — process-local, for tests and dry runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use db::repository::{checkpoints, workflows};
use db::{DbError, DbPool};

use crate::error::StoreError;
use crate::models::Workflow;
use crate::state::ExecutionState;

/// An immutable, versioned snapshot of an execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub workflow_id: Uuid,
    /// Starts at 1 and increases by one per append for a workflow.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub state: ExecutionState,
}

/// Durable home of workflow definitions and their checkpoint logs.
///
/// Implementations must never overwrite or delete a checkpoint.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Store an immutable workflow definition.
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;

    async fn load_workflow(&self, workflow_id: Uuid) -> Result<Workflow, StoreError>;

    /// Append `state` as the next version for its workflow.
    async fn append(&self, state: &ExecutionState) -> Result<Checkpoint, StoreError>;

    async fn latest(&self, workflow_id: Uuid) -> Result<Option<Checkpoint>, StoreError>;

    /// Checkpoints with `version > since` (all when `None`), oldest first.
    async fn list(&self, workflow_id: Uuid, since: Option<u64>) -> Result<Vec<Checkpoint>, StoreError>;
}

fn decode_state(workflow_id: Uuid, version: u64, raw: &str) -> Result<ExecutionState, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        workflow_id,
        version,
        message: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

pub struct SqliteCheckpointStore {
    pool: DbPool,
}

impl SqliteCheckpointStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn decode_row(workflow_id: Uuid, row: db::models::CheckpointRow) -> Result<Checkpoint, StoreError> {
        let version = u64::try_from(row.version).map_err(|_| StoreError::Corrupt {
            workflow_id,
            version: 0,
            message: format!("negative version {}", row.version),
        })?;
        let state = decode_state(workflow_id, version, &row.state)?;
        Ok(Checkpoint {
            workflow_id,
            version,
            created_at: row.created_at,
            state,
        })
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let definition = serde_json::to_string(workflow)?;
        workflows::create_workflow(
            &self.pool,
            &workflow.id.to_string(),
            &workflow.name,
            &definition,
            workflow.created_at,
        )
        .await?;
        Ok(())
    }

    async fn load_workflow(&self, workflow_id: Uuid) -> Result<Workflow, StoreError> {
        let row = match workflows::get_workflow(&self.pool, &workflow_id.to_string()).await {
            Ok(row) => row,
            Err(DbError::NotFound) => return Err(StoreError::WorkflowNotFound(workflow_id)),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&row.definition)?)
    }

    async fn append(&self, state: &ExecutionState) -> Result<Checkpoint, StoreError> {
        let raw = serde_json::to_string(state)?;
        let conflicts = serde_json::to_string(&state.conflicts)?;
        let row = checkpoints::append_checkpoint(
            &self.pool,
            &state.workflow_id.to_string(),
            &state.status.to_string(),
            &raw,
            &conflicts,
        )
        .await?;
        Self::decode_row(state.workflow_id, row)
    }

    async fn latest(&self, workflow_id: Uuid) -> Result<Option<Checkpoint>, StoreError> {
        checkpoints::latest_checkpoint(&self.pool, &workflow_id.to_string())
            .await?
            .map(|row| Self::decode_row(workflow_id, row))
            .transpose()
    }

    async fn list(&self, workflow_id: Uuid, since: Option<u64>) -> Result<Vec<Checkpoint>, StoreError> {
        let since = since.map(|v| i64::try_from(v).unwrap_or(i64::MAX));
        checkpoints::list_checkpoints(&self.pool, &workflow_id.to_string(), since)
            .await?
            .into_iter()
            .map(|row| Self::decode_row(workflow_id, row))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredCheckpoint {
    version: u64,
    created_at: DateTime<Utc>,
    raw: String,
}

#[derive(Default)]
struct MemoryInner {
    workflows: HashMap<Uuid, String>,
    logs: HashMap<Uuid, Vec<StoredCheckpoint>>,
}

/// Checkpoint store that lives and dies with the process.
///
/// States are kept serialized so reads go through the same decoding path as
/// the SQLite store.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an arbitrary payload as the next version. Lets tests plant an
    /// unreadable checkpoint.
    pub async fn append_raw(&self, workflow_id: Uuid, raw: impl Into<String>) -> u64 {
        let mut inner = self.inner.lock().await;
        let log = inner.logs.entry(workflow_id).or_default();
        let version = log.last().map_or(1, |c| c.version + 1);
        log.push(StoredCheckpoint {
            version,
            created_at: Utc::now(),
            raw: raw.into(),
        });
        version
    }

    fn decode(workflow_id: Uuid, stored: &StoredCheckpoint) -> Result<Checkpoint, StoreError> {
        Ok(Checkpoint {
            workflow_id,
            version: stored.version,
            created_at: stored.created_at,
            state: decode_state(workflow_id, stored.version, &stored.raw)?,
        })
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let definition = serde_json::to_string(workflow)?;
        self.inner.lock().await.workflows.insert(workflow.id, definition);
        Ok(())
    }

    async fn load_workflow(&self, workflow_id: Uuid) -> Result<Workflow, StoreError> {
        let inner = self.inner.lock().await;
        let raw = inner
            .workflows
            .get(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        Ok(serde_json::from_str(raw)?)
    }

    async fn append(&self, state: &ExecutionState) -> Result<Checkpoint, StoreError> {
        let raw = serde_json::to_string(state)?;
        let version = self.append_raw(state.workflow_id, raw).await;
        let inner = self.inner.lock().await;
        let stored = inner
            .logs
            .get(&state.workflow_id)
            .and_then(|log| log.iter().find(|c| c.version == version))
            .ok_or(StoreError::WorkflowNotFound(state.workflow_id))?;
        Self::decode(state.workflow_id, stored)
    }

    async fn latest(&self, workflow_id: Uuid) -> Result<Option<Checkpoint>, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .logs
            .get(&workflow_id)
            .and_then(|log| log.last())
            .map(|stored| Self::decode(workflow_id, stored))
            .transpose()
    }

    async fn list(&self, workflow_id: Uuid, since: Option<u64>) -> Result<Vec<Checkpoint>, StoreError> {
        let inner = self.inner.lock().await;
        let since = since.unwrap_or(0);
        inner
            .logs
            .get(&workflow_id)
            .into_iter()
            .flatten()
            .filter(|c| c.version > since)
            .map(|stored| Self::decode(workflow_id, stored))
            .collect()
    }
}

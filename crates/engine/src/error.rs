//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

use crate::conflict::Conflict;
use crate::state::WorkflowStatus;

/// Errors produced by a [`CheckpointStore`](crate::store::CheckpointStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Error from the db crate.
    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored record exists but cannot be decoded.
    #[error("checkpoint {version} of workflow {workflow_id} is unreadable: {message}")]
    Corrupt {
        workflow_id: Uuid,
        version: u64,
        message: String,
    },

    #[error("no stored definition for workflow {0}")]
    WorkflowNotFound(Uuid),
}

/// Errors produced by the workflow engine (validation, persistence,
/// recovery, lifecycle misuse). Node failures are never surfaced here; they
/// are absorbed into the execution state.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    /// The definition has conflicts; the workflow never starts.
    #[error("workflow {workflow_id} failed validation with {} conflict(s)", .conflicts.len())]
    Validation {
        workflow_id: Uuid,
        conflicts: Vec<Conflict>,
    },

    // ------ Durability errors ------

    /// A checkpoint could not be written or read. Dispatch halts.
    #[error("persistence failure: {0}")]
    Persistence(#[source] StoreError),

    /// The latest checkpoint could not be turned back into a runnable state.
    #[error("recovery of workflow {workflow_id} failed: {detail}")]
    Recovery { workflow_id: Uuid, detail: String },

    #[error("no checkpoint recorded for workflow {0}")]
    CheckpointNotFound(Uuid),

    // ------ Lifecycle errors ------

    #[error("workflow {0} is not known to this engine")]
    WorkflowNotFound(Uuid),

    #[error("cannot {action} workflow {workflow_id} while it is {status}")]
    InvalidTransition {
        workflow_id: Uuid,
        status: WorkflowStatus,
        action: &'static str,
    },

    /// The scheduler task died without producing a result.
    #[error("scheduler for workflow {workflow_id} aborted: {message}")]
    Join { workflow_id: Uuid, message: String },
}

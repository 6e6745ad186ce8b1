//! The `NodeExecutor` trait — the contract every task runner must fulfil.

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::NodeError;

/// Everything a worker slot hands to an executor for one attempt.
///
/// Defined here (in the nodes crate) so both the engine and executor
/// implementations can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct NodeContext {
    /// ID of the parent workflow.
    pub workflow_id: Uuid,
    /// ID of the node within the workflow.
    pub node_id: String,
    /// Opaque task type tag copied from the node definition.
    pub kind: String,
    /// Opaque configuration copied from the node definition.
    pub config: Value,
    /// 1-based attempt number (retries and post-recovery re-runs increment it).
    pub attempt: u32,
    /// Fires when the workflow is cancelled or the node deadline expires.
    pub cancel: CancellationToken,
}

/// The core executor trait.
///
/// Executors must tolerate being invoked again for the same node after a
/// crash recovery: a node that was RUNNING at the last checkpoint is
/// re-dispatched from scratch.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Run the node body and return its output detail.
    ///
    /// Long-running bodies should poll `ctx.cancel` and return
    /// [`NodeError::Cancelled`] when it fires.
    async fn execute_node(&self, ctx: &NodeContext) -> Result<Value, NodeError>;
}

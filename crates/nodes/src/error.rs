//! Node-level error type.

use thiserror::Error;

/// Errors returned by a node executor's `execute_node` method.
///
/// The engine uses the variant to decide retry behaviour:
/// - `Retryable` — the worker slot retries with exponential back-off.
/// - `Fatal`     — the node is immediately marked as failed.
/// - `Cancelled` — the executor observed cancellation and stopped early.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// Transient failure; the engine should re-try the node.
    #[error("retryable node error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal node error: {0}")]
    Fatal(String),

    /// The node stopped because its cancellation token fired.
    #[error("node cancelled")]
    Cancelled,
}

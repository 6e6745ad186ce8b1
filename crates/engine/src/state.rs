//! Execution state: workflow status plus one record per node.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::conflict::Conflict;
use crate::models::Workflow;

// ---------------------------------------------------------------------------
// WorkflowStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a workflow:
/// `Pending → Validating → (Running ⇄ Paused) → {Completed | Failed | Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Validating,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Validating => "validating",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending"    => Ok(Self::Pending),
            "validating" => Ok(Self::Validating),
            "running"    => Ok(Self::Running),
            "paused"     => Ok(Self::Paused),
            "completed"  => Ok(Self::Completed),
            "failed"     => Ok(Self::Failed),
            "cancelled"  => Ok(Self::Cancelled),
            other        => Err(format!("unknown workflow status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// NodeState
// ---------------------------------------------------------------------------

/// Per-node state. Transitions are strictly
/// `Waiting → Ready → Running → {Succeeded | Failed}`; `Skipped` is reached
/// from `Waiting`/`Ready` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Waiting,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Running now or already finished in any way.
    pub fn has_started(self) -> bool {
        self == Self::Running || self.is_terminal()
    }

    pub fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, next),
            (Waiting, Ready)
                | (Ready, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Waiting, Skipped)
                | (Ready, Skipped)
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Waiting => "WAITING",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        };
        f.write_str(s)
    }
}

/// Why a node ended FAILED or SKIPPED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The executor returned a fatal error.
    Error,
    /// The node deadline expired.
    Timeout,
    /// The workflow was cancelled while the node was in flight or waiting.
    Cancelled,
    /// Retryable errors exceeded the retry limit.
    RetryExhausted,
    /// A DATA predecessor failed or was skipped.
    UpstreamFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub state: NodeState,
    /// Executor attempts made across all dispatches of this node.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    /// Executor output on success, error text otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl NodeRecord {
    fn waiting() -> Self {
        Self {
            state: NodeState::Waiting,
            attempts: 0,
            reason: None,
            detail: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub workflow_id: Uuid,
    pub status: WorkflowStatus,
    pub nodes: BTreeMap<String, NodeRecord>,
    /// Conflicts found at validation time (empty for valid workflows).
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
    /// Workflow-level diagnostic, e.g. why recovery failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionState {
    /// Fresh PENDING state with every node WAITING.
    pub fn new(workflow: &Workflow) -> Self {
        Self {
            workflow_id: workflow.id,
            status: WorkflowStatus::Pending,
            nodes: workflow
                .nodes
                .iter()
                .map(|n| (n.id.clone(), NodeRecord::waiting()))
                .collect(),
            conflicts: Vec::new(),
            detail: None,
            updated_at: Utc::now(),
        }
    }

    pub fn node_state(&self, id: &str) -> Option<NodeState> {
        self.nodes.get(id).map(|r| r.state)
    }

    /// Ids of nodes currently in `state`, ascending.
    pub fn nodes_in(&self, state: NodeState) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, r)| r.state == state)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Every node has reached a terminal state (vacuously true when empty).
    pub fn all_nodes_terminal(&self) -> bool {
        self.nodes.values().all(|r| r.state.is_terminal())
    }

    /// Apply a node transition if it is legal. Returns whether it was applied.
    pub fn transition(&mut self, id: &str, next: NodeState) -> bool {
        match self.nodes.get_mut(id) {
            Some(record) if record.state.can_transition_to(next) => {
                record.state = next;
                self.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    pub fn set_status(&mut self, status: WorkflowStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

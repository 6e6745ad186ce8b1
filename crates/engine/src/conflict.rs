//! Conflict records produced by graph validation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Category of a validation conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// DATA/CONTROL edges (or any self-loop) form a cycle.
    Cycle,
    /// A mutual-exclusion or capacity constraint can never be satisfied.
    ResourceDeadlock,
    /// An edge references a node that does not exist.
    InvalidEdge,
    /// Two nodes share the same id.
    DuplicateNode,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cycle => write!(f, "CYCLE"),
            Self::ResourceDeadlock => write!(f, "RESOURCE_DEADLOCK"),
            Self::InvalidEdge => write!(f, "INVALID_EDGE"),
            Self::DuplicateNode => write!(f, "DUPLICATE_NODE"),
        }
    }
}

/// A single problem found in a workflow definition. Conflicts are reported,
/// never auto-resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub involved_node_ids: Vec<String>,
    pub detail: String,
}

impl Conflict {
    pub fn new(kind: ConflictKind, involved_node_ids: Vec<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            involved_node_ids,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.kind, self.involved_node_ids.join(", "), self.detail)
    }
}

//! Core domain models for the workflow engine.
//!
//! These types are the source of truth for what a workflow looks like
//! in memory. They serialise to/from the JSON `definition` column of the
//! `workflows` table and to the workflow files read by the CLI.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Dependency kinds
// ---------------------------------------------------------------------------

/// What an edge means for the target node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    /// Target consumes the source's output; the source must succeed.
    Data,
    /// Ordering only; see [`ControlGate`].
    Control,
    /// Mutual exclusion; source and target never run concurrently.
    Resource,
}

/// When a CONTROL edge releases its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlGate {
    /// Source has started (RUNNING or any terminal state).
    OnStart,
    /// Source has reached a terminal state, successful or not.
    #[default]
    OnFinish,
}

// ---------------------------------------------------------------------------
// WorkflowNode
// ---------------------------------------------------------------------------

/// A single task in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// Unique identifier within this workflow (referenced by edges).
    pub id: String,
    /// Opaque task type tag handed to the executor.
    #[serde(default)]
    pub kind: String,
    /// Opaque configuration handed to the executor. The engine only reads
    /// `critical`, `timeout_ms` and `max_retries`.
    #[serde(default)]
    pub config: Value,
    /// Named capacity costs, e.g. `{"cpu": 2}`.
    #[serde(default)]
    pub resource_requirements: BTreeMap<String, u32>,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            config: Value::Null,
            resource_requirements: BTreeMap::new(),
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn requiring(mut self, resource: impl Into<String>, amount: u32) -> Self {
        self.resource_requirements.insert(resource.into(), amount);
        self
    }

    /// `config.critical`, if the caller set it.
    pub fn critical_flag(&self) -> Option<bool> {
        self.config.get("critical").and_then(Value::as_bool)
    }

    /// Per-node deadline from `config.timeout_ms`.
    pub fn timeout(&self) -> Option<Duration> {
        self.config
            .get("timeout_ms")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
    }

    /// Per-node retry limit from `config.max_retries`.
    pub fn max_retries(&self) -> Option<u32> {
        self.config
            .get("max_retries")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
    }
}

// ---------------------------------------------------------------------------
// WorkflowEdge
// ---------------------------------------------------------------------------

/// Directed edge from `source_id` to `target_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub source_id: String,
    pub target_id: String,
    pub dependency_type: DependencyType,
    /// Only meaningful for CONTROL edges.
    #[serde(default)]
    pub gate: ControlGate,
}

impl WorkflowEdge {
    pub fn data(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(source, target, DependencyType::Data)
    }

    pub fn control(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(source, target, DependencyType::Control)
    }

    pub fn control_on_start(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            gate: ControlGate::OnStart,
            ..Self::new(source, target, DependencyType::Control)
        }
    }

    pub fn resource(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(source, target, DependencyType::Resource)
    }

    fn new(source: impl Into<String>, target: impl Into<String>, dependency_type: DependencyType) -> Self {
        Self {
            source_id: source.into(),
            target_id: target.into(),
            dependency_type,
            gate: ControlGate::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

fn default_parallelism() -> usize {
    4
}

/// A complete workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
    /// Worker slot count. Zero is treated as one.
    #[serde(default = "default_parallelism")]
    pub max_parallelism: usize,
    /// Named resource capacities shared by all nodes of this workflow.
    #[serde(default)]
    pub resource_pool: BTreeMap<String, u32>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    /// Convenience constructor for testing.
    pub fn new(name: impl Into<String>, nodes: Vec<WorkflowNode>, edges: Vec<WorkflowEdge>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            nodes,
            edges,
            max_parallelism: default_parallelism(),
            resource_pool: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_parallelism(mut self, max_parallelism: usize) -> Self {
        self.max_parallelism = max_parallelism;
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>, capacity: u32) -> Self {
        self.resource_pool.insert(resource.into(), capacity);
        self
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Effective worker slot count.
    pub fn slots(&self) -> usize {
        self.max_parallelism.max(1)
    }

    /// Whether the node forces workflow failure when it does not succeed.
    ///
    /// When no node in the workflow carries an explicit `critical` flag,
    /// every node is critical.
    pub fn is_critical(&self, node: &WorkflowNode) -> bool {
        match node.critical_flag() {
            Some(flag) => flag,
            None => !self.nodes.iter().any(|n| n.critical_flag().is_some()),
        }
    }
}

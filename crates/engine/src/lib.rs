//! `engine` crate — graph model, dependency analysis, scheduling, state
//! persistence and the workflow engine façade.

pub mod models;
pub mod conflict;
pub mod state;
pub mod error;
pub mod config;
pub mod dag;
pub mod resources;
pub mod store;
pub mod state_manager;
pub mod scheduler;
pub mod engine;

pub use models::{ControlGate, DependencyType, Workflow, WorkflowEdge, WorkflowNode};
pub use conflict::{Conflict, ConflictKind};
pub use state::{ExecutionState, FailureReason, NodeRecord, NodeState, WorkflowStatus};
pub use error::{EngineError, StoreError};
pub use config::EngineConfig;
pub use dag::{compute_ready_set, topological_order, validate, DependencyGraph};
pub use store::{Checkpoint, CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};
pub use state_manager::StateManager;
pub use scheduler::{ExecutionControl, Scheduler};
pub use engine::WorkflowEngine;

#[cfg(test)]
mod scheduler_tests;

//! Row structs that map 1-to-1 onto database tables.
//!
//! SQLite has no native UUID or JSON column types, so ids and payloads are
//! plain `String`s here. Domain types live in the `engine` crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// workflows
// ---------------------------------------------------------------------------

/// A persisted workflow definition row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowRow {
    pub id: String,
    pub name: String,
    /// Full JSON workflow definition (nodes, edges, pool, …)
    pub definition: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// checkpoints
// ---------------------------------------------------------------------------

/// A persisted checkpoint row. Rows are never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CheckpointRow {
    pub workflow_id: String,
    pub version: i64,
    /// Workflow status at the time of the checkpoint, for cheap filtering.
    pub status: String,
    /// Full serialised execution state.
    pub state: String,
    /// Conflict list recorded at validation time (JSON array).
    pub conflicts: String,
    pub created_at: DateTime<Utc>,
}

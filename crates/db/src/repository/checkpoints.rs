//! Checkpoint log operations.
//!
//! The table is append-only: there is no update or delete function, and
//! database triggers reject both. Versions are allocated per workflow inside
//! the insert statement itself, so two writers can never hand out the same
//! version.

use chrono::Utc;

use crate::{DbError, DbPool, models::CheckpointRow};

/// Append a checkpoint and return the stored row with its new version.
pub async fn append_checkpoint(
    pool: &DbPool,
    workflow_id: &str,
    status: &str,
    state: &str,
    conflicts: &str,
) -> Result<CheckpointRow, DbError> {
    let row = sqlx::query_as::<_, CheckpointRow>(
        r#"
        INSERT INTO checkpoints (workflow_id, version, status, state, conflicts, created_at)
        SELECT ?1, COALESCE(MAX(version), 0) + 1, ?2, ?3, ?4, ?5
        FROM checkpoints
        WHERE workflow_id = ?1
        RETURNING workflow_id, version, status, state, conflicts, created_at
        "#,
    )
    .bind(workflow_id)
    .bind(status)
    .bind(state)
    .bind(conflicts)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Fetch the highest-versioned checkpoint for a workflow, if any.
pub async fn latest_checkpoint(
    pool: &DbPool,
    workflow_id: &str,
) -> Result<Option<CheckpointRow>, DbError> {
    let row = sqlx::query_as::<_, CheckpointRow>(
        r#"
        SELECT workflow_id, version, status, state, conflicts, created_at
        FROM checkpoints
        WHERE workflow_id = ?1
        ORDER BY version DESC
        LIMIT 1
        "#,
    )
    .bind(workflow_id)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// List checkpoints with `version > since` (all when `since` is `None`),
/// oldest first.
pub async fn list_checkpoints(
    pool: &DbPool,
    workflow_id: &str,
    since: Option<i64>,
) -> Result<Vec<CheckpointRow>, DbError> {
    let rows = sqlx::query_as::<_, CheckpointRow>(
        r#"
        SELECT workflow_id, version, status, state, conflicts, created_at
        FROM checkpoints
        WHERE workflow_id = ?1 AND version > ?2
        ORDER BY version ASC
        "#,
    )
    .bind(workflow_id)
    .bind(since.unwrap_or(0))
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

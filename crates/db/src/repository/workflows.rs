//! Workflow definition operations.

use chrono::{DateTime, Utc};

use crate::{DbError, DbPool, models::WorkflowRow};

/// Insert a new workflow definition.
///
/// `definition` must be the JSON produced by serialising the domain
/// `Workflow` type from the `engine` crate. Definitions are immutable once
/// stored; inserting an existing id fails with a constraint violation.
pub async fn create_workflow(
    pool: &DbPool,
    id: &str,
    name: &str,
    definition: &str,
    created_at: DateTime<Utc>,
) -> Result<WorkflowRow, DbError> {
    let row = sqlx::query_as::<_, WorkflowRow>(
        r#"
        INSERT INTO workflows (id, name, definition, created_at)
        VALUES (?1, ?2, ?3, ?4)
        RETURNING id, name, definition, created_at
        "#,
    )
    .bind(id)
    .bind(name)
    .bind(definition)
    .bind(created_at)
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Fetch a single workflow by its primary key.
pub async fn get_workflow(pool: &DbPool, id: &str) -> Result<WorkflowRow, DbError> {
    let row = sqlx::query_as::<_, WorkflowRow>(
        r#"SELECT id, name, definition, created_at FROM workflows WHERE id = ?1"#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)?;

    Ok(row)
}

/// Return all workflows ordered by creation time (newest first).
pub async fn list_workflows(pool: &DbPool) -> Result<Vec<WorkflowRow>, DbError> {
    let rows = sqlx::query_as::<_, WorkflowRow>(
        r#"SELECT id, name, definition, created_at FROM workflows ORDER BY created_at DESC"#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

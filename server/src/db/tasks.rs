//! Database operations for the publish_tasks table.

use innsync_engine::{PublishScope, PublishTask, PushType, TaskStatus, Timestamp};
use sqlx::{PgConnection, PgPool, Row};

/// A stored publish task row from the database.
#[derive(Debug)]
pub struct StoredTask {
    pub id: String,
    pub connection_id: String,
    pub idempotency_key: String,
    pub scope: serde_json::Value,
    pub push_type: String,
    pub priority: i32,
    pub status: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: Timestamp,
    pub next_attempt_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredTask {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredTask {
            id: row.try_get("id")?,
            connection_id: row.try_get("connection_id")?,
            idempotency_key: row.try_get("idempotency_key")?,
            scope: row.try_get("scope")?,
            push_type: row.try_get("push_type")?,
            priority: row.try_get("priority")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

impl StoredTask {
    /// Convert database row to an engine PublishTask.
    pub fn to_task(self) -> Result<PublishTask, String> {
        let scope: PublishScope =
            serde_json::from_value(self.scope).map_err(|e| format!("Invalid task scope: {e}"))?;
        let push_type: PushType = self.push_type.parse().map_err(|e| format!("{e}"))?;
        let status: TaskStatus = self.status.parse().map_err(|e| format!("{e}"))?;

        Ok(PublishTask {
            id: self.id,
            connection_id: self.connection_id,
            idempotency_key: self.idempotency_key,
            scope,
            push_type,
            priority: self.priority,
            status,
            attempts: self.attempts.max(0) as u32,
            last_error: self.last_error,
            created_at: self.created_at,
            next_attempt_at: self.next_attempt_at,
            completed_at: self.completed_at,
        })
    }
}

const TASK_COLUMNS: &str = r#"
    id, connection_id, idempotency_key, scope, push_type, priority, status,
    attempts, last_error, created_at, next_attempt_at, completed_at
"#;

fn scope_json(task: &PublishTask) -> Result<serde_json::Value, sqlx::Error> {
    serde_json::to_value(&task.scope).map_err(|e| sqlx::Error::Encode(Box::new(e)))
}

pub async fn insert_task(pool: &PgPool, task: &PublishTask) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO publish_tasks (
            id, connection_id, idempotency_key, scope, push_type, priority, status,
            attempts, last_error, created_at, next_attempt_at, completed_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(&task.id)
    .bind(&task.connection_id)
    .bind(&task.idempotency_key)
    .bind(scope_json(task)?)
    .bind(task.push_type.as_str())
    .bind(task.priority)
    .bind(task.status.as_str())
    .bind(task.attempts as i32)
    .bind(&task.last_error)
    .bind(task.created_at)
    .bind(task.next_attempt_at)
    .bind(task.completed_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn update_task(pool: &PgPool, task: &PublishTask) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE publish_tasks
        SET status = $2, attempts = $3, last_error = $4,
            next_attempt_at = $5, completed_at = $6
        WHERE id = $1
        "#,
    )
    .bind(&task.id)
    .bind(task.status.as_str())
    .bind(task.attempts as i32)
    .bind(&task.last_error)
    .bind(task.next_attempt_at)
    .bind(task.completed_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub async fn get_task(pool: &PgPool, id: &str) -> Result<Option<StoredTask>, sqlx::Error> {
    sqlx::query_as::<_, StoredTask>(&format!(
        "SELECT {TASK_COLUMNS} FROM publish_tasks WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Oldest due queued task, unless the connection already has one processing.
pub async fn next_due_task(
    pool: &PgPool,
    connection_id: &str,
    now: Timestamp,
) -> Result<Option<StoredTask>, sqlx::Error> {
    sqlx::query_as::<_, StoredTask>(&format!(
        r#"
        SELECT {TASK_COLUMNS}
        FROM publish_tasks
        WHERE connection_id = $1
          AND status = 'queued'
          AND next_attempt_at <= $2
          AND NOT EXISTS (
              SELECT 1 FROM publish_tasks
              WHERE connection_id = $1 AND status = 'processing'
          )
        ORDER BY created_at ASC, priority ASC, id ASC
        LIMIT 1
        "#
    ))
    .bind(connection_id)
    .bind(now)
    .fetch_optional(pool)
    .await
}

/// Queued tasks of every connection, for cancellation checks.
pub async fn queued_tasks(conn: &mut PgConnection) -> Result<Vec<StoredTask>, sqlx::Error> {
    sqlx::query_as::<_, StoredTask>(&format!(
        "SELECT {TASK_COLUMNS} FROM publish_tasks WHERE status = 'queued' FOR UPDATE"
    ))
    .fetch_all(conn)
    .await
}

pub async fn delete_tasks(conn: &mut PgConnection, ids: &[String]) -> Result<u64, sqlx::Error> {
    if ids.is_empty() {
        return Ok(0);
    }
    let result = sqlx::query("DELETE FROM publish_tasks WHERE id = ANY($1) AND status = 'queued'")
        .bind(ids)
        .execute(conn)
        .await?;

    Ok(result.rows_affected())
}

/// Put every processing task back to queued without spending an attempt.
pub async fn recover_stalled(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE publish_tasks
        SET status = 'queued', last_error = 'recovered after restart'
        WHERE status = 'processing'
        "#,
    )
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

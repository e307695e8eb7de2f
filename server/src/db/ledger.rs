//! Database operations for the append-only sync_log table.

use innsync_engine::{LedgerOperation, SyncLogEntry, Timestamp};
use sqlx::{PgPool, Row};

/// A stored ledger row from the database.
#[derive(Debug)]
pub struct StoredLogEntry {
    pub connection_id: String,
    pub operation: String,
    pub request_summary: String,
    pub response_status: Option<i32>,
    pub credits_remaining: Option<i32>,
    pub credits_reset_at: Option<Timestamp>,
    pub request_cost: Option<i32>,
    pub duration_ms: i64,
    pub success: bool,
    pub created_at: Timestamp,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredLogEntry {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredLogEntry {
            connection_id: row.try_get("connection_id")?,
            operation: row.try_get("operation")?,
            request_summary: row.try_get("request_summary")?,
            response_status: row.try_get("response_status")?,
            credits_remaining: row.try_get("credits_remaining")?,
            credits_reset_at: row.try_get("credits_reset_at")?,
            request_cost: row.try_get("request_cost")?,
            duration_ms: row.try_get("duration_ms")?,
            success: row.try_get("success")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl StoredLogEntry {
    /// Convert database row to an engine SyncLogEntry.
    pub fn to_entry(self) -> Result<SyncLogEntry, String> {
        let operation: LedgerOperation = self.operation.parse().map_err(|e| format!("{e}"))?;
        Ok(SyncLogEntry {
            connection_id: self.connection_id,
            operation,
            request_summary: self.request_summary,
            response_status: self.response_status.map(|s| s.clamp(0, u16::MAX as i32) as u16),
            credits_remaining: self.credits_remaining.map(|c| c.max(0) as u32),
            credits_reset_at: self.credits_reset_at,
            request_cost: self.request_cost.map(|c| c.max(0) as u32),
            duration_ms: self.duration_ms.max(0) as u64,
            success: self.success,
            created_at: self.created_at,
        })
    }
}

pub async fn insert_entry(pool: &PgPool, entry: &SyncLogEntry) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO sync_log (
            connection_id, operation, request_summary, response_status,
            credits_remaining, credits_reset_at, request_cost, duration_ms, success, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(&entry.connection_id)
    .bind(entry.operation.as_str())
    .bind(&entry.request_summary)
    .bind(entry.response_status.map(i32::from))
    .bind(entry.credits_remaining.map(|c| c.min(i32::MAX as u32) as i32))
    .bind(entry.credits_reset_at)
    .bind(entry.request_cost.map(|c| c.min(i32::MAX as u32) as i32))
    .bind(entry.duration_ms.min(i64::MAX as u64) as i64)
    .bind(entry.success)
    .bind(entry.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn recent_entries(
    pool: &PgPool,
    connection_id: &str,
    limit: i64,
) -> Result<Vec<StoredLogEntry>, sqlx::Error> {
    sqlx::query_as::<_, StoredLogEntry>(
        r#"
        SELECT connection_id, operation, request_summary, response_status,
               credits_remaining, credits_reset_at, request_cost, duration_ms,
               success, created_at
        FROM sync_log
        WHERE connection_id = $1
        ORDER BY created_at DESC, id DESC
        LIMIT $2
        "#,
    )
    .bind(connection_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Newest entry of a connection that carried credit headers.
pub async fn latest_credit_entry(
    pool: &PgPool,
    connection_id: &str,
) -> Result<Option<StoredLogEntry>, sqlx::Error> {
    sqlx::query_as::<_, StoredLogEntry>(
        r#"
        SELECT connection_id, operation, request_summary, response_status,
               credits_remaining, credits_reset_at, request_cost, duration_ms,
               success, created_at
        FROM sync_log
        WHERE connection_id = $1
          AND credits_remaining IS NOT NULL
          AND credits_reset_at IS NOT NULL
        ORDER BY created_at DESC, id DESC
        LIMIT 1
        "#,
    )
    .bind(connection_id)
    .fetch_optional(pool)
    .await
}

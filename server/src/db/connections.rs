//! Database operations for the connections and channel_mappings tables.

use innsync_engine::{
    AccessToken, ChannelMapping, Connection, ConnectionStatus, CreditState, MappingTable,
    TokenScope,
};
use sqlx::{PgPool, Row};

/// A stored connection row from the database.
#[derive(Debug)]
pub struct StoredConnection {
    pub id: String,
    pub property_id: String,
    pub channel_property_id: String,
    pub channel_code: String,
    pub organization: String,
    pub refresh_token: String,
    pub read_token: Option<String>,
    pub read_token_expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub write_token: Option<String>,
    pub write_token_expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub credits_remaining: Option<i32>,
    pub credits_reset_at: Option<chrono::DateTime<chrono::Utc>>,
    pub status: String,
    pub status_reason: Option<String>,
    pub active: bool,
    pub webhook_secret: Option<String>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredConnection {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredConnection {
            id: row.try_get("id")?,
            property_id: row.try_get("property_id")?,
            channel_property_id: row.try_get("channel_property_id")?,
            channel_code: row.try_get("channel_code")?,
            organization: row.try_get("organization")?,
            refresh_token: row.try_get("refresh_token")?,
            read_token: row.try_get("read_token")?,
            read_token_expires_at: row.try_get("read_token_expires_at")?,
            write_token: row.try_get("write_token")?,
            write_token_expires_at: row.try_get("write_token_expires_at")?,
            credits_remaining: row.try_get("credits_remaining")?,
            credits_reset_at: row.try_get("credits_reset_at")?,
            status: row.try_get("status")?,
            status_reason: row.try_get("status_reason")?,
            active: row.try_get("active")?,
            webhook_secret: row.try_get("webhook_secret")?,
        })
    }
}

fn token(value: Option<String>, expires_at: Option<chrono::DateTime<chrono::Utc>>) -> Option<AccessToken> {
    Some(AccessToken {
        token: value?,
        expires_at: expires_at?,
    })
}

impl StoredConnection {
    /// Convert database row to an engine Connection.
    pub fn to_connection(self) -> Result<Connection, String> {
        let status: ConnectionStatus = self.status.parse().map_err(|e| format!("{e}"))?;
        Ok(Connection {
            id: self.id,
            property_id: self.property_id,
            channel_property_id: self.channel_property_id,
            channel_code: self.channel_code,
            organization: self.organization,
            refresh_token: self.refresh_token,
            read_token: token(self.read_token, self.read_token_expires_at),
            write_token: token(self.write_token, self.write_token_expires_at),
            credits_remaining: self.credits_remaining.map(|c| c.max(0) as u32),
            credits_reset_at: self.credits_reset_at,
            status,
            status_reason: self.status_reason,
            active: self.active,
            webhook_secret: self.webhook_secret,
        })
    }
}

const CONNECTION_COLUMNS: &str = r#"
    id, property_id, channel_property_id, channel_code, organization, refresh_token,
    read_token, read_token_expires_at, write_token, write_token_expires_at,
    credits_remaining, credits_reset_at, status, status_reason, active, webhook_secret
"#;

pub async fn get_connection(pool: &PgPool, id: &str) -> Result<Option<StoredConnection>, sqlx::Error> {
    sqlx::query_as::<_, StoredConnection>(&format!(
        "SELECT {CONNECTION_COLUMNS} FROM connections WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub async fn list_connections(pool: &PgPool) -> Result<Vec<StoredConnection>, sqlx::Error> {
    sqlx::query_as::<_, StoredConnection>(&format!(
        "SELECT {CONNECTION_COLUMNS} FROM connections ORDER BY id"
    ))
    .fetch_all(pool)
    .await
}

/// Upsert a connection (insert or update).
pub async fn upsert_connection(pool: &PgPool, conn: &Connection) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO connections (
            id, property_id, channel_property_id, channel_code, organization, refresh_token,
            read_token, read_token_expires_at, write_token, write_token_expires_at,
            credits_remaining, credits_reset_at, status, status_reason, active, webhook_secret
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        ON CONFLICT (id) DO UPDATE SET
            property_id = EXCLUDED.property_id,
            channel_property_id = EXCLUDED.channel_property_id,
            channel_code = EXCLUDED.channel_code,
            organization = EXCLUDED.organization,
            refresh_token = EXCLUDED.refresh_token,
            read_token = EXCLUDED.read_token,
            read_token_expires_at = EXCLUDED.read_token_expires_at,
            write_token = EXCLUDED.write_token,
            write_token_expires_at = EXCLUDED.write_token_expires_at,
            credits_remaining = EXCLUDED.credits_remaining,
            credits_reset_at = EXCLUDED.credits_reset_at,
            status = EXCLUDED.status,
            status_reason = EXCLUDED.status_reason,
            active = EXCLUDED.active,
            webhook_secret = EXCLUDED.webhook_secret,
            updated_at = NOW()
        "#,
    )
    .bind(&conn.id)
    .bind(&conn.property_id)
    .bind(&conn.channel_property_id)
    .bind(&conn.channel_code)
    .bind(&conn.organization)
    .bind(&conn.refresh_token)
    .bind(conn.read_token.as_ref().map(|t| t.token.as_str()))
    .bind(conn.read_token.as_ref().map(|t| t.expires_at))
    .bind(conn.write_token.as_ref().map(|t| t.token.as_str()))
    .bind(conn.write_token.as_ref().map(|t| t.expires_at))
    .bind(conn.credits_remaining.map(|c| c.min(i32::MAX as u32) as i32))
    .bind(conn.credits_reset_at)
    .bind(conn.status.as_str())
    .bind(&conn.status_reason)
    .bind(conn.active)
    .bind(&conn.webhook_secret)
    .execute(pool)
    .await?;

    Ok(())
}

/// Store a token for one scope and reset the connection to active.
pub async fn store_token(
    pool: &PgPool,
    id: &str,
    scope: TokenScope,
    token: Option<&AccessToken>,
) -> Result<u64, sqlx::Error> {
    let query = match scope {
        TokenScope::Read => {
            r#"
            UPDATE connections
            SET read_token = $2, read_token_expires_at = $3,
                status = CASE WHEN $2 IS NULL THEN status ELSE 'active' END,
                status_reason = CASE WHEN $2 IS NULL THEN status_reason ELSE NULL END,
                updated_at = NOW()
            WHERE id = $1
            "#
        }
        TokenScope::Write => {
            r#"
            UPDATE connections
            SET write_token = $2, write_token_expires_at = $3,
                status = CASE WHEN $2 IS NULL THEN status ELSE 'active' END,
                status_reason = CASE WHEN $2 IS NULL THEN status_reason ELSE NULL END,
                updated_at = NOW()
            WHERE id = $1
            "#
        }
    };

    let result = sqlx::query(query)
        .bind(id)
        .bind(token.map(|t| t.token.as_str()))
        .bind(token.map(|t| t.expires_at))
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

pub async fn mark_error(pool: &PgPool, id: &str, reason: &str) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE connections
        SET status = 'error', status_reason = $2, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(reason)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub async fn record_credits(pool: &PgPool, id: &str, state: CreditState) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE connections
        SET credits_remaining = $2, credits_reset_at = $3, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(state.remaining.min(i32::MAX as u32) as i32)
    .bind(state.reset_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub async fn get_mappings(pool: &PgPool, connection_id: &str) -> Result<MappingTable, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT connection_id, room_type, rate_plan, product_code, active
        FROM channel_mappings
        WHERE connection_id = $1
        "#,
    )
    .bind(connection_id)
    .fetch_all(pool)
    .await?;

    let mut mappings = Vec::with_capacity(rows.len());
    for row in rows {
        mappings.push(ChannelMapping {
            connection_id: row.try_get("connection_id")?,
            room_type: row.try_get("room_type")?,
            rate_plan: row.try_get("rate_plan")?,
            product_code: row.try_get("product_code")?,
            active: row.try_get("active")?,
        });
    }

    Ok(MappingTable::from_mappings(mappings))
}

pub async fn upsert_mappings(
    pool: &PgPool,
    connection_id: &str,
    mappings: &[ChannelMapping],
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    for mapping in mappings {
        sqlx::query(
            r#"
            INSERT INTO channel_mappings (connection_id, room_type, rate_plan, product_code, active)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (connection_id, room_type, rate_plan) DO UPDATE SET
                product_code = EXCLUDED.product_code,
                active = EXCLUDED.active
            "#,
        )
        .bind(connection_id)
        .bind(&mapping.room_type)
        .bind(&mapping.rate_plan)
        .bind(&mapping.product_code)
        .bind(mapping.active)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await
}

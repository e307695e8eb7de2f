//! Connection registration, credentials, mappings and ledger reads.

use innsync_engine::{
    ChannelMapping, Connection, CreditState, Error, SyncLogEntry,
};
use serde::{Deserialize, Serialize};

use crate::channel::ChannelRoomType;
use crate::error::{AppError, Result};
use crate::AppState;

/// Default number of ledger entries returned.
pub const DEFAULT_LEDGER_LIMIT: usize = 100;
/// Upper bound on ledger entries per request.
pub const MAX_LEDGER_LIMIT: usize = 1000;

/// Request body for registering or updating a connection.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInput {
    pub property_id: String,
    /// Property id on the channel side; defaults to `property_id`
    #[serde(default)]
    pub channel_property_id: Option<String>,
    pub channel_code: String,
    pub organization: String,
    pub refresh_token: String,
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

/// Request body for rotating credentials.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsInput {
    pub refresh_token: String,
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

/// One mapping row in a mapping edit.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingInput {
    pub room_type: String,
    pub rate_plan: String,
    pub product_code: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingsResponse {
    pub mappings: Vec<ChannelMapping>,
}

/// Ledger page plus the credit state derived from it.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerView {
    pub connection_id: String,
    pub credits: Option<CreditState>,
    pub entries: Vec<SyncLogEntry>,
}

async fn existing(state: &AppState, connection_id: &str) -> Result<Connection> {
    Ok(state
        .store
        .get_connection(connection_id)
        .await?
        .ok_or_else(|| Error::not_found("connection", connection_id))?)
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(AppError::BadRequest(format!("{field} must not be empty")));
    }
    Ok(())
}

/// Register a connection, or update the one with the same id.
///
/// A changed refresh token clears cached access tokens and any error state.
pub async fn save_connection(
    state: &AppState,
    connection_id: &str,
    input: ConnectionInput,
) -> Result<Connection> {
    require("propertyId", &input.property_id)?;
    require("organization", &input.organization)?;
    require("refreshToken", &input.refresh_token)?;

    let mut connection = match state.store.get_connection(connection_id).await? {
        Some(mut connection) => {
            if connection.refresh_token != input.refresh_token {
                connection.rotate_credentials(input.refresh_token);
            }
            connection.property_id = input.property_id;
            connection.channel_code = input.channel_code;
            connection.organization = input.organization;
            connection
        }
        None => Connection::new(
            connection_id,
            input.property_id,
            input.channel_code,
            input.organization,
            input.refresh_token,
        ),
    };
    if let Some(channel_property_id) = input.channel_property_id {
        connection.channel_property_id = channel_property_id;
    }
    connection.webhook_secret = input.webhook_secret.filter(|s| !s.is_empty());

    state.store.save_connection(&connection).await?;
    tracing::info!(connection_id = %connection.id, "Connection saved");
    Ok(connection)
}

/// Replace the refresh token and put the connection back to `active`.
pub async fn rotate_credentials(
    state: &AppState,
    connection_id: &str,
    input: CredentialsInput,
) -> Result<Connection> {
    require("refreshToken", &input.refresh_token)?;

    let mut connection = existing(state, connection_id).await?;
    connection.rotate_credentials(input.refresh_token);
    if let Some(secret) = input.webhook_secret {
        connection.webhook_secret = Some(secret).filter(|s| !s.is_empty());
    }
    state.store.save_connection(&connection).await?;

    tracing::info!(connection_id = %connection_id, "Connection credentials rotated");
    Ok(connection)
}

/// Stop all outbound work for a connection. Its history is kept.
pub async fn deactivate_connection(state: &AppState, connection_id: &str) -> Result<Connection> {
    let mut connection = existing(state, connection_id).await?;
    connection.deactivate();
    state.store.save_connection(&connection).await?;

    tracing::info!(connection_id = %connection_id, "Connection deactivated");
    Ok(connection)
}

/// Upsert mapping rows and return the connection's active mappings.
pub async fn update_mappings(
    state: &AppState,
    connection_id: &str,
    input: Vec<MappingInput>,
) -> Result<MappingsResponse> {
    existing(state, connection_id).await?;

    let mut mappings = Vec::with_capacity(input.len());
    for row in input {
        require("productCode", &row.product_code)?;
        let mut mapping =
            ChannelMapping::new(connection_id, row.room_type, row.rate_plan, row.product_code);
        mapping.active = row.active;
        mappings.push(mapping);
    }
    state.store.upsert_mappings(connection_id, &mappings).await?;

    let table = state.store.mappings(connection_id).await?;
    let mut mappings: Vec<ChannelMapping> = table.active().cloned().collect();
    mappings.sort_by(|a, b| a.pair().cmp(&b.pair()));

    tracing::info!(connection_id = %connection_id, count = mappings.len(), "Mappings updated");
    Ok(MappingsResponse { mappings })
}

/// Newest ledger entries and the latest known credit state.
pub async fn ledger_view(
    state: &AppState,
    connection_id: &str,
    limit: Option<usize>,
) -> Result<LedgerView> {
    let connection = existing(state, connection_id).await?;
    let limit = limit
        .unwrap_or(DEFAULT_LEDGER_LIMIT)
        .clamp(1, MAX_LEDGER_LIMIT);

    let entries = state.store.recent_log(connection_id, limit).await?;
    let credits = match state.store.latest_credit_state(connection_id).await? {
        Some(credits) => Some(credits),
        None => connection.credit_state(),
    };

    Ok(LedgerView {
        connection_id: connection.id,
        credits,
        entries,
    })
}

/// Room types the channel offers, for the mapping screen.
pub async fn list_room_types(state: &AppState, connection_id: &str) -> Result<Vec<ChannelRoomType>> {
    existing(state, connection_id).await?;
    state.channel.list_room_types(connection_id).await
}

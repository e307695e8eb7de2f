//! Connection management routes.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post, put},
    Json, Router,
};
use innsync_engine::{Connection, Error};
use serde::Deserialize;

use crate::auth::AuthUser;
use crate::channel::ChannelRoomType;
use crate::error::Result;
use crate::handlers::{
    deactivate_connection, ledger_view, list_room_types, rotate_credentials, save_connection,
    update_mappings, ConnectionInput, CredentialsInput, LedgerView, MappingInput,
    MappingsResponse,
};
use crate::AppState;

#[derive(Debug, Deserialize)]
struct LedgerQuery {
    limit: Option<usize>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/connections/{id}", get(get_handler).put(save_handler))
        .route("/connections/{id}/credentials", post(credentials_handler))
        .route("/connections/{id}/deactivate", post(deactivate_handler))
        .route("/connections/{id}/mappings", put(mappings_handler))
        .route("/connections/{id}/ledger", get(ledger_handler))
        .route("/connections/{id}/room-types", get(room_types_handler))
}

/// GET /connections/{id}
async fn get_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Connection>> {
    let connection = state
        .store
        .get_connection(&id)
        .await?
        .ok_or_else(|| Error::not_found("connection", &id))?;
    Ok(Json(connection))
}

/// PUT /connections/{id} - Register or update a connection.
async fn save_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<String>,
    Json(input): Json<ConnectionInput>,
) -> Result<Json<Connection>> {
    Ok(Json(save_connection(&state, &id, input).await?))
}

/// POST /connections/{id}/credentials - Rotate credentials and reactivate.
async fn credentials_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<String>,
    Json(input): Json<CredentialsInput>,
) -> Result<Json<Connection>> {
    Ok(Json(rotate_credentials(&state, &id, input).await?))
}

/// POST /connections/{id}/deactivate
async fn deactivate_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Connection>> {
    Ok(Json(deactivate_connection(&state, &id).await?))
}

/// PUT /connections/{id}/mappings - Upsert mapping rows.
async fn mappings_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<String>,
    Json(input): Json<Vec<MappingInput>>,
) -> Result<Json<MappingsResponse>> {
    Ok(Json(update_mappings(&state, &id, input).await?))
}

/// GET /connections/{id}/ledger?limit= - Recent ledger entries and credits.
async fn ledger_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<String>,
    Query(query): Query<LedgerQuery>,
) -> Result<Json<LedgerView>> {
    Ok(Json(ledger_view(&state, &id, query.limit).await?))
}

/// GET /connections/{id}/room-types - Channel products for the mapping screen.
async fn room_types_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Vec<ChannelRoomType>>> {
    Ok(Json(list_room_types(&state, &id).await?))
}

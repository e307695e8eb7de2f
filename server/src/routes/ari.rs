//! ARI grid routes.

use axum::{
    body::Bytes,
    extract::{Path, State},
    routing::{get, post, put},
    Json, Router,
};
use chrono::NaiveDate;
use innsync_engine::{BulkEdit, CellKey};

use crate::auth::AuthUser;
use crate::error::{AppError, Result};
use crate::handlers::{
    bulk_edit, clear_pending, commit_cells, get_effective, paste_selection, stage_cells,
    CellValue, ClearRequest, ClearResponse, CommitResponse, EffectiveCell, PasteRequest,
    StageResponse,
};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/ari/{date}/{room_type}/{rate_plan}", get(effective_handler))
        .route("/ari/staged", put(stage_handler).delete(clear_handler))
        .route("/ari/bulk", post(bulk_handler))
        .route("/ari/paste", post(paste_handler))
        .route("/ari/commit", post(commit_handler))
}

/// GET /ari/{date}/{room_type}/{rate_plan} - Effective value of one cell.
async fn effective_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path((date, room_type, rate_plan)): Path<(NaiveDate, String, String)>,
) -> Result<Json<EffectiveCell>> {
    let cell = get_effective(&state, CellKey::new(date, room_type, rate_plan)).await?;
    Ok(Json(cell))
}

/// PUT /ari/staged - Stage full cell values.
async fn stage_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Json(cells): Json<Vec<CellValue>>,
) -> Result<Json<StageResponse>> {
    Ok(Json(stage_cells(&state, cells).await?))
}

/// DELETE /ari/staged - Drop staged changes; an empty body clears all.
async fn clear_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    body: Bytes,
) -> Result<Json<ClearResponse>> {
    let request = if body.is_empty() {
        ClearRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| AppError::BadRequest(e.to_string()))?
    };
    Ok(Json(clear_pending(&state, request).await?))
}

/// POST /ari/bulk - Patch a date range and stage the result.
async fn bulk_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Json(edit): Json<BulkEdit>,
) -> Result<Json<StageResponse>> {
    Ok(Json(bulk_edit(&state, edit).await?))
}

/// POST /ari/paste - Stage a copied selection at a new anchor date.
async fn paste_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Json(request): Json<PasteRequest>,
) -> Result<Json<StageResponse>> {
    Ok(Json(paste_selection(&state, request).await?))
}

/// POST /ari/commit - Commit values locally and queue their publish.
async fn commit_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Json(cells): Json<Vec<CellValue>>,
) -> Result<Json<CommitResponse>> {
    Ok(Json(commit_cells(&state, cells).await?))
}

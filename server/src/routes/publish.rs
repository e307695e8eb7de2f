//! Publish queue routes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use innsync_engine::{Error, PublishTask};

use crate::auth::AuthUser;
use crate::error::Result;
use crate::handlers::{enqueue_publish, PublishRequest};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/connections/{id}/publish", post(publish_handler))
        .route("/tasks/{id}", get(task_handler))
}

/// POST /connections/{id}/publish - Queue a publish task.
async fn publish_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(connection_id): Path<String>,
    Json(request): Json<PublishRequest>,
) -> Result<(StatusCode, Json<PublishTask>)> {
    let task = enqueue_publish(&state, &connection_id, request).await?;
    Ok((StatusCode::ACCEPTED, Json(task)))
}

/// GET /tasks/{id} - Task status.
async fn task_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(task_id): Path<String>,
) -> Result<Json<PublishTask>> {
    let task = state
        .store
        .get_task(&task_id)
        .await?
        .ok_or_else(|| Error::not_found("publish task", &task_id))?;
    Ok(Json(task))
}

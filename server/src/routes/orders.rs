//! Inbound order routes.

use axum::{
    body::Bytes,
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use innsync_engine::{Error, InboundOrder, OrderAction};
use serde::Deserialize;

use crate::auth::AuthUser;
use crate::error::{AppError, Result};
use crate::handlers::process_order;
use crate::AppState;

const DEFAULT_REJECT_REASON: &str = "rejected by operator";

#[derive(Debug, Default, Deserialize)]
struct ActionBody {
    #[serde(default)]
    reason: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/orders/{id}", get(order_handler))
        .route("/orders/{id}/{action}", post(action_handler))
}

/// GET /orders/{id} - One inbound order.
async fn order_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(order_id): Path<String>,
) -> Result<Json<InboundOrder>> {
    let order = state
        .store
        .get_order(&order_id)
        .await?
        .ok_or_else(|| Error::not_found("inbound order", &order_id))?;
    Ok(Json(order))
}

/// POST /orders/{id}/{action} - Apply or reject a pending order.
///
/// `reject` takes an optional `{"reason": "..."}` body.
async fn action_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path((order_id, action)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<InboundOrder>> {
    let action = match action.as_str() {
        "apply" => OrderAction::Apply,
        "reject" => {
            let body: ActionBody = if body.is_empty() {
                ActionBody::default()
            } else {
                serde_json::from_slice(&body).map_err(|e| AppError::BadRequest(e.to_string()))?
            };
            OrderAction::Reject {
                reason: body
                    .reason
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_REJECT_REASON.to_string()),
            }
        }
        other => {
            return Err(AppError::BadRequest(format!(
                "unknown order action: {other} (expected apply or reject)"
            )))
        }
    };

    Ok(Json(process_order(&state, &order_id, action).await?))
}

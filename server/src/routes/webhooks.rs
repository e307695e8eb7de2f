//! Channel webhook receiver.
//!
//! Authenticated by the delivery's HMAC signature rather than the operator
//! bearer token.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};

use crate::error::Result;
use crate::handlers::{receive_order, ReceiveResponse, SIGNATURE_HEADER};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route(
        "/webhooks/{connection_id}/reservations",
        post(reservation_handler),
    )
}

/// POST /webhooks/{connection_id}/reservations - Store a reservation delivery.
async fn reservation_handler(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Result<(StatusCode, Json<ReceiveResponse>)> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string());

    let received = receive_order(&state, &connection_id, &body, signature).await?;
    Ok((StatusCode::ACCEPTED, Json(received)))
}

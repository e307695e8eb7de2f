//! Live ledger feed endpoint.

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};
use innsync_engine::ConnectionId;
use serde::Deserialize;

use crate::auth::AuthUser;
use crate::handlers::handle_feed_socket;
use crate::AppState;

#[derive(Debug, Deserialize)]
struct FeedQuery {
    connection_id: Option<ConnectionId>,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/ws/ledger", get(feed_handler))
}

/// GET /ws/ledger - Upgrade to a ledger feed, optionally for one connection.
async fn feed_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(query): Query<FeedQuery>,
) -> Response {
    let feed = state.feed.clone();
    ws.on_upgrade(move |socket| handle_feed_socket(socket, feed, query.connection_id))
}

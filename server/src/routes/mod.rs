//! HTTP route definitions.

mod ari;
mod connections;
mod feed;
mod health;
mod orders;
mod publish;
mod webhooks;

use crate::AppState;
use axum::Router;

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(ari::routes())
        .merge(publish::routes())
        .merge(connections::routes())
        .merge(orders::routes())
        .merge(webhooks::routes())
        .merge(feed::routes())
}

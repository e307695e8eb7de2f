//! InnSync Server - channel synchronization runtime.
//!
//! Publishes staged ARI changes to distribution channels, ingests
//! reservations from them and exposes both to the surrounding property
//! management application over HTTP and WebSocket. The decisions live in
//! `innsync-engine`; this crate supplies storage, the channel wire, timers
//! and the HTTP surface.

pub mod auth;
pub mod channel;
pub mod config;
pub mod db;
pub mod error;
pub mod feed;
pub mod handlers;
pub mod ledger;
pub mod routes;
pub mod worker;

use std::sync::Arc;

use axum::Router;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::channel::{ChannelClient, ChannelTransport, TokenManager};
use crate::config::Config;
use crate::db::SyncStore;
use crate::feed::LedgerFeed;
use crate::ledger::LedgerWriter;

/// Application state shared across handlers and workers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SyncStore>,
    pub config: Arc<Config>,
    pub channel: Arc<ChannelClient>,
    pub ledger: LedgerWriter,
    pub feed: Arc<LedgerFeed>,
    /// Serializes processing of one inbound order, keyed by external id
    pub order_locks: OrderLocks,
}

impl AppState {
    pub fn new(
        store: Arc<dyn SyncStore>,
        transport: Arc<dyn ChannelTransport>,
        config: Config,
    ) -> Self {
        let feed = LedgerFeed::new_shared();
        let ledger = LedgerWriter::new(store.clone(), feed.clone());
        let tokens = Arc::new(TokenManager::new(
            store.clone(),
            transport.clone(),
            ledger.clone(),
            config.token_skew(),
        ));
        let channel = Arc::new(ChannelClient::new(
            store.clone(),
            transport,
            tokens,
            ledger.clone(),
            config.rate_limit_policy(),
        ));

        Self {
            store,
            config: Arc::new(config),
            channel,
            ledger,
            feed,
            order_locks: Arc::new(DashMap::new()),
        }
    }

    /// Hold the lock of one external reservation id.
    pub async fn lock_order(&self, external_id: &str) -> OrderLockGuard {
        let lock = self
            .order_locks
            .entry(external_id.to_string())
            .or_default()
            .clone();
        OrderLockGuard {
            guard: Some(lock.lock_owned().await),
            locks: self.order_locks.clone(),
            external_id: external_id.to_string(),
        }
    }
}

pub type OrderLocks = Arc<DashMap<String, Arc<Mutex<()>>>>;

/// Held while one inbound order is processed.
///
/// Dropping the last holder removes the id's entry from the lock map.
pub struct OrderLockGuard {
    guard: Option<OwnedMutexGuard<()>>,
    locks: OrderLocks,
    external_id: String,
}

impl Drop for OrderLockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold a clone, so the map's copy is the only one left when idle.
        self.locks
            .remove_if(&self.external_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Build the HTTP router with tracing and CORS layers.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
        .with_state(state)
}

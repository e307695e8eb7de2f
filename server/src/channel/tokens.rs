//! Access token cache with single-flight refresh per connection.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use innsync_engine::{
    AccessToken, Connection, ConnectionId, Error, LedgerOperation, SyncLogEntry, TokenScope,
};
use tokio::sync::Mutex;

use super::ChannelTransport;
use crate::db::SyncStore;
use crate::error::Result;
use crate::ledger::LedgerWriter;

/// Token lifetimes are clamped to this many seconds.
const MAX_TOKEN_LIFETIME_SECS: u64 = 10 * 365 * 24 * 3600;

/// Hands out access tokens, exchanging the refresh token when the cached
/// one is missing or about to expire.
///
/// Exchanges for one connection are serialized: concurrent callers that
/// find a stale token wait on the same lock and reuse the token the first
/// of them obtained.
pub struct TokenManager {
    store: Arc<dyn SyncStore>,
    transport: Arc<dyn ChannelTransport>,
    ledger: LedgerWriter,
    skew: chrono::Duration,
    locks: DashMap<ConnectionId, Arc<Mutex<()>>>,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn SyncStore>,
        transport: Arc<dyn ChannelTransport>,
        ledger: LedgerWriter,
        skew: chrono::Duration,
    ) -> Self {
        Self {
            store,
            transport,
            ledger,
            skew,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, connection_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(connection_id.to_string())
            .or_default()
            .clone()
    }

    async fn load(&self, connection_id: &str) -> Result<Connection> {
        let connection = self
            .store
            .get_connection(connection_id)
            .await?
            .ok_or_else(|| Error::not_found("connection", connection_id))?;
        if !connection.is_usable() {
            return Err(Error::ConnectionPaused(connection.id).into());
        }
        Ok(connection)
    }

    /// A token for `scope` that is valid for at least the expiry skew.
    pub async fn access_token(&self, connection_id: &str, scope: TokenScope) -> Result<AccessToken> {
        let connection = self.load(connection_id).await?;
        if let Some(token) = connection.usable_token(scope, Utc::now(), self.skew) {
            return Ok(token.clone());
        }

        let lock = self.lock_for(connection_id);
        let _guard = lock.lock().await;

        // Another caller may have refreshed while we waited.
        let connection = self.load(connection_id).await?;
        if let Some(token) = connection.usable_token(scope, Utc::now(), self.skew) {
            return Ok(token.clone());
        }
        self.exchange(&connection, scope).await
    }

    /// Replace a token the channel answered 401 to.
    ///
    /// If a concurrent caller already replaced `rejected`, its token is
    /// returned without another exchange.
    pub async fn refresh_after_unauthorized(
        &self,
        connection_id: &str,
        scope: TokenScope,
        rejected: &str,
    ) -> Result<AccessToken> {
        let lock = self.lock_for(connection_id);
        let _guard = lock.lock().await;

        let connection = self.load(connection_id).await?;
        if let Some(token) = connection.usable_token(scope, Utc::now(), self.skew) {
            if token.token != rejected {
                return Ok(token.clone());
            }
        }

        self.store.invalidate_token(connection_id, scope).await?;
        self.exchange(&connection, scope).await
    }

    async fn exchange(&self, connection: &Connection, scope: TokenScope) -> Result<AccessToken> {
        let started = Instant::now();
        let result = self.transport.exchange_token(connection, scope).await;
        let now = Utc::now();
        let summary = format!("token exchange ({scope})");

        match result {
            Ok(grant) => {
                let lifetime = grant.expires_in.min(MAX_TOKEN_LIFETIME_SECS) as i64;
                let token = AccessToken {
                    token: grant.token,
                    expires_at: now + chrono::Duration::seconds(lifetime),
                };
                self.store.store_token(&connection.id, scope, &token).await?;
                self.ledger
                    .record(
                        SyncLogEntry::new(&connection.id, LedgerOperation::TokenRefresh, summary, true, now)
                            .with_duration(started.elapsed()),
                    )
                    .await;
                tracing::info!(connection_id = %connection.id, scope = %scope, "Access token refreshed");
                Ok(token)
            }
            Err(error) => {
                if let Error::Credential { reason, .. } = &error {
                    tracing::error!(
                        connection_id = %connection.id,
                        scope = %scope,
                        reason = %reason,
                        "Token exchange rejected, pausing connection"
                    );
                    self.store.mark_connection_error(&connection.id, reason).await?;
                } else {
                    tracing::warn!(
                        connection_id = %connection.id,
                        scope = %scope,
                        error = %error,
                        "Token exchange failed"
                    );
                }
                self.ledger
                    .record(
                        SyncLogEntry::new(&connection.id, LedgerOperation::TokenRefresh, summary, false, now)
                            .with_duration(started.elapsed()),
                    )
                    .await;
                Err(error.into())
            }
        }
    }
}

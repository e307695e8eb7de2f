//! Rate-limited channel client.
//!
//! Decisions come from [`RateLimitPolicy`]; this module only sleeps, sends
//! and records. Credit state is overwritten from every response's headers.

use std::sync::Arc;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use innsync_engine::{
    CallDecision, Connection, Error, LedgerOperation, RateLimitPolicy, SyncLogEntry, Timestamp,
    TokenScope,
};

use super::{ChannelAuth, ChannelRequest, ChannelResponse, ChannelRoomType, ChannelTransport, TokenManager};
use crate::db::SyncStore;
use crate::error::Result;
use crate::ledger::LedgerWriter;

/// Calls the channel API on behalf of a connection.
pub struct ChannelClient {
    store: Arc<dyn SyncStore>,
    transport: Arc<dyn ChannelTransport>,
    tokens: Arc<TokenManager>,
    ledger: LedgerWriter,
    policy: RateLimitPolicy,
}

impl ChannelClient {
    pub fn new(
        store: Arc<dyn SyncStore>,
        transport: Arc<dyn ChannelTransport>,
        tokens: Arc<TokenManager>,
        ledger: LedgerWriter,
        policy: RateLimitPolicy,
    ) -> Self {
        Self {
            store,
            transport,
            tokens,
            ledger,
            policy,
        }
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    async fn connection(&self, connection_id: &str) -> Result<Connection> {
        Ok(self
            .store
            .get_connection(connection_id)
            .await?
            .ok_or_else(|| Error::not_found("connection", connection_id))?)
    }

    /// Send a request, waiting out low credits and retrying per policy.
    ///
    /// Returns the first 2xx response. A 401 triggers one token refresh;
    /// 429 and 5xx are retried up to the policy's attempt ceiling. For a
    /// request with an idempotency key, a duplicate answer is returned as
    /// delivered.
    pub async fn call(
        &self,
        connection_id: &str,
        scope: TokenScope,
        request: &ChannelRequest,
    ) -> Result<ChannelResponse> {
        let connection = self.connection(connection_id).await?;
        let keyed = request.idempotency_key.is_some();
        let mut attempt: u32 = 1;
        let mut refreshed = false;
        // Set after a policy wait so the credit check does not wait twice.
        let mut just_waited = false;

        loop {
            if !just_waited {
                self.wait_for_credits(connection_id).await?;
            }
            just_waited = false;

            // Fetched after any wait so an expired token is never sent.
            let token = self.tokens.access_token(connection_id, scope).await?;
            let auth = ChannelAuth {
                organization: &connection.organization,
                token: &token.token,
            };
            let started = Instant::now();
            let sent = self.transport.send(auth, request).await;
            let elapsed = started.elapsed();
            let now = Utc::now();

            let response = match sent {
                Ok(response) => response,
                Err(error) => {
                    self.ledger
                        .record(
                            SyncLogEntry::new(
                                connection_id,
                                LedgerOperation::ChannelCall,
                                request.summary(),
                                false,
                                now,
                            )
                            .with_duration(elapsed),
                        )
                        .await;
                    match self.policy.after_network_error(attempt) {
                        CallDecision::RetryAfter(wait) => {
                            tracing::warn!(
                                connection_id = %connection_id,
                                attempt = attempt,
                                wait_ms = wait.as_millis() as u64,
                                error = %error,
                                "Channel call failed, retrying"
                            );
                            tokio::time::sleep(wait).await;
                            attempt += 1;
                            just_waited = true;
                            continue;
                        }
                        _ => return Err(error.into()),
                    }
                }
            };

            let credits = response.headers.credit_state(now);
            if let Some(state) = credits {
                self.store.record_credits(connection_id, state).await?;
            }
            let decision = if keyed {
                self.policy
                    .after_keyed_response(response.status, &response.headers, attempt, refreshed)
            } else {
                self.policy
                    .after_response(response.status, &response.headers, attempt, refreshed)
            };
            let delivered = matches!(decision, CallDecision::Accept | CallDecision::AlreadyApplied);
            self.ledger
                .record(
                    SyncLogEntry::new(
                        connection_id,
                        LedgerOperation::ChannelCall,
                        request.summary(),
                        delivered,
                        now,
                    )
                    .with_status(response.status)
                    .with_duration(elapsed)
                    .with_credits(credits, response.headers.cost),
                )
                .await;

            match decision {
                CallDecision::Accept => return Ok(response),
                CallDecision::AlreadyApplied => {
                    tracing::info!(
                        connection_id = %connection_id,
                        attempt = attempt,
                        idempotency_key = ?request.idempotency_key,
                        "Channel already applied this request"
                    );
                    return Ok(response);
                }
                CallDecision::RetryAfter(wait) => {
                    tracing::warn!(
                        connection_id = %connection_id,
                        status = response.status,
                        attempt = attempt,
                        wait_ms = wait.as_millis() as u64,
                        "Channel call throttled or failed, waiting before retry"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                    just_waited = true;
                }
                CallDecision::RefreshToken => {
                    tracing::info!(connection_id = %connection_id, "Channel returned 401, refreshing token");
                    refreshed = true;
                    self.tokens
                        .refresh_after_unauthorized(connection_id, scope, &token.token)
                        .await?;
                }
                CallDecision::Exhausted => {
                    return Err(Error::RateLimitExceeded { attempts: attempt }.into());
                }
                CallDecision::Fail => {
                    return Err(Error::ChannelApi {
                        status: response.status,
                        body: response.body,
                    }
                    .into());
                }
            }
        }
    }

    /// Sleep until the credit window resets when remaining credits are low.
    async fn wait_for_credits(&self, connection_id: &str) -> Result<()> {
        let credits = self.connection(connection_id).await?.credit_state();
        if let Some(wait) = self.policy.wait_before_call(credits.as_ref(), Utc::now()) {
            tracing::info!(
                connection_id = %connection_id,
                credits = ?credits,
                wait_ms = wait.as_millis() as u64,
                "Credits below low-water mark, waiting for reset"
            );
            tokio::time::sleep(wait).await;
        }
        Ok(())
    }

    /// Room types and rate plans the channel offers for the property.
    pub async fn list_room_types(&self, connection_id: &str) -> Result<Vec<ChannelRoomType>> {
        let connection = self.connection(connection_id).await?;
        let request = ChannelRequest::get(format!(
            "/properties/{}/room-types",
            connection.channel_property_id
        ));
        let response = self.call(connection_id, TokenScope::Read, &request).await?;
        Ok(response.json()?)
    }

    /// Raw reservation payloads created or modified since `since`.
    pub async fn fetch_bookings(&self, connection_id: &str, since: Timestamp) -> Result<Vec<String>> {
        let connection = self.connection(connection_id).await?;
        let request = ChannelRequest::get(format!(
            "/properties/{}/bookings?since={}",
            connection.channel_property_id,
            since.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
        let response = self.call(connection_id, TokenScope::Read, &request).await?;
        let bookings: Vec<serde_json::Value> = response.json()?;
        Ok(bookings.iter().map(|b| b.to_string()).collect())
    }
}

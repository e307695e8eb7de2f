//! Channel connections and their credentials.
//!
//! A connection is created once per property/channel pairing and is never
//! deleted, only deactivated. Tokens and rate-limit credit state are
//! overwritten on every exchange or call.

use crate::{ratelimit::CreditState, ConnectionId, Error, PropertyId, Timestamp};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Health of a connection's credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Active,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Active => "active",
            ConnectionStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for ConnectionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "active" => Ok(ConnectionStatus::Active),
            "error" => Ok(ConnectionStatus::Error),
            other => Err(Error::InvalidPayload(format!(
                "unknown connection status: {other}"
            ))),
        }
    }
}

/// Read or write scope, for channels that issue separate tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenScope {
    Read,
    Write,
}

impl TokenScope {
    pub fn for_write(for_write: bool) -> Self {
        if for_write {
            TokenScope::Write
        } else {
            TokenScope::Read
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TokenScope::Read => "read",
            TokenScope::Write => "write",
        }
    }
}

impl fmt::Display for TokenScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An access token and the instant it stops being valid.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessToken {
    pub token: String,
    pub expires_at: Timestamp,
}

impl AccessToken {
    /// Valid at `now` with at least `skew` to spare.
    pub fn is_fresh(&self, now: Timestamp, skew: Duration) -> bool {
        now + skew < self.expires_at
    }
}

// Keep tokens out of logs.
impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Credentials and rate-limit state for one property on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: ConnectionId,
    pub property_id: PropertyId,
    /// Channel's identifier for the property
    pub channel_property_id: String,
    pub channel_code: String,
    /// Sent as the `organization` header on every call
    pub organization: String,
    #[serde(skip_serializing)]
    pub refresh_token: String,
    #[serde(default, skip_serializing)]
    pub read_token: Option<AccessToken>,
    #[serde(default, skip_serializing)]
    pub write_token: Option<AccessToken>,
    pub credits_remaining: Option<u32>,
    pub credits_reset_at: Option<Timestamp>,
    pub status: ConnectionStatus,
    pub status_reason: Option<String>,
    pub active: bool,
    /// Shared secret for webhook signatures
    #[serde(default, skip_serializing)]
    pub webhook_secret: Option<String>,
}

impl Connection {
    pub fn new(
        id: impl Into<ConnectionId>,
        property_id: impl Into<PropertyId>,
        channel_code: impl Into<String>,
        organization: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        let property_id = property_id.into();
        Self {
            id: id.into(),
            channel_property_id: property_id.clone(),
            property_id,
            channel_code: channel_code.into(),
            organization: organization.into(),
            refresh_token: refresh_token.into(),
            read_token: None,
            write_token: None,
            credits_remaining: None,
            credits_reset_at: None,
            status: ConnectionStatus::Active,
            status_reason: None,
            active: true,
            webhook_secret: None,
        }
    }

    pub fn token(&self, scope: TokenScope) -> Option<&AccessToken> {
        match scope {
            TokenScope::Read => self.read_token.as_ref(),
            TokenScope::Write => self.write_token.as_ref(),
        }
    }

    /// A cached token that is still valid, if any.
    pub fn usable_token(
        &self,
        scope: TokenScope,
        now: Timestamp,
        skew: Duration,
    ) -> Option<&AccessToken> {
        self.token(scope).filter(|t| t.is_fresh(now, skew))
    }

    pub fn store_token(&mut self, scope: TokenScope, token: AccessToken) {
        match scope {
            TokenScope::Read => self.read_token = Some(token),
            TokenScope::Write => self.write_token = Some(token),
        }
        self.status = ConnectionStatus::Active;
        self.status_reason = None;
    }

    /// Drop a cached token, e.g. after the channel answered 401.
    pub fn invalidate_token(&mut self, scope: TokenScope) {
        match scope {
            TokenScope::Read => self.read_token = None,
            TokenScope::Write => self.write_token = None,
        }
    }

    pub fn mark_error(&mut self, reason: impl Into<String>) {
        self.status = ConnectionStatus::Error;
        self.status_reason = Some(reason.into());
    }

    /// Whether outbound work may run on this connection.
    pub fn is_usable(&self) -> bool {
        self.active && self.status == ConnectionStatus::Active
    }

    pub fn credit_state(&self) -> Option<CreditState> {
        Some(CreditState {
            remaining: self.credits_remaining?,
            reset_at: self.credits_reset_at?,
        })
    }

    pub fn record_credits(&mut self, state: CreditState) {
        self.credits_remaining = Some(state.remaining);
        self.credits_reset_at = Some(state.reset_at);
    }

    /// Replace the refresh token and clear the error state.
    pub fn rotate_credentials(&mut self, refresh_token: impl Into<String>) {
        self.refresh_token = refresh_token.into();
        self.read_token = None;
        self.write_token = None;
        self.status = ConnectionStatus::Active;
        self.status_reason = None;
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }
}

//! Access to the channel REST API.
//!
//! [`ChannelTransport`] is the raw wire: one token exchange or one request,
//! no retries. [`TokenManager`] caches and refreshes access tokens per
//! connection, and [`ChannelClient`] layers rate-limit waits, 401 refresh
//! and ledger accounting on top of the transport.

mod client;
mod http;
mod tokens;

pub use client::ChannelClient;
pub use http::HttpTransport;
pub use tokens::TokenManager;

use async_trait::async_trait;
use innsync_engine::{error::Result, Connection, Error, RateLimitHeaders, TokenScope};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Header carrying the channel organization.
pub const HEADER_ORGANIZATION: &str = "organization";
/// Header carrying the access token.
pub const HEADER_TOKEN: &str = "token";
/// Header carrying a publish task's idempotency key.
pub const HEADER_IDEMPOTENCY_KEY: &str = "Idempotency-Key";

/// Access token returned by the authentication endpoint.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGrant {
    pub token: String,
    /// Lifetime in seconds from the moment of issue
    pub expires_in: u64,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("token", &"<redacted>")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Credentials attached to one request.
#[derive(Debug, Clone, Copy)]
pub struct ChannelAuth<'a> {
    pub organization: &'a str,
    pub token: &'a str,
}

/// A request to the channel API, relative to the base URL.
#[derive(Debug, Clone)]
pub struct ChannelRequest {
    pub method: Method,
    pub path: String,
    pub idempotency_key: Option<String>,
    pub body: Option<serde_json::Value>,
}

impl ChannelRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            idempotency_key: None,
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            idempotency_key: None,
            body: Some(body),
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Short form for the ledger, e.g. `POST /properties/p1/rates`.
    pub fn summary(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// Raw channel response.
#[derive(Debug, Clone)]
pub struct ChannelResponse {
    pub status: u16,
    pub headers: RateLimitHeaders,
    pub body: String,
}

impl ChannelResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body)
            .map_err(|e| Error::InvalidPayload(format!("channel response: {e}")))
    }
}

/// Wire access to the channel API.
///
/// Implementations never retry; a transport failure surfaces as
/// [`Error::Network`] and a rejected token exchange as [`Error::Credential`].
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Exchange the connection's refresh token for an access token.
    async fn exchange_token(&self, connection: &Connection, scope: TokenScope)
        -> Result<TokenGrant>;

    /// Send one request. Any HTTP status is a successful send.
    async fn send(&self, auth: ChannelAuth<'_>, request: &ChannelRequest)
        -> Result<ChannelResponse>;
}

/// Room type offered by the channel, used when editing mappings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRoomType {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub rate_plans: Vec<ChannelRatePlan>,
}

/// Rate plan of a channel room type, identified by its product code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRatePlan {
    pub product_code: String,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_summary_names_method_and_path() {
        let request = ChannelRequest::post("/properties/p1/rates", json!({}))
            .with_idempotency_key("pub-1");
        assert_eq!(request.summary(), "POST /properties/p1/rates");
        assert_eq!(request.idempotency_key.as_deref(), Some("pub-1"));
    }

    #[test]
    fn response_json_reports_bad_bodies() {
        let response = ChannelResponse {
            status: 200,
            headers: RateLimitHeaders::default(),
            body: "not json".into(),
        };
        let err = response.json::<Vec<ChannelRoomType>>().unwrap_err();
        assert!(matches!(err, Error::InvalidPayload(_)));
        assert!(response.is_success());
    }

    #[test]
    fn room_types_decode_without_rate_plans() {
        let body = json!([{"code": "STD", "name": "Standard"}]).to_string();
        let response = ChannelResponse {
            status: 200,
            headers: RateLimitHeaders::default(),
            body,
        };
        let room_types: Vec<ChannelRoomType> = response.json().unwrap();
        assert_eq!(room_types[0].code, "STD");
        assert!(room_types[0].rate_plans.is_empty());
    }
}

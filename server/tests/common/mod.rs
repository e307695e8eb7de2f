//! Shared fixtures: an in-memory app and a scripted channel.
#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use innsync_engine::{
    error::Result, ChannelMapping, Connection, Error, RateLimitHeaders, TokenScope,
};
use innsync_server::channel::{
    ChannelAuth, ChannelRequest, ChannelResponse, ChannelTransport, TokenGrant,
};
use innsync_server::config::{Config, StoreKind};
use innsync_server::db::{MemoryStore, SyncStore};
use innsync_server::AppState;
use serde_json::{json, Value};

pub const CONNECTION_ID: &str = "conn-1";
pub const PROPERTY_ID: &str = "prop-1";
pub const WEBHOOK_SECRET: &str = "whsec-test";

/// A request as the channel saw it.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    pub path: String,
    pub token: String,
    pub idempotency_key: Option<String>,
    pub body: Option<Value>,
}

/// Channel stand-in.
///
/// Counts token exchanges, remembers idempotency keys and answers a repeated
/// key with 409 without applying it again. Responses can be scripted ahead;
/// unscripted calls succeed with a healthy credit pool. Writes can be
/// applied with their response lost on the way back.
#[derive(Default)]
pub struct MockChannel {
    exchanges: AtomicUsize,
    exchange_delay: Mutex<Duration>,
    reject_exchange: AtomicBool,
    lost_responses: AtomicUsize,
    script: Mutex<VecDeque<ChannelResponse>>,
    get_bodies: Mutex<Vec<(String, String)>>,
    seen_keys: Mutex<HashSet<String>>,
    applied: Mutex<Vec<SeenRequest>>,
    requests: Mutex<Vec<SeenRequest>>,
}

impl MockChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn exchange_count(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    /// Make each token exchange take this long.
    pub fn set_exchange_delay(&self, delay: Duration) {
        *self.exchange_delay.lock().unwrap() = delay;
    }

    pub fn reject_exchanges(&self, reject: bool) {
        self.reject_exchange.store(reject, Ordering::SeqCst);
    }

    /// Apply the next `count` writes but fail them with a network error.
    pub fn lose_responses(&self, count: usize) {
        self.lost_responses.store(count, Ordering::SeqCst);
    }

    /// Queue a response for the next send.
    pub fn push_response(&self, status: u16, credits_remaining: u32, reset_in: u64) {
        self.script.lock().unwrap().push_back(response(
            status,
            credits_remaining,
            reset_in,
            json!({}).to_string(),
        ));
    }

    /// Answer GET requests whose path starts with `prefix` with `body`.
    pub fn respond_to_get(&self, prefix: &str, body: Value) {
        self.get_bodies
            .lock()
            .unwrap()
            .push((prefix.to_string(), body.to_string()));
    }

    /// Requests that changed channel state.
    pub fn applied(&self) -> Vec<SeenRequest> {
        self.applied.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<SeenRequest> {
        self.requests.lock().unwrap().clone()
    }
}

fn response(status: u16, credits_remaining: u32, reset_in: u64, body: String) -> ChannelResponse {
    ChannelResponse {
        status,
        headers: RateLimitHeaders {
            credits_remaining: Some(credits_remaining),
            reset_in_secs: Some(reset_in),
            cost: Some(1),
        },
        body,
    }
}

#[async_trait]
impl ChannelTransport for MockChannel {
    async fn exchange_token(&self, connection: &Connection, scope: TokenScope) -> Result<TokenGrant> {
        let n = self.exchanges.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.exchange_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.reject_exchange.load(Ordering::SeqCst) {
            return Err(Error::Credential {
                connection_id: connection.id.clone(),
                reason: "refresh token revoked".to_string(),
            });
        }
        Ok(TokenGrant {
            token: format!("tok-{scope}-{n}"),
            expires_in: 3600,
        })
    }

    async fn send(&self, auth: ChannelAuth<'_>, request: &ChannelRequest) -> Result<ChannelResponse> {
        let seen = SeenRequest {
            method: request.method.to_string(),
            path: request.path.clone(),
            token: auth.token.to_string(),
            idempotency_key: request.idempotency_key.clone(),
            body: request.body.clone(),
        };
        self.requests.lock().unwrap().push(seen.clone());

        if let Some(scripted) = self.script.lock().unwrap().pop_front() {
            if scripted.is_success() {
                self.applied.lock().unwrap().push(seen);
            }
            return Ok(scripted);
        }

        if request.method == reqwest::Method::GET {
            let body = self
                .get_bodies
                .lock()
                .unwrap()
                .iter()
                .find(|(prefix, _)| request.path.starts_with(prefix.as_str()))
                .map(|(_, body)| body.clone())
                .unwrap_or_else(|| "[]".to_string());
            return Ok(response(200, 100, 60, body));
        }

        if let Some(key) = &request.idempotency_key {
            if !self.seen_keys.lock().unwrap().insert(key.clone()) {
                return Ok(response(
                    409,
                    100,
                    60,
                    json!({"error": "duplicate idempotency key"}).to_string(),
                ));
            }
        }
        self.applied.lock().unwrap().push(seen);
        let lost = self
            .lost_responses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            return Err(Error::Network("connection reset by peer".to_string()));
        }
        Ok(response(200, 100, 60, json!({"accepted": true}).to_string()))
    }
}

pub fn test_config() -> Config {
    Config {
        store: StoreKind::Memory,
        ..Config::default()
    }
}

/// App state over a fresh memory store and the given channel.
pub fn app(channel: Arc<MockChannel>) -> AppState {
    let store: Arc<dyn SyncStore> = Arc::new(MemoryStore::new());
    AppState::new(store, channel, test_config())
}

/// Register the default connection with a webhook secret.
pub async fn seed_connection(state: &AppState) -> Connection {
    let mut connection = Connection::new(CONNECTION_ID, PROPERTY_ID, "booking", "org-1", "refresh-1");
    connection.webhook_secret = Some(WEBHOOK_SECRET.to_string());
    state.store.save_connection(&connection).await.unwrap();
    connection
}

/// Map (room type, rate plan) pairs on the default connection.
pub async fn seed_mappings(state: &AppState, pairs: &[(&str, &str)]) {
    let mappings: Vec<_> = pairs
        .iter()
        .map(|(room_type, rate_plan)| {
            ChannelMapping::new(
                CONNECTION_ID,
                *room_type,
                *rate_plan,
                format!("{room_type}-{rate_plan}").to_uppercase(),
            )
        })
        .collect();
    state
        .store
        .upsert_mappings(CONNECTION_ID, &mappings)
        .await
        .unwrap();
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Raw reservation webhook body.
pub fn reservation_body(external_id: &str, room_type: &str, arrival: NaiveDate, nights: i64) -> String {
    json!({
        "externalId": external_id,
        "channelCode": "booking",
        "roomType": room_type,
        "ratePlan": "bar",
        "arrival": arrival,
        "departure": arrival + chrono::Duration::days(nights),
        "rooms": 1,
        "guest": {
            "firstName": "Ada",
            "lastName": "Lovelace",
            "email": "ada@example.com"
        },
        "totalAmount": 30000,
        "currency": "EUR"
    })
    .to_string()
}

//! Token management and rate-limited channel calls.

mod common;

use std::time::Duration;

use common::*;
use innsync_engine::{AccessToken, ConnectionStatus, Error, LedgerOperation, TokenScope};
use innsync_server::channel::ChannelRequest;
use innsync_server::handlers::{ledger_view, list_room_types};
use serde_json::json;

fn listing() -> ChannelRequest {
    ChannelRequest::get("/properties/prop-1/room-types")
}

#[tokio::test(start_paused = true)]
async fn concurrent_refreshes_exchange_once() {
    let channel = MockChannel::new();
    channel.set_exchange_delay(Duration::from_millis(200));
    let state = app(channel.clone());
    seed_connection(&state).await;

    let tokens = state.channel.tokens();
    let (a, b) = tokio::join!(
        tokens.access_token(CONNECTION_ID, TokenScope::Write),
        tokens.access_token(CONNECTION_ID, TokenScope::Write),
    );

    assert_eq!(a.unwrap().token, b.unwrap().token);
    assert_eq!(channel.exchange_count(), 1);
}

#[tokio::test]
async fn cached_token_is_reused_per_scope() {
    let channel = MockChannel::new();
    let state = app(channel.clone());
    seed_connection(&state).await;

    let tokens = state.channel.tokens();
    let first = tokens.access_token(CONNECTION_ID, TokenScope::Read).await.unwrap();
    let again = tokens.access_token(CONNECTION_ID, TokenScope::Read).await.unwrap();
    assert_eq!(first.token, again.token);
    assert_eq!(channel.exchange_count(), 1);

    let write = tokens.access_token(CONNECTION_ID, TokenScope::Write).await.unwrap();
    assert_ne!(write.token, first.token);
    assert_eq!(channel.exchange_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn low_credits_hold_the_next_call() {
    let channel = MockChannel::new();
    let state = app(channel.clone());
    seed_connection(&state).await;

    channel.push_response(200, 2, 20);
    state
        .channel
        .call(CONNECTION_ID, TokenScope::Read, &listing())
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    state
        .channel
        .call(CONNECTION_ID, TokenScope::Read, &listing())
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_secs(19));
    assert_eq!(channel.requests().len(), 2);

    // The pool recovered; no further wait.
    let started = tokio::time::Instant::now();
    state
        .channel
        .call(CONNECTION_ID, TokenScope::Read, &listing())
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn token_expiring_during_a_credit_wait_is_refreshed() {
    let channel = MockChannel::new();
    let state = app(channel.clone());
    seed_connection(&state).await;

    channel.push_response(200, 2, 300);
    state
        .channel
        .call(CONNECTION_ID, TokenScope::Read, &listing())
        .await
        .unwrap();
    assert_eq!(channel.exchange_count(), 1);

    let waiting = {
        let state = state.clone();
        tokio::spawn(async move {
            state
                .channel
                .call(CONNECTION_ID, TokenScope::Read, &listing())
                .await
        })
    };
    tokio::time::sleep(Duration::from_secs(10)).await;

    // The cached token lapses while the call waits for credits.
    let lapsed = AccessToken {
        token: "tok-lapsed".to_string(),
        expires_at: chrono::Utc::now() - chrono::Duration::seconds(1),
    };
    state
        .store
        .store_token(CONNECTION_ID, TokenScope::Read, &lapsed)
        .await
        .unwrap();

    waiting.await.unwrap().unwrap();
    let requests = channel.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].token, "tok-read-2");
    assert_eq!(channel.exchange_count(), 2);
}

#[tokio::test]
async fn oversized_reset_header_is_capped() {
    let channel = MockChannel::new();
    let state = app(channel.clone());
    seed_connection(&state).await;

    channel.push_response(200, 50, 10_000_000_000_000);
    state
        .channel
        .call(CONNECTION_ID, TokenScope::Read, &listing())
        .await
        .unwrap();

    let connection = state.store.get_connection(CONNECTION_ID).await.unwrap().unwrap();
    let credits = connection.credit_state().unwrap();
    assert!(credits.reset_at <= chrono::Utc::now() + chrono::Duration::days(1));
}

#[tokio::test]
async fn unauthorized_refreshes_once_and_retries() {
    let channel = MockChannel::new();
    let state = app(channel.clone());
    seed_connection(&state).await;

    channel.push_response(401, 100, 60);
    state
        .channel
        .call(CONNECTION_ID, TokenScope::Read, &listing())
        .await
        .unwrap();

    let requests = channel.requests();
    assert_eq!(requests.len(), 2);
    assert_ne!(requests[0].token, requests[1].token);
    assert_eq!(channel.exchange_count(), 2);
}

#[tokio::test]
async fn second_unauthorized_fails() {
    let channel = MockChannel::new();
    let state = app(channel.clone());
    seed_connection(&state).await;

    channel.push_response(401, 100, 60);
    channel.push_response(401, 100, 60);
    let err = state
        .channel
        .call(CONNECTION_ID, TokenScope::Read, &listing())
        .await
        .unwrap_err();
    assert!(matches!(err.engine(), Some(Error::ChannelApi { status: 401, .. })));
    assert_eq!(channel.requests().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn throttling_gives_up_after_the_attempt_ceiling() {
    let channel = MockChannel::new();
    let state = app(channel.clone());
    seed_connection(&state).await;

    for _ in 0..3 {
        channel.push_response(429, 50, 5);
    }
    let started = tokio::time::Instant::now();
    let err = state
        .channel
        .call(CONNECTION_ID, TokenScope::Read, &listing())
        .await
        .unwrap_err();

    assert!(matches!(
        err.engine(),
        Some(Error::RateLimitExceeded { attempts: 3 })
    ));
    assert_eq!(channel.requests().len(), 3);
    assert!(started.elapsed() >= Duration::from_secs(10));
}

#[tokio::test]
async fn failed_exchange_marks_connection_error() {
    let channel = MockChannel::new();
    channel.reject_exchanges(true);
    let state = app(channel.clone());
    seed_connection(&state).await;

    let err = state
        .channel
        .tokens()
        .access_token(CONNECTION_ID, TokenScope::Write)
        .await
        .unwrap_err();
    assert!(matches!(err.engine(), Some(Error::Credential { .. })));

    let connection = state.store.get_connection(CONNECTION_ID).await.unwrap().unwrap();
    assert_eq!(connection.status, ConnectionStatus::Error);

    // Paused until an operator rotates credentials.
    let err = state
        .channel
        .tokens()
        .access_token(CONNECTION_ID, TokenScope::Write)
        .await
        .unwrap_err();
    assert!(matches!(err.engine(), Some(Error::ConnectionPaused(_))));
    assert_eq!(channel.exchange_count(), 1);
}

#[tokio::test]
async fn every_call_lands_in_the_ledger_with_credits() {
    let channel = MockChannel::new();
    let state = app(channel.clone());
    seed_connection(&state).await;

    channel.push_response(200, 42, 30);
    state
        .channel
        .call(CONNECTION_ID, TokenScope::Read, &listing())
        .await
        .unwrap();

    let view = ledger_view(&state, CONNECTION_ID, None).await.unwrap();
    assert_eq!(view.credits.map(|c| c.remaining), Some(42));

    let call = view
        .entries
        .iter()
        .find(|e| e.operation == LedgerOperation::ChannelCall)
        .unwrap();
    assert_eq!(call.response_status, Some(200));
    assert_eq!(call.credits_remaining, Some(42));
    assert_eq!(call.request_cost, Some(1));
    assert!(view
        .entries
        .iter()
        .any(|e| e.operation == LedgerOperation::TokenRefresh));
}

#[tokio::test]
async fn room_types_are_listed_from_the_channel() {
    let channel = MockChannel::new();
    channel.respond_to_get(
        "/properties/prop-1/room-types",
        json!([{
            "code": "STD",
            "name": "Standard",
            "ratePlans": [{"productCode": "STD-BAR", "name": "Best available"}]
        }]),
    );
    let state = app(channel.clone());
    seed_connection(&state).await;

    let room_types = list_room_types(&state, CONNECTION_ID).await.unwrap();
    assert_eq!(room_types.len(), 1);
    assert_eq!(room_types[0].rate_plans[0].product_code, "STD-BAR");
}

//! HTTP surface: routing, auth and webhook signatures.

mod common;

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use common::*;
use innsync_engine::{signature, LedgerOperation, SyncLogEntry};
use innsync_server::db::MemoryStore;
use innsync_server::feed::ServerMessage;
use innsync_server::{build_router, AppState};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_is_open() {
    let state = app(MockChannel::new());
    let response = build_router(state)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
}

#[tokio::test]
async fn operator_routes_require_the_secret_when_configured() {
    let mut config = test_config();
    config.auth_secret = Some("s3cret".to_string());
    let state = AppState::new(Arc::new(MemoryStore::new()), MockChannel::new(), config);
    seed_connection(&state).await;
    let router = build_router(state);

    let uri = format!("/connections/{CONNECTION_ID}/ledger");
    let response = router
        .clone()
        .oneshot(Request::get(&uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = router
        .clone()
        .oneshot(
            Request::get(&uri)
                .header(header::AUTHORIZATION, "Bearer wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = router
        .oneshot(
            Request::get(&uri)
                .header(header::AUTHORIZATION, "Bearer s3cret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["connectionId"], CONNECTION_ID);
}

#[tokio::test]
async fn stage_and_read_back_a_cell() {
    let state = app(MockChannel::new());
    let router = build_router(state);

    let response = router
        .clone()
        .oneshot(json_request(
            "PUT",
            "/ari/staged",
            json!([{"date": "2025-09-25", "roomType": "std", "ratePlan": "bar", "rate": 15000, "available": 3}]),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["staged"], 1);

    let response = router
        .oneshot(
            Request::get("/ari/2025-09-25/std/bar")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cell = body_json(response).await;
    assert_eq!(cell["effective"]["rate"], 15000);
    assert_eq!(cell["committed"], Value::Null);
}

#[tokio::test]
async fn webhook_accepts_signed_delivery_and_apply_reports_gaps() {
    let state = app(MockChannel::new());
    seed_connection(&state).await;
    let router = build_router(state);

    let body = reservation_body("R-900", "STD-999", date(2025, 9, 25), 1);
    let response = router
        .clone()
        .oneshot(
            Request::post(format!("/webhooks/{CONNECTION_ID}/reservations"))
                .header("X-Signature", signature::sign(WEBHOOK_SECRET, body.as_bytes()))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let received = body_json(response).await;
    assert_eq!(received["outcome"], "created");
    assert_eq!(received["order"]["signatureValid"], true);

    let order_id = received["order"]["id"].as_str().unwrap().to_string();
    let response = router
        .clone()
        .oneshot(
            Request::post(format!("/orders/{order_id}/apply"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let error = body_json(response).await;
    assert_eq!(error["details"]["missing"][0]["roomType"], "STD-999");

    let response = router
        .oneshot(
            Request::post(format!("/orders/{order_id}/reject"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({"reason": "unknown room"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "rejected");
}

#[tokio::test]
async fn unknown_order_action_is_a_bad_request() {
    let state = app(MockChannel::new());
    let response = build_router(state)
        .oneshot(
            Request::post("/orders/o-1/cancel")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn connection_registration_and_mappings() {
    let state = app(MockChannel::new());
    let router = build_router(state);

    let response = router
        .clone()
        .oneshot(json_request(
            "PUT",
            "/connections/conn-9",
            json!({
                "propertyId": "prop-9",
                "channelPropertyId": "ext-9",
                "channelCode": "expedia",
                "organization": "org-9",
                "refreshToken": "rt-9",
                "webhookSecret": "sec-9"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let connection = body_json(response).await;
    assert_eq!(connection["channelPropertyId"], "ext-9");
    assert_eq!(connection["status"], "active");
    assert!(connection.get("refreshToken").is_none());
    assert!(connection.get("webhookSecret").is_none());

    let response = router
        .clone()
        .oneshot(json_request(
            "PUT",
            "/connections/conn-9/mappings",
            json!([
                {"roomType": "std", "ratePlan": "bar", "productCode": "STD-BAR"},
                {"roomType": "dlx", "ratePlan": "bar", "productCode": "DLX-BAR", "active": false}
            ]),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mappings = body_json(response).await;
    assert_eq!(mappings["mappings"].as_array().unwrap().len(), 1);

    let response = router
        .oneshot(
            Request::post("/connections/conn-9/deactivate")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(body_json(response).await["active"], false);
}

#[tokio::test]
async fn ledger_entries_reach_feed_subscribers() {
    let state = app(MockChannel::new());
    let (all_tx, mut all_rx) = mpsc::unbounded_channel();
    let (one_tx, mut one_rx) = mpsc::unbounded_channel();
    state.feed.register(all_tx);
    let filtered = state.feed.register(one_tx);
    state.feed.set_filter(&filtered, Some("conn-2".to_string()));

    state
        .ledger
        .record(SyncLogEntry::new(
            CONNECTION_ID,
            LedgerOperation::StagingCleared,
            "cleared 1 staged cells",
            true,
            chrono::Utc::now(),
        ))
        .await;

    match all_rx.try_recv().unwrap() {
        ServerMessage::Entry { entry } => assert_eq!(entry.connection_id, CONNECTION_ID),
        other => panic!("expected entry, got {other:?}"),
    }
    assert!(one_rx.try_recv().is_err());
}

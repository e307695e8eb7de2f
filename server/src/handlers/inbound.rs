//! Inbound reservation ingestion and processing.

use chrono::Utc;
use innsync_engine::{
    signature, CommitEvent, Connection, Error, Guest, InboundOrder, LedgerOperation, OrderAction,
    ReceiveOutcome, Reservation, SyncLogEntry, Timestamp,
};
use serde::Serialize;

use super::auto_enqueue;
use crate::db::OrderApplication;
use crate::error::Result;
use crate::AppState;

/// Header carrying the webhook HMAC signature.
pub const SIGNATURE_HEADER: &str = "x-signature";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveResponse {
    pub order: InboundOrder,
    pub outcome: ReceiveOutcome,
}

async fn load_connection(state: &AppState, connection_id: &str) -> Result<Connection> {
    Ok(state
        .store
        .get_connection(connection_id)
        .await?
        .ok_or_else(|| Error::not_found("connection", connection_id))?)
}

/// Whether `provided` is a valid signature of `body` under the connection's secret.
///
/// A connection without a webhook secret cannot validate anything.
fn signature_valid(connection: &Connection, body: &str, provided: Option<&str>) -> bool {
    match (&connection.webhook_secret, provided) {
        (Some(secret), Some(provided)) => signature::verify(secret, body.as_bytes(), provided),
        _ => false,
    }
}

/// Store a webhook delivery as a pending order, upserting by external id.
///
/// An invalid signature is recorded on the order for the operator; it does
/// not reject the delivery.
pub async fn receive_order(
    state: &AppState,
    connection_id: &str,
    body: &str,
    provided_signature: Option<String>,
) -> Result<ReceiveResponse> {
    let connection = load_connection(state, connection_id).await?;
    let valid = signature_valid(&connection, body, provided_signature.as_deref());
    let order = InboundOrder::receive(
        uuid::Uuid::new_v4().to_string(),
        connection_id,
        body,
        provided_signature,
        valid,
        Utc::now(),
    )?;
    if !valid {
        tracing::warn!(
            connection_id = %connection_id,
            external_id = %order.external_id,
            "Inbound order signature missing or invalid"
        );
    }

    store_received(state, order).await
}

async fn store_received(state: &AppState, order: InboundOrder) -> Result<ReceiveResponse> {
    let _guard = state.lock_order(&order.external_id).await;

    let (order, outcome) = state.store.receive_order(&order).await?;

    state
        .ledger
        .record(SyncLogEntry::new(
            &order.connection_id,
            LedgerOperation::InboundReceive,
            format!("receive {} ({outcome:?})", order.external_id),
            true,
            order.received_at,
        ))
        .await;
    tracing::info!(
        connection_id = %order.connection_id,
        external_id = %order.external_id,
        outcome = ?outcome,
        "Inbound order received"
    );

    Ok(ReceiveResponse { order, outcome })
}

/// Apply or reject a pending order.
///
/// An order that already reached a terminal status is returned unchanged,
/// so a repeated call is a no-op that reports the earlier result.
pub async fn process_order(state: &AppState, order_id: &str, action: OrderAction) -> Result<InboundOrder> {
    let order = state
        .store
        .get_order(order_id)
        .await?
        .ok_or_else(|| Error::not_found("inbound order", order_id))?;

    let _guard = state.lock_order(&order.external_id).await;

    // Re-read under the lock; a concurrent call may have finished it.
    let order = state
        .store
        .get_order(order_id)
        .await?
        .ok_or_else(|| Error::not_found("inbound order", order_id))?;
    if order.status.is_terminal() {
        tracing::debug!(
            external_id = %order.external_id,
            status = %order.status,
            "Order already processed"
        );
        return Ok(order);
    }

    match action {
        OrderAction::Apply => apply_order(state, order).await,
        OrderAction::Reject { reason } => reject_order(state, order, reason).await,
    }
}

async fn apply_order(state: &AppState, mut order: InboundOrder) -> Result<InboundOrder> {
    let connection = load_connection(state, &order.connection_id).await?;
    let now = Utc::now();

    // Polled bookings carry no signature and keep their flag.
    if order.signature.is_some() {
        order.signature_valid =
            signature_valid(&connection, &order.raw_payload, order.signature.as_deref());
    }
    if !order.signature_valid {
        tracing::warn!(
            external_id = %order.external_id,
            "Applying order with an unverified signature"
        );
    }

    let payload = order.payload()?;
    let mappings = state.store.mappings(&connection.id).await?;
    if let Err(missing) = mappings.validate([&payload.pair()]) {
        state
            .ledger
            .record(SyncLogEntry::new(
                &connection.id,
                LedgerOperation::InboundApply,
                format!("apply {} blocked: {missing}", order.external_id),
                false,
                now,
            ))
            .await;
        return Err(Error::MappingGap(missing).into());
    }

    let guest = Guest::from_details(
        uuid::Uuid::new_v4().to_string(),
        &connection.property_id,
        &payload.guest,
    );
    let reservation = Reservation::from_payload(
        uuid::Uuid::new_v4().to_string(),
        &connection.property_id,
        &guest.id,
        &payload,
    );
    let applied = state
        .store
        .apply_order(OrderApplication {
            order,
            guest,
            reservation,
            inventory: payload.inventory_keys(),
            now,
        })
        .await?;

    state
        .ledger
        .record(SyncLogEntry::new(
            &connection.id,
            LedgerOperation::InboundApply,
            format!(
                "apply {} -> reservation {}",
                applied.order.external_id, applied.reservation_id
            ),
            true,
            now,
        ))
        .await;
    tracing::info!(
        connection_id = %connection.id,
        external_id = %applied.order.external_id,
        reservation_id = %applied.reservation_id,
        nights = applied.changes.len(),
        "Inbound order applied"
    );

    // The order is applied either way; a failed enqueue only delays the push.
    if let Some(event) = CommitEvent::from_changes(&applied.changes) {
        if let Err(e) = auto_enqueue(state, &event).await {
            tracing::error!(
                external_id = %applied.order.external_id,
                error = %e,
                "Failed to queue availability publish"
            );
        }
    }

    Ok(applied.order)
}

async fn reject_order(state: &AppState, mut order: InboundOrder, reason: String) -> Result<InboundOrder> {
    let now = Utc::now();
    order.mark_rejected(reason.clone(), now)?;
    state.store.save_order(&order).await?;

    state
        .ledger
        .record(SyncLogEntry::new(
            &order.connection_id,
            LedgerOperation::InboundReject,
            format!("reject {}: {reason}", order.external_id),
            true,
            now,
        ))
        .await;
    tracing::info!(external_id = %order.external_id, reason = %reason, "Inbound order rejected");

    Ok(order)
}

/// Pull bookings changed since `since` and receive each one.
///
/// Bookings fetched with the connection's own credentials are trusted and
/// stored as signature-valid. Returns the number of created or updated
/// orders.
pub async fn poll_bookings(state: &AppState, connection_id: &str, since: Timestamp) -> Result<usize> {
    let bookings = state.channel.fetch_bookings(connection_id, since).await?;
    let mut changed = 0;

    for raw in bookings {
        let order = match InboundOrder::receive(
            uuid::Uuid::new_v4().to_string(),
            connection_id,
            raw,
            None,
            true,
            Utc::now(),
        ) {
            Ok(order) => order,
            Err(e) => {
                tracing::warn!(connection_id = %connection_id, error = %e, "Skipping malformed booking");
                continue;
            }
        };
        let received = store_received(state, order).await?;
        if received.outcome != ReceiveOutcome::Unchanged {
            changed += 1;
        }
    }

    Ok(changed)
}

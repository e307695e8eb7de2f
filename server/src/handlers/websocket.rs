//! WebSocket handler for the live ledger feed.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use innsync_engine::ConnectionId;
use tokio::sync::mpsc;

use crate::feed::{ClientMessage, LedgerFeed, ServerMessage};

/// Serve one dashboard until it disconnects.
///
/// The subscriber starts with `filter` (from the upgrade query) and may
/// change it later with a `subscribe` message.
pub async fn handle_feed_socket(
    socket: WebSocket,
    feed: Arc<LedgerFeed>,
    filter: Option<ConnectionId>,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let subscriber_id = feed.register(tx);
    if filter.is_some() {
        feed.set_filter(&subscriber_id, filter.clone());
    }
    feed.send_to(
        &subscriber_id,
        ServerMessage::Subscribed {
            connection_id: filter,
        },
    );

    tracing::info!(subscriber_id = %subscriber_id, "Ledger feed subscriber connected");

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(text) => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::warn!("Failed to send feed message: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize feed message: {}", e);
                }
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let response = process_message(&text, &feed, &subscriber_id);
                feed.send_to(&subscriber_id, response);
            }
            Ok(Message::Binary(_)) => {
                tracing::warn!("Binary messages not supported");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::warn!(subscriber_id = %subscriber_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    feed.unregister(&subscriber_id);
    send_task.abort();

    tracing::info!(
        subscriber_id = %subscriber_id,
        remaining = feed.subscriber_count(),
        "Ledger feed subscriber disconnected"
    );
}

fn process_message(text: &str, feed: &LedgerFeed, subscriber_id: &str) -> ServerMessage {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => return ServerMessage::error(format!("Invalid message format: {e}")),
    };

    match message {
        ClientMessage::Subscribe { connection_id } => {
            feed.set_filter(subscriber_id, connection_id.clone());
            ServerMessage::Subscribed { connection_id }
        }
        ClientMessage::Ping => ServerMessage::Pong,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_message_sets_filter() {
        let feed = LedgerFeed::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = feed.register(tx);

        let reply = process_message(r#"{"type":"subscribe","connection_id":"c1"}"#, &feed, &id);
        assert!(matches!(
            reply,
            ServerMessage::Subscribed { connection_id: Some(ref c) } if c == "c1"
        ));
    }

    #[test]
    fn malformed_message_yields_error() {
        let feed = LedgerFeed::new();
        let reply = process_message("not json", &feed, "missing");
        assert!(matches!(reply, ServerMessage::Error { .. }));
    }
}

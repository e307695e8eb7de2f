//! Ledger feed message protocol.
//!
//! All messages are JSON-encoded and tagged by `type`.

use innsync_engine::{ConnectionId, SyncLogEntry};
use serde::{Deserialize, Serialize};

/// Messages sent from a dashboard to the server.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Narrow the feed to one connection, or widen it again with `null`.
    Subscribe {
        #[serde(default)]
        connection_id: Option<ConnectionId>,
    },

    /// Keep-alive ping.
    Ping,
}

/// Messages sent from the server to a dashboard.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A ledger entry was appended.
    Entry { entry: SyncLogEntry },

    /// Acknowledges a subscribe request.
    Subscribed {
        #[serde(skip_serializing_if = "Option::is_none")]
        connection_id: Option<ConnectionId>,
    },

    /// Response to ping.
    Pong,

    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use innsync_engine::LedgerOperation;

    #[test]
    fn client_messages_deserialize() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type": "subscribe", "connection_id": "c1"}"#).unwrap();
        match msg {
            ClientMessage::Subscribe { connection_id } => {
                assert_eq!(connection_id.as_deref(), Some("c1"))
            }
            _ => panic!("Expected Subscribe message"),
        }

        let msg: ClientMessage = serde_json::from_str(r#"{"type": "subscribe"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Subscribe { connection_id: None }));

        let msg: ClientMessage = serde_json::from_str(r#"{"type": "ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }

    #[test]
    fn server_messages_serialize() {
        let json = serde_json::to_string(&ServerMessage::Pong).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);

        let entry = SyncLogEntry::new(
            "c1",
            LedgerOperation::ChannelCall,
            "POST /properties/p1/rates",
            true,
            Utc.timestamp_opt(1_758_758_400, 0).unwrap(),
        )
        .with_status(200);
        let value = serde_json::to_value(ServerMessage::Entry { entry }).unwrap();
        assert_eq!(value["type"], "entry");
        assert_eq!(value["entry"]["operation"], "channel_call");
        assert_eq!(value["entry"]["responseStatus"], 200);
    }
}

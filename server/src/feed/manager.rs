//! Ledger feed subscriber registry.
//!
//! Tracks connected dashboards and fans appended ledger entries out to
//! every subscriber whose filter matches.

use std::sync::Arc;

use dashmap::DashMap;
use innsync_engine::{ConnectionId, SyncLogEntry};
use tokio::sync::mpsc;

use super::ServerMessage;

/// Sender for feed messages.
pub type MessageSender = mpsc::UnboundedSender<ServerMessage>;

/// One connected dashboard.
#[derive(Debug)]
struct Subscriber {
    /// Only entries of this channel connection, or all when `None`
    filter: Option<ConnectionId>,
    sender: MessageSender,
}

impl Subscriber {
    fn wants(&self, entry: &SyncLogEntry) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |id| *id == entry.connection_id)
    }
}

/// Registry of live ledger subscribers.
///
/// Thread-safe and shared across handlers and workers via `Arc`.
#[derive(Debug, Default)]
pub struct LedgerFeed {
    subscribers: DashMap<String, Subscriber>,
}

impl LedgerFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a subscriber that receives every entry.
    ///
    /// Returns the subscriber id.
    pub fn register(&self, sender: MessageSender) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.subscribers.insert(
            id.clone(),
            Subscriber {
                filter: None,
                sender,
            },
        );
        tracing::debug!(subscriber_id = %id, "Ledger feed subscriber registered");
        id
    }

    /// Change a subscriber's connection filter.
    pub fn set_filter(&self, subscriber_id: &str, filter: Option<ConnectionId>) -> bool {
        match self.subscribers.get_mut(subscriber_id) {
            Some(mut subscriber) => {
                subscriber.filter = filter;
                true
            }
            None => false,
        }
    }

    pub fn unregister(&self, subscriber_id: &str) {
        if self.subscribers.remove(subscriber_id).is_some() {
            tracing::debug!(subscriber_id = %subscriber_id, "Ledger feed subscriber unregistered");
        }
    }

    /// Fan an entry out to matching subscribers.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, entry: &SyncLogEntry) -> usize {
        let mut sent = 0;
        for subscriber in self.subscribers.iter() {
            if subscriber.wants(entry)
                && subscriber
                    .sender
                    .send(ServerMessage::Entry {
                        entry: entry.clone(),
                    })
                    .is_ok()
            {
                sent += 1;
            }
        }
        sent
    }

    /// Send a message to one subscriber.
    pub fn send_to(&self, subscriber_id: &str, message: ServerMessage) -> bool {
        self.subscribers
            .get(subscriber_id)
            .is_some_and(|s| s.sender.send(message).is_ok())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use innsync_engine::LedgerOperation;

    fn entry(connection_id: &str) -> SyncLogEntry {
        SyncLogEntry::new(
            connection_id,
            LedgerOperation::PublishTask,
            "publish task t1",
            true,
            Utc.timestamp_opt(1_758_758_400, 0).unwrap(),
        )
    }

    #[test]
    fn register_unregister() {
        let feed = LedgerFeed::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let id = feed.register(tx);
        assert_eq!(feed.subscriber_count(), 1);

        feed.unregister(&id);
        assert_eq!(feed.subscriber_count(), 0);
        assert!(!feed.set_filter(&id, None));
    }

    #[test]
    fn publish_honours_filters() {
        let feed = LedgerFeed::new();
        let (all_tx, mut all_rx) = mpsc::unbounded_channel();
        let (c2_tx, mut c2_rx) = mpsc::unbounded_channel();

        feed.register(all_tx);
        let c2 = feed.register(c2_tx);
        assert!(feed.set_filter(&c2, Some("c2".into())));

        assert_eq!(feed.publish(&entry("c1")), 1);
        assert!(matches!(all_rx.try_recv().unwrap(), ServerMessage::Entry { .. }));
        assert!(c2_rx.try_recv().is_err());

        assert_eq!(feed.publish(&entry("c2")), 2);
        match c2_rx.try_recv().unwrap() {
            ServerMessage::Entry { entry } => assert_eq!(entry.connection_id, "c2"),
            other => panic!("Expected entry, got {other:?}"),
        }
    }

    #[test]
    fn closed_subscribers_are_skipped() {
        let feed = LedgerFeed::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = feed.register(tx);
        drop(rx);

        assert_eq!(feed.publish(&entry("c1")), 0);
        assert!(!feed.send_to(&id, ServerMessage::Pong));
    }
}

//! Sync Ledger writes.
//!
//! Every entry is appended to the store and then fanned out to live feed
//! subscribers. A failed append is logged and never fails the operation
//! being recorded: credit state is rebuilt from response headers, not from
//! the ledger, so a lost entry cannot skew accounting.

use std::sync::Arc;

use innsync_engine::SyncLogEntry;

use crate::db::SyncStore;
use crate::feed::LedgerFeed;

/// Appends ledger entries and publishes them to the live feed.
#[derive(Clone)]
pub struct LedgerWriter {
    store: Arc<dyn SyncStore>,
    feed: Arc<LedgerFeed>,
}

impl LedgerWriter {
    pub fn new(store: Arc<dyn SyncStore>, feed: Arc<LedgerFeed>) -> Self {
        Self { store, feed }
    }

    pub async fn record(&self, entry: SyncLogEntry) {
        if let Err(e) = self.store.append_log(&entry).await {
            tracing::warn!(
                connection_id = %entry.connection_id,
                operation = %entry.operation,
                error = %e,
                "Failed to append ledger entry"
            );
        }
        self.feed.publish(&entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::feed::ServerMessage;
    use chrono::Utc;
    use innsync_engine::LedgerOperation;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn record_persists_and_publishes() {
        let store = Arc::new(MemoryStore::new());
        let feed = LedgerFeed::new_shared();
        let (tx, mut rx) = mpsc::unbounded_channel();
        feed.register(tx);

        let writer = LedgerWriter::new(store.clone(), feed);
        writer
            .record(SyncLogEntry::new(
                "c1",
                LedgerOperation::InboundReceive,
                "webhook R-1",
                true,
                Utc::now(),
            ))
            .await;

        let stored = store.recent_log("c1", 10).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::Entry { .. }));
    }
}

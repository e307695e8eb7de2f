//! Persistence for connections, ARI, publish tasks, orders and the ledger.
//!
//! [`SyncStore`] is the seam between the workers and storage. [`PgStore`]
//! is the production backend; [`MemoryStore`] keeps everything in process
//! and backs the tests and `STORE=memory` development runs.

mod ari;
mod connections;
mod ledger;
mod memory;
mod orders;
mod pool;
mod postgres;
mod tasks;

pub use memory::MemoryStore;
pub use pool::*;
pub use postgres::PgStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use innsync_engine::{
    AccessToken, AriCell, CellKey, ChannelMapping, CommittedChange, Connection, CreditState,
    Guest, InboundOrder, MappingTable, PublishTask, PushType, ReceiveOutcome, Reservation,
    SyncLogEntry, TaskId, Timestamp, TokenScope,
};

use crate::error::Result;

/// Everything needed to apply an inbound order in one transaction.
#[derive(Debug, Clone)]
pub struct OrderApplication {
    /// The pending order; the store marks it applied
    pub order: InboundOrder,
    /// Guest built from the payload; merged into an existing guest with the
    /// same property and email
    pub guest: Guest,
    /// Reservation built from the payload; its id is kept if one already
    /// exists for the external id
    pub reservation: Reservation,
    /// Cells whose committed availability drops by `reservation.rooms`
    pub inventory: Vec<CellKey>,
    pub now: Timestamp,
}

/// Result of a successful order application.
#[derive(Debug, Clone)]
pub struct AppliedOrder {
    pub order: InboundOrder,
    pub guest_id: String,
    pub reservation_id: String,
    /// Committed cells changed by the inventory decrement
    pub changes: Vec<CommittedChange>,
}

/// Storage backend used by the server.
///
/// Every method is atomic on its own. Methods that touch several rows
/// (`commit_published`, `apply_order`) run in a single transaction.
#[async_trait]
pub trait SyncStore: Send + Sync {
    // Connections

    async fn get_connection(&self, id: &str) -> Result<Option<Connection>>;

    async fn list_connections(&self) -> Result<Vec<Connection>>;

    /// Insert or replace a connection, including credentials.
    async fn save_connection(&self, connection: &Connection) -> Result<()>;

    /// Cache a freshly exchanged token and clear any error state.
    async fn store_token(&self, id: &str, scope: TokenScope, token: &AccessToken) -> Result<()>;

    async fn invalidate_token(&self, id: &str, scope: TokenScope) -> Result<()>;

    async fn mark_connection_error(&self, id: &str, reason: &str) -> Result<()>;

    async fn record_credits(&self, id: &str, state: CreditState) -> Result<()>;

    // Mappings

    async fn mappings(&self, connection_id: &str) -> Result<MappingTable>;

    async fn upsert_mappings(&self, connection_id: &str, mappings: &[ChannelMapping]) -> Result<()>;

    // ARI

    /// Committed and staged value of one cell.
    async fn get_cell(&self, key: &CellKey) -> Result<(Option<AriCell>, Option<AriCell>)>;

    /// Effective values for the keys, skipping keys with no value.
    async fn effective_cells(&self, keys: &[CellKey]) -> Result<BTreeMap<CellKey, AriCell>>;

    /// Stage full cells, each replacing any earlier staged value.
    async fn stage_cells(&self, cells: &[(CellKey, AriCell)], now: Timestamp) -> Result<()>;

    /// Commit the fields a publish of type `push` delivered.
    ///
    /// Cells re-staged while the publish was in flight are skipped; a staged
    /// edit is cleared once committed holds all of it.
    async fn commit_published(
        &self,
        pushed: &[(CellKey, AriCell)],
        push: PushType,
    ) -> Result<Vec<CellKey>>;

    /// Write committed values directly, bypassing staging.
    async fn commit_local(&self, cells: &[(CellKey, AriCell)]) -> Result<Vec<CommittedChange>>;

    /// Drop staged cells and every queued task touching them.
    ///
    /// Returns the number of cleared cells and the cancelled task ids.
    async fn clear_pending(&self, keys: &[CellKey]) -> Result<(usize, Vec<TaskId>)>;

    async fn staged_keys(&self) -> Result<Vec<CellKey>>;

    // Publish tasks

    async fn insert_task(&self, task: &PublishTask) -> Result<()>;

    async fn get_task(&self, id: &str) -> Result<Option<PublishTask>>;

    async fn update_task(&self, task: &PublishTask) -> Result<()>;

    /// Oldest due task of a connection, or `None` while one is processing.
    async fn next_due_task(&self, connection_id: &str, now: Timestamp)
        -> Result<Option<PublishTask>>;

    /// Return tasks left in `processing` by a crash to the queue.
    async fn recover_stalled_tasks(&self) -> Result<usize>;

    // Inbound orders

    /// Insert by external id, or merge a re-delivery into the stored order.
    async fn receive_order(&self, order: &InboundOrder) -> Result<(InboundOrder, ReceiveOutcome)>;

    async fn get_order(&self, id: &str) -> Result<Option<InboundOrder>>;

    async fn save_order(&self, order: &InboundOrder) -> Result<()>;

    /// Upsert guest and reservation, decrement inventory and mark the order
    /// applied, all or nothing.
    async fn apply_order(&self, application: OrderApplication) -> Result<AppliedOrder>;

    async fn get_reservation(&self, external_id: &str) -> Result<Option<Reservation>>;

    async fn count_reservations(&self) -> Result<usize>;

    // Ledger

    async fn append_log(&self, entry: &SyncLogEntry) -> Result<()>;

    /// Newest entries of a connection first.
    async fn recent_log(&self, connection_id: &str, limit: usize) -> Result<Vec<SyncLogEntry>>;

    async fn latest_credit_state(&self, connection_id: &str) -> Result<Option<CreditState>>;
}

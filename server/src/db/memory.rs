//! In-process store built directly on the engine's collections.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use innsync_engine::{
    reservation::decrement_inventory, AccessToken, AriCell, CellKey, ChannelMapping,
    CommittedChange, Connection, CreditState, Error, Guest, InboundOrder, MappingTable,
    PublishQueue, PublishTask, PushType, ReceiveOutcome, Reservation, StagingStore, SyncLedger,
    SyncLogEntry, TaskId, Timestamp, TokenScope,
};
use tokio::sync::Mutex;

use super::{AppliedOrder, OrderApplication, SyncStore};
use crate::error::Result;

#[derive(Debug, Default)]
struct State {
    connections: HashMap<String, Connection>,
    mappings: HashMap<String, MappingTable>,
    ari: StagingStore,
    tasks: PublishQueue,
    orders: innsync_engine::OrderBook,
    /// Keyed by (property id, normalized email)
    guests: HashMap<(String, String), Guest>,
    /// Keyed by external reservation id
    reservations: HashMap<String, Reservation>,
    ledger: SyncLedger,
}

impl State {
    fn connection_mut(&mut self, id: &str) -> Result<&mut Connection> {
        self.connections
            .get_mut(id)
            .ok_or_else(|| Error::not_found("connection", id).into())
    }
}

/// Store that keeps all state behind one async mutex.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed committed ARI values.
    pub async fn load_committed(&self, cells: impl IntoIterator<Item = (CellKey, AriCell)>) {
        self.state.lock().await.ari.load_committed(cells);
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn get_connection(&self, id: &str) -> Result<Option<Connection>> {
        Ok(self.state.lock().await.connections.get(id).cloned())
    }

    async fn list_connections(&self) -> Result<Vec<Connection>> {
        let state = self.state.lock().await;
        let mut connections: Vec<_> = state.connections.values().cloned().collect();
        connections.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(connections)
    }

    async fn save_connection(&self, connection: &Connection) -> Result<()> {
        self.state
            .lock()
            .await
            .connections
            .insert(connection.id.clone(), connection.clone());
        Ok(())
    }

    async fn store_token(&self, id: &str, scope: TokenScope, token: &AccessToken) -> Result<()> {
        let mut state = self.state.lock().await;
        state.connection_mut(id)?.store_token(scope, token.clone());
        Ok(())
    }

    async fn invalidate_token(&self, id: &str, scope: TokenScope) -> Result<()> {
        let mut state = self.state.lock().await;
        state.connection_mut(id)?.invalidate_token(scope);
        Ok(())
    }

    async fn mark_connection_error(&self, id: &str, reason: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.connection_mut(id)?.mark_error(reason);
        Ok(())
    }

    async fn record_credits(&self, id: &str, credits: CreditState) -> Result<()> {
        let mut state = self.state.lock().await;
        state.connection_mut(id)?.record_credits(credits);
        Ok(())
    }

    async fn mappings(&self, connection_id: &str) -> Result<MappingTable> {
        Ok(self
            .state
            .lock()
            .await
            .mappings
            .get(connection_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn upsert_mappings(&self, connection_id: &str, mappings: &[ChannelMapping]) -> Result<()> {
        let mut state = self.state.lock().await;
        let table = state.mappings.entry(connection_id.to_string()).or_default();
        for mapping in mappings {
            table.upsert(mapping.clone());
        }
        Ok(())
    }

    async fn get_cell(&self, key: &CellKey) -> Result<(Option<AriCell>, Option<AriCell>)> {
        let state = self.state.lock().await;
        Ok((
            state.ari.committed(key).cloned(),
            state.ari.staged(key).cloned(),
        ))
    }

    async fn effective_cells(&self, keys: &[CellKey]) -> Result<BTreeMap<CellKey, AriCell>> {
        Ok(self.state.lock().await.ari.effective_many(keys))
    }

    async fn stage_cells(&self, cells: &[(CellKey, AriCell)], now: Timestamp) -> Result<()> {
        // Validate everything first so a bad cell stages nothing.
        for (_, cell) in cells {
            cell.validate()?;
        }
        let mut state = self.state.lock().await;
        for (key, cell) in cells {
            state.ari.stage(key.clone(), cell.clone(), now)?;
        }
        Ok(())
    }

    async fn commit_published(
        &self,
        pushed: &[(CellKey, AriCell)],
        push: PushType,
    ) -> Result<Vec<CellKey>> {
        Ok(self.state.lock().await.ari.commit_published(pushed, push))
    }

    async fn commit_local(&self, cells: &[(CellKey, AriCell)]) -> Result<Vec<CommittedChange>> {
        Ok(self.state.lock().await.ari.commit_local(cells.to_vec()))
    }

    async fn clear_pending(&self, keys: &[CellKey]) -> Result<(usize, Vec<TaskId>)> {
        let mut state = self.state.lock().await;
        let cleared = state.ari.clear(keys);
        let cancelled = state.tasks.remove_queued_touching(keys);
        Ok((cleared, cancelled))
    }

    async fn staged_keys(&self) -> Result<Vec<CellKey>> {
        Ok(self.state.lock().await.ari.staged_keys())
    }

    async fn insert_task(&self, task: &PublishTask) -> Result<()> {
        self.state.lock().await.tasks.enqueue(task.clone());
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<PublishTask>> {
        Ok(self.state.lock().await.tasks.get(id).cloned())
    }

    async fn update_task(&self, task: &PublishTask) -> Result<()> {
        self.state.lock().await.tasks.update(task.clone())?;
        Ok(())
    }

    async fn next_due_task(
        &self,
        connection_id: &str,
        now: Timestamp,
    ) -> Result<Option<PublishTask>> {
        Ok(self
            .state
            .lock()
            .await
            .tasks
            .next_due(connection_id, now)
            .cloned())
    }

    async fn recover_stalled_tasks(&self) -> Result<usize> {
        Ok(self.state.lock().await.tasks.recover_stalled())
    }

    async fn receive_order(&self, order: &InboundOrder) -> Result<(InboundOrder, ReceiveOutcome)> {
        Ok(self.state.lock().await.orders.receive(order.clone()))
    }

    async fn get_order(&self, id: &str) -> Result<Option<InboundOrder>> {
        Ok(self.state.lock().await.orders.get_by_id(id).cloned())
    }

    async fn save_order(&self, order: &InboundOrder) -> Result<()> {
        self.state.lock().await.orders.update(order.clone());
        Ok(())
    }

    async fn apply_order(&self, application: OrderApplication) -> Result<AppliedOrder> {
        let OrderApplication {
            mut order,
            guest,
            mut reservation,
            inventory,
            now,
        } = application;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if let Some(stored) = state.orders.get(&order.external_id) {
            if stored.status.is_terminal() {
                return Err(Error::InvalidTransition {
                    entity: "inbound order",
                    from: stored.status.to_string(),
                    to: "applied".to_string(),
                }
                .into());
            }
        }

        let guest_key = (guest.property_id.clone(), guest.email.clone());
        let guest_id = match state.guests.get_mut(&guest_key) {
            Some(existing) => {
                existing.merge(&guest);
                existing.id.clone()
            }
            None => {
                let id = guest.id.clone();
                state.guests.insert(guest_key, guest);
                id
            }
        };

        if let Some(existing) = state.reservations.get(&reservation.external_id) {
            reservation.id = existing.id.clone();
        }
        reservation.guest_id = guest_id.clone();
        let reservation_id = reservation.id.clone();
        let rooms = reservation.rooms;

        let committed: Vec<(CellKey, AriCell)> = inventory
            .iter()
            .filter_map(|key| state.ari.committed(key).map(|c| (key.clone(), c.clone())))
            .collect();
        let decremented = decrement_inventory(committed.iter().map(|(k, c)| (k, c)), rooms);
        let changes = state.ari.commit_local(decremented);

        // Staged edits on the same nights must not resurrect sold rooms.
        let staged: Vec<(CellKey, AriCell)> = inventory
            .iter()
            .filter_map(|key| state.ari.staged(key).map(|c| (key.clone(), c.clone())))
            .collect();
        for (key, cell) in decrement_inventory(staged.iter().map(|(k, c)| (k, c)), rooms) {
            state.ari.stage(key, cell, now)?;
        }

        order.mark_applied(reservation_id.clone(), now)?;
        state
            .reservations
            .insert(reservation.external_id.clone(), reservation);
        state.orders.update(order.clone());

        Ok(AppliedOrder {
            order,
            guest_id,
            reservation_id,
            changes,
        })
    }

    async fn get_reservation(&self, external_id: &str) -> Result<Option<Reservation>> {
        Ok(self
            .state
            .lock()
            .await
            .reservations
            .get(external_id)
            .cloned())
    }

    async fn count_reservations(&self) -> Result<usize> {
        Ok(self.state.lock().await.reservations.len())
    }

    async fn append_log(&self, entry: &SyncLogEntry) -> Result<()> {
        self.state.lock().await.ledger.append(entry.clone());
        Ok(())
    }

    async fn recent_log(&self, connection_id: &str, limit: usize) -> Result<Vec<SyncLogEntry>> {
        Ok(self.state.lock().await.ledger.recent(connection_id, limit))
    }

    async fn latest_credit_state(&self, connection_id: &str) -> Result<Option<CreditState>> {
        Ok(self
            .state
            .lock()
            .await
            .ledger
            .latest_credit_state(connection_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    fn key(day: u32) -> CellKey {
        CellKey::new(NaiveDate::from_ymd_opt(2025, 9, day).unwrap(), "std", "bar")
    }

    #[tokio::test]
    async fn invalid_cell_stages_nothing() {
        let store = MemoryStore::new();
        let good = AriCell {
            rate: 100,
            ..Default::default()
        };
        let bad = AriCell {
            rate: -1,
            ..Default::default()
        };
        let result = store
            .stage_cells(&[(key(25), good), (key(26), bad)], Utc::now())
            .await;
        assert!(result.is_err());
        assert!(store.staged_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_connection_is_not_found() {
        let store = MemoryStore::new();
        let err = store.mark_connection_error("nope", "x").await.unwrap_err();
        assert!(matches!(err.engine(), Some(Error::NotFound { .. })));
    }
}

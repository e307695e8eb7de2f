//! Postgres-backed [`SyncStore`].

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use innsync_engine::{
    reservation::decrement_inventory,
    staging::{merge_published, overlay},
    AccessToken, AriCell, CellKey,
    ChannelMapping, CommittedChange, Connection, CreditState, Error, InboundOrder, MappingTable,
    PublishTask, PushType, ReceiveOutcome, Reservation, SyncLogEntry, TaskId, Timestamp, TokenScope,
};

use super::ari::{self, AriTable};
use super::{connections, ledger, orders, tasks, AppliedOrder, OrderApplication, Pool, SyncStore};
use crate::error::{AppError, Result};

/// Store backed by the Postgres schema in `migrations/`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

fn corrupt(message: String) -> AppError {
    AppError::Internal(message)
}

/// Fail with `NotFound` when an update touched no row.
fn ensure_found(rows: u64, kind: &'static str, id: &str) -> Result<()> {
    if rows == 0 {
        return Err(Error::not_found(kind, id).into());
    }
    Ok(())
}

#[async_trait]
impl SyncStore for PgStore {
    async fn get_connection(&self, id: &str) -> Result<Option<Connection>> {
        connections::get_connection(&self.pool, id)
            .await?
            .map(|row| row.to_connection().map_err(corrupt))
            .transpose()
    }

    async fn list_connections(&self) -> Result<Vec<Connection>> {
        connections::list_connections(&self.pool)
            .await?
            .into_iter()
            .map(|row| row.to_connection().map_err(corrupt))
            .collect()
    }

    async fn save_connection(&self, connection: &Connection) -> Result<()> {
        connections::upsert_connection(&self.pool, connection).await?;
        Ok(())
    }

    async fn store_token(&self, id: &str, scope: TokenScope, token: &AccessToken) -> Result<()> {
        let rows = connections::store_token(&self.pool, id, scope, Some(token)).await?;
        ensure_found(rows, "connection", id)
    }

    async fn invalidate_token(&self, id: &str, scope: TokenScope) -> Result<()> {
        let rows = connections::store_token(&self.pool, id, scope, None).await?;
        ensure_found(rows, "connection", id)
    }

    async fn mark_connection_error(&self, id: &str, reason: &str) -> Result<()> {
        let rows = connections::mark_error(&self.pool, id, reason).await?;
        ensure_found(rows, "connection", id)
    }

    async fn record_credits(&self, id: &str, state: CreditState) -> Result<()> {
        let rows = connections::record_credits(&self.pool, id, state).await?;
        ensure_found(rows, "connection", id)
    }

    async fn mappings(&self, connection_id: &str) -> Result<MappingTable> {
        Ok(connections::get_mappings(&self.pool, connection_id).await?)
    }

    async fn upsert_mappings(&self, connection_id: &str, mappings: &[ChannelMapping]) -> Result<()> {
        connections::upsert_mappings(&self.pool, connection_id, mappings).await?;
        Ok(())
    }

    async fn get_cell(&self, key: &CellKey) -> Result<(Option<AriCell>, Option<AriCell>)> {
        let mut conn = self.pool.acquire().await?;
        let keys = std::slice::from_ref(key);
        let committed = ari::fetch_cells(&mut *conn, AriTable::Committed, keys, false).await?;
        let staged = ari::fetch_cells(&mut *conn, AriTable::Staged, keys, false).await?;
        Ok((
            committed.into_iter().next().map(|(_, c)| c),
            staged.into_iter().next().map(|(_, c)| c),
        ))
    }

    async fn effective_cells(&self, keys: &[CellKey]) -> Result<BTreeMap<CellKey, AriCell>> {
        let mut conn = self.pool.acquire().await?;
        let committed: HashMap<_, _> = ari::fetch_cells(&mut *conn, AriTable::Committed, keys, false)
            .await?
            .into_iter()
            .collect();
        let staged: HashMap<_, _> = ari::fetch_cells(&mut *conn, AriTable::Staged, keys, false)
            .await?
            .into_iter()
            .collect();

        Ok(keys
            .iter()
            .filter_map(|key| {
                overlay(committed.get(key), staged.get(key)).map(|cell| (key.clone(), cell))
            })
            .collect())
    }

    async fn stage_cells(&self, cells: &[(CellKey, AriCell)], now: Timestamp) -> Result<()> {
        for (_, cell) in cells {
            cell.validate()?;
        }
        let mut tx = self.pool.begin().await?;
        for (key, cell) in cells {
            ari::upsert_staged(&mut *tx, key, cell, now).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn commit_published(
        &self,
        pushed: &[(CellKey, AriCell)],
        push: PushType,
    ) -> Result<Vec<CellKey>> {
        let keys: Vec<CellKey> = pushed.iter().map(|(k, _)| k.clone()).collect();
        let mut tx = self.pool.begin().await?;

        let staged: HashMap<_, _> = ari::fetch_cells(&mut *tx, AriTable::Staged, &keys, true)
            .await?
            .into_iter()
            .collect();
        let current: HashMap<_, _> = ari::fetch_cells(&mut *tx, AriTable::Committed, &keys, true)
            .await?
            .into_iter()
            .collect();

        let mut committed = Vec::new();
        let mut cleared = Vec::new();
        for (key, sent) in pushed {
            let Some(merge) = merge_published(current.get(key), staged.get(key), sent, push) else {
                continue;
            };
            ari::upsert_committed(&mut *tx, key, &merge.committed).await?;
            if merge.clear_staged {
                cleared.push(key.clone());
            }
            committed.push(key.clone());
        }
        ari::delete_staged(&mut *tx, &cleared).await?;
        tx.commit().await?;

        Ok(committed)
    }

    async fn commit_local(&self, cells: &[(CellKey, AriCell)]) -> Result<Vec<CommittedChange>> {
        let keys: Vec<CellKey> = cells.iter().map(|(k, _)| k.clone()).collect();
        let mut tx = self.pool.begin().await?;

        let mut before: HashMap<_, _> = ari::fetch_cells(&mut *tx, AriTable::Committed, &keys, true)
            .await?
            .into_iter()
            .collect();

        let mut changes = Vec::with_capacity(cells.len());
        for (key, cell) in cells {
            ari::upsert_committed(&mut *tx, key, cell).await?;
            changes.push(CommittedChange {
                key: key.clone(),
                before: before.remove(key),
                after: cell.clone(),
            });
        }
        tx.commit().await?;

        Ok(changes)
    }

    async fn clear_pending(&self, keys: &[CellKey]) -> Result<(usize, Vec<TaskId>)> {
        let mut tx = self.pool.begin().await?;

        let cleared = ari::delete_staged(&mut *tx, keys).await?;

        let mut cancelled = Vec::new();
        for row in tasks::queued_tasks(&mut *tx).await? {
            let task = row.to_task().map_err(corrupt)?;
            if keys.iter().any(|k| task.scope.touches(k)) {
                cancelled.push(task.id);
            }
        }
        tasks::delete_tasks(&mut *tx, &cancelled).await?;
        tx.commit().await?;

        Ok((cleared as usize, cancelled))
    }

    async fn staged_keys(&self) -> Result<Vec<CellKey>> {
        let mut conn = self.pool.acquire().await?;
        Ok(ari::staged_keys(&mut *conn).await?)
    }

    async fn insert_task(&self, task: &PublishTask) -> Result<()> {
        tasks::insert_task(&self.pool, task).await?;
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<PublishTask>> {
        tasks::get_task(&self.pool, id)
            .await?
            .map(|row| row.to_task().map_err(corrupt))
            .transpose()
    }

    async fn update_task(&self, task: &PublishTask) -> Result<()> {
        let rows = tasks::update_task(&self.pool, task).await?;
        ensure_found(rows, "publish task", &task.id)
    }

    async fn next_due_task(
        &self,
        connection_id: &str,
        now: Timestamp,
    ) -> Result<Option<PublishTask>> {
        tasks::next_due_task(&self.pool, connection_id, now)
            .await?
            .map(|row| row.to_task().map_err(corrupt))
            .transpose()
    }

    async fn recover_stalled_tasks(&self) -> Result<usize> {
        Ok(tasks::recover_stalled(&self.pool).await? as usize)
    }

    async fn receive_order(&self, order: &InboundOrder) -> Result<(InboundOrder, ReceiveOutcome)> {
        let mut tx = self.pool.begin().await?;

        let existing = orders::get_order_by_external_id_for_update(&mut *tx, &order.external_id)
            .await?
            .map(|row| row.to_order().map_err(corrupt))
            .transpose()?;

        let (stored, outcome) = match existing {
            Some(mut stored) => {
                if stored.redeliver(order) {
                    orders::upsert_order(&mut *tx, &stored).await?;
                    (stored, ReceiveOutcome::Updated)
                } else {
                    (stored, ReceiveOutcome::Unchanged)
                }
            }
            None => {
                orders::upsert_order(&mut *tx, order).await?;
                (order.clone(), ReceiveOutcome::Created)
            }
        };
        tx.commit().await?;

        Ok((stored, outcome))
    }

    async fn get_order(&self, id: &str) -> Result<Option<InboundOrder>> {
        let mut conn = self.pool.acquire().await?;
        orders::get_order(&mut *conn, id)
            .await?
            .map(|row| row.to_order().map_err(corrupt))
            .transpose()
    }

    async fn save_order(&self, order: &InboundOrder) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        orders::upsert_order(&mut *conn, order).await?;
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

        let mut tx = self.pool.begin().await?;

        // Row lock serializes concurrent applies of the same external id.
        let stored = orders::get_order_by_external_id_for_update(&mut *tx, &order.external_id)
            .await?
            .map(|row| row.to_order().map_err(corrupt))
            .transpose()?;
        if let Some(stored) = stored {
            if stored.status.is_terminal() {
                return Err(Error::InvalidTransition {
                    entity: "inbound order",
                    from: stored.status.to_string(),
                    to: "applied".to_string(),
                }
                .into());
            }
        }

        let guest_id = orders::upsert_guest(&mut *tx, &guest).await?;
        reservation.guest_id = guest_id.clone();
        let reservation_id = orders::upsert_reservation(&mut *tx, &reservation).await?;

        let committed = ari::fetch_cells(&mut *tx, AriTable::Committed, &inventory, true).await?;
        let mut changes = Vec::with_capacity(committed.len());
        for (key, after) in decrement_inventory(committed.iter().map(|(k, c)| (k, c)), reservation.rooms) {
            let before = committed.iter().find(|(k, _)| *k == key).map(|(_, c)| c.clone());
            ari::upsert_committed(&mut *tx, &key, &after).await?;
            changes.push(CommittedChange { key, before, after });
        }

        let staged = ari::fetch_cells(&mut *tx, AriTable::Staged, &inventory, true).await?;
        for (key, cell) in decrement_inventory(staged.iter().map(|(k, c)| (k, c)), reservation.rooms) {
            ari::upsert_staged(&mut *tx, &key, &cell, now).await?;
        }

        order.mark_applied(reservation_id.clone(), now)?;
        orders::upsert_order(&mut *tx, &order).await?;

        tx.commit().await?;

        Ok(AppliedOrder {
            order,
            guest_id,
            reservation_id,
            changes,
        })
    }

    async fn get_reservation(&self, external_id: &str) -> Result<Option<Reservation>> {
        let mut conn = self.pool.acquire().await?;
        Ok(orders::get_reservation(&mut *conn, external_id).await?)
    }

    async fn count_reservations(&self) -> Result<usize> {
        let mut conn = self.pool.acquire().await?;
        Ok(orders::count_reservations(&mut *conn).await?.max(0) as usize)
    }

    async fn append_log(&self, entry: &SyncLogEntry) -> Result<()> {
        ledger::insert_entry(&self.pool, entry).await?;
        Ok(())
    }

    async fn recent_log(&self, connection_id: &str, limit: usize) -> Result<Vec<SyncLogEntry>> {
        ledger::recent_entries(&self.pool, connection_id, limit.min(i64::MAX as usize) as i64)
            .await?
            .into_iter()
            .map(|row| row.to_entry().map_err(corrupt))
            .collect()
    }

    async fn latest_credit_state(&self, connection_id: &str) -> Result<Option<CreditState>> {
        Ok(ledger::latest_credit_entry(&self.pool, connection_id)
            .await?
            .map(|row| row.to_entry().map_err(corrupt))
            .transpose()?
            .and_then(|entry| entry.credit_state()))
    }
}

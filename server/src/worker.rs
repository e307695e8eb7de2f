//! Outbound push worker and background runner.
//!
//! Each connection drains its queue in order with at most one task in
//! flight. The runner wakes on an interval, starts a drain for every usable
//! connection that is not already draining and, when configured, polls the
//! channel for bookings as a fallback to webhooks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use innsync_engine::{
    build_payload, publish_path, AriCell, CellKey, ConnectionId, Error, LedgerOperation,
    PublishTask, SyncLogEntry, TaskOutcome, Timestamp, TokenScope,
};
use tokio::time::{interval, Interval, MissedTickBehavior};

use crate::channel::ChannelRequest;
use crate::error::{AppError, Result};
use crate::handlers::poll_bookings;
use crate::AppState;

/// Take the next due task of a connection and run it to an outcome.
///
/// Returns `None` when nothing is due or a task of the connection is
/// already processing.
pub async fn process_next(
    state: &AppState,
    connection_id: &str,
) -> Result<Option<(PublishTask, TaskOutcome)>> {
    let now = Utc::now();
    let Some(mut task) = state.store.next_due_task(connection_id, now).await? else {
        return Ok(None);
    };

    let mappings = state.store.mappings(connection_id).await?;
    if let Err(error) = task.begin(&mappings, now) {
        if let Error::MappingGap(_) = error {
            state.store.update_task(&task).await?;
            record_outcome(state, &task, &TaskOutcome::Failed, now).await;
            tracing::warn!(
                connection_id = %connection_id,
                task_id = %task.id,
                error = %error,
                "Publish task blocked by unmapped cells"
            );
            return Ok(Some((task, TaskOutcome::Failed)));
        }
        return Err(error.into());
    }
    state.store.update_task(&task).await?;
    tracing::debug!(connection_id = %connection_id, task_id = %task.id, "Publish task started");

    let outcome = match publish(state, &task).await {
        Ok(pushed) => match state.store.commit_published(&pushed, task.push_type).await {
            Ok(committed) => {
                task.complete(Utc::now())?;
                tracing::info!(
                    connection_id = %connection_id,
                    task_id = %task.id,
                    pushed = pushed.len(),
                    committed = committed.len(),
                    "Publish task completed"
                );
                TaskOutcome::Completed
            }
            // Published but not committed: retrying is safe under the same key.
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "Failed to commit published cells");
                task.pause(Some(e.to_string()))?
            }
        },
        Err(AppError::Engine(
            error @ (Error::Credential { .. } | Error::ConnectionPaused(_)),
        )) => {
            tracing::warn!(
                connection_id = %connection_id,
                task_id = %task.id,
                error = %error,
                "Connection unusable, task paused"
            );
            task.pause(Some(error.to_string()))?
        }
        Err(AppError::Engine(error)) => {
            let outcome = task.record_failure(&error, &state.config.retry_schedule(), Utc::now())?;
            tracing::warn!(
                connection_id = %connection_id,
                task_id = %task.id,
                attempt = task.attempts,
                error = %error,
                outcome = ?outcome,
                "Publish attempt failed"
            );
            outcome
        }
        Err(other) => {
            tracing::error!(task_id = %task.id, error = %other, "Publish task interrupted");
            task.pause(Some(other.to_string()))?
        }
    };

    state.store.update_task(&task).await?;
    record_outcome(state, &task, &outcome, Utc::now()).await;
    Ok(Some((task, outcome)))
}

/// Push the task's effective cells and return exactly what was sent.
async fn publish(state: &AppState, task: &PublishTask) -> Result<Vec<(CellKey, AriCell)>> {
    let connection = state
        .store
        .get_connection(&task.connection_id)
        .await?
        .ok_or_else(|| Error::not_found("connection", &task.connection_id))?;
    if !connection.is_usable() {
        return Err(Error::ConnectionPaused(connection.id).into());
    }

    let mappings = state.store.mappings(&connection.id).await?;
    let cells = state.store.effective_cells(&task.scope.keys()).await?;
    let payload = build_payload(&task.idempotency_key, task.push_type, &cells, &mappings)?;
    if payload.is_empty() {
        tracing::debug!(task_id = %task.id, "Nothing to publish");
        return Ok(Vec::new());
    }

    let body = serde_json::to_value(&payload).map_err(|e| AppError::Internal(e.to_string()))?;
    let request = ChannelRequest::post(
        publish_path(&connection.channel_property_id, task.push_type),
        body,
    )
    .with_idempotency_key(task.idempotency_key.clone());

    state
        .channel
        .call(&connection.id, TokenScope::Write, &request)
        .await?;

    Ok(cells.into_iter().collect())
}

async fn record_outcome(state: &AppState, task: &PublishTask, outcome: &TaskOutcome, now: Timestamp) {
    let summary = match outcome {
        TaskOutcome::Completed => format!("publish {} {} completed", task.push_type, task.id),
        TaskOutcome::Retrying { next_attempt_at } => format!(
            "publish {} {} retrying at {next_attempt_at}: {}",
            task.push_type,
            task.id,
            task.last_error.as_deref().unwrap_or("unknown error")
        ),
        TaskOutcome::Failed => format!(
            "publish {} {} failed: {}",
            task.push_type,
            task.id,
            task.last_error.as_deref().unwrap_or("unknown error")
        ),
        TaskOutcome::Paused => format!("publish {} {} paused", task.push_type, task.id),
    };
    state
        .ledger
        .record(SyncLogEntry::new(
            &task.connection_id,
            LedgerOperation::PublishTask,
            summary,
            *outcome == TaskOutcome::Completed,
            now,
        ))
        .await;
}

/// Run due tasks of one connection until its queue is idle or paused.
///
/// Returns the number of tasks that reached an outcome.
pub async fn drain_connection(state: &AppState, connection_id: &str) -> usize {
    let mut processed = 0;
    loop {
        match process_next(state, connection_id).await {
            Ok(Some((_, TaskOutcome::Paused))) => return processed + 1,
            Ok(Some(_)) => processed += 1,
            Ok(None) => return processed,
            Err(e) => {
                tracing::error!(connection_id = %connection_id, error = %e, "Publish drain failed");
                return processed;
            }
        }
    }
}

/// Return tasks left processing by a previous run to the queue.
pub async fn recover_stalled(state: &AppState) -> Result<usize> {
    let recovered = state.store.recover_stalled_tasks().await?;
    if recovered > 0 {
        tracing::warn!(count = recovered, "Requeued stalled publish tasks");
    }
    Ok(recovered)
}

/// Background loop driving publish drains and the bookings poll.
pub struct Runner {
    state: AppState,
    /// Connections with a drain in flight
    draining: Arc<DashMap<ConnectionId, ()>>,
    /// Per-connection start of the next bookings window
    poll_since: HashMap<ConnectionId, Timestamp>,
    shutdown: Arc<AtomicBool>,
}

impl Runner {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            draining: Arc::new(DashMap::new()),
            poll_since: HashMap::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked on every tick; setting it stops the loop.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub async fn run(mut self) {
        let config = self.state.config.clone();
        tracing::info!(
            poll_interval_ms = config.worker_poll_interval.as_millis() as u64,
            booking_poll = config.booking_poll_interval.is_some(),
            "Starting publish runner"
        );

        let mut publish_tick = interval(config.worker_poll_interval);
        publish_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut booking_tick = config.booking_poll_interval.map(|period| {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick
        });

        loop {
            tokio::select! {
                _ = publish_tick.tick() => {
                    if self.shutdown.load(Ordering::Relaxed) {
                        tracing::info!("Runner shutdown requested");
                        break;
                    }
                    self.start_drains().await;
                }
                _ = next_tick(&mut booking_tick) => {
                    self.poll_all_bookings().await;
                }
            }
        }
    }

    async fn start_drains(&self) {
        let connections = match self.state.store.list_connections().await {
            Ok(connections) => connections,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list connections");
                return;
            }
        };

        for connection in connections.into_iter().filter(|c| c.is_usable()) {
            if self.draining.insert(connection.id.clone(), ()).is_some() {
                continue;
            }
            let state = self.state.clone();
            let draining = self.draining.clone();
            tokio::spawn(async move {
                let processed = drain_connection(&state, &connection.id).await;
                if processed > 0 {
                    tracing::debug!(connection_id = %connection.id, processed, "Drain finished");
                }
                draining.remove(&connection.id);
            });
        }
    }

    async fn poll_all_bookings(&mut self) {
        let Some(period) = self.state.config.booking_poll_interval else {
            return;
        };
        let connections = match self.state.store.list_connections().await {
            Ok(connections) => connections,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list connections");
                return;
            }
        };

        // First poll of a connection looks back one interval.
        let lookback = chrono::Duration::from_std(period).unwrap_or(chrono::Duration::zero());
        for connection in connections.into_iter().filter(|c| c.is_usable()) {
            let started = Utc::now();
            let since = self
                .poll_since
                .get(&connection.id)
                .copied()
                .unwrap_or(started - lookback);

            match poll_bookings(&self.state, &connection.id, since).await {
                Ok(changed) => {
                    self.poll_since.insert(connection.id.clone(), started);
                    if changed > 0 {
                        tracing::info!(connection_id = %connection.id, changed, "Bookings poll received orders");
                    }
                }
                Err(e) => {
                    tracing::warn!(connection_id = %connection.id, error = %e, "Bookings poll failed");
                }
            }
        }
    }
}

/// Tick an optional interval; pends forever when there is none.
async fn next_tick(tick: &mut Option<Interval>) {
    match tick {
        Some(tick) => {
            tick.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

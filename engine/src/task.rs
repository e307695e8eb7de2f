//! Publish tasks and their state machine.
//!
//! ```text
//! queued -> processing -> completed
//!                      -> queued (retry, after backoff)
//!                      -> failed
//! queued -> failed (mapping gap)
//! ```
//!
//! The idempotency key is fixed when the task is created and travels with
//! every attempt, so a channel that already applied an earlier attempt can
//! recognise the retry as a duplicate.

use crate::{
    ari::{CellKey, DateRange, PushType},
    error::Result,
    mapping::{MappingPair, MappingTable},
    ConnectionId, Error, RatePlanId, RoomTypeId, TaskId, Timestamp,
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Lifecycle state of a publish task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(Error::InvalidPayload(format!("unknown task status: {other}"))),
        }
    }
}

/// The cells a publish task covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PublishScope {
    /// An explicit set of cells
    Cells { cells: Vec<CellKey> },
    /// Every combination of the listed room types and rate plans in a range
    #[serde(rename_all = "camelCase")]
    Range {
        range: DateRange,
        room_types: Vec<RoomTypeId>,
        rate_plans: Vec<RatePlanId>,
    },
}

impl PublishScope {
    pub fn cells(mut cells: Vec<CellKey>) -> Self {
        cells.sort();
        cells.dedup();
        PublishScope::Cells { cells }
    }

    /// Expand the scope into cell keys, in key order.
    pub fn keys(&self) -> Vec<CellKey> {
        match self {
            PublishScope::Cells { cells } => cells.clone(),
            PublishScope::Range {
                range,
                room_types,
                rate_plans,
            } => {
                let mut keys = Vec::with_capacity(range.day_count() * room_types.len());
                for date in range.days() {
                    for room_type in room_types {
                        for rate_plan in rate_plans {
                            keys.push(CellKey::new(date, room_type.clone(), rate_plan.clone()));
                        }
                    }
                }
                keys
            }
        }
    }

    /// Distinct (room type, rate plan) pairs in the scope.
    pub fn pairs(&self) -> BTreeSet<MappingPair> {
        match self {
            PublishScope::Cells { cells } => cells
                .iter()
                .map(|k| MappingPair::new(k.room_type.clone(), k.rate_plan.clone()))
                .collect(),
            PublishScope::Range {
                room_types,
                rate_plans,
                ..
            } => room_types
                .iter()
                .flat_map(|rt| {
                    rate_plans
                        .iter()
                        .map(move |rp| MappingPair::new(rt.clone(), rp.clone()))
                })
                .collect(),
        }
    }

    /// Whether the scope contains the given cell.
    pub fn touches(&self, key: &CellKey) -> bool {
        match self {
            PublishScope::Cells { cells } => cells.contains(key),
            PublishScope::Range {
                range,
                room_types,
                rate_plans,
            } => {
                range.contains(key.date)
                    && room_types.contains(&key.room_type)
                    && rate_plans.contains(&key.rate_plan)
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            PublishScope::Cells { cells } => cells.is_empty(),
            PublishScope::Range {
                room_types,
                rate_plans,
                ..
            } => room_types.is_empty() || rate_plans.is_empty(),
        }
    }
}

/// Backoff policy for requeued tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    /// Attempts before a task is marked failed
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::seconds(30),
            cap: Duration::minutes(15),
        }
    }
}

impl RetrySchedule {
    /// Delay before the next attempt after `attempts` failed ones.
    pub fn delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(20);
        let delay = self.base * 2_i32.pow(exponent);
        delay.min(self.cap)
    }
}

/// What happened to a task after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum TaskOutcome {
    Completed,
    #[serde(rename_all = "camelCase")]
    Retrying { next_attempt_at: Timestamp },
    Failed,
    /// Returned to the queue without using up an attempt
    Paused,
}

/// A unit of outbound work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishTask {
    pub id: TaskId,
    pub connection_id: ConnectionId,
    pub idempotency_key: String,
    pub scope: PublishScope,
    pub push_type: PushType,
    /// Lower number runs first among tasks created at the same time
    pub priority: i32,
    pub status: TaskStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: Timestamp,
    /// Earliest time the task may be dequeued
    pub next_attempt_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

impl PublishTask {
    /// Create a queued task.
    pub fn new(
        id: impl Into<TaskId>,
        connection_id: impl Into<ConnectionId>,
        scope: PublishScope,
        push_type: PushType,
        priority: i32,
        now: Timestamp,
    ) -> Self {
        let id = id.into();
        Self {
            idempotency_key: format!("pub-{id}"),
            id,
            connection_id: connection_id.into(),
            scope,
            push_type,
            priority,
            status: TaskStatus::Queued,
            attempts: 0,
            last_error: None,
            created_at: now,
            next_attempt_at: now,
            completed_at: None,
        }
    }

    pub fn is_due(&self, now: Timestamp) -> bool {
        self.status == TaskStatus::Queued && self.next_attempt_at <= now
    }

    fn transition_error(&self, to: TaskStatus) -> Error {
        Error::InvalidTransition {
            entity: "publish task",
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }

    /// Move a queued task to processing, gated on mappings.
    ///
    /// A scope with unmapped cells fails the task on the spot; it is not
    /// retried because only an operator can fix the mapping.
    pub fn begin(&mut self, mappings: &MappingTable, now: Timestamp) -> Result<()> {
        if self.status != TaskStatus::Queued {
            return Err(self.transition_error(TaskStatus::Processing));
        }
        if let Err(missing) = mappings.validate(&self.scope.pairs()) {
            self.status = TaskStatus::Failed;
            self.last_error = Some(missing.to_string());
            self.completed_at = Some(now);
            return Err(Error::MappingGap(missing));
        }
        self.status = TaskStatus::Processing;
        Ok(())
    }

    /// Mark a processing task as delivered.
    pub fn complete(&mut self, now: Timestamp) -> Result<()> {
        if self.status != TaskStatus::Processing {
            return Err(self.transition_error(TaskStatus::Completed));
        }
        self.status = TaskStatus::Completed;
        self.attempts += 1;
        self.last_error = None;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Record a failed attempt and decide between retry and failure.
    pub fn record_failure(
        &mut self,
        error: &Error,
        schedule: &RetrySchedule,
        now: Timestamp,
    ) -> Result<TaskOutcome> {
        if self.status != TaskStatus::Processing {
            return Err(self.transition_error(TaskStatus::Failed));
        }
        self.attempts += 1;
        self.last_error = Some(error.to_string());

        if error.is_transient() && self.attempts < schedule.max_attempts {
            let next_attempt_at = now + schedule.delay(self.attempts);
            self.status = TaskStatus::Queued;
            self.next_attempt_at = next_attempt_at;
            Ok(TaskOutcome::Retrying { next_attempt_at })
        } else {
            self.status = TaskStatus::Failed;
            self.completed_at = Some(now);
            Ok(TaskOutcome::Failed)
        }
    }

    /// Put a processing task back without spending an attempt.
    ///
    /// Used when the connection itself is unusable (credentials) and for
    /// recovering tasks left in processing by a crash.
    pub fn pause(&mut self, reason: Option<String>) -> Result<TaskOutcome> {
        if self.status != TaskStatus::Processing {
            return Err(self.transition_error(TaskStatus::Queued));
        }
        self.status = TaskStatus::Queued;
        if reason.is_some() {
            self.last_error = reason;
        }
        Ok(TaskOutcome::Paused)
    }
}

/// In-memory ordered queue of publish tasks.
#[derive(Debug, Clone, Default)]
pub struct PublishQueue {
    tasks: HashMap<TaskId, PublishTask>,
}

impl PublishQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, task: PublishTask) {
        self.tasks.insert(task.id.clone(), task);
    }

    pub fn get(&self, id: &str) -> Option<&PublishTask> {
        self.tasks.get(id)
    }

    /// Replace a stored task with an updated copy.
    pub fn update(&mut self, task: PublishTask) -> Result<()> {
        match self.tasks.get_mut(&task.id) {
            Some(slot) => {
                *slot = task;
                Ok(())
            }
            None => Err(Error::not_found("publish task", task.id)),
        }
    }

    /// The next due task for a connection.
    ///
    /// Oldest first; tasks created at the same instant run by ascending
    /// priority. Nothing is returned while another task of the connection is
    /// processing.
    pub fn next_due(&self, connection_id: &str, now: Timestamp) -> Option<&PublishTask> {
        if self.processing_count(connection_id) > 0 {
            return None;
        }
        self.tasks
            .values()
            .filter(|t| t.connection_id == connection_id && t.is_due(now))
            .min_by(|a, b| {
                (a.created_at, a.priority, &a.id).cmp(&(b.created_at, b.priority, &b.id))
            })
    }

    pub fn processing_count(&self, connection_id: &str) -> usize {
        self.tasks
            .values()
            .filter(|t| t.connection_id == connection_id && t.status == TaskStatus::Processing)
            .count()
    }

    /// Remove queued tasks whose scope touches any of the keys.
    ///
    /// Processing tasks are left to finish under their own retry policy.
    pub fn remove_queued_touching(&mut self, keys: &[CellKey]) -> Vec<TaskId> {
        let ids: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Queued && keys.iter().any(|k| t.scope.touches(k))
            })
            .map(|t| t.id.clone())
            .collect();
        for id in &ids {
            self.tasks.remove(id);
        }
        ids
    }

    /// Return every processing task to the queue.
    pub fn recover_stalled(&mut self) -> usize {
        self.tasks
            .values_mut()
            .filter(|t| t.status == TaskStatus::Processing)
            .map(|t| t.pause(Some("recovered after restart".into())))
            .filter(|r| r.is_ok())
            .count()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

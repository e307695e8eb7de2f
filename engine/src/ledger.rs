//! Sync ledger - append-only audit of every exchange and transition.

use crate::{ratelimit::CreditState, ConnectionId, Error, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerOperation {
    TokenRefresh,
    ChannelCall,
    PublishTask,
    InboundReceive,
    InboundApply,
    InboundReject,
    StagingCleared,
}

impl LedgerOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerOperation::TokenRefresh => "token_refresh",
            LedgerOperation::ChannelCall => "channel_call",
            LedgerOperation::PublishTask => "publish_task",
            LedgerOperation::InboundReceive => "inbound_receive",
            LedgerOperation::InboundApply => "inbound_apply",
            LedgerOperation::InboundReject => "inbound_reject",
            LedgerOperation::StagingCleared => "staging_cleared",
        }
    }
}

impl fmt::Display for LedgerOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LedgerOperation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Ok(match s {
            "token_refresh" => LedgerOperation::TokenRefresh,
            "channel_call" => LedgerOperation::ChannelCall,
            "publish_task" => LedgerOperation::PublishTask,
            "inbound_receive" => LedgerOperation::InboundReceive,
            "inbound_apply" => LedgerOperation::InboundApply,
            "inbound_reject" => LedgerOperation::InboundReject,
            "staging_cleared" => LedgerOperation::StagingCleared,
            other => {
                return Err(Error::InvalidPayload(format!(
                    "unknown ledger operation: {other}"
                )))
            }
        })
    }
}

/// One immutable ledger record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogEntry {
    pub connection_id: ConnectionId,
    pub operation: LedgerOperation,
    /// Short human-readable description, e.g. `POST /properties/p1/rates`
    pub request_summary: String,
    pub response_status: Option<u16>,
    pub credits_remaining: Option<u32>,
    pub credits_reset_at: Option<Timestamp>,
    pub request_cost: Option<u32>,
    pub duration_ms: u64,
    pub success: bool,
    pub created_at: Timestamp,
}

impl SyncLogEntry {
    pub fn new(
        connection_id: impl Into<ConnectionId>,
        operation: LedgerOperation,
        request_summary: impl Into<String>,
        success: bool,
        created_at: Timestamp,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            operation,
            request_summary: request_summary.into(),
            response_status: None,
            credits_remaining: None,
            credits_reset_at: None,
            request_cost: None,
            duration_ms: 0,
            success,
            created_at,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.response_status = Some(status);
        self
    }

    pub fn with_duration(mut self, duration: std::time::Duration) -> Self {
        self.duration_ms = duration.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    pub fn with_credits(mut self, state: Option<CreditState>, cost: Option<u32>) -> Self {
        if let Some(state) = state {
            self.credits_remaining = Some(state.remaining);
            self.credits_reset_at = Some(state.reset_at);
        }
        self.request_cost = cost;
        self
    }

    pub fn credit_state(&self) -> Option<CreditState> {
        Some(CreditState {
            remaining: self.credits_remaining?,
            reset_at: self.credits_reset_at?,
        })
    }
}

/// In-memory ledger. Entries are only ever appended.
#[derive(Debug, Clone, Default)]
pub struct SyncLedger {
    entries: Vec<SyncLogEntry>,
}

impl SyncLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: SyncLogEntry) {
        self.entries.push(entry);
    }

    /// Newest entries of a connection first.
    pub fn recent(&self, connection_id: &str, limit: usize) -> Vec<SyncLogEntry> {
        self.entries
            .iter()
            .rev()
            .filter(|e| e.connection_id == connection_id)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Credit position reported by the most recent response that had one.
    pub fn latest_credit_state(&self, connection_id: &str) -> Option<CreditState> {
        latest_credit_state(
            self.entries
                .iter()
                .filter(|e| e.connection_id == connection_id),
        )
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reconstruct credit state from entries.
///
/// Picks the newest entry by timestamp, so duplicated or reordered writes
/// give the same answer.
pub fn latest_credit_state<'a>(
    entries: impl IntoIterator<Item = &'a SyncLogEntry>,
) -> Option<CreditState> {
    entries
        .into_iter()
        .filter_map(|e| e.credit_state().map(|s| (e.created_at, s)))
        .max_by_key(|(created_at, _)| *created_at)
        .map(|(_, state)| state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_758_758_400 + secs, 0).unwrap()
    }

    fn call(conn: &str, created: i64, remaining: Option<u32>) -> SyncLogEntry {
        let state = remaining.map(|remaining| CreditState {
            remaining,
            reset_at: at(created + 60),
        });
        SyncLogEntry::new(conn, LedgerOperation::ChannelCall, "GET /x", true, at(created))
            .with_status(200)
            .with_credits(state, Some(1))
    }

    #[test]
    fn latest_credit_state_uses_newest_entry() {
        let mut ledger = SyncLedger::new();
        ledger.append(call("c1", 10, Some(80)));
        ledger.append(call("c1", 30, Some(40)));
        ledger.append(call("c1", 40, None));
        ledger.append(call("c2", 50, Some(1)));
        // Late duplicate of an older write
        ledger.append(call("c1", 10, Some(80)));

        let state = ledger.latest_credit_state("c1").unwrap();
        assert_eq!(state.remaining, 40);
        assert_eq!(state.reset_at, at(90));
    }

    #[test]
    fn recent_is_newest_first_and_filtered() {
        let mut ledger = SyncLedger::new();
        ledger.append(call("c1", 1, None));
        ledger.append(call("c2", 2, None));
        ledger.append(call("c1", 3, None));

        let recent = ledger.recent("c1", 10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].created_at, at(3));
        assert_eq!(ledger.recent("c1", 1).len(), 1);
    }

    #[test]
    fn operation_names_round_trip_through_str() {
        for op in [
            LedgerOperation::TokenRefresh,
            LedgerOperation::InboundReject,
            LedgerOperation::StagingCleared,
        ] {
            assert_eq!(op.as_str().parse::<LedgerOperation>().unwrap(), op);
        }
    }
}

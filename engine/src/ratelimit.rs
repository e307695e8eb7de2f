//! Rate-limit accounting and retry decisions.
//!
//! Everything here is pure: given response headers, status and attempt
//! number it says what to do next. Sleeping, sending and logging happen in
//! the caller. Credit state always comes from the latest response headers,
//! never from a local counter, so a lost or duplicated log write cannot
//! skew it.

use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Remaining credits in the current window.
pub const HEADER_CREDITS_REMAINING: &str = "x-credits-remaining";
/// Seconds until the window resets.
pub const HEADER_RESET_IN: &str = "x-credits-reset-in";
/// Credits charged for this request.
pub const HEADER_REQUEST_COST: &str = "x-request-cost";

/// Status a channel answers when an idempotency key was already applied.
pub const STATUS_DUPLICATE: u16 = 409;

/// Longest credit window honoured; larger reset-in values are capped.
pub const MAX_RESET_IN_SECS: u64 = 24 * 60 * 60;

/// Rate-limit headers of a single response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitHeaders {
    pub credits_remaining: Option<u32>,
    pub reset_in_secs: Option<u64>,
    pub cost: Option<u32>,
}

impl RateLimitHeaders {
    /// Parse from a header lookup. Unparseable values are ignored.
    pub fn parse<'a>(header: impl Fn(&str) -> Option<&'a str>) -> Self {
        Self {
            credits_remaining: header(HEADER_CREDITS_REMAINING).and_then(|v| v.trim().parse().ok()),
            reset_in_secs: header(HEADER_RESET_IN).and_then(|v| v.trim().parse().ok()),
            cost: header(HEADER_REQUEST_COST).and_then(|v| v.trim().parse().ok()),
        }
    }

    /// Seconds until the window resets, capped at [`MAX_RESET_IN_SECS`].
    pub fn reset_in(&self) -> u64 {
        self.reset_in_secs.unwrap_or(0).min(MAX_RESET_IN_SECS)
    }

    /// Credit state implied by these headers at `now`.
    pub fn credit_state(&self, now: Timestamp) -> Option<CreditState> {
        let remaining = self.credits_remaining?;
        let reset_at = now + chrono::Duration::seconds(self.reset_in() as i64);
        Some(CreditState {
            remaining,
            reset_at,
        })
    }
}

/// Last known credit position of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditState {
    pub remaining: u32,
    pub reset_at: Timestamp,
}

/// What the client should do with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDecision {
    /// Hand the response to the caller
    Accept,
    /// The channel already holds this idempotency key; treat as delivered
    AlreadyApplied,
    /// Sleep, then send again; counts as an attempt
    RetryAfter(Duration),
    /// Refresh the token and send again; does not count as an attempt
    RefreshToken,
    /// Give up and surface the error
    Fail,
    /// Rate limited and out of attempts
    Exhausted,
}

/// Thresholds for the channel's credit pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Below this many credits the client waits for the window to reset
    pub low_water: u32,
    pub min_backoff: Duration,
    /// Attempts per call, not counting a token refresh
    pub max_attempts: u32,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            low_water: 10,
            min_backoff: Duration::from_secs(1),
            max_attempts: 3,
        }
    }
}

impl RateLimitPolicy {
    /// How long to hold the next call, given the last known credits.
    pub fn wait_before_call(&self, state: Option<&CreditState>, now: Timestamp) -> Option<Duration> {
        let state = state?;
        if state.remaining >= self.low_water {
            return None;
        }
        // The window already rolled over.
        if state.reset_at <= now {
            return None;
        }
        let reset_in = (state.reset_at - now).to_std().unwrap_or_default();
        Some(reset_in.max(self.min_backoff))
    }

    /// Decide what to do after a response.
    ///
    /// `attempt` starts at 1. `refreshed` is true once a 401 already led to
    /// a token refresh for this call.
    pub fn after_response(
        &self,
        status: u16,
        headers: &RateLimitHeaders,
        attempt: u32,
        refreshed: bool,
    ) -> CallDecision {
        match status {
            200..=299 => CallDecision::Accept,
            401 if !refreshed => CallDecision::RefreshToken,
            429 => {
                if attempt >= self.max_attempts {
                    CallDecision::Exhausted
                } else {
                    CallDecision::RetryAfter(self.reset_wait(headers))
                }
            }
            500..=599 if attempt < self.max_attempts => {
                CallDecision::RetryAfter(self.server_error_backoff(attempt))
            }
            _ => CallDecision::Fail,
        }
    }

    /// Like [`after_response`](Self::after_response) for a request carrying
    /// an idempotency key, where a duplicate answer means an earlier send
    /// already landed.
    pub fn after_keyed_response(
        &self,
        status: u16,
        headers: &RateLimitHeaders,
        attempt: u32,
        refreshed: bool,
    ) -> CallDecision {
        if status == STATUS_DUPLICATE {
            return CallDecision::AlreadyApplied;
        }
        self.after_response(status, headers, attempt, refreshed)
    }

    /// Decide what to do after a transport failure (no response).
    pub fn after_network_error(&self, attempt: u32) -> CallDecision {
        if attempt < self.max_attempts {
            CallDecision::RetryAfter(self.server_error_backoff(attempt))
        } else {
            CallDecision::Fail
        }
    }

    /// `max(reset-in, minimum backoff)`.
    pub fn reset_wait(&self, headers: &RateLimitHeaders) -> Duration {
        let reset_in = Duration::from_secs(headers.reset_in());
        reset_in.max(self.min_backoff)
    }

    fn server_error_backoff(&self, attempt: u32) -> Duration {
        self.min_backoff * 2_u32.pow(attempt.saturating_sub(1).min(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_758_758_400 + secs, 0).unwrap()
    }

    fn headers(remaining: u32, reset_in: u64) -> RateLimitHeaders {
        RateLimitHeaders {
            credits_remaining: Some(remaining),
            reset_in_secs: Some(reset_in),
            cost: Some(1),
        }
    }

    #[test]
    fn parse_headers() {
        let map: HashMap<&str, &str> = [
            (HEADER_CREDITS_REMAINING, "42"),
            (HEADER_RESET_IN, " 17 "),
            (HEADER_REQUEST_COST, "oops"),
        ]
        .into_iter()
        .collect();
        let parsed = RateLimitHeaders::parse(|name| map.get(name).copied());
        assert_eq!(parsed.credits_remaining, Some(42));
        assert_eq!(parsed.reset_in_secs, Some(17));
        assert_eq!(parsed.cost, None);
    }

    #[test]
    fn low_credits_wait_for_reset() {
        let policy = RateLimitPolicy::default();
        let state = headers(2, 20).credit_state(at(0)).unwrap();
        assert_eq!(
            policy.wait_before_call(Some(&state), at(0)),
            Some(Duration::from_secs(20))
        );
        // Minimum backoff applies when reset is imminent.
        let state = CreditState {
            remaining: 2,
            reset_at: at(0) + chrono::Duration::milliseconds(200),
        };
        assert_eq!(
            policy.wait_before_call(Some(&state), at(0)),
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn no_wait_with_enough_credits_or_after_reset() {
        let policy = RateLimitPolicy::default();
        let plenty = headers(50, 20).credit_state(at(0)).unwrap();
        assert_eq!(policy.wait_before_call(Some(&plenty), at(0)), None);

        let low = headers(2, 20).credit_state(at(0)).unwrap();
        assert_eq!(policy.wait_before_call(Some(&low), at(21)), None);
        assert_eq!(policy.wait_before_call(None, at(0)), None);
    }

    #[test]
    fn too_many_requests_retries_then_exhausts() {
        let policy = RateLimitPolicy::default();
        let h = headers(0, 5);
        assert_eq!(
            policy.after_response(429, &h, 1, false),
            CallDecision::RetryAfter(Duration::from_secs(5))
        );
        assert_eq!(
            policy.after_response(429, &h, 3, false),
            CallDecision::Exhausted
        );
    }

    #[test]
    fn unauthorized_refreshes_once() {
        let policy = RateLimitPolicy::default();
        let h = RateLimitHeaders::default();
        assert_eq!(
            policy.after_response(401, &h, 1, false),
            CallDecision::RefreshToken
        );
        assert_eq!(policy.after_response(401, &h, 1, true), CallDecision::Fail);
    }

    #[test]
    fn server_errors_back_off_exponentially() {
        let policy = RateLimitPolicy::default();
        let h = RateLimitHeaders::default();
        assert_eq!(
            policy.after_response(503, &h, 1, false),
            CallDecision::RetryAfter(Duration::from_secs(1))
        );
        assert_eq!(
            policy.after_response(503, &h, 2, false),
            CallDecision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(policy.after_response(503, &h, 3, false), CallDecision::Fail);
        assert_eq!(policy.after_response(404, &h, 1, false), CallDecision::Fail);
        assert_eq!(policy.after_response(204, &h, 1, false), CallDecision::Accept);
    }

    #[test]
    fn duplicate_key_counts_as_delivered() {
        let policy = RateLimitPolicy::default();
        let h = headers(40, 5);
        assert_eq!(
            policy.after_keyed_response(409, &h, 2, false),
            CallDecision::AlreadyApplied
        );
        assert_eq!(policy.after_response(409, &h, 2, false), CallDecision::Fail);
        assert_eq!(
            policy.after_keyed_response(201, &h, 1, false),
            CallDecision::Accept
        );
    }

    #[test]
    fn huge_reset_in_is_capped() {
        let policy = RateLimitPolicy::default();
        let h = headers(2, 10_000_000_000_000);
        let state = h.credit_state(at(0)).unwrap();
        assert_eq!(
            state.reset_at,
            at(0) + chrono::Duration::seconds(MAX_RESET_IN_SECS as i64)
        );
        assert_eq!(
            policy.after_response(429, &h, 1, false),
            CallDecision::RetryAfter(Duration::from_secs(MAX_RESET_IN_SECS))
        );
    }

    #[test]
    fn network_errors_retry_within_ceiling() {
        let policy = RateLimitPolicy::default();
        assert!(matches!(
            policy.after_network_error(1),
            CallDecision::RetryAfter(_)
        ));
        assert_eq!(policy.after_network_error(3), CallDecision::Fail);
    }
}

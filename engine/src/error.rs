//! Error types for the InnSync engine.

use crate::mapping::MissingMappings;
use crate::ConnectionId;
use thiserror::Error;

/// All possible errors from the InnSync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Credential errors
    #[error("credential refresh failed for connection {connection_id}: {reason}")]
    Credential {
        connection_id: ConnectionId,
        reason: String,
    },

    #[error("connection {0} is paused until its credentials are fixed")]
    ConnectionPaused(ConnectionId),

    // Channel errors
    #[error("rate limit exceeded after {attempts} attempts")]
    RateLimitExceeded { attempts: u32 },

    #[error("channel API error {status}: {body}")]
    ChannelApi { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    // Gating errors
    #[error("{0}")]
    MappingGap(MissingMappings),

    #[error("invalid signature: {0}")]
    SignatureInvalid(String),

    // State errors
    #[error("invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl Error {
    /// Whether the failure may succeed on a later attempt.
    ///
    /// Network failures, 5xx, 429 and exhausted rate-limit retries are
    /// transient. Everything else needs an operator or a code change.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) | Error::RateLimitExceeded { .. } => true,
            Error::ChannelApi { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::MappingPair;

    #[test]
    fn error_display() {
        let err = Error::ChannelApi {
            status: 422,
            body: "bad rate".into(),
        };
        assert_eq!(err.to_string(), "channel API error 422: bad rate");

        let err = Error::MappingGap(MissingMappings::new(vec![MappingPair::new("std", "bar")]));
        assert_eq!(err.to_string(), "missing channel mappings: std/bar");

        let err = Error::not_found("order", "ext-1");
        assert_eq!(err.to_string(), "order not found: ext-1");
    }

    #[test]
    fn transient_classification() {
        assert!(Error::Network("reset".into()).is_transient());
        assert!(Error::RateLimitExceeded { attempts: 3 }.is_transient());
        assert!(Error::ChannelApi {
            status: 503,
            body: String::new()
        }
        .is_transient());
        assert!(Error::ChannelApi {
            status: 429,
            body: String::new()
        }
        .is_transient());
        assert!(!Error::ChannelApi {
            status: 400,
            body: String::new()
        }
        .is_transient());
        assert!(!Error::MappingGap(MissingMappings::default()).is_transient());
        assert!(!Error::Credential {
            connection_id: "c1".into(),
            reason: "revoked".into()
        }
        .is_transient());
    }
}

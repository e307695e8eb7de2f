//! Live Sync Ledger feed over WebSocket.
//!
//! Monitoring dashboards subscribe once and receive every ledger entry as
//! it is appended, optionally filtered to a single channel connection.

mod manager;
mod protocol;

pub use manager::LedgerFeed;
pub use protocol::*;

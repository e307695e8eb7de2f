//! Sync operations behind the HTTP routes and the background runner.
//!
//! Each function takes the shared [`crate::AppState`] and does one
//! operation end to end: storage, channel calls and ledger entries.

mod ari;
mod connections;
mod inbound;
mod publish;
mod websocket;

pub use ari::*;
pub use connections::*;
pub use inbound::*;
pub use publish::*;
pub use websocket::*;

//! # InnSync Engine
//!
//! Deterministic core of the channel synchronization engine.
//!
//! This crate keeps a property's availability, rates and restrictions (ARI)
//! consistent with third-party distribution channels. It holds the data
//! model, the state machines and every decision the runtime makes; the
//! `innsync-server` crate supplies storage, HTTP and timers.
//!
//! ## Design Principles
//!
//! - **No IO**: no network, files or database access
//! - **No clock reads**: functions that depend on time take `now`
//! - **Testable**: every decision can be checked without mocks
//!
//! ## Core Concepts
//!
//! ### ARI cells
//!
//! An [`AriCell`] holds rate, availability and restrictions for one
//! [`CellKey`] (date, room type, rate plan).
//!
//! ### Staging
//!
//! The [`StagingStore`] shadows committed values with staged edits.
//! [`StagingStore::effective`] always returns staged-over-committed; only a
//! commit moves staged values into the committed set.
//!
//! ### Mapping gate
//!
//! A [`MappingTable`] maps (room type, rate plan) pairs to channel product
//! codes. [`MappingTable::validate`] reports every gap at once, and a
//! [`PublishTask`] cannot start processing while any gap exists.
//!
//! ### Publish tasks
//!
//! [`PublishTask`] carries a stable idempotency key across retries and moves
//! `queued -> processing -> completed | queued (retry) | failed`.
//!
//! ### Inbound orders
//!
//! [`InboundOrder`] moves once from `pending` to `applied` or `rejected`;
//! the [`OrderBook`] upserts by external reservation id.
//!
//! ### Rate limits
//!
//! [`RateLimitPolicy`] turns response headers into a [`CallDecision`]
//! (accept, wait, refresh token, fail) without sleeping itself.
//!
//! ## Quick Start
//!
//! ```rust
//! use innsync_engine::{AriCell, CellKey, StagingStore};
//! use chrono::{NaiveDate, Utc};
//!
//! let key = CellKey::new(NaiveDate::from_ymd_opt(2025, 9, 25).unwrap(), "std", "bar");
//! let mut store = StagingStore::new();
//!
//! let cell = AriCell { rate: 15000, available: 4, ..Default::default() };
//! store.stage(key.clone(), cell.clone(), Utc::now()).unwrap();
//! assert_eq!(store.effective(&key), Some(cell.clone()));
//!
//! store.commit(&[key.clone()]);
//! assert_eq!(store.committed(&key), Some(&cell));
//! assert!(store.staged(&key).is_none());
//! ```

pub mod ari;
pub mod connection;
pub mod error;
pub mod ledger;
pub mod mapping;
pub mod order;
pub mod payload;
pub mod ratelimit;
pub mod reservation;
pub mod selection;
pub mod signature;
pub mod staging;
pub mod task;

// Re-export main types at crate root
pub use ari::{AriCell, AriPatch, BulkEdit, CellKey, DateRange, PushType};
pub use connection::{AccessToken, Connection, ConnectionStatus, TokenScope};
pub use error::Error;
pub use ledger::{LedgerOperation, SyncLedger, SyncLogEntry};
pub use mapping::{ChannelMapping, MappingPair, MappingTable, MissingMappings};
pub use order::{
    GuestDetails, InboundOrder, OrderAction, OrderBook, OrderResult, OrderStatus,
    ReceiveOutcome, ReservationPayload,
};
pub use payload::{build_payload, publish_path, AriUpdate, PublishPayload};
pub use ratelimit::{CallDecision, CreditState, RateLimitHeaders, RateLimitPolicy};
pub use reservation::{Guest, Reservation};
pub use selection::{Clipboard, Selection};
pub use staging::{CommitEvent, CommittedChange, StagedChange, StagingStore};
pub use task::{PublishQueue, PublishScope, PublishTask, RetrySchedule, TaskOutcome, TaskStatus};

/// Type aliases for clarity
pub type ConnectionId = String;
pub type PropertyId = String;
pub type RoomTypeId = String;
pub type RatePlanId = String;
pub type ProductCode = String;
pub type TaskId = String;
pub type OrderId = String;
pub type Timestamp = chrono::DateTime<chrono::Utc>;

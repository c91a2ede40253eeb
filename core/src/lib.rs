#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::dbg_macro,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

//! Offline-first synchronization core for the touchline match console.
//!
//! Two cooperating pieces:
//! - [`ledger::Ledger`] owns the canonical in-memory record of events for
//!   the active match (live list, offline queue, pending set, undo stack)
//!   and exposes pure state transitions.
//! - [`channel::SyncSession`] owns the channel lifecycle (connect, send,
//!   receive, close, fixed-interval reconnect) and translates wire traffic
//!   into ledger transitions on a single actor task.

use std::time::Duration;

pub mod channel;
pub mod event;
pub mod interface;
pub mod ledger;
pub mod persist;
pub mod protocol;

pub use channel::{Config, LedgerView, SessionEvent, SyncSession, UndoOutcome};
pub use event::{ClockState, DuplicateInfo, DuplicateStats, EventDraft, Location, MatchEvent};
pub use interface::{
	AuthError, Connection, FetchError, SessionStore, SnapshotFetcher, StoreError, TokenProvider,
	Transport, TransportError,
};
pub use ledger::{AckOutcome, Ledger, PendingOrigin, UndoPlan};
pub use persist::SessionSnapshot;
pub use protocol::{AckResult, AckStatus, Inbound, UndoCommand};

/// Maximum number of undo candidates kept per session; the oldest is
/// evicted on overflow.
pub const UNDO_STACK_MAX: usize = 20;

/// Delay between reconnect attempts. Every retry uses the same fixed
/// interval; there is intentionally no exponential backoff.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(3);

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("transport error: {0}")]
	Transport(#[from] interface::TransportError),
	#[error("auth error: {0}")]
	Auth(#[from] interface::AuthError),
	#[error("store error: {0}")]
	Store(#[from] interface::StoreError),
	#[error("hydration error: {0}")]
	Fetch(#[from] interface::FetchError),
	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
	#[error("malformed inbound message: {0}")]
	Protocol(String),
	#[error("undo rejected: {0}")]
	Undo(String),
	#[error("sync session is gone")]
	SessionClosed,
}

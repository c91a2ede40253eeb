//! Seams to the collaborators this core depends on but does not own: the
//! persistent channel, the credential provider, the hydration fetch and
//! the durable key-value store. Production wires real implementations in;
//! tests inject scripted ones.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::event::MatchEvent;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
	#[error("failed to open channel: {0}")]
	Open(String),
	#[error("failed to send on channel: {0}")]
	Send(String),
	#[error("channel i/o error: {0}")]
	Io(String),
}

#[derive(thiserror::Error, Debug)]
#[error("no credential available: {0}")]
pub struct AuthError(pub String);

#[derive(thiserror::Error, Debug)]
#[error("store operation failed: {0}")]
pub struct StoreError(pub String);

#[derive(thiserror::Error, Debug)]
#[error("snapshot fetch failed: {0}")]
pub struct FetchError(pub String);

/// Yields a bearer credential on demand.
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
	async fn get_token(&self) -> Result<String, AuthError>;
}

/// Initial timeline hydration over plain HTTP, independent of the channel.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync + 'static {
	async fn events_since(&self, match_id: Uuid) -> Result<Vec<MatchEvent>, FetchError>;
}

/// Durable local key-value store backing the persisted session record.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
	async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;
	async fn del(&self, key: &str) -> Result<(), StoreError>;
}

/// Opens the persistent channel to the server.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
	type Conn: Connection;

	async fn connect(&self, token: &str) -> Result<Self::Conn, TransportError>;
}

/// One open channel. `recv` returning `None` means the channel closed;
/// an in-flight send cannot be cancelled, it either succeeds or errors.
#[async_trait]
pub trait Connection: Send + 'static {
	async fn send(&mut self, message: Value) -> Result<(), TransportError>;
	async fn recv(&mut self) -> Option<Result<Value, TransportError>>;
}

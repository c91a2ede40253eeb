//! JSON wire messages exchanged over the persistent channel.
//!
//! Outbound events are serialized [`MatchEvent`]s; the only other outbound
//! shape is the explicit [`UndoCommand`]. Inbound frames are dispatched on
//! their `type` field: `"ack"`, `"event_undone"`, anything else is assumed
//! to be another operator's confirmed event broadcast.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
	event::{DuplicateInfo, MatchEvent},
	Error,
};

/// Explicit cancellation of a previously logged event, carrying the
/// idempotency key and, when known, the server-assigned id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoCommand {
	pub command: String,
	pub match_id: Uuid,
	pub client_id: Uuid,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub event_id: Option<String>,
}

impl UndoCommand {
	pub fn new(match_id: Uuid, client_id: Uuid, event_id: Option<String>) -> Self {
		Self {
			command: "undo".to_owned(),
			match_id,
			client_id,
			event_id,
		}
	}
}

/// Terminal status carried by an acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckStatus {
	Success,
	Duplicate,
	UndoSuccess,
	UndoNotFound,
	/// Any other status is a failure, recovered by re-queuing.
	Other(String),
}

impl From<&str> for AckStatus {
	fn from(status: &str) -> Self {
		match status {
			"success" => Self::Success,
			"duplicate" => Self::Duplicate,
			"undo_success" => Self::UndoSuccess,
			"undo_not_found" => Self::UndoNotFound,
			other => Self::Other(other.to_owned()),
		}
	}
}

/// The `result` object of an inbound acknowledgment.
#[derive(Debug, Clone, Deserialize)]
pub struct AckResult {
	pub status: String,
	#[serde(default)]
	pub client_id: Option<Uuid>,
	#[serde(default)]
	pub event_id: Option<String>,
	#[serde(default)]
	pub duplicate: Option<DuplicateInfo>,
}

impl AckResult {
	#[must_use]
	pub fn status(&self) -> AckStatus {
		AckStatus::from(self.status.as_str())
	}
}

/// Everything the server can push down the channel.
#[derive(Debug)]
pub enum Inbound {
	Ack(AckResult),
	EventUndone {
		event_id: Option<String>,
		client_id: Option<Uuid>,
	},
	Broadcast(Box<MatchEvent>),
}

/// Dispatches one inbound frame. Anything that does not parse is a
/// protocol error for the caller to log and drop; it must never affect
/// ledger state.
pub fn parse_inbound(frame: Value) -> Result<Inbound, Error> {
	match frame.get("type").and_then(Value::as_str) {
		Some("ack") => {
			let result = frame
				.get("result")
				.cloned()
				.ok_or_else(|| Error::Protocol("ack without result".to_owned()))?;
			serde_json::from_value::<AckResult>(result)
				.map(Inbound::Ack)
				.map_err(|e| Error::Protocol(e.to_string()))
		}
		Some("event_undone") => {
			#[derive(Deserialize)]
			struct Undone {
				#[serde(default)]
				event_id: Option<String>,
				#[serde(default)]
				client_id: Option<Uuid>,
			}

			serde_json::from_value::<Undone>(frame)
				.map(|undone| Inbound::EventUndone {
					event_id: undone.event_id,
					client_id: undone.client_id,
				})
				.map_err(|e| Error::Protocol(e.to_string()))
		}
		// broadcast events carry their own event-type tag in `type`
		_ => serde_json::from_value::<MatchEvent>(frame)
			.map(|event| Inbound::Broadcast(Box::new(event)))
			.map_err(|e| Error::Protocol(e.to_string())),
	}
}

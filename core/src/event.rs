//! Domain model for logged match events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// 2D pitch location, normalized to the 0..=1 range on both axes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
	pub x: f32,
	pub y: f32,
}

/// One logged occurrence.
///
/// `client_id` is assigned at creation and never changes for the event's
/// whole lifetime; it is the only reliable cross-reference between the
/// optimistic and confirmed representations when timestamps could collide.
/// `server_id` stays `None` until the server confirms the event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchEvent {
	pub match_id: Uuid,
	pub client_id: Uuid,
	#[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
	pub server_id: Option<String>,
	pub created_at: DateTime<Utc>,
	pub match_clock: String,
	pub period: u8,
	pub team_id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub player_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub location: Option<Location>,
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default)]
	pub data: Map<String, Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub notes: Option<String>,
}

impl MatchEvent {
	/// Equality used when no server id lines up, e.g. merging a broadcast
	/// against our optimistic copy of the same occurrence.
	pub(crate) fn same_occurrence(&self, other: &Self) -> bool {
		self.created_at == other.created_at
			&& self.kind == other.kind
			&& self.match_clock == other.match_clock
	}
}

/// Operator input for a new event. The ledger assigns the idempotency key
/// and the creation timestamp.
#[derive(Debug, Clone)]
pub struct EventDraft {
	pub match_id: Uuid,
	pub match_clock: String,
	pub period: u8,
	pub team_id: String,
	pub player_id: Option<String>,
	pub location: Option<Location>,
	pub kind: String,
	pub data: Map<String, Value>,
	pub notes: Option<String>,
}

impl EventDraft {
	pub(crate) fn into_event(self, client_id: Uuid, created_at: DateTime<Utc>) -> MatchEvent {
		MatchEvent {
			match_id: self.match_id,
			client_id,
			server_id: None,
			created_at,
			match_clock: self.match_clock,
			period: self.period,
			team_id: self.team_id,
			player_id: self.player_id,
			location: self.location,
			kind: self.kind,
			data: self.data,
			notes: self.notes,
		}
	}
}

/// Operator clock state carried with the persisted session record. Has no
/// bearing on the reliability protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockState {
	pub period: u8,
	pub match_clock: String,
	pub effective_seconds: u64,
	pub ball_in_play: bool,
}

/// The most recent server-detected duplicate, for operator feedback only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateInfo {
	#[serde(default)]
	pub event_id: Option<String>,
	#[serde(default)]
	pub match_clock: String,
	#[serde(default)]
	pub period: u8,
	#[serde(default)]
	pub team_id: String,
	/// Filled in locally from the discarded event, not from the wire.
	#[serde(default)]
	pub kind: String,
}

/// Running per-session duplicate counter plus the latest highlight.
#[derive(Debug, Clone, Default)]
pub struct DuplicateStats {
	pub count: u64,
	pub last: Option<DuplicateInfo>,
}

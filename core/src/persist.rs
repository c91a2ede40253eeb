//! Durable session record. One logical key in the injected store holds
//! everything an in-progress offline session needs to survive a reload.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
	event::{ClockState, MatchEvent},
	interface::SessionStore,
	Error,
};

pub const SESSION_KEY: &str = "touchline.session";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSnapshot {
	pub active_match: Option<Uuid>,
	/// Offline queue grouped by match id.
	pub queues: HashMap<Uuid, Vec<MatchEvent>>,
	pub clock: ClockState,
	pub live: Vec<MatchEvent>,
}

pub async fn load(store: &dyn SessionStore) -> Result<Option<SessionSnapshot>, Error> {
	let Some(bytes) = store.get(SESSION_KEY).await? else {
		return Ok(None);
	};

	Ok(Some(serde_json::from_slice(&bytes)?))
}

pub async fn save(store: &dyn SessionStore, snapshot: &SessionSnapshot) -> Result<(), Error> {
	store.set(SESSION_KEY, serde_json::to_vec(snapshot)?).await?;

	Ok(())
}

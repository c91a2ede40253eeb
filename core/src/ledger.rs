//! The Event Ledger: canonical in-memory record of events for the active
//! match session.
//!
//! Owns the optimistic live list, the per-match offline queue, the set of
//! events awaiting server acknowledgment and the bounded undo candidate
//! stack. Every public method is one synchronous, indivisible transition;
//! the ledger knows nothing about the transport.

use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::{
	event::{ClockState, DuplicateInfo, DuplicateStats, EventDraft, MatchEvent},
	persist::SessionSnapshot,
	protocol::{AckResult, AckStatus, UndoCommand},
	Error, UNDO_STACK_MAX,
};

/// How an event ended up in the pending set. Origin feeds retry policy on
/// acknowledgment; demotion on channel close treats origins equally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOrigin {
	/// Optimistic first send.
	Fresh,
	/// Re-sent from the offline queue by a flush.
	Replayed,
	/// Outstanding undo command.
	Undo,
}

#[derive(Debug, Clone)]
pub struct PendingEntry {
	pub event: MatchEvent,
	pub origin: PendingOrigin,
}

/// What [`Ledger::apply_ack`] did, for the controller to log and surface.
#[derive(Debug)]
pub enum AckOutcome {
	Confirmed(MatchEvent),
	Duplicate(DuplicateInfo),
	Requeued(Uuid),
	UndoConfirmed(MatchEvent),
	UndoNotFound,
	/// The ack referenced a key with no pending entry. Tolerated as
	/// already resolved: an undo and an ordinary ack can legitimately
	/// race for the same key, and whichever lands second finds nothing.
	AlreadyResolved(Option<Uuid>),
}

/// What a permitted undo requires from the controller.
#[derive(Debug)]
pub enum UndoPlan {
	/// The event was never sent and is not pending: removed locally, no
	/// network interaction.
	Local(MatchEvent),
	/// The event is pending or already confirmed: the cancellation must
	/// go over the channel. The event is pending again (origin `Undo`)
	/// until the undo acknowledgment resolves it.
	Remote(UndoCommand),
}

#[derive(Debug, Default)]
pub struct Ledger {
	active_match: Option<Uuid>,
	live: Vec<MatchEvent>,
	queues: HashMap<Uuid, Vec<MatchEvent>>,
	pending: HashMap<Uuid, PendingEntry>,
	/// Send-order bookkeeping backing the FIFO correlation fallback.
	send_order: VecDeque<Uuid>,
	undo_stack: Vec<Uuid>,
	clock: ClockState,
	duplicates: DuplicateStats,
}

impl Ledger {
	#[must_use]
	pub fn active_match(&self) -> Option<Uuid> {
		self.active_match
	}

	#[must_use]
	pub fn live(&self) -> &[MatchEvent] {
		&self.live
	}

	#[must_use]
	pub fn queued(&self, match_id: Uuid) -> &[MatchEvent] {
		self.queues.get(&match_id).map_or(&[], Vec::as_slice)
	}

	#[must_use]
	pub fn undo_candidates(&self) -> &[Uuid] {
		&self.undo_stack
	}

	#[must_use]
	pub fn duplicates(&self) -> &DuplicateStats {
		&self.duplicates
	}

	#[must_use]
	pub fn clock(&self) -> &ClockState {
		&self.clock
	}

	pub fn set_clock(&mut self, clock: ClockState) {
		self.clock = clock;
	}

	#[must_use]
	pub fn is_pending(&self, key: Uuid) -> bool {
		self.pending.contains_key(&key)
	}

	/// Outstanding sends in send order.
	#[must_use]
	pub fn pending_keys(&self) -> Vec<Uuid> {
		self.send_order.iter().copied().collect()
	}

	#[must_use]
	pub fn oldest_pending(&self) -> Option<Uuid> {
		self.send_order.front().copied()
	}

	/// Switches the active match session. The live view is rebuilt from
	/// the new match's unsynced queue; hydration then overlays the server
	/// snapshot.
	pub fn set_active_match(&mut self, match_id: Uuid) {
		if self.active_match == Some(match_id) {
			return;
		}

		self.active_match = Some(match_id);
		self.undo_stack.clear();
		self.live = self.queued(match_id).to_vec();
	}

	/// The optimistic-UI contract: always succeeds, the operator sees the
	/// event before any network round trip begins.
	pub fn create_event(&mut self, draft: EventDraft) -> MatchEvent {
		let event = draft.into_event(Uuid::new_v4(), Utc::now());

		self.live.push(event.clone());
		self.push_undo_candidate(event.client_id);

		trace!(client_id = %event.client_id, kind = %event.kind, "created optimistic event");

		event
	}

	fn push_undo_candidate(&mut self, client_id: Uuid) {
		// re-pushing an existing key relocates it without growing the stack
		self.undo_stack.retain(|key| *key != client_id);
		self.undo_stack.push(client_id);

		if self.undo_stack.len() > UNDO_STACK_MAX {
			self.undo_stack.remove(0);
		}
	}

	/// Adds an event to its match's offline queue. Idempotent per
	/// idempotency key.
	pub fn enqueue(&mut self, event: MatchEvent) {
		let queue = self.queues.entry(event.match_id).or_default();

		if queue.iter().any(|queued| queued.client_id == event.client_id) {
			return;
		}

		queue.push(event);
	}

	/// Removes an event from its match's offline queue, matching by key
	/// or, failing that, by `(timestamp, type, clock)` equality.
	pub fn dequeue(&mut self, event: &MatchEvent) {
		if let Some(queue) = self.queues.get_mut(&event.match_id) {
			queue.retain(|queued| {
				queued.client_id != event.client_id && !queued.same_occurrence(event)
			});
		}
	}

	/// Moves an event into the pending set the instant it is handed to the
	/// transport. At most one entry exists per idempotency key; a repeat
	/// registration (an undo chasing its own event) replaces the entry
	/// without growing the send order.
	pub fn register_pending(&mut self, event: MatchEvent, origin: PendingOrigin) {
		let key = event.client_id;

		if self.pending.insert(key, PendingEntry { event, origin }).is_none() {
			self.send_order.push_back(key);
		}
	}

	/// Removes and returns the pending entry for `key`. Absent keys return
	/// `None` and must not raise: acknowledgments can legitimately arrive
	/// after a race already resolved the entry.
	pub fn resolve_pending(&mut self, key: Uuid) -> Option<PendingEntry> {
		let entry = self.pending.remove(&key);

		if entry.is_some() {
			self.send_order.retain(|pending| *pending != key);
		}

		entry
	}

	/// Identical to [`Self::resolve_pending`]; named for failure paths
	/// that still need the entry's payload to re-queue it.
	pub fn reject_pending(&mut self, key: Uuid) -> Option<PendingEntry> {
		self.resolve_pending(key)
	}

	/// Channel closed: atomically drains every in-flight entry back into
	/// the offline queue and clears the send-order bookkeeping. Fresh and
	/// replayed origins get equal treatment. An outstanding undo command
	/// is dropped instead; its event is only re-queued when it was never
	/// confirmed, and the undo candidate survives for a retry.
	pub fn demote_all_pending(&mut self) -> Vec<MatchEvent> {
		let keys = self.send_order.iter().copied().collect::<Vec<_>>();
		let mut demoted = Vec::with_capacity(keys.len());

		for key in keys {
			let Some(entry) = self.pending.remove(&key) else {
				continue;
			};

			if entry.origin == PendingOrigin::Undo && entry.event.server_id.is_some() {
				continue;
			}

			self.enqueue(entry.event.clone());
			demoted.push(entry.event);
		}

		self.pending.clear();
		self.send_order.clear();

		demoted
	}

	/// Single entry point for every acknowledgment shape. Correlates by
	/// idempotency key when the server sent one, falling back to strict
	/// FIFO over the send order otherwise.
	pub fn apply_ack(&mut self, result: &AckResult) -> AckOutcome {
		let key = match result.client_id {
			Some(key) => key,
			None => {
				let Some(key) = self.oldest_pending() else {
					return AckOutcome::AlreadyResolved(None);
				};

				// Fragile by design of the protocol: silently wrong under
				// out-of-order delivery with more than one send in flight,
				// so every exercise of this path is surfaced.
				warn!(
					%key,
					status = %result.status,
					"ack carried no client_id, correlating by FIFO fallback"
				);

				key
			}
		};

		let Some(entry) = self.resolve_pending(key) else {
			return AckOutcome::AlreadyResolved(Some(key));
		};

		match result.status() {
			AckStatus::Success => {
				if let Some(server_id) = &result.event_id {
					self.attach_server_id(key, server_id);
				}

				if entry.origin == PendingOrigin::Replayed {
					// a replayed success confirms persistence
					self.dequeue(&entry.event);
				}

				let confirmed = self
					.live
					.iter()
					.find(|event| event.client_id == key)
					.cloned()
					.unwrap_or_else(|| {
						let mut event = entry.event.clone();
						event.server_id = result.event_id.clone();
						event
					});

				AckOutcome::Confirmed(confirmed)
			}
			AckStatus::Duplicate => {
				// the server already holds an equivalent record; the
				// operator's action is discarded entirely
				self.remove_everywhere(&entry.event);

				let info = DuplicateInfo {
					kind: entry.event.kind.clone(),
					..result.duplicate.clone().unwrap_or_default()
				};

				self.duplicates.count += 1;
				self.duplicates.last = Some(info.clone());

				AckOutcome::Duplicate(info)
			}
			AckStatus::UndoSuccess => {
				self.remove_everywhere(&entry.event);

				// covers the case where the optimistic entry was already
				// confirmed before the undo was requested
				if let Some(server_id) = &result.event_id {
					self.remove_by_server_id(server_id);
				}

				AckOutcome::UndoConfirmed(entry.event)
			}
			AckStatus::UndoNotFound => AckOutcome::UndoNotFound,
			AckStatus::Other(status) => {
				debug!(%key, %status, "ack reported failure, event stays queued for a later flush");

				if entry.origin != PendingOrigin::Undo || entry.event.server_id.is_none() {
					self.enqueue(entry.event);
				}

				AckOutcome::Requeued(key)
			}
		}
	}

	/// Only permitted on the most recently pushed, still-present undo
	/// candidate, with a connection available: events already on the wire
	/// or confirmed are cancelled remotely, unsent ones locally.
	pub fn request_undo(&mut self) -> Result<UndoPlan, Error> {
		let Some(&key) = self.undo_stack.last() else {
			return Err(Error::Undo("nothing to undo".to_owned()));
		};

		if let Some(entry) = self.pending.get(&key) {
			let command =
				UndoCommand::new(entry.event.match_id, key, entry.event.server_id.clone());
			let event = entry.event.clone();
			self.register_pending(event, PendingOrigin::Undo);

			return Ok(UndoPlan::Remote(command));
		}

		let Some(event) = self
			.live
			.iter()
			.find(|event| event.client_id == key)
			.cloned()
		else {
			self.undo_stack.pop();
			return Err(Error::Undo("event is no longer present".to_owned()));
		};

		if event.server_id.is_some() {
			let command = UndoCommand::new(event.match_id, key, event.server_id.clone());
			self.register_pending(event, PendingOrigin::Undo);

			Ok(UndoPlan::Remote(command))
		} else {
			// never sent: purely local
			self.remove_everywhere(&event);

			Ok(UndoPlan::Local(event))
		}
	}

	/// Undo without a connection: only an event that was never handed to
	/// the transport can be cancelled, purely locally. Sent or confirmed
	/// events are a user-visible failure with no state mutation.
	pub fn request_undo_offline(&mut self) -> Result<MatchEvent, Error> {
		let Some(&key) = self.undo_stack.last() else {
			return Err(Error::Undo("nothing to undo".to_owned()));
		};

		if self.pending.contains_key(&key) {
			return Err(Error::Undo(
				"cannot cancel a sent event while disconnected".to_owned(),
			));
		}

		let Some(event) = self
			.live
			.iter()
			.find(|event| event.client_id == key)
			.cloned()
		else {
			self.undo_stack.pop();
			return Err(Error::Undo("event is no longer present".to_owned()));
		};

		if event.server_id.is_some() {
			return Err(Error::Undo(
				"cannot cancel a confirmed event while disconnected".to_owned(),
			));
		}

		self.remove_everywhere(&event);

		Ok(event)
	}

	/// Replaces the live view with the server snapshot for `match_id`,
	/// then overlays the still-unsynced local queue.
	pub fn hydrate(&mut self, match_id: Uuid, confirmed: Vec<MatchEvent>) {
		self.active_match = Some(match_id);
		self.live = confirmed;

		let queued = self.queued(match_id).to_vec();

		for event in queued {
			let known = self.live.iter().any(|live| {
				live.client_id == event.client_id || live.same_occurrence(&event)
			});

			if !known {
				self.live.push(event);
			}
		}
	}

	/// Another operator's confirmed event arriving over the channel,
	/// merged by server id or by occurrence equality.
	pub fn merge_confirmed(&mut self, event: MatchEvent) {
		if self.active_match != Some(event.match_id) {
			trace!(match_id = %event.match_id, "ignoring broadcast for inactive match");
			return;
		}

		if let Some(server_id) = event.server_id.clone() {
			if let Some(existing) = self
				.live
				.iter_mut()
				.find(|live| live.server_id.as_deref() == Some(server_id.as_str()))
			{
				*existing = event;
				return;
			}
		}

		if let Some(existing) = self.live.iter_mut().find(|live| live.same_occurrence(&event)) {
			// our optimistic copy, confirmed through someone else's view
			existing.server_id = event.server_id;
			return;
		}

		self.live.push(event);
	}

	/// Inbound undo broadcast: the referenced event is gone server-side.
	pub fn apply_remote_undo(&mut self, event_id: Option<&str>, client_id: Option<Uuid>) {
		if let Some(server_id) = event_id {
			self.remove_by_server_id(server_id);
		}

		if let Some(key) = client_id {
			if let Some(event) = self
				.live
				.iter()
				.find(|event| event.client_id == key)
				.cloned()
			{
				self.remove_everywhere(&event);
			}

			self.undo_stack.retain(|candidate| *candidate != key);
		}
	}

	fn attach_server_id(&mut self, key: Uuid, server_id: &str) {
		if let Some(event) = self.live.iter_mut().find(|event| event.client_id == key) {
			event.server_id = Some(server_id.to_owned());
		}
	}

	fn remove_everywhere(&mut self, event: &MatchEvent) {
		self.live.retain(|live| live.client_id != event.client_id);
		self.dequeue(event);
		self.undo_stack.retain(|key| *key != event.client_id);
	}

	fn remove_by_server_id(&mut self, server_id: &str) {
		self.live
			.retain(|event| event.server_id.as_deref() != Some(server_id));

		for queue in self.queues.values_mut() {
			queue.retain(|event| event.server_id.as_deref() != Some(server_id));
		}
	}

	/// The one logical record that survives a reload. In-flight entries
	/// are not persisted; anything unacknowledged is already in the queue
	/// or will be demoted there before shutdown.
	#[must_use]
	pub fn snapshot(&self) -> SessionSnapshot {
		SessionSnapshot {
			active_match: self.active_match,
			queues: self.queues.clone(),
			clock: self.clock.clone(),
			live: self.live.clone(),
		}
	}

	pub fn restore(&mut self, snapshot: SessionSnapshot) {
		self.active_match = snapshot.active_match;
		self.queues = snapshot.queues;
		self.clock = snapshot.clock;
		self.live = snapshot.live;
	}
}

#[cfg(test)]
mod test {
	use serde_json::Map;
	use tracing_test::traced_test;

	use super::*;

	fn draft(match_id: Uuid) -> EventDraft {
		EventDraft {
			match_id,
			match_clock: "12:41".to_owned(),
			period: 1,
			team_id: "home".to_owned(),
			player_id: None,
			location: None,
			kind: "pass".to_owned(),
			data: Map::new(),
			notes: None,
		}
	}

	fn success_ack(client_id: Uuid, event_id: &str) -> AckResult {
		AckResult {
			status: "success".to_owned(),
			client_id: Some(client_id),
			event_id: Some(event_id.to_owned()),
			duplicate: None,
		}
	}

	#[test]
	fn created_events_are_live_before_any_ack() {
		let match_id = Uuid::new_v4();
		let mut ledger = Ledger::default();
		ledger.set_active_match(match_id);

		let event = ledger.create_event(draft(match_id));

		assert_eq!(ledger.live().len(), 1);
		assert_eq!(ledger.live()[0].client_id, event.client_id);
		assert!(event.server_id.is_none());
		assert_eq!(ledger.undo_candidates(), &[event.client_id]);
	}

	#[test]
	fn at_most_one_pending_entry_per_key() {
		let match_id = Uuid::new_v4();
		let mut ledger = Ledger::default();
		ledger.set_active_match(match_id);

		let event = ledger.create_event(draft(match_id));
		ledger.register_pending(event.clone(), PendingOrigin::Fresh);
		ledger.register_pending(event.clone(), PendingOrigin::Undo);

		assert_eq!(ledger.pending_keys(), vec![event.client_id]);
		assert_eq!(ledger.oldest_pending(), Some(event.client_id));
	}

	#[test]
	fn success_ack_attaches_the_server_id() {
		let match_id = Uuid::new_v4();
		let mut ledger = Ledger::default();
		ledger.set_active_match(match_id);

		let event = ledger.create_event(draft(match_id));
		ledger.register_pending(event.clone(), PendingOrigin::Fresh);

		let outcome = ledger.apply_ack(&success_ack(event.client_id, "srv1"));

		assert!(matches!(outcome, AckOutcome::Confirmed(_)));
		assert_eq!(ledger.live()[0].server_id.as_deref(), Some("srv1"));
		assert!(ledger.pending_keys().is_empty());
	}

	#[test]
	fn replayed_success_also_clears_the_queue() {
		let match_id = Uuid::new_v4();
		let mut ledger = Ledger::default();
		ledger.set_active_match(match_id);

		let event = ledger.create_event(draft(match_id));
		ledger.enqueue(event.clone());
		ledger.register_pending(event.clone(), PendingOrigin::Replayed);

		ledger.apply_ack(&success_ack(event.client_id, "srv1"));

		assert!(ledger.queued(match_id).is_empty());
		assert_eq!(ledger.live().len(), 1);
	}

	#[test]
	fn duplicate_ack_discards_the_event_and_counts() {
		let match_id = Uuid::new_v4();
		let mut ledger = Ledger::default();
		ledger.set_active_match(match_id);

		let event = ledger.create_event(draft(match_id));
		ledger.enqueue(event.clone());
		ledger.register_pending(event.clone(), PendingOrigin::Replayed);

		let ack = AckResult {
			status: "duplicate".to_owned(),
			client_id: Some(event.client_id),
			event_id: None,
			duplicate: Some(DuplicateInfo {
				event_id: Some("srv7".to_owned()),
				match_clock: "12:41".to_owned(),
				period: 1,
				team_id: "home".to_owned(),
				kind: String::new(),
			}),
		};

		let AckOutcome::Duplicate(info) = ledger.apply_ack(&ack) else {
			panic!("expected a duplicate outcome");
		};

		assert!(ledger.live().is_empty());
		assert!(ledger.queued(match_id).is_empty());
		assert!(ledger.undo_candidates().is_empty());
		assert_eq!(ledger.duplicates().count, 1);
		assert_eq!(info.kind, "pass");
		assert_eq!(info.event_id.as_deref(), Some("srv7"));
	}

	#[test]
	fn failure_ack_requeues_fresh_sends() {
		let match_id = Uuid::new_v4();
		let mut ledger = Ledger::default();
		ledger.set_active_match(match_id);

		let event = ledger.create_event(draft(match_id));
		ledger.register_pending(event.clone(), PendingOrigin::Fresh);

		let ack = AckResult {
			status: "storage_error".to_owned(),
			client_id: Some(event.client_id),
			event_id: None,
			duplicate: None,
		};

		assert!(matches!(ledger.apply_ack(&ack), AckOutcome::Requeued(_)));
		assert_eq!(ledger.queued(match_id).len(), 1);
		assert!(ledger.pending_keys().is_empty());
		// still visible to the operator
		assert_eq!(ledger.live().len(), 1);
	}

	#[test]
	fn demotion_moves_every_pending_entry_exactly_once() {
		let match_id = Uuid::new_v4();
		let mut ledger = Ledger::default();
		ledger.set_active_match(match_id);

		let events = (0..3)
			.map(|_| {
				let event = ledger.create_event(draft(match_id));
				ledger.register_pending(event.clone(), PendingOrigin::Fresh);
				event
			})
			.collect::<Vec<_>>();

		// one of them was a replay, treatment is equal
		ledger.enqueue(events[1].clone());
		ledger.register_pending(events[1].clone(), PendingOrigin::Replayed);

		let demoted = ledger.demote_all_pending();

		assert_eq!(demoted.len(), 3);
		assert_eq!(ledger.queued(match_id).len(), 3);
		assert!(ledger.pending_keys().is_empty());
		assert_eq!(ledger.oldest_pending(), None);
	}

	#[test]
	fn ack_for_unknown_key_is_a_tolerated_no_op() {
		let mut ledger = Ledger::default();

		let outcome = ledger.apply_ack(&success_ack(Uuid::new_v4(), "srv1"));

		assert!(matches!(outcome, AckOutcome::AlreadyResolved(Some(_))));
	}

	#[traced_test]
	#[test]
	fn missing_client_id_falls_back_to_fifo_order() {
		let match_id = Uuid::new_v4();
		let mut ledger = Ledger::default();
		ledger.set_active_match(match_id);

		let first = ledger.create_event(draft(match_id));
		let second = ledger.create_event(draft(match_id));
		ledger.register_pending(first.clone(), PendingOrigin::Fresh);
		ledger.register_pending(second.clone(), PendingOrigin::Fresh);

		let ack = AckResult {
			status: "success".to_owned(),
			client_id: None,
			event_id: Some("srv1".to_owned()),
			duplicate: None,
		};
		ledger.apply_ack(&ack);

		// the oldest outstanding send is the one resolved
		assert_eq!(ledger.pending_keys(), vec![second.client_id]);
		assert_eq!(
			ledger
				.live()
				.iter()
				.find(|event| event.client_id == first.client_id)
				.and_then(|event| event.server_id.as_deref()),
			Some("srv1")
		);
		assert!(logs_contain("FIFO fallback"));
	}

	#[test]
	fn undo_stack_caps_at_twenty_and_relocates_repeats() {
		let match_id = Uuid::new_v4();
		let mut ledger = Ledger::default();
		ledger.set_active_match(match_id);

		let events = (0..25)
			.map(|_| ledger.create_event(draft(match_id)))
			.collect::<Vec<_>>();

		assert_eq!(ledger.undo_candidates().len(), UNDO_STACK_MAX);
		assert_eq!(
			ledger.undo_candidates()[0],
			events[events.len() - UNDO_STACK_MAX].client_id
		);

		// re-pushing an existing key moves it to the top without growing
		let relocated = events[events.len() - 2].client_id;
		ledger.push_undo_candidate(relocated);

		assert_eq!(ledger.undo_candidates().len(), UNDO_STACK_MAX);
		assert_eq!(*ledger.undo_candidates().last().expect("non-empty"), relocated);
	}

	#[test]
	fn undo_of_an_unsent_event_is_purely_local() {
		let match_id = Uuid::new_v4();
		let mut ledger = Ledger::default();
		ledger.set_active_match(match_id);

		let event = ledger.create_event(draft(match_id));
		ledger.enqueue(event.clone());

		let Ok(undone) = ledger.request_undo_offline() else {
			panic!("expected a local undo");
		};

		assert_eq!(undone.client_id, event.client_id);
		assert!(ledger.live().is_empty());
		assert!(ledger.queued(match_id).is_empty());
		assert!(ledger.undo_candidates().is_empty());
	}

	#[test]
	fn undo_of_a_pending_event_goes_over_the_wire() {
		let match_id = Uuid::new_v4();
		let mut ledger = Ledger::default();
		ledger.set_active_match(match_id);

		let event = ledger.create_event(draft(match_id));
		ledger.register_pending(event.clone(), PendingOrigin::Fresh);

		let Ok(UndoPlan::Remote(command)) = ledger.request_undo() else {
			panic!("expected a remote undo");
		};

		assert_eq!(command.client_id, event.client_id);
		assert_eq!(command.event_id, None);
		// still exactly one pending entry, now tagged as an undo
		assert_eq!(ledger.pending_keys(), vec![event.client_id]);
	}

	#[test]
	fn undo_of_a_confirmed_event_requires_a_connection() {
		let match_id = Uuid::new_v4();
		let mut ledger = Ledger::default();
		ledger.set_active_match(match_id);

		let event = ledger.create_event(draft(match_id));
		ledger.register_pending(event.clone(), PendingOrigin::Fresh);
		ledger.apply_ack(&success_ack(event.client_id, "srv1"));

		assert!(matches!(ledger.request_undo_offline(), Err(Error::Undo(_))));
		// no state mutation on the failure path
		assert_eq!(ledger.live().len(), 1);
		assert_eq!(ledger.undo_candidates(), &[event.client_id]);
	}

	#[test]
	fn offline_undo_of_a_pending_event_is_refused() {
		let match_id = Uuid::new_v4();
		let mut ledger = Ledger::default();
		ledger.set_active_match(match_id);

		let event = ledger.create_event(draft(match_id));
		ledger.register_pending(event.clone(), PendingOrigin::Fresh);

		assert!(matches!(ledger.request_undo_offline(), Err(Error::Undo(_))));
		assert_eq!(ledger.pending_keys(), vec![event.client_id]);
		assert_eq!(ledger.undo_candidates(), &[event.client_id]);
	}

	#[test]
	fn undo_success_removes_by_server_id_as_well() {
		let match_id = Uuid::new_v4();
		let mut ledger = Ledger::default();
		ledger.set_active_match(match_id);

		let event = ledger.create_event(draft(match_id));
		ledger.register_pending(event.clone(), PendingOrigin::Fresh);
		ledger.apply_ack(&success_ack(event.client_id, "srv1"));

		let Ok(UndoPlan::Remote(command)) = ledger.request_undo() else {
			panic!("expected a remote undo");
		};
		assert_eq!(command.event_id.as_deref(), Some("srv1"));

		let ack = AckResult {
			status: "undo_success".to_owned(),
			client_id: Some(event.client_id),
			event_id: Some("srv1".to_owned()),
			duplicate: None,
		};

		assert!(matches!(ledger.apply_ack(&ack), AckOutcome::UndoConfirmed(_)));
		assert!(ledger.live().is_empty());
		assert!(ledger.undo_candidates().is_empty());
		assert!(ledger.pending_keys().is_empty());
	}

	#[test]
	fn enqueue_is_idempotent_per_key() {
		let match_id = Uuid::new_v4();
		let mut ledger = Ledger::default();
		ledger.set_active_match(match_id);

		let event = ledger.create_event(draft(match_id));
		ledger.enqueue(event.clone());
		ledger.enqueue(event.clone());

		assert_eq!(ledger.queued(match_id).len(), 1);
	}

	#[test]
	fn broadcasts_merge_into_the_optimistic_copy() {
		let match_id = Uuid::new_v4();
		let mut ledger = Ledger::default();
		ledger.set_active_match(match_id);

		let event = ledger.create_event(draft(match_id));

		let mut confirmed = event.clone();
		confirmed.client_id = Uuid::new_v4(); // other operator's key
		confirmed.server_id = Some("srv5".to_owned());

		ledger.merge_confirmed(confirmed);

		assert_eq!(ledger.live().len(), 1);
		assert_eq!(ledger.live()[0].server_id.as_deref(), Some("srv5"));
	}

	#[test]
	fn switching_matches_rebuilds_the_live_view() {
		let first = Uuid::new_v4();
		let second = Uuid::new_v4();
		let mut ledger = Ledger::default();
		ledger.set_active_match(first);

		let event = ledger.create_event(draft(first));
		ledger.enqueue(event);

		ledger.set_active_match(second);
		assert!(ledger.live().is_empty());
		assert!(ledger.undo_candidates().is_empty());

		// the queued slice for the original match is mirrored back
		ledger.set_active_match(first);
		assert_eq!(ledger.live().len(), 1);
	}
}

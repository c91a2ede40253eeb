//! The sync channel controller.
//!
//! A single actor task owns both the [`Ledger`] and the channel lifecycle
//! (connect, send, receive, close, fixed-interval reconnect). Consumers
//! talk to it through typed commands on [`SyncSession`] and observe it via
//! a broadcast stream of [`SessionEvent`]s, so every ledger mutation is an
//! indivisible transition on one task regardless of which callback site
//! asked for it.

use std::fmt;
use std::time::Duration;

use serde_json::Value;
use tokio::{
	sync::{broadcast, mpsc, oneshot},
	time::{sleep_until, Instant},
};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::{
	event::{ClockState, DuplicateInfo, DuplicateStats, EventDraft, MatchEvent},
	interface::{Connection, SessionStore, SnapshotFetcher, TokenProvider, Transport, TransportError},
	ledger::{AckOutcome, Ledger, PendingOrigin, UndoPlan},
	persist,
	protocol::{self, Inbound},
	Error, RECONNECT_INTERVAL,
};

#[derive(Debug, Clone)]
pub struct Config {
	/// Delay before each reconnect attempt after a closure. Fixed, never
	/// exponential.
	pub reconnect_interval: Duration,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			reconnect_interval: RECONNECT_INTERVAL,
		}
	}
}

/// What the consumer (the rendering layer) observes.
#[derive(Debug, Clone)]
pub enum SessionEvent {
	Connected,
	Disconnected,
	EventLogged(MatchEvent),
	EventConfirmed(MatchEvent),
	EventRequeued(Uuid),
	DuplicateDetected(DuplicateInfo),
	UndoConfirmed(MatchEvent),
	UndoNotFound,
	RemoteEvent(MatchEvent),
	RemoteUndo {
		event_id: Option<String>,
		client_id: Option<Uuid>,
	},
	QueueFlushed(usize),
	Hydrated {
		match_id: Uuid,
		count: usize,
	},
}

/// How an undo request was satisfied.
#[derive(Debug)]
pub enum UndoOutcome {
	/// Removed locally, nothing was ever sent.
	Local(MatchEvent),
	/// A cancellation command is in flight for this key.
	Requested(Uuid),
}

/// Read-only view of the ledger for consumers and tests.
#[derive(Debug, Clone)]
pub struct LedgerView {
	pub connected: bool,
	pub live: Vec<MatchEvent>,
	pub queued: Vec<MatchEvent>,
	pub pending: Vec<Uuid>,
	pub undo_stack: Vec<Uuid>,
	pub duplicates: DuplicateStats,
	pub clock: ClockState,
}

enum Command {
	Connect {
		reply: oneshot::Sender<Result<(), Error>>,
	},
	LogEvent {
		draft: EventDraft,
		reply: oneshot::Sender<MatchEvent>,
	},
	RequestUndo {
		reply: oneshot::Sender<Result<UndoOutcome, Error>>,
	},
	FlushQueue,
	OpenMatch {
		match_id: Uuid,
		reply: oneshot::Sender<usize>,
	},
	UpdateClock(ClockState),
	SetAutoReconnect(bool),
	Snapshot {
		reply: oneshot::Sender<LedgerView>,
	},
	Shutdown,
}

enum State<C> {
	Offline { retry_at: Option<Instant> },
	Online(C),
}

impl<C> fmt::Debug for State<C> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Offline { retry_at } => f
				.debug_struct("Offline")
				.field("retry_scheduled", &retry_at.is_some())
				.finish(),
			Self::Online(_) => f.write_str("Online"),
		}
	}
}

enum Flow {
	Continue,
	Shutdown,
}

/// Handle to a running sync session actor. Dropping the last handle shuts
/// the actor down.
pub struct SyncSession {
	cmd_tx: mpsc::Sender<Command>,
	events_tx: broadcast::Sender<SessionEvent>,
}

impl SyncSession {
	/// Restores the persisted session record from `store` and spawns the
	/// actor. The session starts disconnected; call [`Self::connect`].
	pub async fn spawn<T, P, F, S>(
		transport: T,
		tokens: P,
		fetcher: F,
		store: S,
		config: Config,
	) -> Result<Self, Error>
	where
		T: Transport,
		T::Conn: Sync,
		P: TokenProvider,
		F: SnapshotFetcher,
		S: SessionStore,
	{
		let (cmd_tx, cmd_rx) = mpsc::channel(64);
		let (events_tx, _) = broadcast::channel(256);

		let mut ledger = Ledger::default();
		if let Some(snapshot) = persist::load(&store).await? {
			debug!(
				active_match = ?snapshot.active_match,
				live = snapshot.live.len(),
				"restored persisted session"
			);
			ledger.restore(snapshot);
		}

		let actor = Actor {
			transport,
			tokens,
			fetcher,
			store,
			config,
			ledger,
			cmd_rx,
			events_tx: events_tx.clone(),
			auto_reconnect: true,
			state: Some(State::Offline { retry_at: None }),
		};

		tokio::spawn(actor.run());

		Ok(Self { cmd_tx, events_tx })
	}

	#[must_use]
	pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
		self.events_tx.subscribe()
	}

	pub async fn connect(&self) -> Result<(), Error> {
		self.request(|reply| Command::Connect { reply }).await?
	}

	/// Logs an event optimistically; resolves as soon as the ledger holds
	/// it, before any network round trip.
	pub async fn log_event(&self, draft: EventDraft) -> Result<MatchEvent, Error> {
		self.request(|reply| Command::LogEvent { draft, reply })
			.await
	}

	/// Cancels the most recently logged, still-eligible event.
	pub async fn undo_last(&self) -> Result<UndoOutcome, Error> {
		self.request(|reply| Command::RequestUndo { reply }).await?
	}

	/// Makes `match_id` the active session and hydrates it from the
	/// server snapshot. Returns the number of fetched events.
	pub async fn open_match(&self, match_id: Uuid) -> Result<usize, Error> {
		self.request(|reply| Command::OpenMatch { match_id, reply })
			.await
	}

	pub async fn flush_queue(&self) -> Result<(), Error> {
		self.send(Command::FlushQueue).await
	}

	pub async fn update_clock(&self, clock: ClockState) -> Result<(), Error> {
		self.send(Command::UpdateClock(clock)).await
	}

	/// Suppresses or re-enables automatic reconnection. Reserved for
	/// deterministic tests and manual control.
	pub async fn set_auto_reconnect(&self, enabled: bool) -> Result<(), Error> {
		self.send(Command::SetAutoReconnect(enabled)).await
	}

	pub async fn snapshot(&self) -> Result<LedgerView, Error> {
		self.request(|reply| Command::Snapshot { reply }).await
	}

	/// Tears the session down after persisting the current state.
	pub async fn shutdown(&self) -> Result<(), Error> {
		self.send(Command::Shutdown).await
	}

	async fn send(&self, command: Command) -> Result<(), Error> {
		self.cmd_tx
			.send(command)
			.await
			.map_err(|_| Error::SessionClosed)
	}

	async fn request<R>(
		&self,
		make: impl FnOnce(oneshot::Sender<R>) -> Command,
	) -> Result<R, Error> {
		let (reply, response) = oneshot::channel();
		self.send(make(reply)).await?;

		response.await.map_err(|_| Error::SessionClosed)
	}
}

struct Actor<T: Transport, P, F, S> {
	transport: T,
	tokens: P,
	fetcher: F,
	store: S,
	config: Config,
	ledger: Ledger,
	cmd_rx: mpsc::Receiver<Command>,
	events_tx: broadcast::Sender<SessionEvent>,
	/// Cleared by `SetAutoReconnect(false)`; an explicit connect turns it
	/// back on.
	auto_reconnect: bool,
	state: Option<State<T::Conn>>,
}

enum OnlineWake {
	Command(Option<Command>),
	Inbound(Option<Result<Value, TransportError>>),
}

impl<T, P, F, S> Actor<T, P, F, S>
where
	T: Transport,
	P: TokenProvider,
	F: SnapshotFetcher,
	S: SessionStore,
{
	async fn run(mut self) {
		loop {
			match self.tick().await {
				Flow::Continue => {}
				Flow::Shutdown => break,
			}
		}

		debug!("sync channel actor stopped");
	}

	#[instrument(skip(self), fields(state = ?self.state))]
	async fn tick(&mut self) -> Flow {
		let (state, flow) = match self
			.state
			.take()
			.expect("sync channel actor in inconsistent state")
		{
			State::Offline { retry_at } => self.offline_transition(retry_at).await,
			State::Online(conn) => self.online_transition(conn).await,
		};

		self.state = Some(state);

		flow
	}

	async fn offline_transition(
		&mut self,
		retry_at: Option<Instant>,
	) -> (State<T::Conn>, Flow) {
		let command = if let Some(at) = retry_at {
			tokio::select! {
				command = self.cmd_rx.recv() => command,
				() = sleep_until(at) => {
					return (self.scheduled_reconnect().await, Flow::Continue);
				}
			}
		} else {
			self.cmd_rx.recv().await
		};

		match command {
			Some(command) => self.handle_offline_command(command, retry_at).await,
			None => (State::Offline { retry_at }, Flow::Shutdown),
		}
	}

	async fn online_transition(&mut self, mut conn: T::Conn) -> (State<T::Conn>, Flow) {
		let wake = tokio::select! {
			command = self.cmd_rx.recv() => OnlineWake::Command(command),
			inbound = conn.recv() => OnlineWake::Inbound(inbound),
		};

		match wake {
			OnlineWake::Command(Some(command)) => self.handle_online_command(command, conn).await,
			OnlineWake::Command(None) => (State::Offline { retry_at: None }, Flow::Shutdown),
			OnlineWake::Inbound(Some(Ok(frame))) => {
				self.handle_inbound(frame).await;
				(State::Online(conn), Flow::Continue)
			}
			OnlineWake::Inbound(Some(Err(e))) => {
				// logged only; the closure that follows corrects state
				error!(%e, "channel error");
				(State::Online(conn), Flow::Continue)
			}
			OnlineWake::Inbound(None) => (self.on_close().await, Flow::Continue),
		}
	}

	async fn handle_offline_command(
		&mut self,
		command: Command,
		retry_at: Option<Instant>,
	) -> (State<T::Conn>, Flow) {
		match command {
			Command::Connect { reply } => match self.open_channel().await {
				Ok(mut conn) => {
					self.auto_reconnect = true;
					self.on_connected(&mut conn).await;
					let _ = reply.send(Ok(()));

					(State::Online(conn), Flow::Continue)
				}
				Err(e) => {
					// usually non-transient (missing credential), so the
					// caller must re-invoke; no retry is scheduled
					error!(%e, "connect failed");
					let _ = reply.send(Err(e));

					(State::Offline { retry_at }, Flow::Continue)
				}
			},
			Command::LogEvent { draft, reply } => {
				let event = self.ledger.create_event(draft);
				self.emit(SessionEvent::EventLogged(event.clone()));
				let _ = reply.send(event.clone());

				// no transmission attempt while disconnected
				self.ledger.enqueue(event);
				self.persist().await;

				(State::Offline { retry_at }, Flow::Continue)
			}
			Command::RequestUndo { reply } => {
				match self.ledger.request_undo_offline() {
					Ok(event) => {
						self.emit(SessionEvent::UndoConfirmed(event.clone()));
						self.persist().await;
						let _ = reply.send(Ok(UndoOutcome::Local(event)));
					}
					Err(e) => {
						let _ = reply.send(Err(e));
					}
				}

				(State::Offline { retry_at }, Flow::Continue)
			}
			Command::FlushQueue => {
				debug!("flush requested while disconnected, ignoring");

				(State::Offline { retry_at }, Flow::Continue)
			}
			Command::OpenMatch { match_id, reply } => {
				let count = self.open_match(match_id).await;
				let _ = reply.send(count);
				self.persist().await;

				(State::Offline { retry_at }, Flow::Continue)
			}
			Command::UpdateClock(clock) => {
				self.ledger.set_clock(clock);
				self.persist().await;

				(State::Offline { retry_at }, Flow::Continue)
			}
			Command::SetAutoReconnect(enabled) => {
				self.auto_reconnect = enabled;
				let retry_at = if enabled { retry_at } else { None };

				(State::Offline { retry_at }, Flow::Continue)
			}
			Command::Snapshot { reply } => {
				let _ = reply.send(self.view(false));

				(State::Offline { retry_at }, Flow::Continue)
			}
			Command::Shutdown => {
				self.persist().await;

				(State::Offline { retry_at }, Flow::Shutdown)
			}
		}
	}

	async fn handle_online_command(
		&mut self,
		command: Command,
		mut conn: T::Conn,
	) -> (State<T::Conn>, Flow) {
		match command {
			Command::Connect { reply } => {
				let _ = reply.send(Ok(()));
			}
			Command::LogEvent { draft, reply } => {
				// the optimistic step happens regardless of what the
				// transmission below does
				let event = self.ledger.create_event(draft);
				self.emit(SessionEvent::EventLogged(event.clone()));
				let _ = reply.send(event.clone());

				self.transmit_event(&mut conn, event).await;
				self.persist().await;
			}
			Command::RequestUndo { reply } => {
				match self.ledger.request_undo() {
					Ok(UndoPlan::Local(event)) => {
						self.emit(SessionEvent::UndoConfirmed(event.clone()));
						self.persist().await;
						let _ = reply.send(Ok(UndoOutcome::Local(event)));
					}
					Ok(UndoPlan::Remote(undo)) => {
						let key = undo.client_id;
						let sent = match serde_json::to_value(&undo) {
							Ok(frame) => conn.send(frame).await.map_err(Error::from),
							Err(e) => Err(Error::from(e)),
						};

						match sent {
							Ok(()) => {
								let _ = reply.send(Ok(UndoOutcome::Requested(key)));
							}
							Err(e) => {
								// roll the registration back so the event
								// is not stranded outside queue and pending
								if let Some(entry) = self.ledger.reject_pending(key) {
									if entry.event.server_id.is_none() {
										self.ledger.enqueue(entry.event);
									}
								}

								let _ = reply.send(Err(Error::Undo(format!(
									"undo command failed to send: {e}"
								))));
							}
						}

						self.persist().await;
					}
					Err(e) => {
						let _ = reply.send(Err(e));
					}
				}
			}
			Command::FlushQueue => {
				self.flush(&mut conn).await;
				self.persist().await;
			}
			Command::OpenMatch { match_id, reply } => {
				let count = self.open_match(match_id).await;
				let _ = reply.send(count);

				// anything already queued for this match can go out now
				self.flush(&mut conn).await;
				self.persist().await;
			}
			Command::UpdateClock(clock) => {
				self.ledger.set_clock(clock);
				self.persist().await;
			}
			Command::SetAutoReconnect(enabled) => {
				self.auto_reconnect = enabled;
			}
			Command::Snapshot { reply } => {
				let _ = reply.send(self.view(true));
			}
			Command::Shutdown => {
				self.persist().await;

				return (State::Online(conn), Flow::Shutdown);
			}
		}

		(State::Online(conn), Flow::Continue)
	}

	async fn handle_inbound(&mut self, frame: Value) {
		let inbound = match protocol::parse_inbound(frame) {
			Ok(inbound) => inbound,
			Err(e) => {
				// malformed input never touches the ledger
				warn!(%e, "dropping malformed inbound message");
				return;
			}
		};

		match inbound {
			Inbound::Ack(result) => {
				match self.ledger.apply_ack(&result) {
					AckOutcome::Confirmed(event) => {
						debug!(client_id = %event.client_id, "event confirmed");
						self.emit(SessionEvent::EventConfirmed(event));
					}
					AckOutcome::Duplicate(info) => {
						debug!(event_id = ?info.event_id, "server reported a duplicate");
						self.emit(SessionEvent::DuplicateDetected(info));
					}
					AckOutcome::Requeued(key) => {
						self.emit(SessionEvent::EventRequeued(key));
					}
					AckOutcome::UndoConfirmed(event) => {
						self.emit(SessionEvent::UndoConfirmed(event));
					}
					AckOutcome::UndoNotFound => {
						warn!("undo target not found on the server");
						self.emit(SessionEvent::UndoNotFound);
					}
					AckOutcome::AlreadyResolved(key) => {
						warn!(?key, "ack for an unknown or already-resolved entry");
					}
				}

				self.persist().await;
			}
			Inbound::Broadcast(event) => {
				self.emit(SessionEvent::RemoteEvent((*event).clone()));
				self.ledger.merge_confirmed(*event);
				self.persist().await;
			}
			Inbound::EventUndone {
				event_id,
				client_id,
			} => {
				self.ledger.apply_remote_undo(event_id.as_deref(), client_id);
				self.emit(SessionEvent::RemoteUndo {
					event_id,
					client_id,
				});
				self.persist().await;
			}
		}
	}

	async fn open_channel(&mut self) -> Result<T::Conn, Error> {
		let token = self.tokens.get_token().await?;

		Ok(self.transport.connect(&token).await?)
	}

	async fn scheduled_reconnect(&mut self) -> State<T::Conn> {
		match self.open_channel().await {
			Ok(mut conn) => {
				self.on_connected(&mut conn).await;

				State::Online(conn)
			}
			Err(e) => {
				warn!(%e, "reconnect attempt failed, trying again at the same interval");

				State::Offline {
					retry_at: Some(Instant::now() + self.config.reconnect_interval),
				}
			}
		}
	}

	async fn on_connected(&mut self, conn: &mut T::Conn) {
		debug!("channel connected");
		self.emit(SessionEvent::Connected);
		self.flush(conn).await;
		self.persist().await;
	}

	async fn on_close(&mut self) -> State<T::Conn> {
		let demoted = self.ledger.demote_all_pending();
		warn!(demoted = demoted.len(), "channel closed");
		self.emit(SessionEvent::Disconnected);
		self.persist().await;

		let retry_at = self
			.auto_reconnect
			.then(|| Instant::now() + self.config.reconnect_interval);

		State::Offline { retry_at }
	}

	/// Replays everything queued for the active match that is not already
	/// in flight. Only meaningful while connected.
	async fn flush(&mut self, conn: &mut T::Conn) {
		let Some(match_id) = self.ledger.active_match() else {
			return;
		};

		let replay = self
			.ledger
			.queued(match_id)
			.iter()
			.filter(|event| !self.ledger.is_pending(event.client_id))
			.cloned()
			.collect::<Vec<_>>();

		if replay.is_empty() {
			return;
		}

		let mut sent = 0_usize;

		for event in replay {
			let frame = match serde_json::to_value(&event) {
				Ok(frame) => frame,
				Err(e) => {
					error!(%e, client_id = %event.client_id, "failed to serialize queued event");
					continue;
				}
			};

			match conn.send(frame).await {
				Ok(()) => {
					self.ledger.register_pending(event, PendingOrigin::Replayed);
					sent += 1;
				}
				Err(e) => {
					// the rest stays queued; the closure that follows a
					// broken channel corrects state
					warn!(%e, "flush send failed, leaving the rest queued");
					break;
				}
			}
		}

		if sent > 0 {
			debug!(count = sent, "replayed offline queue");
			self.emit(SessionEvent::QueueFlushed(sent));
		}
	}

	async fn transmit_event(&mut self, conn: &mut T::Conn, event: MatchEvent) {
		let frame = match serde_json::to_value(&event) {
			Ok(frame) => frame,
			Err(e) => {
				error!(%e, client_id = %event.client_id, "failed to serialize event");
				self.ledger.enqueue(event);
				return;
			}
		};

		match conn.send(frame).await {
			Ok(()) => self.ledger.register_pending(event, PendingOrigin::Fresh),
			Err(e) => {
				// recovered locally: the event falls back to the queue and
				// is retried on the next flush
				warn!(%e, client_id = %event.client_id, "send failed, event queued");
				self.ledger.enqueue(event);
			}
		}
	}

	async fn open_match(&mut self, match_id: Uuid) -> usize {
		self.ledger.set_active_match(match_id);

		match self.fetcher.events_since(match_id).await {
			Ok(confirmed) => {
				let count = confirmed.len();
				self.ledger.hydrate(match_id, confirmed);
				self.emit(SessionEvent::Hydrated { match_id, count });

				count
			}
			Err(e) => {
				warn!(%e, "hydration fetch failed, continuing with local state only");

				0
			}
		}
	}

	fn view(&self, connected: bool) -> LedgerView {
		LedgerView {
			connected,
			live: self.ledger.live().to_vec(),
			queued: self
				.ledger
				.active_match()
				.map_or_else(Vec::new, |match_id| self.ledger.queued(match_id).to_vec()),
			pending: self.ledger.pending_keys(),
			undo_stack: self.ledger.undo_candidates().to_vec(),
			duplicates: self.ledger.duplicates().clone(),
			clock: self.ledger.clock().clone(),
		}
	}

	async fn persist(&self) {
		if let Err(e) = persist::save(&self.store, &self.ledger.snapshot()).await {
			warn!(%e, "failed to persist session snapshot");
		}
	}

	fn emit(&self, event: SessionEvent) {
		// no receivers is fine
		let _ = self.events_tx.send(event);
	}
}

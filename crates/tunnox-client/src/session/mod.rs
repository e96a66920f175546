//! The control session: one persistent, multiplexed link to the rendezvous
//! server. Owns the handshake, the heartbeat, request/response correlation,
//! push dispatch, and the reconnect policy. This is the only component that
//! reads from or writes to the control pipeline.

mod api;
mod inflight;
mod push;
mod state;

use std::{
	sync::{
		Arc, Mutex,
		atomic::{AtomicBool, AtomicU64, Ordering},
	},
	time::Duration,
};

use arc_swap::{ArcSwap, ArcSwapOption};
pub use inflight::InflightTable;
pub use push::{PushFuture, PushHandler, PushRegistry};
use snafu::prelude::*;
pub use state::SessionState;
use tokio::{
	sync::{Notify, watch},
	time::Instant,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};
use tunnox_proto::{
	Command, CommandKind, Packet, PacketKind,
	payload::{HandshakeRequest, HandshakeResponse, KickNotice, REASON_DUPLICATE_LOGIN},
};
use tunnox_stream::{FactoryConfig, StreamFactory, StreamProcessor};
use tunnox_transport::{DialOpts, ServerAddr, TransportKind};

use crate::{
	ClientError, ConfigStore, DeadlineSnafu, Identity, KickedSnafu, NotConnectedSnafu, Result,
	StoppedSnafu,
};

pub struct SessionOpts {
	pub server_addr:         ServerAddr,
	pub transport:           TransportKind,
	pub dial:                DialOpts,
	pub pipeline:            FactoryConfig,
	pub handshake_timeout:   Duration,
	pub heartbeat_interval:  Duration,
	pub heartbeat_miss_limit: u32,
	pub request_timeout:     Duration,
	pub reconnect_base:      Duration,
	pub reconnect_cap:       Duration,
	pub capabilities:        Vec<String>,
}

impl SessionOpts {
	pub fn new(server_addr: ServerAddr, transport: TransportKind) -> Self {
		SessionOpts {
			server_addr,
			transport,
			dial: DialOpts::default(),
			pipeline: FactoryConfig::default(),
			handshake_timeout: Duration::from_secs(10),
			heartbeat_interval: Duration::from_secs(30),
			heartbeat_miss_limit: 3,
			request_timeout: Duration::from_secs(30),
			reconnect_base: Duration::from_secs(2),
			reconnect_cap: Duration::from_secs(60),
			capabilities: Vec::new(),
		}
	}
}

/// What knocked a connected session over.
enum Outcome {
	Stop,
	Kicked(String),
	Reconnect(ClientError),
}

pub struct ControlSession {
	opts:              SessionOpts,
	factory:           StreamFactory,
	identity:          ArcSwap<Identity>,
	store:             Option<Arc<dyn ConfigStore>>,
	state_tx:          watch::Sender<SessionState>,
	/// Bumped on every successful (re)connect; waiters and callbacks keyed
	/// by an older generation self-cancel.
	generation:        AtomicU64,
	inflight:          InflightTable,
	pushes:            PushRegistry,
	conn:              ArcSwapOption<StreamProcessor>,
	reconnect_pending: AtomicBool,
	reconnect_notify:  Notify,
	root:              CancellationToken,
	tasks:             TaskTracker,
	last_inbound:      Mutex<Instant>,
	kicked_reason:     Mutex<Option<String>>,
}

impl ControlSession {
	pub fn new(opts: SessionOpts, identity: Identity, store: Option<Arc<dyn ConfigStore>>) -> Arc<Self> {
		let (state_tx, _) = watch::channel(SessionState::Disconnected);
		let factory = StreamFactory::new(opts.pipeline.clone());
		Arc::new(ControlSession {
			opts,
			factory,
			identity: ArcSwap::from_pointee(identity),
			store,
			state_tx,
			generation: AtomicU64::new(0),
			inflight: InflightTable::default(),
			pushes: PushRegistry::default(),
			conn: ArcSwapOption::empty(),
			reconnect_pending: AtomicBool::new(false),
			reconnect_notify: Notify::new(),
			root: CancellationToken::new(),
			tasks: TaskTracker::new(),
			last_inbound: Mutex::new(Instant::now()),
			kicked_reason: Mutex::new(None),
		})
	}

	pub fn state(&self) -> SessionState {
		*self.state_tx.borrow()
	}

	pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
		self.state_tx.subscribe()
	}

	pub fn is_connected(&self) -> bool {
		self.state() == SessionState::Connected
	}

	pub fn generation(&self) -> u64 {
		self.generation.load(Ordering::SeqCst)
	}

	pub fn identity(&self) -> Arc<Identity> {
		self.identity.load_full()
	}

	pub fn inflight_len(&self) -> usize {
		self.inflight.len()
	}

	pub fn kicked_reason(&self) -> Option<String> {
		self.kicked_reason.lock().expect("reason poisoned").clone()
	}

	pub fn cancel_token(&self) -> &CancellationToken {
		&self.root
	}

	pub fn register_push(&self, kind: CommandKind, handler: Arc<dyn PushHandler>) {
		self.pushes.install(kind, handler);
	}

	fn set_state(&self, next: SessionState) {
		let prev = self.state_tx.send_replace(next);
		if prev != next {
			info!(target: "[SESSION]", "state {prev} -> {next}");
		}
	}

	fn touch_inbound(&self) {
		*self.last_inbound.lock().expect("clock poisoned") = Instant::now();
	}

	/// Time since the peer last produced any traffic; the watchdog uses this
	/// to decide an out-of-band reconnect is warranted.
	pub fn inbound_idle(&self) -> Duration {
		self.last_inbound.lock().expect("clock poisoned").elapsed()
	}

	/// Dial, handshake, and start the supervision loop. A transient failure
	/// on the first attempt does not surface: the session parks in
	/// Reconnecting and walks the same backoff ladder as any later
	/// disconnect. Only non-retryable failures (bad parameters, kick, stop)
	/// reach the caller.
	pub async fn connect(self: &Arc<Self>) -> Result<()> {
		match self.state() {
			SessionState::Stopped => return StoppedSnafu.fail(),
			SessionState::Kicked => {
				let reason = self.kicked_reason().unwrap_or_else(|| "kicked".into());
				return KickedSnafu { reason }.fail();
			}
			SessionState::Disconnected => {}
			// Already running in some live state.
			_ => return Ok(()),
		}

		match self.establish().await {
			Ok(conn) => {
				let session = self.clone();
				self.tasks.spawn(async move {
					session.supervise(conn).await;
				});
				Ok(())
			}
			Err(e @ (ClientError::Kicked { .. } | ClientError::Cancelled | ClientError::Stopped)) => {
				Err(e)
			}
			Err(e @ ClientError::InvalidParameter { .. }) => {
				// Never retried; a bad address stays bad.
				self.set_state(SessionState::Disconnected);
				Err(e)
			}
			Err(cause) => {
				warn!(target: "[SESSION]", "first connect failed: {cause}; retrying in the background");
				self.set_state(SessionState::Reconnecting);
				let session = self.clone();
				self.tasks.spawn(async move {
					if let Some(conn) = session.reconnect_with_backoff().await {
						session.supervise(conn).await;
					}
				});
				Ok(())
			}
		}
	}

	/// One dial + handshake pass: Connecting -> Handshaking -> Connected.
	async fn establish(self: &Arc<Self>) -> Result<Arc<StreamProcessor>> {
		self.set_state(SessionState::Connecting);
		let stream = tunnox_transport::dial(self.opts.transport, &self.opts.server_addr, &self.opts.dial, &self.root)
			.await
			.map_err(ClientError::from_transport)?;

		self.set_state(SessionState::Handshaking);
		let conn = self
			.factory
			.wrap(stream, self.root.child_token())
			.map_err(ClientError::from_stream)?;

		if let Err(e) = self.handshake(&conn).await {
			conn.close().await;
			return Err(e);
		}

		self.conn.store(Some(conn.clone()));
		self.generation.fetch_add(1, Ordering::SeqCst);
		self.touch_inbound();
		self.set_state(SessionState::Connected);
		info!(
			target: "[SESSION]",
			"connected to {} as client {} (gen {})",
			self.opts.server_addr,
			self.identity.load().client_id,
			self.generation()
		);
		Ok(conn)
	}

	async fn handshake(&self, conn: &Arc<StreamProcessor>) -> Result<()> {
		let identity = self.identity.load_full();
		let request = HandshakeRequest {
			device_id:    identity.device_id.clone(),
			client_id:    identity.client_id,
			secret_key:   identity.secret_key.clone(),
			capabilities: self.opts.capabilities.clone(),
		};
		let body = serde_json::to_vec(&request).map_err(|e| ClientError::Protocol { source: Box::new(e) })?;
		conn.write_packet(&Packet::new(PacketKind::Handshake, body.into()), false)
			.await
			.map_err(ClientError::from_stream)?;

		let response = tokio::time::timeout(self.opts.handshake_timeout, conn.read_packet())
			.await
			.map_err(|_| ClientError::Network {
				source: Box::new(std::io::Error::new(
					std::io::ErrorKind::TimedOut,
					"handshake timed out",
				)),
			})?
			.map_err(ClientError::from_stream)?;

		if response.kind != PacketKind::HandshakeResp {
			return Err(ClientError::Protocol {
				source: format!("expected handshake response, got {:?}", response.kind).into(),
			});
		}
		let accepted: HandshakeResponse = serde_json::from_slice(&response.body)
			.map_err(|e| ClientError::Protocol { source: Box::new(e) })?;

		if !accepted.accepted {
			let reason = accepted.reason.unwrap_or_else(|| "rejected".into());
			if reason == REASON_DUPLICATE_LOGIN {
				self.mark_kicked(&reason);
				return KickedSnafu { reason }.fail();
			}
			return crate::AuthSnafu { reason }.fail();
		}

		if accepted.client_id != 0
			&& (accepted.client_id != identity.client_id || accepted.secret_key != identity.secret_key)
		{
			let updated = Identity {
				client_id:  accepted.client_id,
				secret_key: accepted.secret_key,
				device_id:  identity.device_id.clone(),
			};
			info!(target: "[SESSION]", "server assigned client id {}", updated.client_id);
			self.identity.store(Arc::new(updated.clone()));
			if let Some(store) = &self.store {
				if let Err(e) = store.save_identity(&updated) {
					warn!(target: "[SESSION]", "persisting identity failed: {e}");
				}
			}
		}
		Ok(())
	}

	fn mark_kicked(&self, reason: &str) {
		*self.kicked_reason.lock().expect("reason poisoned") = Some(reason.to_string());
		self.set_state(SessionState::Kicked);
	}

	/// Runs for the life of the session: pump the connected link, then walk
	/// the backoff ladder until a handshake lands or the session ends.
	async fn supervise(self: Arc<Self>, mut conn: Arc<StreamProcessor>) {
		loop {
			let generation = self.generation();
			let outcome = self.run_connected(&conn, generation).await;
			conn.close().await;
			self.conn.store(None);

			match outcome {
				Outcome::Stop => break,
				Outcome::Kicked(reason) => {
					self.inflight.fail_all(|| ClientError::Kicked { reason: reason.clone() });
					break;
				}
				Outcome::Reconnect(cause) => {
					if self.root.is_cancelled() {
						break;
					}
					warn!(target: "[SESSION]", "connection lost (gen {generation}): {cause}");
					self.set_state(SessionState::Reconnecting);
					self.inflight.fail_generation(generation, || ClientError::Reconnected);
					self.reconnect_pending.store(false, Ordering::SeqCst);

					match self.reconnect_with_backoff().await {
						Some(next) => conn = next,
						None => break,
					}
				}
			}
		}
	}

	/// Exponential backoff, doubling from base to cap, reset by success.
	async fn reconnect_with_backoff(self: &Arc<Self>) -> Option<Arc<StreamProcessor>> {
		let mut backoff = self.opts.reconnect_base;
		loop {
			debug!(target: "[SESSION]", "retrying in {backoff:?}");
			tokio::select! {
				_ = self.root.cancelled() => return None,
				_ = tokio::time::sleep(backoff) => {}
			}
			match self.establish().await {
				Ok(conn) => return Some(conn),
				Err(ClientError::Kicked { reason }) => {
					self.inflight.fail_all(|| ClientError::Kicked { reason: reason.clone() });
					return None;
				}
				Err(ClientError::Cancelled) | Err(ClientError::Stopped) => return None,
				Err(e) => {
					warn!(target: "[SESSION]", "reconnect attempt failed: {e}");
					self.set_state(SessionState::Reconnecting);
					backoff = (backoff * 2).min(self.opts.reconnect_cap);
				}
			}
		}
	}

	async fn run_connected(self: &Arc<Self>, conn: &Arc<StreamProcessor>, generation: u64) -> Outcome {
		tokio::select! {
			_ = self.root.cancelled() => Outcome::Stop,
			outcome = self.read_loop(conn, generation) => outcome,
			outcome = self.heartbeat_loop(conn) => outcome,
			_ = self.reconnect_notify.notified() => {
				info!(target: "[SESSION]", "out-of-band reconnect requested");
				Outcome::Reconnect(ClientError::Network {
					source: Box::new(std::io::Error::other("reconnect requested")),
				})
			}
		}
	}

	async fn read_loop(self: &Arc<Self>, conn: &Arc<StreamProcessor>, generation: u64) -> Outcome {
		loop {
			match conn.read_packet().await {
				Ok(packet) => {
					self.touch_inbound();
					if let Some(outcome) = self.dispatch(packet, generation) {
						return outcome;
					}
				}
				Err(tunnox_stream::StreamError::Cancelled) => return Outcome::Stop,
				Err(e) => return Outcome::Reconnect(ClientError::from_stream(e)),
			}
		}
	}

	/// Correlate responses strictly by command id; the kind octet does not
	/// distinguish request from response, servers use either. Uncorrelated
	/// command frames are pushes.
	fn dispatch(self: &Arc<Self>, packet: Packet, generation: u64) -> Option<Outcome> {
		match packet.kind {
			PacketKind::Heartbeat => None,
			PacketKind::JsonCommand | PacketKind::CommandResp => {
				let Some(command) = packet.command else {
					warn!(target: "[SESSION]", "command frame without a body");
					return None;
				};
				let result = response_result(&command);
				if self.inflight.complete(&command.command_id, result) {
					return None;
				}
				if !command.command_type.is_push() {
					// A reply whose waiter already timed out or got drained.
					debug!(target: "[SESSION]", "orphaned response `{}`", command.command_id);
					return None;
				}
				self.dispatch_push(command, generation)
			}
			kind => {
				// Tunnel frames never ride the control connection.
				warn!(target: "[SESSION]", "unexpected {kind:?} on control connection");
				None
			}
		}
	}

	fn dispatch_push(self: &Arc<Self>, command: Command, generation: u64) -> Option<Outcome> {
		if command.command_type == CommandKind::KickClient {
			let reason = serde_json::from_str::<KickNotice>(&command.command_body)
				.map(|k| k.reason)
				.unwrap_or_else(|_| "kicked".into());
			self.mark_kicked(&reason);
			return Some(Outcome::Kicked(reason));
		}

		match self.pushes.get(command.command_type) {
			Some(handler) => {
				let session = self.clone();
				let fut = handler.handle(command);
				self.tasks.spawn(async move {
					// A push handler that outlives its generation self-cancels.
					if session.generation() != generation {
						return;
					}
					fut.await;
				});
			}
			None => debug!(target: "[SESSION]", "no handler for push {:?}", command.command_type),
		}
		None
	}

	async fn heartbeat_loop(&self, conn: &Arc<StreamProcessor>) -> Outcome {
		let mut ticker = tokio::time::interval(self.opts.heartbeat_interval);
		ticker.tick().await;
		loop {
			ticker.tick().await;
			let dead_after = self.opts.heartbeat_interval * self.opts.heartbeat_miss_limit;
			if self.inbound_idle() > dead_after {
				return Outcome::Reconnect(ClientError::Network {
					source: Box::new(std::io::Error::new(
						std::io::ErrorKind::TimedOut,
						"peer silent past heartbeat budget",
					)),
				});
			}
			match conn.write_packet(&Packet::heartbeat(), false).await {
				Ok(()) => {}
				Err(tunnox_stream::StreamError::Cancelled) => return Outcome::Stop,
				Err(e) => return Outcome::Reconnect(ClientError::from_stream(e)),
			}
		}
	}

	/// Out-of-band reconnect request (the CLI watchdog). Deduplicated so
	/// only one reconnect is ever in flight.
	pub fn request_reconnect(&self) {
		if self.state() == SessionState::Connected
			&& !self.reconnect_pending.swap(true, Ordering::SeqCst)
		{
			self.reconnect_notify.notify_one();
		}
	}

	/// Issue one command and block until its echoed command id comes back.
	pub async fn request(&self, kind: CommandKind, body: impl Into<String>) -> Result<String> {
		self.request_with_timeout(kind, body.into(), self.opts.request_timeout).await
	}

	pub async fn request_with_timeout(
		&self,
		kind: CommandKind,
		body: String,
		timeout: Duration,
	) -> Result<String> {
		ensure!(self.is_connected(), NotConnectedSnafu);
		let conn = self.conn.load_full().context(NotConnectedSnafu)?;
		let identity = self.identity.load();

		let command_id = Command::fresh_id();
		let command = Command::new(
			kind,
			command_id.clone(),
			identity.secret_key.clone(),
			identity.client_id.to_string(),
			"server",
			body,
		);
		let receiver = self.inflight.register(&command_id, self.generation());

		let packet = Packet::command(PacketKind::JsonCommand, command);
		if let Err(e) = conn.write_packet(&packet, self.factory.compression()).await {
			self.inflight.forget(&command_id);
			return Err(ClientError::from_stream(e));
		}

		match tokio::time::timeout(timeout, receiver).await {
			Err(_) => {
				self.inflight.forget(&command_id);
				DeadlineSnafu { command_id }.fail()
			}
			// Waiter dropped without a verdict: the session went away.
			Ok(Err(_)) => Err(ClientError::Cancelled),
			Ok(Ok(result)) => result,
		}
	}

	/// Reply to a push, echoing its command id so the server can correlate.
	pub async fn respond(&self, original: &Command, body: impl Into<String>) -> Result<()> {
		let conn = self.conn.load_full().context(NotConnectedSnafu)?;
		let identity = self.identity.load();
		let reply = Command::new(
			original.command_type,
			original.command_id.clone(),
			String::new(),
			identity.client_id.to_string(),
			original.sender_id.clone(),
			body,
		);
		conn.write_packet(&Packet::command(PacketKind::CommandResp, reply), self.factory.compression())
			.await
			.map_err(ClientError::from_stream)
	}

	/// Leave `Kicked`; the only way back to `Disconnected` from there.
	pub fn reset(&self) {
		if self.state() == SessionState::Kicked {
			*self.kicked_reason.lock().expect("reason poisoned") = None;
			self.set_state(SessionState::Disconnected);
		}
	}

	/// Cancel everything, fail every waiter, and wait for the loops to exit.
	pub async fn stop(&self) {
		if self.state() == SessionState::Stopped {
			return;
		}
		self.set_state(SessionState::Stopped);
		self.root.cancel();
		if let Some(conn) = self.conn.swap(None) {
			conn.close().await;
		}
		self.inflight.fail_all(|| ClientError::Cancelled);
		self.pushes.clear();
		self.tasks.close();
		self.tasks.wait().await;
		info!(target: "[SESSION]", "stopped");
	}
}

/// A response body carrying `{"error": "..."}` is a carried failure; any
/// other body is delivered verbatim.
fn response_result(command: &Command) -> Result<String> {
	if let Ok(value) = serde_json::from_str::<serde_json::Value>(&command.command_body) {
		if let Some(message) = value.get("error").and_then(|e| e.as_str()) {
			if !message.is_empty() {
				return Err(ClientError::Remote { message: message.to_string() });
			}
		}
	}
	Ok(command.command_body.clone())
}

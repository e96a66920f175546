//! The tunnel broker: per-mapping listeners, per-flow tunnel connections,
//! and the accounting the quota enforcer feeds on.

mod mapping;
mod pump;
mod udp;

use std::{
	collections::HashMap,
	sync::{
		Arc, RwLock,
		atomic::{AtomicBool, AtomicU64, Ordering},
	},
	time::Duration,
};

pub use mapping::{MappingHandle, MappingStats, TrafficSnapshot};
use snafu::prelude::*;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info, warn};
use tunnox_proto::{
	Command, CommandKind, Packet, PacketKind,
	payload::{
		Direction, HttpDomainRequest, MappingConfig, MappingProtocol, ProxyForwardRequest,
		TunnelOpenAckBody, TunnelOpenEnvelope,
	},
};
use tunnox_stream::{ProcessorOpts, StreamFactory, StreamManager, StreamProcessor};
use tunnox_transport::{DialOpts, ServerAddr, TransportKind};

use crate::{
	AlreadyExistsSnafu, ClientError, ControlSession, InvalidParameterSnafu, NotFoundSnafu,
	PushHandler, QuotaExceededSnafu, Result, derive_key, session::PushFuture,
};

pub struct BrokerOpts {
	pub server_addr:      ServerAddr,
	pub transport:        TransportKind,
	pub dial:             DialOpts,
	/// Pipeline template for tunnel connections; the encryption key is
	/// replaced per mapping with material derived from its secret.
	pub pipeline:         tunnox_stream::FactoryConfig,
	pub open_timeout:     Duration,
	pub udp_idle_timeout: Duration,
	pub sweep_interval:   Duration,
}

impl BrokerOpts {
	pub fn new(server_addr: ServerAddr, transport: TransportKind) -> Self {
		BrokerOpts {
			server_addr,
			transport,
			dial: DialOpts::default(),
			pipeline: tunnox_stream::FactoryConfig::default(),
			open_timeout: Duration::from_secs(5),
			udp_idle_timeout: Duration::from_secs(60),
			sweep_interval: Duration::from_secs(30),
		}
	}
}

pub struct TunnelBroker {
	session:      Arc<ControlSession>,
	opts:         BrokerOpts,
	mappings:     RwLock<HashMap<String, Arc<MappingHandle>>>,
	streams:      StreamManager,
	refuse_opens: AtomicBool,
	root:         CancellationToken,
	tasks:        TaskTracker,
	tunnel_seq:   AtomicU64,
}

impl TunnelBroker {
	pub fn new(session: Arc<ControlSession>, opts: BrokerOpts) -> Arc<Self> {
		// Stopping the session cascades into every listener and tunnel.
		let root = session.cancel_token().child_token();
		Arc::new(TunnelBroker {
			session,
			opts,
			mappings: RwLock::new(HashMap::new()),
			streams: StreamManager::new(),
			refuse_opens: AtomicBool::new(false),
			root,
			tasks: TaskTracker::new(),
			tunnel_seq: AtomicU64::new(0),
		})
	}

	/// Install the push handlers and the expiry sweep. Call once, before
	/// mappings are added.
	pub fn start(self: &Arc<Self>) {
		let weak = Arc::downgrade(self);
		self.session.register_push(
			CommandKind::ProxyForward,
			Arc::new(move |command: Command| -> PushFuture {
				let weak = weak.clone();
				Box::pin(async move {
					if let Some(broker) = weak.upgrade() {
						broker.handle_proxy_forward(command).await;
					}
				})
			}) as Arc<dyn PushHandler>,
		);

		let weak = Arc::downgrade(self);
		self.session.register_push(
			CommandKind::MappingUpdated,
			Arc::new(move |command: Command| -> PushFuture {
				let weak = weak.clone();
				Box::pin(async move {
					if let Some(broker) = weak.upgrade() {
						broker.handle_mapping_updated(command).await;
					}
				})
			}) as Arc<dyn PushHandler>,
		);

		let broker = self.clone();
		self.tasks.spawn(async move {
			broker.expiry_sweep().await;
		});
	}

	pub(crate) fn spawn(self: &Arc<Self>, fut: impl Future<Output = ()> + Send + 'static) {
		self.tasks.spawn(fut);
	}

	pub fn compression(&self) -> bool {
		self.opts.pipeline.enable_compression
	}

	pub(crate) fn udp_idle_timeout(&self) -> Duration {
		self.opts.udp_idle_timeout
	}

	pub fn stream_manager(&self) -> &StreamManager {
		&self.streams
	}

	pub fn cancel_token(&self) -> &CancellationToken {
		&self.root
	}

	/// Flip on when the user's quota is exhausted; new opens are refused
	/// until it clears.
	pub fn set_refuse_opens(&self, refuse: bool) {
		self.refuse_opens.store(refuse, Ordering::SeqCst);
	}

	pub fn refusing_opens(&self) -> bool {
		self.refuse_opens.load(Ordering::SeqCst)
	}

	/// Register a mapping and open its listener synchronously; a bind
	/// failure surfaces to the caller and leaves nothing registered.
	pub async fn add_mapping(self: &Arc<Self>, config: MappingConfig) -> Result<()> {
		ensure!(
			!config.mapping_id.is_empty(),
			InvalidParameterSnafu {
				what:  "mapping_id",
				value: String::new(),
			}
		);
		{
			let mappings = self.mappings.read().expect("mappings poisoned");
			ensure!(
				!mappings.contains_key(&config.mapping_id),
				AlreadyExistsSnafu { id: config.mapping_id.clone() }
			);
		}

		let handle = MappingHandle::new(config, &self.root);
		match (handle.config.direction, handle.config.protocol) {
			(Direction::Outbound, MappingProtocol::Udp) => {
				let listen = self.listen_address(&handle)?;
				let socket = UdpSocket::bind(&listen).await.map_err(|e| bind_error(&listen, e))?;
				if let Ok(addr) = socket.local_addr() {
					handle.set_bound_addr(addr);
				}
				info!(
					target: "[BROKER]",
					"mapping `{}` listening on udp {listen}",
					handle.config.mapping_id
				);
				let broker = self.clone();
				let mapping = handle.clone();
				self.tasks.spawn(async move {
					udp::run_udp_listener(broker, mapping, Arc::new(socket)).await;
				});
			}
			(Direction::Outbound, _) => {
				let listen = self.listen_address(&handle)?;
				let listener = TcpListener::bind(&listen).await.map_err(|e| bind_error(&listen, e))?;
				if let Ok(addr) = listener.local_addr() {
					handle.set_bound_addr(addr);
				}
				info!(
					target: "[BROKER]",
					"mapping `{}` listening on tcp {listen}",
					handle.config.mapping_id
				);
				let broker = self.clone();
				let mapping = handle.clone();
				self.tasks.spawn(async move {
					broker.accept_loop(mapping, listener).await;
				});
			}
			(Direction::Inbound, _) => {
				ensure!(
					handle.config.target_address.is_some(),
					InvalidParameterSnafu {
						what:  "target_address",
						value: String::new(),
					}
				);
			}
		}

		let mut mappings = self.mappings.write().expect("mappings poisoned");
		if mappings.contains_key(&handle.config.mapping_id) {
			// Lost a race with a concurrent add; tear our listener down.
			handle.cancel.cancel();
			return AlreadyExistsSnafu { id: handle.config.mapping_id.clone() }.fail();
		}
		mappings.insert(handle.config.mapping_id.clone(), handle);
		Ok(())
	}

	fn listen_address(&self, handle: &MappingHandle) -> Result<String> {
		handle
			.config
			.listen_address
			.clone()
			.context(InvalidParameterSnafu {
				what:  "listen_address",
				value: String::new(),
			})
	}

	/// Tear a mapping down: cancel its listener and every tunnel under it.
	pub fn remove_mapping(&self, mapping_id: &str) -> Result<Arc<MappingHandle>> {
		let handle = {
			let mut mappings = self.mappings.write().expect("mappings poisoned");
			mappings.remove(mapping_id)
		}
		.context(NotFoundSnafu { id: mapping_id })?;
		handle.cancel.cancel();
		info!(target: "[BROKER]", "mapping `{mapping_id}` removed");
		Ok(handle)
	}

	pub fn get_mapping(&self, mapping_id: &str) -> Result<Arc<MappingHandle>> {
		let mappings = self.mappings.read().expect("mappings poisoned");
		mappings.get(mapping_id).cloned().context(NotFoundSnafu { id: mapping_id })
	}

	pub fn list_mappings(&self) -> Vec<Arc<MappingHandle>> {
		let mappings = self.mappings.read().expect("mappings poisoned");
		mappings.values().cloned().collect()
	}

	/// Aggregated traffic across every mapping, for the quota reporter.
	pub fn total_traffic(&self) -> TrafficSnapshot {
		let mappings = self.mappings.read().expect("mappings poisoned");
		let mut total = TrafficSnapshot {
			bytes_sent:     0,
			bytes_received: 0,
			active_tunnels: 0,
		};
		for handle in mappings.values() {
			let snap = handle.stats.snapshot();
			total.bytes_sent += snap.bytes_sent;
			total.bytes_received += snap.bytes_received;
			total.active_tunnels += snap.active_tunnels;
		}
		total
	}

	/// HTTP-domain mapping: register the subdomain through the control
	/// session, then run the returned mapping like any inbound one.
	pub async fn register_http_domain(
		self: &Arc<Self>,
		subdomain: &str,
		target_address: &str,
	) -> Result<MappingConfig> {
		let checked = self.session.http_domain_check(subdomain).await?;
		ensure!(checked.available, AlreadyExistsSnafu { id: subdomain });
		let created = self
			.session
			.http_domain_create(&HttpDomainRequest {
				subdomain:      subdomain.to_string(),
				target_address: Some(target_address.to_string()),
			})
			.await?;
		let mapping = created.mapping.ok_or_else(|| ClientError::Remote {
			message: "http domain create returned no mapping".into(),
		})?;
		self.add_mapping(mapping.clone()).await?;
		Ok(mapping)
	}

	pub async fn unregister_http_domain(&self, subdomain: &str, mapping_id: &str) -> Result<()> {
		self.session.http_domain_delete(subdomain).await?;
		self.remove_mapping(mapping_id)?;
		Ok(())
	}

	async fn accept_loop(self: Arc<Self>, mapping: Arc<MappingHandle>, listener: TcpListener) {
		loop {
			let accepted = tokio::select! {
				_ = mapping.cancel.cancelled() => break,
				res = listener.accept() => res,
			};
			let (stream, peer) = match accepted {
				Ok(v) => v,
				Err(e) => {
					warn!(
						target: "[BROKER]",
						"accept on `{}` failed: {e}",
						mapping.config.mapping_id
					);
					break;
				}
			};
			if self.refusing_opens() {
				warn!(target: "[BROKER]", "quota exhausted, refusing flow from {peer}");
				continue;
			}
			let broker = self.clone();
			let mapping = mapping.clone();
			self.tasks.spawn(async move {
				if let Err(e) = broker.run_outbound_flow(mapping.clone(), stream).await {
					if !matches!(e, ClientError::Cancelled) {
						warn!(
							target: "[BROKER]",
							"flow from {peer} on `{}` failed: {e}",
							mapping.config.mapping_id
						);
					}
				}
			});
		}
	}

	async fn run_outbound_flow(
		self: &Arc<Self>,
		mapping: Arc<MappingHandle>,
		stream: TcpStream,
	) -> Result<()> {
		let flow_cancel = mapping.cancel.child_token();
		let local = Arc::new(StreamProcessor::new(
			stream,
			ProcessorOpts::default(),
			flow_cancel.child_token(),
		));
		let tunnel = self.open_tunnel_with(&mapping, &flow_cancel).await?;
		pump::run_pump(local, tunnel.clone(), mapping.stats.clone(), self.compression(), flow_cancel)
			.await;
		self.release_tunnel(&tunnel).await;
		Ok(())
	}

	/// Inbound push: the server wants a tunnel toward this client's target.
	async fn handle_proxy_forward(self: &Arc<Self>, command: Command) {
		let request: ProxyForwardRequest = match serde_json::from_str(&command.command_body) {
			Ok(request) => request,
			Err(e) => {
				warn!(target: "[BROKER]", "malformed proxy-forward push: {e}");
				return;
			}
		};
		let verdict = self.validate_forward(&request);
		let reply = match &verdict {
			Ok(_) => serde_json::json!({ "accepted": true }).to_string(),
			Err(e) => serde_json::json!({ "error": e.to_string() }).to_string(),
		};
		if let Err(e) = self.session.respond(&command, reply).await {
			warn!(target: "[BROKER]", "proxy-forward ack failed: {e}");
		}
		let Ok(mapping) = verdict else { return };

		if let Err(e) = self.run_inbound_flow(mapping.clone(), &request.tunnel_id).await {
			if !matches!(e, ClientError::Cancelled) {
				warn!(
					target: "[BROKER]",
					"inbound flow on `{}` failed: {e}",
					mapping.config.mapping_id
				);
			}
		}
	}

	fn validate_forward(&self, request: &ProxyForwardRequest) -> Result<Arc<MappingHandle>> {
		let mapping = self.get_mapping(&request.mapping_id)?;
		ensure!(
			mapping.config.secret_key == request.secret_key,
			InvalidParameterSnafu {
				what:  "secret_key",
				value: "mismatch".to_string(),
			}
		);
		ensure!(
			!self.refusing_opens(),
			QuotaExceededSnafu {
				user: self.session.identity().client_id.to_string(),
			}
		);
		Ok(mapping)
	}

	async fn run_inbound_flow(
		self: &Arc<Self>,
		mapping: Arc<MappingHandle>,
		tunnel_id: &str,
	) -> Result<()> {
		let target = mapping.config.target_address.clone().context(InvalidParameterSnafu {
			what:  "target_address",
			value: String::new(),
		})?;
		let stream = TcpStream::connect(&target)
			.await
			.map_err(|e| ClientError::Network { source: Box::new(e) })?;

		let flow_cancel = mapping.cancel.child_token();
		let local = Arc::new(StreamProcessor::new(
			stream,
			ProcessorOpts::default(),
			flow_cancel.child_token(),
		));
		let tunnel = self
			.open_tunnel_inner(&mapping, &flow_cancel, tunnel_id.to_string())
			.await?;
		pump::run_pump(local, tunnel.clone(), mapping.stats.clone(), self.compression(), flow_cancel)
			.await;
		self.release_tunnel(&tunnel).await;
		Ok(())
	}

	/// Dial a fresh tunnel connection, wrap it with the mapping's keying
	/// material, and authenticate it with the mapping secret.
	pub(crate) async fn open_tunnel(
		self: &Arc<Self>,
		mapping: &Arc<MappingHandle>,
	) -> Result<Arc<StreamProcessor>> {
		let cancel = mapping.cancel.child_token();
		self.open_tunnel_with(mapping, &cancel).await
	}

	async fn open_tunnel_with(
		self: &Arc<Self>,
		mapping: &Arc<MappingHandle>,
		cancel: &CancellationToken,
	) -> Result<Arc<StreamProcessor>> {
		ensure!(
			!self.refusing_opens(),
			QuotaExceededSnafu {
				user: self.session.identity().client_id.to_string(),
			}
		);
		let nonce = uuid::Uuid::new_v4().simple().to_string();
		self.open_tunnel_inner(mapping, cancel, nonce).await
	}

	async fn open_tunnel_inner(
		self: &Arc<Self>,
		mapping: &Arc<MappingHandle>,
		cancel: &CancellationToken,
		nonce: String,
	) -> Result<Arc<StreamProcessor>> {
		let stream = tunnox_transport::dial(self.opts.transport, &self.opts.server_addr, &self.opts.dial, cancel)
			.await
			.map_err(ClientError::from_transport)?;

		let mut config = self.opts.pipeline.clone();
		if config.enable_encryption {
			config.encryption_key = Some(derive_key(&mapping.config.secret_key));
		}
		let tunnel = StreamFactory::new(config)
			.wrap(stream, cancel.child_token())
			.map_err(ClientError::from_stream)?;

		let envelope = TunnelOpenEnvelope {
			mapping_id: mapping.config.mapping_id.clone(),
			secret_key: mapping.config.secret_key.clone(),
			nonce,
		};
		let body = serde_json::to_vec(&envelope).map_err(|e| ClientError::Protocol { source: Box::new(e) })?;
		tunnel
			.write_packet(&Packet::new(PacketKind::TunnelOpen, body.into()), false)
			.await
			.map_err(ClientError::from_stream)?;

		let ack = tokio::time::timeout(self.opts.open_timeout, tunnel.read_packet())
			.await
			.map_err(|_| ClientError::Network {
				source: Box::new(std::io::Error::new(
					std::io::ErrorKind::TimedOut,
					"tunnel open ack timed out",
				)),
			})?
			.map_err(ClientError::from_stream)?;
		if ack.kind != PacketKind::TunnelOpenAck {
			tunnel.close().await;
			return Err(ClientError::Protocol {
				source: format!("expected tunnel open ack, got {:?}", ack.kind).into(),
			});
		}
		let verdict: TunnelOpenAckBody = serde_json::from_slice(&ack.body)
			.map_err(|e| ClientError::Protocol { source: Box::new(e) })?;
		if !verdict.accepted {
			tunnel.close().await;
			return Err(ClientError::Auth {
				reason: verdict.reason.unwrap_or_else(|| "tunnel refused".into()),
			});
		}

		let seq = self.tunnel_seq.fetch_add(1, Ordering::SeqCst);
		let stream_id = format!("tunnel-{}-{seq}", mapping.config.mapping_id);
		if let Err(e) = self.streams.register(stream_id, tunnel.clone()) {
			warn!(target: "[BROKER]", "tunnel registry: {e}");
		}
		Ok(tunnel)
	}

	/// Unindex and close a tunnel pipeline once its pump is done.
	pub(crate) async fn release_tunnel(&self, tunnel: &Arc<StreamProcessor>) {
		// Ids are sequence-based; walk the registry for the pointer.
		let ids: Vec<String> = {
			let all = self.streams.list_ids();
			all.into_iter()
				.filter(|id| {
					self.streams
						.get(id)
						.map(|p| Arc::ptr_eq(&p, tunnel))
						.unwrap_or(false)
				})
				.collect()
		};
		for id in ids {
			self.streams.remove(&id);
		}
		tunnel.close().await;
	}

	async fn handle_mapping_updated(self: &Arc<Self>, command: Command) {
		let config: MappingConfig = match serde_json::from_str(&command.command_body) {
			Ok(config) => config,
			Err(e) => {
				warn!(target: "[BROKER]", "malformed mapping push: {e}");
				return;
			}
		};
		let id = config.mapping_id.clone();
		// Replace-by-id: drop the old incarnation, run the pushed one.
		let _ = self.remove_mapping(&id);
		if let Err(e) = self.add_mapping(config).await {
			warn!(target: "[BROKER]", "applying pushed mapping `{id}` failed: {e}");
		}
	}

	/// Expired mappings are swept on a timer rather than per-operation.
	async fn expiry_sweep(self: &Arc<Self>) {
		let mut ticker = tokio::time::interval(self.opts.sweep_interval);
		ticker.tick().await;
		loop {
			tokio::select! {
				_ = self.root.cancelled() => return,
				_ = ticker.tick() => {}
			}
			let now = time::OffsetDateTime::now_utc();
			let expired: Vec<String> = {
				let mappings = self.mappings.read().expect("mappings poisoned");
				mappings
					.values()
					.filter(|h| h.is_expired(now))
					.map(|h| h.config.mapping_id.clone())
					.collect()
			};
			for id in expired {
				info!(target: "[BROKER]", "mapping `{id}` expired");
				let _ = self.remove_mapping(&id);
			}
		}
	}

	/// Cancel every listener and tunnel and wait for their tasks.
	pub async fn stop(&self) {
		self.root.cancel();
		let handles: Vec<Arc<MappingHandle>> = {
			let mut mappings = self.mappings.write().expect("mappings poisoned");
			mappings.drain().map(|(_, h)| h).collect()
		};
		for handle in handles {
			handle.cancel.cancel();
		}
		self.streams.shutdown().await;
		self.tasks.close();
		self.tasks.wait().await;
		info!(target: "[BROKER]", "stopped");
	}
}

fn bind_error(listen: &str, e: std::io::Error) -> ClientError {
	ClientError::InvalidParameter {
		what:  "listen_address",
		value: format!("{listen}: {e}"),
	}
}

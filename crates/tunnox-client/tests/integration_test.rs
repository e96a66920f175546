//! End-to-end scenarios against a scripted in-process rendezvous server
//! speaking the real packet protocol over plain TCP.

use std::{
	net::SocketAddr,
	sync::{Arc, Mutex},
	time::Duration,
};

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tunnox_client::{
	BrokerOpts, ClientError, ConfigStore, ControlSession, Identity, SessionOpts, SessionState,
	TunnelBroker, derive_key,
};
use tunnox_proto::{
	Command, CommandKind, Packet, PacketKind,
	payload::{
		Direction, GenerateCodeRequest, HandshakeRequest, HandshakeResponse, KickNotice,
		MappingConfig, MappingProtocol, TunnelOpenAckBody, TunnelOpenEnvelope,
	},
};
use tunnox_stream::{FactoryConfig, ProcessorOpts, StreamProcessor};
use tunnox_transport::{ServerAddr, TransportKind};

const ASSIGNED_ID: u64 = 10_000_001;
const ASSIGNED_KEY: &str = "k-abc";
const MAPPING_SECRET: &str = "mapping-secret";

#[derive(Default)]
struct MemoryStore {
	saved: Mutex<Option<Identity>>,
}

impl ConfigStore for MemoryStore {
	fn save_identity(&self, identity: &Identity) -> std::io::Result<()> {
		*self.saved.lock().unwrap() = Some(identity.clone());
		Ok(())
	}
}

/// What the scripted server saw, for assertions.
#[derive(Default)]
struct ServerLog {
	handshakes: Mutex<Vec<HandshakeRequest>>,
	commands:   Mutex<Vec<Command>>,
}

enum OnCommand {
	/// Echo a canned body back under the received command id.
	Reply(&'static str),
	/// Swallow the command and slam the connection shut.
	DropConnection,
}

struct ServerScript {
	on_command: OnCommand,
	/// Push a kick right after handshake completes.
	kick_after_handshake: bool,
	/// Serve tunnel connections with an encrypted pipeline echoing data.
	tunnel_key: Option<[u8; 32]>,
}

impl Default for ServerScript {
	fn default() -> Self {
		ServerScript {
			on_command: OnCommand::Reply(r#"{"ok":true}"#),
			kick_after_handshake: false,
			tunnel_key: None,
		}
	}
}

async fn spawn_server(script: ServerScript) -> (SocketAddr, Arc<ServerLog>) {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let log = serve_on(listener, script);
	(addr, log)
}

fn serve_on(listener: TcpListener, script: ServerScript) -> Arc<ServerLog> {
	let log = Arc::new(ServerLog::default());
	let script = Arc::new(script);

	let log_clone = log.clone();
	tokio::spawn(async move {
		loop {
			let Ok((stream, _)) = listener.accept().await else { break };
			let log = log_clone.clone();
			let script = script.clone();
			tokio::spawn(async move {
				let _ = serve_connection(stream, log, script).await;
			});
		}
	});
	log
}

/// One accepted connection: the first packet decides whether this is a
/// control session or a tunnel connection.
async fn serve_connection(
	mut stream: TcpStream,
	log: Arc<ServerLog>,
	script: Arc<ServerScript>,
) -> eyre::Result<()> {
	let first = Packet::read_from(&mut stream).await?;
	match first.kind {
		PacketKind::Handshake => serve_control(stream, first, log, script).await,
		PacketKind::TunnelOpen => serve_tunnel(stream, first, script).await,
		other => eyre::bail!("unexpected first packet {other:?}"),
	}
}

async fn serve_control(
	mut stream: TcpStream,
	first: Packet,
	log: Arc<ServerLog>,
	script: Arc<ServerScript>,
) -> eyre::Result<()> {
	let request: HandshakeRequest = serde_json::from_slice(&first.body)?;
	log.handshakes.lock().unwrap().push(request.clone());

	let response = HandshakeResponse {
		accepted:   true,
		client_id:  if request.client_id == 0 { ASSIGNED_ID } else { request.client_id },
		secret_key: if request.secret_key.is_empty() {
			ASSIGNED_KEY.to_string()
		} else {
			request.secret_key.clone()
		},
		reason:     None,
	};
	let body = serde_json::to_vec(&response)?;
	Packet::new(PacketKind::HandshakeResp, body.into()).write_to(&mut stream).await?;

	if script.kick_after_handshake {
		let notice = KickNotice { reason: "duplicate-login".into() };
		let kick = Command::new(
			CommandKind::KickClient,
			Command::fresh_id(),
			"",
			"server",
			response.client_id.to_string(),
			serde_json::to_string(&notice)?,
		);
		Packet::command(PacketKind::JsonCommand, kick).write_to(&mut stream).await?;
	}

	loop {
		let packet = Packet::read_from(&mut stream).await?;
		match packet.kind {
			PacketKind::Heartbeat => {
				Packet::heartbeat().write_to(&mut stream).await?;
			}
			PacketKind::JsonCommand | PacketKind::CommandResp => {
				let command = packet.command.expect("command frame");
				log.commands.lock().unwrap().push(command.clone());
				match script.on_command {
					OnCommand::Reply(canned) => {
						let reply = Command::new(
							command.command_type,
							command.command_id.clone(),
							"",
							"server",
							command.sender_id.clone(),
							canned,
						);
						Packet::command(PacketKind::CommandResp, reply).write_to(&mut stream).await?;
					}
					OnCommand::DropConnection => return Ok(()),
				}
			}
			other => eyre::bail!("unexpected {other:?} on control"),
		}
	}
}

/// Tunnel leg: ack the open, then echo TunnelData until close. Runs over an
/// encrypted pipeline when the script carries the mapping key.
async fn serve_tunnel(
	stream: TcpStream,
	first: Packet,
	script: Arc<ServerScript>,
) -> eyre::Result<()> {
	let envelope: TunnelOpenEnvelope = serde_json::from_slice(&first.body)?;
	eyre::ensure!(envelope.secret_key == MAPPING_SECRET, "bad tunnel secret");

	let opts = match script.tunnel_key {
		Some(key) => ProcessorOpts {
			cipher: Some(tunnox_stream::AeadCipher::new(tunnox_stream::CipherKind::Aes256Gcm, &key)),
			..Default::default()
		},
		None => ProcessorOpts::default(),
	};
	let proc = StreamProcessor::new(stream, opts, CancellationToken::new());

	let ack = TunnelOpenAckBody { accepted: true, reason: None };
	proc.write_packet(
		&Packet::new(PacketKind::TunnelOpenAck, serde_json::to_vec(&ack)?.into()),
		false,
	)
	.await?;

	loop {
		let packet = proc.read_packet().await?;
		match packet.kind {
			PacketKind::TunnelData => {
				proc.write_packet(&Packet::new(PacketKind::TunnelData, packet.body), false)
					.await?;
			}
			PacketKind::TunnelClose => {
				proc.write_packet(&Packet::new(PacketKind::TunnelClose, bytes::Bytes::new()), false)
					.await?;
				return Ok(());
			}
			PacketKind::StreamEof | PacketKind::Heartbeat => continue,
			other => eyre::bail!("unexpected {other:?} on tunnel"),
		}
	}
}

fn session_opts(addr: SocketAddr) -> SessionOpts {
	let mut opts = SessionOpts::new(
		ServerAddr::parse(&addr.to_string()).unwrap(),
		TransportKind::Tcp,
	);
	opts.reconnect_base = Duration::from_millis(50);
	opts.reconnect_cap = Duration::from_millis(200);
	opts
}

/// S1: a zero-id client gets an identity assigned, persists it, and replays
/// it on the next handshake.
#[test_log::test(tokio::test)]
async fn test_handshake_assignment_and_replay() -> eyre::Result<()> {
	let (addr, log) = spawn_server(ServerScript {
		on_command: OnCommand::DropConnection,
		..Default::default()
	})
	.await;

	let store = Arc::new(MemoryStore::default());
	let session = ControlSession::new(
		session_opts(addr),
		Identity::unassigned("d1"),
		Some(store.clone()),
	);
	session.connect().await?;

	assert_eq!(session.identity().client_id, ASSIGNED_ID);
	assert_eq!(session.identity().secret_key, ASSIGNED_KEY);
	let saved = store.saved.lock().unwrap().clone().expect("identity persisted");
	assert_eq!(saved.client_id, ASSIGNED_ID);

	// Knock the connection over; the replayed handshake must carry the
	// assigned identity.
	let _ = session.request(CommandKind::RpcInvoke, "{}").await;
	let mut state = session.subscribe_state();
	tokio::time::timeout(Duration::from_secs(5), async {
		while *state.borrow_and_update() != SessionState::Connected {
			state.changed().await.unwrap();
		}
	})
	.await?;

	let handshakes = log.handshakes.lock().unwrap().clone();
	assert!(handshakes.len() >= 2);
	assert_eq!(handshakes[0].client_id, 0);
	assert_eq!(handshakes[1].client_id, ASSIGNED_ID);
	assert_eq!(handshakes[1].secret_key, ASSIGNED_KEY);

	session.stop().await;
	Ok(())
}

/// S2: a command round-trips and the caller unblocks with exactly the body
/// the server sent.
#[test_log::test(tokio::test)]
async fn test_command_round_trip() -> eyre::Result<()> {
	let (addr, log) = spawn_server(ServerScript {
		on_command: OnCommand::Reply(r#"{"code":"ABC123","expires_at":"2025-01-01T00:10:00Z"}"#),
		..Default::default()
	})
	.await;

	let session = ControlSession::new(session_opts(addr), Identity::unassigned("d1"), None);
	session.connect().await?;

	let generated = session
		.generate_code(&GenerateCodeRequest {
			target_address:         "tcp://127.0.0.1:22".into(),
			activation_ttl_seconds: 600,
			mapping_ttl_seconds:    604_800,
		})
		.await?;
	assert_eq!(generated.code, "ABC123");

	let seen = log.commands.lock().unwrap().clone();
	assert_eq!(seen.len(), 1);
	assert_eq!(seen[0].command_type, CommandKind::CodeGenerate);
	assert!(!seen[0].command_id.is_empty());

	session.stop().await;
	assert!(!session.is_connected());
	assert_eq!(session.inflight_len(), 0);
	Ok(())
}

/// A dial failure on the very first connect parks the session in
/// Reconnecting and the backoff loop picks the server up once it appears,
/// instead of surfacing a startup error.
#[test_log::test(tokio::test)]
async fn test_initial_connect_retries_in_background() -> eyre::Result<()> {
	// Reserve a port, then leave it closed for the first dial.
	let probe = TcpListener::bind("127.0.0.1:0").await?;
	let addr = probe.local_addr()?;
	drop(probe);

	let session = ControlSession::new(session_opts(addr), Identity::unassigned("d1"), None);
	session.connect().await?;
	assert!(!session.is_connected());
	assert_eq!(session.state(), SessionState::Reconnecting);

	// Bring the server up; the backoff ladder finds it.
	let _log = serve_on(TcpListener::bind(addr).await?, ServerScript::default());

	let mut state = session.subscribe_state();
	tokio::time::timeout(Duration::from_secs(5), async {
		while *state.borrow_and_update() != SessionState::Connected {
			state.changed().await.unwrap();
		}
	})
	.await?;
	assert!(session.is_connected());

	session.stop().await;
	Ok(())
}

/// S4: a request in flight across a reconnect fails with `Reconnected`, and
/// the session comes back one generation later.
#[test_log::test(tokio::test)]
async fn test_reconnect_fails_inflight_waiters() -> eyre::Result<()> {
	let (addr, _log) = spawn_server(ServerScript {
		on_command: OnCommand::DropConnection,
		..Default::default()
	})
	.await;

	let session = ControlSession::new(session_opts(addr), Identity::unassigned("d1"), None);
	session.connect().await?;
	let generation = session.generation();

	let err = session.request(CommandKind::RpcInvoke, "{}").await.unwrap_err();
	assert!(matches!(err, ClientError::Reconnected), "got {err:?}");

	let mut state = session.subscribe_state();
	tokio::time::timeout(Duration::from_secs(5), async {
		while *state.borrow_and_update() != SessionState::Connected {
			state.changed().await.unwrap();
		}
	})
	.await?;
	assert!(session.generation() > generation);
	assert_eq!(session.inflight_len(), 0);

	session.stop().await;
	Ok(())
}

/// S5 / property 7: a duplicate-login kick is terminal until reset, and
/// later connects are rejected outright.
#[test_log::test(tokio::test)]
async fn test_duplicate_login_kick() -> eyre::Result<()> {
	let (addr, _log) = spawn_server(ServerScript {
		kick_after_handshake: true,
		..Default::default()
	})
	.await;

	let session = ControlSession::new(session_opts(addr), Identity::unassigned("d1"), None);
	session.connect().await?;

	let mut state = session.subscribe_state();
	tokio::time::timeout(Duration::from_secs(5), async {
		while *state.borrow_and_update() != SessionState::Kicked {
			state.changed().await.unwrap();
		}
	})
	.await?;

	assert_eq!(session.kicked_reason().as_deref(), Some("duplicate-login"));
	let err = session.connect().await.unwrap_err();
	assert!(matches!(err, ClientError::Kicked { .. }));

	// Only an explicit reset leaves Kicked.
	session.reset();
	assert_eq!(session.state(), SessionState::Disconnected);

	session.stop().await;
	Ok(())
}

/// S3 scaled down: bytes pumped through an outbound mapping arrive intact
/// at the peer and the counters account for every byte, end to end through
/// an encrypted tunnel pipeline.
#[test_log::test(tokio::test)]
async fn test_tunnel_pump_accounts_bytes() -> eyre::Result<()> {
	use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

	let key = derive_key(MAPPING_SECRET);
	let (addr, _log) = spawn_server(ServerScript {
		tunnel_key: Some(key),
		..Default::default()
	})
	.await;

	let session = ControlSession::new(session_opts(addr), Identity::unassigned("d1"), None);
	session.connect().await?;

	let mut broker_opts = BrokerOpts::new(
		ServerAddr::parse(&addr.to_string()).unwrap(),
		TransportKind::Tcp,
	);
	broker_opts.pipeline = FactoryConfig {
		enable_encryption: true,
		..Default::default()
	};
	let broker = TunnelBroker::new(session.clone(), broker_opts);
	broker.start();

	broker
		.add_mapping(MappingConfig {
			mapping_id:     "m-3306".into(),
			direction:      Direction::Outbound,
			protocol:       MappingProtocol::Tcp,
			secret_key:     MAPPING_SECRET.into(),
			listen_address: Some("127.0.0.1:0".into()),
			target_address: None,
			expires_at:     None,
		})
		.await?;

	let mapping = broker.get_mapping("m-3306")?;
	let listen = mapping.bound_addr().expect("listener bound");

	let payload: Vec<u8> = (0..2 * 1024 * 1024usize).map(|i| (i % 251) as u8).collect();
	let mut client = TcpStream::connect(listen).await?;
	let writer = {
		let payload = payload.clone();
		tokio::spawn(async move {
			// Write and read concurrently so neither window fills; only
			// shut down after the whole echo came back, EOF is teardown.
			let total = payload.len();
			let (mut rx, mut tx) = client.split();
			let write = async { tx.write_all(&payload).await };
			let read = async {
				let mut got = Vec::with_capacity(total);
				let mut buf = vec![0u8; 64 * 1024];
				while got.len() < total {
					let n = rx.read(&mut buf).await?;
					if n == 0 {
						break;
					}
					got.extend_from_slice(&buf[..n]);
				}
				std::io::Result::Ok(got)
			};
			let (w, got) = tokio::join!(write, read);
			w?;
			let got = got?;
			tx.shutdown().await?;
			std::io::Result::Ok(got)
		})
	};

	let got = tokio::time::timeout(Duration::from_secs(30), writer).await???;
	assert_eq!(got, payload);

	// Counters are final once the pump has torn down.
	tokio::time::timeout(Duration::from_secs(5), async {
		while mapping.stats.snapshot().active_tunnels != 0 {
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	})
	.await?;
	let snapshot = mapping.stats.snapshot();
	assert_eq!(snapshot.bytes_sent, payload.len() as u64);
	assert_eq!(snapshot.bytes_received, payload.len() as u64);

	broker.stop().await;
	// Property 6: after stop, the outbound listener is gone.
	assert!(TcpStream::connect(listen).await.is_err());
	session.stop().await;
	Ok(())
}

/// Duplicate mapping ids are rejected; unknown ids are not found.
#[test_log::test(tokio::test)]
async fn test_mapping_registry_violations() -> eyre::Result<()> {
	let (addr, _log) = spawn_server(ServerScript::default()).await;
	let session = ControlSession::new(session_opts(addr), Identity::unassigned("d1"), None);
	session.connect().await?;

	let broker = TunnelBroker::new(
		session.clone(),
		BrokerOpts::new(ServerAddr::parse(&addr.to_string()).unwrap(), TransportKind::Tcp),
	);
	broker.start();

	let config = MappingConfig {
		mapping_id:     "dup".into(),
		direction:      Direction::Outbound,
		protocol:       MappingProtocol::Tcp,
		secret_key:     MAPPING_SECRET.into(),
		listen_address: Some("127.0.0.1:0".into()),
		target_address: None,
		expires_at:     None,
	};
	broker.add_mapping(config.clone()).await?;
	let err = broker.add_mapping(config).await.unwrap_err();
	assert!(matches!(err, ClientError::AlreadyExists { .. }));
	assert!(matches!(
		broker.remove_mapping("ghost").unwrap_err(),
		ClientError::NotFound { .. }
	));

	broker.stop().await;
	session.stop().await;
	Ok(())
}

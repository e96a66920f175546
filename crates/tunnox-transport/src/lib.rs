//! Uniform dialer over the four control/tunnel transports. Everything above
//! this boundary sees a plain byte stream; nothing branches on transport
//! identity past [`dial`].

mod addr;
mod error;
mod kcp;
mod quic;
mod tcp;
pub mod tls;
mod ws;

use std::time::Duration;

pub use addr::*;
pub use error::*;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub type Result<T, E = TransportError> = std::result::Result<T, E>;

pub trait AbstractStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AbstractStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// A dialed connection, transport identity erased.
pub type TransportStream = Box<dyn AbstractStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
	#[default]
	Tcp,
	Websocket,
	Kcp,
	Quic,
}

impl TransportKind {
	/// Parse a transport by name; `"ws"` is an accepted alias.
	pub fn from_name(name: &str) -> Result<Self> {
		match name {
			"tcp" => Ok(TransportKind::Tcp),
			"websocket" | "ws" => Ok(TransportKind::Websocket),
			"kcp" => Ok(TransportKind::Kcp),
			"quic" => Ok(TransportKind::Quic),
			other => UnknownTransportSnafu { name: other.to_string() }.fail(),
		}
	}

	pub fn name(self) -> &'static str {
		match self {
			TransportKind::Tcp => "tcp",
			TransportKind::Websocket => "websocket",
			TransportKind::Kcp => "kcp",
			TransportKind::Quic => "quic",
		}
	}
}

/// Per-dial knobs. TLS belongs to the transports that need it (websocket
/// over https, quic); the others ignore those fields.
#[derive(Debug, Clone)]
pub struct DialOpts {
	pub connect_timeout:      Duration,
	/// SNI override; defaults to the address host.
	pub tls_sni:              Option<String>,
	/// Accept self-signed development servers.
	pub insecure_skip_verify: bool,
	pub tcp_nodelay:          bool,
	pub socket_buffer_size:   Option<usize>,
}

impl Default for DialOpts {
	fn default() -> Self {
		DialOpts {
			connect_timeout:      Duration::from_secs(10),
			tls_sni:              None,
			insecure_skip_verify: false,
			tcp_nodelay:          true,
			socket_buffer_size:   None,
		}
	}
}

/// Dial one connection over the selected transport. Cancellation aborts the
/// in-flight dial.
pub async fn dial(
	kind: TransportKind,
	addr: &ServerAddr,
	opts: &DialOpts,
	cancel: &CancellationToken,
) -> Result<TransportStream> {
	debug!(target: "[DIAL]", "dialing {} via {}", addr, kind.name());
	let dial_fut = async {
		match kind {
			TransportKind::Tcp => tcp::dial_tcp(addr, opts).await,
			TransportKind::Websocket => ws::dial_websocket(addr, opts).await,
			TransportKind::Kcp => kcp::dial_kcp(addr, opts).await,
			TransportKind::Quic => quic::dial_quic(addr, opts).await,
		}
	};
	tokio::select! {
		biased;
		_ = cancel.cancelled() => CancelledSnafu.fail(),
		res = dial_fut => res,
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_ws_alias() {
		assert_eq!(TransportKind::from_name("ws").unwrap(), TransportKind::Websocket);
		assert_eq!(
			TransportKind::from_name("websocket").unwrap(),
			TransportKind::Websocket
		);
	}

	#[test]
	fn test_unknown_transport_rejected() {
		assert!(matches!(
			TransportKind::from_name("carrier-pigeon").unwrap_err(),
			TransportError::UnknownTransport { .. }
		));
	}

	#[tokio::test]
	async fn test_tcp_dial_roundtrip() -> eyre::Result<()> {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
		let local = listener.local_addr()?;
		let server = tokio::spawn(async move {
			let (mut sock, _) = listener.accept().await?;
			use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
			let mut buf = [0u8; 4];
			sock.read_exact(&mut buf).await?;
			sock.write_all(&buf).await?;
			eyre::Ok(())
		});

		let addr = ServerAddr::parse(&local.to_string())?;
		let mut stream = dial(
			TransportKind::Tcp,
			&addr,
			&DialOpts::default(),
			&CancellationToken::new(),
		)
		.await?;
		use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
		stream.write_all(b"ping").await?;
		let mut buf = [0u8; 4];
		stream.read_exact(&mut buf).await?;
		assert_eq!(&buf, b"ping");
		server.await??;
		Ok(())
	}

	#[tokio::test]
	async fn test_dial_refused_is_network_error() {
		// Port 1 is essentially never listening.
		let addr = ServerAddr::parse("127.0.0.1:1").unwrap();
		let res = dial(
			TransportKind::Tcp,
			&addr,
			&DialOpts::default(),
			&CancellationToken::new(),
		)
		.await;
		assert!(res.is_err());
	}
}

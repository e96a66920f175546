use snafu::prelude::*;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransportError {
	#[snafu(display("Unknown transport `{name}`"))]
	UnknownTransport { name: String },

	#[snafu(display("Invalid server address `{addr}`: {reason}"))]
	InvalidAddress { addr: String, reason: &'static str },

	#[snafu(display("Dial to {addr} timed out after {seconds}s"))]
	DialTimeout { addr: String, seconds: u64 },

	#[snafu(display("Dial cancelled"))]
	Cancelled,

	#[snafu(display("TLS setup failed"))]
	Tls { source: rustls::Error },

	#[snafu(display("WebSocket handshake failed"))]
	Websocket {
		source: tokio_tungstenite::tungstenite::Error,
	},

	#[snafu(display("KCP session failed"))]
	Kcp { source: kcp::Error },

	#[snafu(display("QUIC connect failed"))]
	QuicConnect { source: quinn::ConnectError },

	#[snafu(display("QUIC connection lost"))]
	QuicConnection { source: quinn::ConnectionError },

	Io { source: std::io::Error },
}

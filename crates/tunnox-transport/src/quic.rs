use std::{
	io,
	net::{Ipv4Addr, SocketAddr},
	pin::Pin,
	sync::Arc,
	task::{Context, Poll},
};

use quinn::{RecvStream, SendStream};
use snafu::prelude::*;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{
	DialOpts, DialTimeoutSnafu, InvalidAddressSnafu, IoSnafu, QuicConnectSnafu, QuicConnectionSnafu,
	Result, ServerAddr, TlsSnafu, TransportStream, tls,
};

/// Dial a QUIC session and use its first bidirectional stream as the byte
/// stream. One session per connection keeps the abstraction identical to the
/// other transports.
pub(crate) async fn dial_quic(addr: &ServerAddr, opts: &DialOpts) -> Result<TransportStream> {
	let peer: SocketAddr = tokio::net::lookup_host((addr.host.as_str(), addr.port))
		.await
		.context(IoSnafu)?
		.next()
		.context(InvalidAddressSnafu {
			addr:   addr.to_string(),
			reason: "did not resolve",
		})?;

	let tls_config = tls::client_config(opts.insecure_skip_verify).context(TlsSnafu)?;
	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls_config)
		.map_err(|e| rustls::Error::Other(rustls::OtherError(Arc::new(e))))
		.context(TlsSnafu)?;
	let client_config = quinn::ClientConfig::new(Arc::new(quic_tls));

	let bind: SocketAddr = if peer.is_ipv4() {
		(Ipv4Addr::UNSPECIFIED, 0).into()
	} else {
		(std::net::Ipv6Addr::UNSPECIFIED, 0).into()
	};
	let mut endpoint = quinn::Endpoint::client(bind).context(IoSnafu)?;
	endpoint.set_default_client_config(client_config);

	let sni = opts.tls_sni.as_deref().unwrap_or(addr.host.as_str());
	let connecting = endpoint.connect(peer, sni).context(QuicConnectSnafu)?;
	let connection = tokio::time::timeout(opts.connect_timeout, connecting)
		.await
		.ok()
		.context(DialTimeoutSnafu {
			addr:    addr.to_string(),
			seconds: opts.connect_timeout.as_secs(),
		})?
		.context(QuicConnectionSnafu)?;

	let (send, recv) = connection.open_bi().await.context(QuicConnectionSnafu)?;
	Ok(Box::new(QuicByteStream {
		_endpoint: endpoint,
		_connection: connection,
		send,
		recv,
	}))
}

/// Send/recv halves of stream 0, endpoint and session kept alive alongside.
pub struct QuicByteStream {
	_endpoint:   quinn::Endpoint,
	_connection: quinn::Connection,
	send:        SendStream,
	recv:        RecvStream,
}

impl AsyncRead for QuicByteStream {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		Pin::new(&mut self.recv).poll_read(cx, buf)
	}
}

impl AsyncWrite for QuicByteStream {
	fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		Pin::new(&mut self.send).poll_write(cx, buf).map_err(io::Error::other)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.send).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.send).poll_shutdown(cx)
	}
}

use std::{
	io,
	pin::Pin,
	sync::Arc,
	task::{Context, Poll, ready},
};

use bytes::Bytes;
use futures_util::{Sink, Stream};
use pin_project::pin_project;
use snafu::prelude::*;
use tokio::{
	io::{AsyncRead, AsyncWrite, ReadBuf},
	net::TcpStream,
};
use tokio_tungstenite::{
	Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config,
	tungstenite::Message,
};

use crate::{DialOpts, DialTimeoutSnafu, Result, ServerAddr, TlsSnafu, TransportStream, WebsocketSnafu, tls};

pub(crate) async fn dial_websocket(addr: &ServerAddr, opts: &DialOpts) -> Result<TransportStream> {
	let connector = if addr.wants_tls() {
		let config = tls::client_config(opts.insecure_skip_verify).context(TlsSnafu)?;
		Some(Connector::Rustls(Arc::new(config)))
	} else {
		None
	};

	let url = addr.websocket_url();
	let (stream, _response) = tokio::time::timeout(
		opts.connect_timeout,
		connect_async_tls_with_config(url.as_str(), None, opts.tcp_nodelay, connector),
	)
	.await
	.ok()
	.context(DialTimeoutSnafu {
		addr:    addr.to_string(),
		seconds: opts.connect_timeout.as_secs(),
	})?
	.context(WebsocketSnafu)?;

	Ok(Box::new(WsByteStream::new(stream)))
}

/// Presents a websocket message stream as the plain byte stream the rest of
/// the stack expects. Outgoing writes become one binary frame each; incoming
/// binary (or text) frames queue into a read buffer. Control frames are
/// handled inside tungstenite.
#[pin_project]
pub struct WsByteStream {
	#[pin]
	inner:   WebSocketStream<MaybeTlsStream<TcpStream>>,
	readbuf: Bytes,
}

impl WsByteStream {
	pub fn new(inner: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
		WsByteStream {
			inner,
			readbuf: Bytes::new(),
		}
	}
}

fn ws_err(e: tokio_tungstenite::tungstenite::Error) -> io::Error {
	match e {
		tokio_tungstenite::tungstenite::Error::Io(io) => io,
		other => io::Error::other(other),
	}
}

impl AsyncRead for WsByteStream {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let mut this = self.project();
		loop {
			if !this.readbuf.is_empty() {
				let n = this.readbuf.len().min(buf.remaining());
				buf.put_slice(&this.readbuf.split_to(n));
				return Poll::Ready(Ok(()));
			}
			match ready!(this.inner.as_mut().poll_next(cx)) {
				Some(Ok(Message::Binary(data))) => *this.readbuf = data,
				Some(Ok(Message::Text(text))) => *this.readbuf = Bytes::from(text.as_bytes().to_vec()),
				Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
				Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
				Some(Err(e)) => return Poll::Ready(Err(ws_err(e))),
			}
		}
	}
}

impl AsyncWrite for WsByteStream {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		let mut this = self.project();
		ready!(this.inner.as_mut().poll_ready(cx)).map_err(ws_err)?;
		this.inner
			.as_mut()
			.start_send(Message::Binary(Bytes::copy_from_slice(buf)))
			.map_err(ws_err)?;
		Poll::Ready(Ok(buf.len()))
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		self.project().inner.poll_flush(cx).map_err(ws_err)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		self.project().inner.poll_close(cx).map_err(ws_err)
	}
}

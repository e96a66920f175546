use snafu::prelude::*;
use tokio::net::TcpStream;

use crate::{DialOpts, DialTimeoutSnafu, IoSnafu, Result, ServerAddr, TransportStream};

pub(crate) async fn dial_tcp(addr: &ServerAddr, opts: &DialOpts) -> Result<TransportStream> {
	let stream = connect(addr, opts).await?;
	Ok(Box::new(stream))
}

/// Shared by the plain transport and the websocket upgrade below it.
pub(crate) async fn connect(addr: &ServerAddr, opts: &DialOpts) -> Result<TcpStream> {
	let stream = tokio::time::timeout(
		opts.connect_timeout,
		TcpStream::connect((addr.host.as_str(), addr.port)),
	)
	.await
	.ok()
	.context(DialTimeoutSnafu {
		addr:    addr.to_string(),
		seconds: opts.connect_timeout.as_secs(),
	})?
	.context(IoSnafu)?;

	configure(&stream, opts)?;
	Ok(stream)
}

fn configure(stream: &TcpStream, opts: &DialOpts) -> Result<()> {
	let sock = socket2::SockRef::from(stream);
	sock.set_tcp_nodelay(opts.tcp_nodelay).context(IoSnafu)?;
	if let Some(size) = opts.socket_buffer_size {
		sock.set_recv_buffer_size(size).context(IoSnafu)?;
		sock.set_send_buffer_size(size).context(IoSnafu)?;
	}
	Ok(())
}

use snafu::prelude::*;
use tokio_kcp::{KcpConfig, KcpStream};

use crate::{DialOpts, DialTimeoutSnafu, InvalidAddressSnafu, IoSnafu, KcpSnafu, Result, ServerAddr, TransportStream};

pub(crate) async fn dial_kcp(addr: &ServerAddr, opts: &DialOpts) -> Result<TransportStream> {
	// KCP rides raw UDP; resolve to a concrete peer first.
	let peer = tokio::net::lookup_host((addr.host.as_str(), addr.port))
		.await
		.context(IoSnafu)?
		.next()
		.context(InvalidAddressSnafu {
			addr:   addr.to_string(),
			reason: "did not resolve",
		})?;

	let config = KcpConfig::default();
	let stream = tokio::time::timeout(opts.connect_timeout, KcpStream::connect(&config, peer))
		.await
		.ok()
		.context(DialTimeoutSnafu {
			addr:    addr.to_string(),
			seconds: opts.connect_timeout.as_secs(),
		})?
		.context(KcpSnafu)?;

	Ok(Box::new(stream))
}

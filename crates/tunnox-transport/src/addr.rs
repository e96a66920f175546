use std::fmt;

use snafu::prelude::*;

use crate::{InvalidAddressSnafu, Result};

/// A rendezvous endpoint, accepted either as bare `host:port` or as
/// `scheme://host:port/path` (websocket upgrade URLs carry a path).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
	pub scheme: Option<String>,
	pub host:   String,
	pub port:   u16,
	pub path:   String,
}

impl ServerAddr {
	pub fn parse(input: &str) -> Result<Self> {
		let (scheme, rest) = match input.split_once("://") {
			Some((scheme, rest)) => (Some(scheme.to_string()), rest),
			None => (None, input),
		};
		let (authority, path) = match rest.find('/') {
			Some(idx) => (&rest[..idx], rest[idx..].to_string()),
			None => (rest, String::from("/")),
		};
		// IPv6 literals come bracketed: [::1]:9000
		let (host, port_str) = if let Some(rest) = authority.strip_prefix('[') {
			let (host, after) = rest.split_once(']').context(InvalidAddressSnafu {
				addr:   input.to_string(),
				reason: "unterminated IPv6 literal",
			})?;
			let port = after.strip_prefix(':').context(InvalidAddressSnafu {
				addr:   input.to_string(),
				reason: "missing port",
			})?;
			(host.to_string(), port)
		} else {
			let (host, port) = authority.rsplit_once(':').context(InvalidAddressSnafu {
				addr:   input.to_string(),
				reason: "missing port",
			})?;
			(host.to_string(), port)
		};
		ensure!(
			!host.is_empty(),
			InvalidAddressSnafu {
				addr:   input.to_string(),
				reason: "empty host",
			}
		);
		let port: u16 = port_str.parse().ok().context(InvalidAddressSnafu {
			addr:   input.to_string(),
			reason: "port out of range",
		})?;
		ensure!(
			port != 0,
			InvalidAddressSnafu {
				addr:   input.to_string(),
				reason: "port out of range",
			}
		);
		Ok(ServerAddr { scheme, host, port, path })
	}

	pub fn authority(&self) -> String {
		if self.host.contains(':') {
			format!("[{}]:{}", self.host, self.port)
		} else {
			format!("{}:{}", self.host, self.port)
		}
	}

	/// Whether the scheme asks for TLS (`https`/`wss` upgrade URLs, `quics`).
	pub fn wants_tls(&self) -> bool {
		matches!(self.scheme.as_deref(), Some("https") | Some("wss"))
	}

	/// The websocket upgrade URL for this address.
	pub fn websocket_url(&self) -> String {
		let scheme = if self.wants_tls() { "wss" } else { "ws" };
		format!("{}://{}{}", scheme, self.authority(), self.path)
	}
}

impl fmt::Display for ServerAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.scheme {
			Some(scheme) => write!(f, "{}://{}{}", scheme, self.authority(), self.path),
			None => write!(f, "{}", self.authority()),
		}
	}
}

#[cfg(test)]
mod test {
	use super::ServerAddr;
	use crate::TransportError;

	#[test]
	fn test_bare_host_port() -> eyre::Result<()> {
		let addr = ServerAddr::parse("tunnel.example.com:9000")?;
		assert_eq!(addr.scheme, None);
		assert_eq!(addr.host, "tunnel.example.com");
		assert_eq!(addr.port, 9000);
		assert_eq!(addr.path, "/");
		Ok(())
	}

	#[test]
	fn test_scheme_and_path() -> eyre::Result<()> {
		let addr = ServerAddr::parse("https://tunnel.example.com:443/ws/control")?;
		assert!(addr.wants_tls());
		assert_eq!(addr.websocket_url(), "wss://tunnel.example.com:443/ws/control");

		let addr = ServerAddr::parse("ws://127.0.0.1:8080/tunnel")?;
		assert!(!addr.wants_tls());
		assert_eq!(addr.websocket_url(), "ws://127.0.0.1:8080/tunnel");
		Ok(())
	}

	#[test]
	fn test_ipv6_literal() -> eyre::Result<()> {
		let addr = ServerAddr::parse("[::1]:9000")?;
		assert_eq!(addr.host, "::1");
		assert_eq!(addr.authority(), "[::1]:9000");
		Ok(())
	}

	#[test]
	fn test_invalid_addresses() {
		for bad in ["no-port", ":9000", "host:notaport", "host:0", "host:70000"] {
			assert!(
				matches!(
					ServerAddr::parse(bad).unwrap_err(),
					TransportError::InvalidAddress { .. }
				),
				"{bad} accepted"
			);
		}
	}
}

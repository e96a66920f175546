use snafu::prelude::*;
use tunnox_stream::StreamError;
use tunnox_transport::TransportError;

/// One variant per error kind. Streams fail with `Protocol`/`Network` and
/// roll into reconnect; request-level kinds return to the caller only;
/// `Kicked` is terminal for the session.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ClientError {
	#[snafu(display("Invalid {what}: {value}"))]
	InvalidParameter { what: &'static str, value: String },

	#[snafu(display("Network failure: {source}"))]
	Network {
		source: Box<dyn std::error::Error + Send + Sync>,
	},

	#[snafu(display("Protocol violation: {source}"))]
	Protocol {
		source: Box<dyn std::error::Error + Send + Sync>,
	},

	#[snafu(display("Handshake rejected: {reason}"))]
	Auth { reason: String },

	#[snafu(display("Kicked by server: {reason}"))]
	Kicked { reason: String },

	#[snafu(display("Cancelled"))]
	Cancelled,

	#[snafu(display("Request `{command_id}` timed out"))]
	Deadline { command_id: String },

	#[snafu(display("Request dropped by reconnect"))]
	Reconnected,

	#[snafu(display("Not connected"))]
	NotConnected,

	#[snafu(display("Session was stopped"))]
	Stopped,

	#[snafu(display("Quota exceeded for user `{user}`"))]
	QuotaExceeded { user: String },

	#[snafu(display("`{id}` already exists"))]
	AlreadyExists { id: String },

	#[snafu(display("`{id}` not found"))]
	NotFound { id: String },

	#[snafu(display("Server replied with an error: {message}"))]
	Remote { message: String },
}

impl ClientError {
	/// Classify a pipeline failure: cancellation propagates as-is, peer
	/// disappearance is `network`, everything else is a protocol breach.
	pub fn from_stream(e: StreamError) -> Self {
		match e {
			StreamError::Cancelled => ClientError::Cancelled,
			e if e.is_disconnect() => ClientError::Network { source: Box::new(e) },
			e => ClientError::Protocol { source: Box::new(e) },
		}
	}

	pub fn from_transport(e: TransportError) -> Self {
		match e {
			TransportError::Cancelled => ClientError::Cancelled,
			TransportError::UnknownTransport { name } => ClientError::InvalidParameter {
				what:  "transport",
				value: name,
			},
			TransportError::InvalidAddress { addr, .. } => ClientError::InvalidParameter {
				what:  "address",
				value: addr,
			},
			e => ClientError::Network { source: Box::new(e) },
		}
	}
}

use snafu::prelude::*;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StreamError {
	#[snafu(display("Stream is closed"))]
	Closed,

	#[snafu(display("Encrypted chunk length {len} outside (0, {max}]"))]
	OversizeChunk { len: usize, max: usize },

	#[snafu(display("AEAD open failed, stream is poisoned"))]
	Crypto,

	#[snafu(display("Corrupt compressed body"))]
	Corrupt { source: std::io::Error },

	#[snafu(display("Operation cancelled"))]
	Cancelled,

	#[snafu(display("Peer used {layer} this pipeline was not built with"))]
	Unnegotiated { layer: &'static str },

	#[snafu(display("Invalid {what}: {value}"))]
	InvalidParameter { what: &'static str, value: String },

	#[snafu(display("Stream `{id}` already registered"))]
	AlreadyExists { id: String },

	#[snafu(display("Stream `{id}` not registered"))]
	NotFound { id: String },

	#[snafu(transparent)]
	Proto { source: tunnox_proto::ProtoError },

	Io { source: std::io::Error },
}

impl StreamError {
	/// Errors that mean the peer went away rather than misbehaved.
	pub fn is_disconnect(&self) -> bool {
		match self {
			StreamError::Closed | StreamError::Cancelled => true,
			StreamError::Io { source } => matches!(
				source.kind(),
				std::io::ErrorKind::UnexpectedEof
					| std::io::ErrorKind::ConnectionReset
					| std::io::ErrorKind::BrokenPipe
			),
			_ => false,
		}
	}
}

use snafu::prelude::*;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProtoError {
	#[snafu(display("Body length {len} exceeds the {max} byte frame cap"))]
	Oversize { len: usize, max: usize },

	#[snafu(display("Stream ended mid-frame, {missing} bytes short"))]
	Truncated { missing: usize },

	#[snafu(display("Unknown packet kind {value:#04x}"))]
	UnknownPacketKind { value: u8 },

	#[snafu(display("Unknown command kind {value}"))]
	UnknownCommandKind { value: u32 },

	#[snafu(display("Malformed command body"))]
	InvalidBody { source: serde_json::Error },

	#[snafu(display("Command field `{field}` must not be empty"))]
	EmptyField { field: &'static str },

	#[snafu(display("Packet kind {kind:?} does not carry a command"))]
	KindMismatch { kind: crate::PacketKind },

	// Caller should yield, the frame has not fully arrived
	BytesRemaining,

	#[snafu(context(false))]
	Io { source: std::io::Error },
}

impl ProtoError {
	/// Whether a retry with more buffered bytes can succeed.
	pub fn is_incomplete(&self) -> bool {
		matches!(self, ProtoError::BytesRemaining)
	}
}

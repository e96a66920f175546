use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use snafu::prelude::*;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
	Command, EmptyFieldSnafu, FLAG_COMPRESSED, FLAG_ENCRYPTED, Frame, InvalidBodySnafu,
	KindMismatchSnafu, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketKind {
	Handshake     = 1,
	HandshakeResp = 2,
	Heartbeat     = 3,
	JsonCommand   = 4,
	CommandResp   = 5,
	TunnelOpen    = 6,
	TunnelOpenAck = 7,
	TunnelData    = 8,
	TunnelClose   = 9,
	StreamEof     = 10,
}

impl PacketKind {
	pub fn carries_command(self) -> bool {
		matches!(self, PacketKind::JsonCommand | PacketKind::CommandResp)
	}
}

/// A parsed packet. `body` holds plaintext bytes; when `command` is set the
/// wire body is its JSON marshalling instead. The flag fields mirror the two
/// high bits of the type octet and survive a build/parse cycle untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
	pub kind:       PacketKind,
	pub encrypted:  bool,
	pub compressed: bool,
	pub command:    Option<Command>,
	pub body:       Bytes,
}

impl Packet {
	pub fn new(kind: PacketKind, body: Bytes) -> Self {
		Packet {
			kind,
			encrypted: false,
			compressed: false,
			command: None,
			body,
		}
	}

	pub fn heartbeat() -> Self {
		Packet::new(PacketKind::Heartbeat, Bytes::new())
	}

	pub fn command(kind: PacketKind, command: Command) -> Self {
		Packet {
			kind,
			encrypted: false,
			compressed: false,
			command: Some(command),
			body: Bytes::new(),
		}
	}

	pub fn type_octet(&self) -> u8 {
		let mut octet = u8::from(self.kind);
		if self.encrypted {
			octet |= FLAG_ENCRYPTED;
		}
		if self.compressed {
			octet |= FLAG_COMPRESSED;
		}
		octet
	}

	/// The untransformed body bytes: the command's JSON when one is attached,
	/// the raw body otherwise.
	pub fn plain_body(&self) -> Result<Bytes> {
		match &self.command {
			Some(cmd) => Ok(serde_json::to_vec(cmd).context(InvalidBodySnafu)?.into()),
			None => Ok(self.body.clone()),
		}
	}

	/// Reassemble a packet from a frame whose body has already been peeled
	/// back to plaintext by the stream layer.
	pub fn from_plain_frame(frame: &Frame, plain: Bytes) -> Result<Self> {
		let kind = frame.kind()?;
		let (command, body) = if kind.carries_command() {
			let cmd = serde_json::from_slice(&plain).context(InvalidBodySnafu)?;
			(Some(cmd), Bytes::new())
		} else {
			(None, plain)
		};
		Ok(Packet {
			kind,
			encrypted: frame.is_encrypted(),
			compressed: frame.is_compressed(),
			command,
			body,
		})
	}

	/// First violation wins: recognized kind (checked upstream by parsing),
	/// then command kind, then the non-empty id fields.
	pub fn validate(&self) -> Result<()> {
		if let Some(cmd) = &self.command {
			ensure!(self.kind.carries_command(), KindMismatchSnafu { kind: self.kind });
			cmd.validate()?;
		} else if self.kind.carries_command() {
			return EmptyFieldSnafu { field: "command_body" }.fail();
		}
		Ok(())
	}

	/// Build onto a plaintext byte stream. Transformed streams go through the
	/// stream pipeline instead, which frames via [`Frame`] directly.
	pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
	where
		W: AsyncWrite + Unpin + ?Sized,
	{
		let frame = Frame::new(self.type_octet(), self.plain_body()?);
		frame.write_to(writer).await
	}

	/// Parse from a plaintext byte stream.
	pub async fn read_from<R>(reader: &mut R) -> Result<Self>
	where
		R: AsyncRead + Unpin + ?Sized,
	{
		let frame = Frame::read_from(reader).await?;
		let body = frame.body.clone();
		Packet::from_plain_frame(&frame, body)
	}
}

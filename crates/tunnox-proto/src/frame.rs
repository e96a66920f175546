use bytes::{Buf, BufMut, Bytes};
use snafu::prelude::*;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
	BytesRemainingSnafu, OversizeSnafu, PacketKind, ProtoError, Result, TruncatedSnafu,
	UnknownPacketKindSnafu,
};

/// Encrypted-body flag on the type octet.
pub const FLAG_ENCRYPTED: u8 = 0b1000_0000;
/// Compressed-body flag on the type octet.
pub const FLAG_COMPRESSED: u8 = 0b0100_0000;
/// Low six bits of the type octet select the packet kind.
pub const KIND_MASK: u8 = 0b0011_1111;
/// Largest body a single frame may carry.
pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

/// One wire frame. The body is still in whatever transformed shape the flag
/// bits describe; peeling encryption and compression off is the stream
/// layer's job, not the codec's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
	pub type_octet: u8,
	pub body:       Bytes,
}

impl Frame {
	pub fn new(type_octet: u8, body: Bytes) -> Self {
		Frame { type_octet, body }
	}

	pub fn heartbeat() -> Self {
		Frame {
			type_octet: PacketKind::Heartbeat.into(),
			body:       Bytes::new(),
		}
	}

	pub fn kind(&self) -> Result<PacketKind> {
		let value = self.type_octet & KIND_MASK;
		PacketKind::try_from(value).ok().context(UnknownPacketKindSnafu { value })
	}

	pub fn is_encrypted(&self) -> bool {
		self.type_octet & FLAG_ENCRYPTED != 0
	}

	pub fn is_compressed(&self) -> bool {
		self.type_octet & FLAG_COMPRESSED != 0
	}

	fn is_heartbeat(&self) -> bool {
		self.type_octet & KIND_MASK == u8::from(PacketKind::Heartbeat)
	}

	/// Read one frame off an async byte stream. A heartbeat returns after the
	/// type octet alone; every other kind reads the length and exactly that
	/// many body bytes.
	pub async fn read_from<R>(reader: &mut R) -> Result<Self>
	where
		R: AsyncRead + Unpin + ?Sized,
	{
		let type_octet = reader.read_u8().await?;
		let value = type_octet & KIND_MASK;
		PacketKind::try_from(value).ok().context(UnknownPacketKindSnafu { value })?;

		let frame = Frame {
			type_octet,
			body: Bytes::new(),
		};
		if frame.is_heartbeat() {
			return Ok(frame);
		}

		let len = reader.read_u32().await? as usize;
		ensure!(len <= MAX_BODY_LEN, OversizeSnafu { len, max: MAX_BODY_LEN });

		let mut body = vec![0u8; len];
		let mut filled = 0;
		while filled < len {
			let n = reader.read(&mut body[filled..]).await?;
			ensure!(n != 0, TruncatedSnafu { missing: len - filled });
			filled += n;
		}

		Ok(Frame {
			type_octet,
			body: body.into(),
		})
	}

	/// Write one frame. The caller owns flushing.
	pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
	where
		W: AsyncWrite + Unpin + ?Sized,
	{
		ensure!(
			self.body.len() <= MAX_BODY_LEN,
			OversizeSnafu {
				len: self.body.len(),
				max: MAX_BODY_LEN
			}
		);
		writer.write_u8(self.type_octet).await?;
		if self.is_heartbeat() {
			return Ok(());
		}
		writer.write_u32(self.body.len() as u32).await?;
		writer.write_all(&self.body).await?;
		Ok(())
	}
}

/// Stateless buffer-level codec for [`Frame`], usable concurrently from any
/// number of independent streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
	type Error = ProtoError;
	type Item = Frame;

	fn decode(&mut self, src: &mut bytes::BytesMut) -> Result<Option<Frame>> {
		if src.is_empty() {
			return Ok(None);
		}
		let type_octet = src[0];
		let value = type_octet & KIND_MASK;
		let kind = PacketKind::try_from(value).ok().context(UnknownPacketKindSnafu { value })?;

		if kind == PacketKind::Heartbeat {
			src.advance(1);
			return Ok(Some(Frame::heartbeat()));
		}
		if src.len() < 5 {
			return Ok(None);
		}
		let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
		ensure!(len <= MAX_BODY_LEN, OversizeSnafu { len, max: MAX_BODY_LEN });
		if src.len() < 5 + len {
			src.reserve(5 + len - src.len());
			return Ok(None);
		}
		src.advance(5);
		let body = src.split_to(len).freeze();
		Ok(Some(Frame { type_octet, body }))
	}

	fn decode_eof(&mut self, buf: &mut bytes::BytesMut) -> Result<Option<Frame>> {
		match self.decode(buf) {
			Ok(None) if !buf.is_empty() => BytesRemainingSnafu.fail(),
			v => v,
		}
	}
}

impl Encoder<Frame> for FrameCodec {
	type Error = ProtoError;

	fn encode(&mut self, item: Frame, dst: &mut bytes::BytesMut) -> Result<()> {
		ensure!(
			item.body.len() <= MAX_BODY_LEN,
			OversizeSnafu {
				len: item.body.len(),
				max: MAX_BODY_LEN
			}
		);
		if item.is_heartbeat() {
			dst.reserve(1);
			dst.put_u8(item.type_octet);
			return Ok(());
		}
		dst.reserve(5 + item.body.len());
		dst.put_u8(item.type_octet);
		dst.put_u32(item.body.len() as u32);
		dst.put_slice(&item.body);
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use bytes::{Bytes, BytesMut};
	use futures_util::SinkExt as _;
	use tokio_stream::StreamExt as _;
	use tokio_util::codec::{Decoder as _, Encoder as _, FramedRead, FramedWrite};

	use super::{FLAG_COMPRESSED, FLAG_ENCRYPTED, Frame, FrameCodec};
	use crate::{PacketKind, ProtoError};

	#[tokio::test]
	async fn test_frame_roundtrip() -> eyre::Result<()> {
		let vars = vec![
			Frame::heartbeat(),
			Frame::new(PacketKind::JsonCommand.into(), Bytes::from_static(b"{}")),
			Frame::new(
				u8::from(PacketKind::TunnelData) | FLAG_ENCRYPTED | FLAG_COMPRESSED,
				Bytes::from(vec![0xAB; 4096]),
			),
			Frame::new(PacketKind::StreamEof.into(), Bytes::new()),
		];
		for frame in vars {
			let buffer = Vec::with_capacity(128);
			let mut writer = FramedWrite::new(buffer, FrameCodec);
			writer.send(frame.clone()).await?;
			let buffer = writer.into_inner();

			let expect_len = if frame.kind()? == PacketKind::Heartbeat {
				1
			} else {
				5 + frame.body.len()
			};
			assert_eq!(buffer.len(), expect_len);

			let mut reader = FramedRead::new(buffer.as_slice(), FrameCodec);
			let decoded = reader.next().await.unwrap()?;
			assert_eq!(decoded, frame);
		}
		Ok(())
	}

	/// Data not fully arrived
	#[tokio::test]
	async fn test_frame_partial() -> eyre::Result<()> {
		let frame = Frame::new(PacketKind::TunnelOpen.into(), Bytes::from(vec![7u8; 64]));
		let mut buf = BytesMut::new();
		FrameCodec.encode(frame.clone(), &mut buf)?;

		let full = buf.split().freeze();
		let mut partial = BytesMut::from(&full[..full.len() / 2]);
		assert!(FrameCodec.decode(&mut partial)?.is_none());
		assert!(matches!(
			FrameCodec.decode_eof(&mut partial).unwrap_err(),
			ProtoError::BytesRemaining
		));

		let mut whole = BytesMut::from(&full[..]);
		assert_eq!(FrameCodec.decode(&mut whole)?.unwrap(), frame);
		Ok(())
	}

	#[tokio::test]
	async fn test_frame_oversize_rejected() {
		// Forged length prefix way past the cap; no body needed to trip it.
		let mut buf = BytesMut::new();
		buf.extend_from_slice(&[u8::from(PacketKind::TunnelData), 0xFF, 0xFF, 0xFF, 0xFF]);
		assert!(matches!(
			FrameCodec.decode(&mut buf).unwrap_err(),
			ProtoError::Oversize { .. }
		));
	}

	#[tokio::test]
	async fn test_frame_truncated_body() {
		let frame = Frame::new(PacketKind::TunnelData.into(), Bytes::from(vec![1u8; 32]));
		let mut buf = BytesMut::new();
		FrameCodec.encode(frame, &mut buf).unwrap();
		let short = buf.split().freeze().slice(..20);
		let err = Frame::read_from(&mut short.as_ref()).await.unwrap_err();
		assert!(matches!(err, ProtoError::Truncated { missing: 17 }));
	}

	#[tokio::test]
	async fn test_unknown_kind_rejected() {
		let mut buf = BytesMut::from(&[0x3Fu8, 0, 0, 0, 0][..]);
		assert!(matches!(
			FrameCodec.decode(&mut buf).unwrap_err(),
			ProtoError::UnknownPacketKind { value: 0x3F }
		));
	}
}

use std::sync::{
	Arc,
	atomic::{AtomicBool, Ordering},
};

use bytes::{BufMut, Bytes, BytesMut};
use snafu::prelude::*;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tunnox_proto::{
	FLAG_COMPRESSED, FLAG_ENCRYPTED, KIND_MASK, MAX_BODY_LEN, OversizeSnafu, Packet, PacketKind,
};

use crate::{
	AeadCipher, BufferPool, CHUNK_PLAINTEXT_MAX, CancelledSnafu, ClosedSnafu, IoSnafu, MAX_IO_CHUNK,
	RateLimiter, Result, UnnegotiatedSnafu, compress_body, decompress_body,
};

/// Knobs fixed at pipeline construction. Encryption cannot be toggled later;
/// a rekey means a new pipeline.
pub struct ProcessorOpts {
	pub cipher:      Option<AeadCipher>,
	pub limiter:     Option<Arc<RateLimiter>>,
	pub buffer_size: usize,
}

impl Default for ProcessorOpts {
	fn default() -> Self {
		ProcessorOpts {
			cipher:      None,
			limiter:     None,
			buffer_size: crate::DEFAULT_BUFFER_SIZE,
		}
	}
}

struct ReadHalf {
	io:      Box<dyn AsyncRead + Send + Unpin>,
	/// Decrypted-but-undelivered plaintext from the raw path.
	pending: BytesMut,
}

struct WriteHalf {
	io: Box<dyn AsyncWrite + Send + Unpin>,
}

/// Frame and raw-byte I/O over one transformed byte stream.
///
/// The read half and the write half each sit behind their own async mutex so
/// two tasks can pump opposite directions in parallel; the closed flag is
/// re-checked after every lock acquisition to close the check-then-lock
/// window. Buffers returned to callers are copies, callers may retain them.
pub struct StreamProcessor {
	read_half:  tokio::sync::Mutex<ReadHalf>,
	write_half: tokio::sync::Mutex<WriteHalf>,
	cipher:     Option<AeadCipher>,
	limiter:    Option<Arc<RateLimiter>>,
	pool:       BufferPool,
	closed:     AtomicBool,
	cancel:     CancellationToken,
}

impl std::fmt::Debug for StreamProcessor {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("StreamProcessor").finish_non_exhaustive()
	}
}

impl StreamProcessor {
	pub fn new<S>(stream: S, opts: ProcessorOpts, cancel: CancellationToken) -> Self
	where
		S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
	{
		let (reader, writer) = tokio::io::split(stream);
		StreamProcessor {
			read_half:  tokio::sync::Mutex::new(ReadHalf {
				io:      Box::new(reader),
				pending: BytesMut::new(),
			}),
			write_half: tokio::sync::Mutex::new(WriteHalf { io: Box::new(writer) }),
			cipher:     opts.cipher,
			limiter:    opts.limiter,
			pool:       BufferPool::new(opts.buffer_size),
			closed:     AtomicBool::new(false),
			cancel,
		}
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	pub fn is_encrypted(&self) -> bool {
		self.cipher.is_some()
	}

	pub fn limiter(&self) -> Option<&Arc<RateLimiter>> {
		self.limiter.as_ref()
	}

	pub fn cancel_token(&self) -> &CancellationToken {
		&self.cancel
	}

	/// Idempotent. Wakes every suspended read/write with `Cancelled`, then
	/// shuts the underlying writer down.
	pub async fn close(&self) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		self.cancel.cancel();
		let mut half = self.write_half.lock().await;
		let _ = half.io.shutdown().await;
	}

	fn ensure_open(&self) -> Result<()> {
		ensure!(!self.is_closed(), ClosedSnafu);
		Ok(())
	}

	async fn cancellable<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
		tokio::select! {
			biased;
			_ = self.cancel.cancelled() => CancelledSnafu.fail(),
			res = fut => res,
		}
	}

	/// Read one packet, peeling AEAD and gzip off the body per the frame's
	/// flag bits.
	pub async fn read_packet(&self) -> Result<Packet> {
		let mut half = self.read_half.lock().await;
		self.ensure_open()?;

		let (type_octet, body, wire_len) = self
			.cancellable(read_raw_frame(&mut half.io, &self.pool))
			.await?;
		if let Some(limiter) = &self.limiter {
			limiter.wait(wire_len, &self.cancel).await?;
		}
		drop(half);

		let mut plain = body;
		if type_octet & FLAG_ENCRYPTED != 0 {
			let cipher = self.cipher.as_ref().context(UnnegotiatedSnafu { layer: "encryption" })?;
			plain = cipher.open_body(&plain)?;
		}
		if type_octet & FLAG_COMPRESSED != 0 {
			plain = decompress_body(&plain)?;
		}
		let frame = tunnox_proto::Frame::new(type_octet, Bytes::new());
		Ok(Packet::from_plain_frame(&frame, plain)?)
	}

	/// Transform and frame one packet, then push it to the wire under the
	/// write lock. The underlying writer is flushed after the body so layered
	/// buffering never strands a frame.
	pub async fn write_packet(&self, packet: &Packet, compress: bool) -> Result<()> {
		let mut octet = u8::from(packet.kind) & KIND_MASK;
		let mut buf = self.pool.get();

		if packet.kind == PacketKind::Heartbeat {
			buf.put_u8(octet);
		} else {
			let mut body = packet.plain_body()?;
			if compress && !body.is_empty() {
				body = compress_body(&body)?;
				octet |= FLAG_COMPRESSED;
			}
			if let Some(cipher) = &self.cipher {
				body = cipher.seal_body(&body)?;
				octet |= FLAG_ENCRYPTED;
			}
			if body.len() > MAX_BODY_LEN {
				self.pool.put(buf);
				return Err(OversizeSnafu {
					len: body.len(),
					max: MAX_BODY_LEN,
				}
				.build()
				.into());
			}
			buf.reserve(5 + body.len());
			buf.put_u8(octet);
			buf.put_u32(body.len() as u32);
			buf.put_slice(&body);
		}

		let mut half = self.write_half.lock().await;
		let open = self.ensure_open();
		let res = match open {
			Ok(()) => {
				self.cancellable(write_limited(
					&mut half.io,
					&buf,
					self.limiter.as_deref(),
					&self.cancel,
				))
				.await
			}
			Err(e) => Err(e),
		};
		drop(half);
		self.pool.put(buf);
		res
	}

	/// Raw-path write used by the tunnel pumps: bytes go through the AEAD
	/// chunking (when negotiated) and the limiter, but not the packet framing.
	pub async fn write_exact(&self, data: &[u8]) -> Result<()> {
		let mut half = self.write_half.lock().await;
		self.ensure_open()?;
		match &self.cipher {
			Some(cipher) => {
				for chunk in data.chunks(CHUNK_PLAINTEXT_MAX) {
					let mut sealed = self.pool.get();
					let seal_res = cipher.seal_chunk(chunk, &mut sealed);
					let res = match seal_res {
						Ok(()) => {
							self.cancellable(write_limited(
								&mut half.io,
								&sealed,
								self.limiter.as_deref(),
								&self.cancel,
							))
							.await
						}
						Err(e) => Err(e),
					};
					self.pool.put(sealed);
					res?;
				}
			}
			None => {
				self.cancellable(write_limited(
					&mut half.io,
					data,
					self.limiter.as_deref(),
					&self.cancel,
				))
				.await?;
			}
		}
		Ok(())
	}

	/// Raw-path read: up to `max` plaintext bytes, an empty buffer meaning a
	/// clean EOF from the peer.
	pub async fn read_available(&self, max: usize) -> Result<Bytes> {
		let mut half = self.read_half.lock().await;
		self.ensure_open()?;
		if half.pending.is_empty() && !self.fill_pending(&mut half, max).await? {
			return Ok(Bytes::new());
		}
		let take = max.min(half.pending.len());
		Ok(half.pending.split_to(take).freeze())
	}

	/// Raw-path read of exactly `n` bytes; EOF short of `n` is an error.
	pub async fn read_exact(&self, n: usize) -> Result<Bytes> {
		let mut half = self.read_half.lock().await;
		self.ensure_open()?;
		while half.pending.len() < n {
			let hint = n - half.pending.len();
			let more = self.fill_pending(&mut half, hint).await?;
			if !more {
				return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)).context(IoSnafu);
			}
		}
		Ok(half.pending.split_to(n).freeze())
	}

	/// Pull one unit off the wire into the pending buffer. Returns false on
	/// a clean EOF at a unit boundary.
	async fn fill_pending(&self, half: &mut ReadHalf, hint: usize) -> Result<bool> {
		match &self.cipher {
			Some(cipher) => {
				let chunk = self
					.cancellable(read_cipher_chunk(&mut half.io, cipher))
					.await?;
				match chunk {
					Some((plain, wire_len)) => {
						if let Some(limiter) = &self.limiter {
							limiter.wait(wire_len, &self.cancel).await?;
						}
						half.pending.extend_from_slice(&plain);
						Ok(true)
					}
					None => Ok(false),
				}
			}
			None => {
				let want = hint.clamp(1, self.pool.buf_size());
				let mut buf = self.pool.get();
				buf.resize(want, 0);
				let res = self
					.cancellable(async {
						half.io.read(&mut buf[..]).await.context(IoSnafu)
					})
					.await;
				let n = match res {
					Ok(n) => n,
					Err(e) => {
						self.pool.put(buf);
						return Err(e);
					}
				};
				if n > 0 {
					if let Some(limiter) = &self.limiter {
						limiter.wait(n, &self.cancel).await?;
					}
					half.pending.extend_from_slice(&buf[..n]);
				}
				self.pool.put(buf);
				Ok(n > 0)
			}
		}
	}
}

/// Read one frame's raw octets: type octet, optional length, transformed
/// body. Returns the total wire length for the limiter.
async fn read_raw_frame(
	io: &mut (dyn AsyncRead + Send + Unpin),
	pool: &BufferPool,
) -> Result<(u8, Bytes, usize)> {
	let type_octet = io.read_u8().await.context(IoSnafu)?;
	let value = type_octet & KIND_MASK;
	let kind: PacketKind = PacketKind::try_from(value)
		.map_err(|_| tunnox_proto::ProtoError::UnknownPacketKind { value })?;
	if kind == PacketKind::Heartbeat {
		return Ok((type_octet, Bytes::new(), 1));
	}
	let len = io.read_u32().await.context(IoSnafu)? as usize;
	if len > MAX_BODY_LEN {
		return Err(tunnox_proto::ProtoError::Oversize { len, max: MAX_BODY_LEN }.into());
	}
	let mut buf = pool.get();
	buf.resize(len, 0);
	let res = io.read_exact(&mut buf[..]).await.context(IoSnafu);
	let body = Bytes::copy_from_slice(&buf[..len]);
	pool.put(buf);
	res?;
	Ok((type_octet, body, 5 + len))
}

/// Read one AEAD chunk; `None` is a clean EOF before any prefix byte.
async fn read_cipher_chunk(
	io: &mut (dyn AsyncRead + Send + Unpin),
	cipher: &AeadCipher,
) -> Result<Option<(Vec<u8>, usize)>> {
	let mut prefix = [0u8; 4];
	let mut filled = 0;
	while filled < 4 {
		let n = io.read(&mut prefix[filled..]).await.context(IoSnafu)?;
		if n == 0 {
			if filled == 0 {
				return Ok(None);
			}
			return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)).context(IoSnafu);
		}
		filled += n;
	}
	let ct_len = u32::from_be_bytes(prefix) as usize;
	cipher.check_chunk_len(ct_len)?;

	let nonce_len = cipher.nonce_len();
	let mut rest = vec![0u8; nonce_len + ct_len];
	io.read_exact(&mut rest).await.context(IoSnafu)?;
	let plain = cipher.open_chunk(&rest[..nonce_len], &rest[nonce_len..])?;
	Ok(Some((plain, 4 + nonce_len + ct_len)))
}

/// Push `data` in limiter-sized chunks, each paying the bucket first, then
/// flush so buffered layers reach the wire.
async fn write_limited(
	io: &mut (dyn AsyncWrite + Send + Unpin),
	data: &[u8],
	limiter: Option<&RateLimiter>,
	cancel: &CancellationToken,
) -> Result<()> {
	for chunk in data.chunks(MAX_IO_CHUNK) {
		if let Some(limiter) = limiter {
			limiter.wait(chunk.len(), cancel).await?;
		}
		io.write_all(chunk).await.context(IoSnafu)?;
	}
	io.flush().await.context(IoSnafu)?;
	Ok(())
}

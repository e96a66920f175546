use aes_gcm::{
	Aes256Gcm, Key,
	aead::{Aead, AeadCore, KeyInit, OsRng},
};
use bytes::{BufMut, Bytes, BytesMut};
use chacha20poly1305::XChaCha20Poly1305;
use snafu::prelude::*;

use crate::{CryptoSnafu, InvalidParameterSnafu, OversizeChunkSnafu, Result};

/// Plaintext cap per AEAD chunk.
pub const CHUNK_PLAINTEXT_MAX: usize = 64 * 1024;
/// AEAD tag length for both supported ciphers.
pub const TAG_LEN: usize = 16;
/// Ciphertext cap per chunk; forged length prefixes beyond this abort the
/// stream before any allocation.
pub const CHUNK_CIPHERTEXT_MAX: usize = CHUNK_PLAINTEXT_MAX + TAG_LEN;

pub const KEY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherKind {
	#[default]
	Aes256Gcm,
	XChaCha20Poly1305,
}

impl CipherKind {
	pub fn from_name(name: &str) -> Result<Self> {
		match name {
			"aes-256-gcm" | "aes256gcm" => Ok(CipherKind::Aes256Gcm),
			"xchacha20-poly1305" | "xchacha20poly1305" => Ok(CipherKind::XChaCha20Poly1305),
			other => InvalidParameterSnafu {
				what:  "cipher",
				value: other.to_string(),
			}
			.fail(),
		}
	}

	pub fn nonce_len(self) -> usize {
		match self {
			CipherKind::Aes256Gcm => 12,
			CipherKind::XChaCha20Poly1305 => 24,
		}
	}
}

enum CipherInner {
	Aes(Box<Aes256Gcm>),
	XChaCha(Box<XChaCha20Poly1305>),
}

/// One keyed AEAD instance. Chunk format on the wire:
/// `[ciphertext-length u32 BE][nonce][ciphertext + tag]`, nonce fresh random
/// per chunk, `ciphertext-length = plaintext-length + 16`.
pub struct AeadCipher {
	kind:  CipherKind,
	inner: CipherInner,
}

impl AeadCipher {
	pub fn new(kind: CipherKind, key: &[u8; KEY_LEN]) -> Self {
		let inner = match kind {
			CipherKind::Aes256Gcm => {
				CipherInner::Aes(Box::new(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key))))
			}
			CipherKind::XChaCha20Poly1305 => CipherInner::XChaCha(Box::new(XChaCha20Poly1305::new(
				chacha20poly1305::Key::from_slice(key),
			))),
		};
		AeadCipher { kind, inner }
	}

	pub fn kind(&self) -> CipherKind {
		self.kind
	}

	pub fn nonce_len(&self) -> usize {
		self.kind.nonce_len()
	}

	/// Seal one chunk of at most [`CHUNK_PLAINTEXT_MAX`] bytes into `out`.
	pub fn seal_chunk(&self, plain: &[u8], out: &mut BytesMut) -> Result<()> {
		debug_assert!(plain.len() <= CHUNK_PLAINTEXT_MAX);
		let (nonce, ciphertext) = match &self.inner {
			CipherInner::Aes(cipher) => {
				let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
				let ct = cipher.encrypt(&nonce, plain).ok().context(CryptoSnafu)?;
				(nonce.to_vec(), ct)
			}
			CipherInner::XChaCha(cipher) => {
				let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
				let ct = cipher.encrypt(&nonce, plain).ok().context(CryptoSnafu)?;
				(nonce.to_vec(), ct)
			}
		};
		out.reserve(4 + nonce.len() + ciphertext.len());
		out.put_u32(ciphertext.len() as u32);
		out.put_slice(&nonce);
		out.put_slice(&ciphertext);
		Ok(())
	}

	/// Open one chunk given its already-read nonce and ciphertext.
	pub fn open_chunk(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
		match &self.inner {
			CipherInner::Aes(cipher) => cipher
				.decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext)
				.ok()
				.context(CryptoSnafu),
			CipherInner::XChaCha(cipher) => cipher
				.decrypt(chacha20poly1305::XNonce::from_slice(nonce), ciphertext)
				.ok()
				.context(CryptoSnafu),
		}
	}

	/// Validate a chunk's length prefix before any allocation happens.
	pub fn check_chunk_len(&self, len: usize) -> Result<()> {
		ensure!(
			len > 0 && len <= CHUNK_CIPHERTEXT_MAX,
			OversizeChunkSnafu {
				len,
				max: CHUNK_CIPHERTEXT_MAX
			}
		);
		Ok(())
	}

	/// Seal a whole packet body as a chunk sequence. An empty body seals to
	/// an empty sequence.
	pub fn seal_body(&self, plain: &[u8]) -> Result<Bytes> {
		let mut out = BytesMut::with_capacity(plain.len() + (plain.len() / CHUNK_PLAINTEXT_MAX + 1) * 64);
		for chunk in plain.chunks(CHUNK_PLAINTEXT_MAX) {
			self.seal_chunk(chunk, &mut out)?;
		}
		Ok(out.freeze())
	}

	/// Open a whole packet body. Every length prefix is validated before its
	/// chunk is touched; a partial final chunk is legal, a truncated one is
	/// not.
	pub fn open_body(&self, mut body: &[u8]) -> Result<Bytes> {
		let nonce_len = self.nonce_len();
		let mut out = BytesMut::with_capacity(body.len());
		while !body.is_empty() {
			ensure!(
				body.len() >= 4,
				OversizeChunkSnafu {
					len: body.len(),
					max: CHUNK_CIPHERTEXT_MAX
				}
			);
			let ct_len = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
			self.check_chunk_len(ct_len)?;
			ensure!(
				body.len() >= 4 + nonce_len + ct_len,
				OversizeChunkSnafu {
					len: ct_len,
					max: CHUNK_CIPHERTEXT_MAX
				}
			);
			let nonce = &body[4..4 + nonce_len];
			let ciphertext = &body[4 + nonce_len..4 + nonce_len + ct_len];
			out.put_slice(&self.open_chunk(nonce, ciphertext)?);
			body = &body[4 + nonce_len + ct_len..];
		}
		Ok(out.freeze())
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::StreamError;

	fn key() -> [u8; KEY_LEN] {
		let mut k = [0u8; KEY_LEN];
		for (i, b) in k.iter_mut().enumerate() {
			*b = i as u8;
		}
		k
	}

	#[test]
	fn test_roundtrip_boundary_sizes() -> eyre::Result<()> {
		for kind in [CipherKind::Aes256Gcm, CipherKind::XChaCha20Poly1305] {
			let cipher = AeadCipher::new(kind, &key());
			for size in [0usize, 1, 65535, 65536, 65537, 1024 * 1024] {
				let plain: Vec<u8> = (0..size).map(|i| (i * 7) as u8).collect();
				let sealed = cipher.seal_body(&plain)?;
				let opened = cipher.open_body(&sealed)?;
				assert_eq!(&opened[..], &plain[..], "{kind:?} size {size}");
			}
		}
		Ok(())
	}

	#[test]
	fn test_any_bit_flip_fails() -> eyre::Result<()> {
		let cipher = AeadCipher::new(CipherKind::Aes256Gcm, &key());
		let sealed = cipher.seal_body(&[0x55u8; 300])?;
		// Walk a sample of positions across the length prefix, nonce, and
		// ciphertext; every single-bit mutation must be rejected.
		for pos in (0..sealed.len()).step_by(7) {
			let mut forged = sealed.to_vec();
			forged[pos] ^= 0x01;
			assert!(cipher.open_body(&forged).is_err(), "flip at {pos} went unnoticed");
		}
		Ok(())
	}

	#[test]
	fn test_forged_length_prefix_rejected() {
		let cipher = AeadCipher::new(CipherKind::Aes256Gcm, &key());
		let mut forged = BytesMut::new();
		forged.put_u32((CHUNK_CIPHERTEXT_MAX + 1) as u32);
		forged.extend_from_slice(&[0u8; 64]);
		assert!(matches!(
			cipher.open_body(&forged).unwrap_err(),
			StreamError::OversizeChunk { .. }
		));

		let mut zero = BytesMut::new();
		zero.put_u32(0);
		assert!(matches!(
			cipher.open_body(&zero).unwrap_err(),
			StreamError::OversizeChunk { len: 0, .. }
		));
	}

	#[test]
	fn test_cross_cipher_rejects() -> eyre::Result<()> {
		let aes = AeadCipher::new(CipherKind::Aes256Gcm, &key());
		let xchacha = AeadCipher::new(CipherKind::XChaCha20Poly1305, &key());
		let sealed = aes.seal_body(b"hello")?;
		assert!(xchacha.open_body(&sealed).is_err());
		Ok(())
	}
}

use std::io::{Read as _, Write as _};

use bytes::Bytes;
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use snafu::prelude::*;
use tunnox_proto::MAX_BODY_LEN;

use crate::{CorruptSnafu, Result};

/// Gzip one packet body. The encoder is finished here so the trailer lands
/// inside the body; a consumer never blocks on a missing flush.
pub fn compress_body(plain: &[u8]) -> Result<Bytes> {
	let mut encoder = GzEncoder::new(Vec::with_capacity(plain.len() / 2 + 64), Compression::default());
	encoder.write_all(plain).context(CorruptSnafu)?;
	Ok(encoder.finish().context(CorruptSnafu)?.into())
}

/// Inflate one packet body, capped at the frame body limit so a gzip bomb
/// cannot out-allocate the 16 MiB wire cap it snuck under.
pub fn decompress_body(body: &[u8]) -> Result<Bytes> {
	let mut out = Vec::with_capacity(body.len() * 2);
	let mut decoder = GzDecoder::new(body).take(MAX_BODY_LEN as u64 + 1);
	decoder.read_to_end(&mut out).context(CorruptSnafu)?;
	ensure!(
		out.len() <= MAX_BODY_LEN,
		crate::OversizeChunkSnafu {
			len: out.len(),
			max: MAX_BODY_LEN
		}
	);
	Ok(out.into())
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::StreamError;

	#[test]
	fn test_gzip_roundtrip() -> eyre::Result<()> {
		for size in [0usize, 1, 1024, 256 * 1024] {
			let plain: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
			let packed = compress_body(&plain)?;
			assert_eq!(&decompress_body(&packed)?[..], &plain[..]);
		}
		Ok(())
	}

	#[test]
	fn test_highly_redundant_body_shrinks() -> eyre::Result<()> {
		let plain = vec![b'a'; 64 * 1024];
		let packed = compress_body(&plain)?;
		assert!(packed.len() < plain.len() / 10);
		Ok(())
	}

	#[test]
	fn test_garbage_rejected() {
		assert!(matches!(
			decompress_body(b"definitely not gzip").unwrap_err(),
			StreamError::Corrupt { .. }
		));
	}
}

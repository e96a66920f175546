use std::{
	collections::HashMap,
	sync::{Arc, RwLock},
};

use snafu::prelude::*;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
	AeadCipher, AlreadyExistsSnafu, CipherKind, InvalidParameterSnafu, KEY_LEN, NotFoundSnafu,
	ProcessorOpts, RateLimiter, Result, StreamProcessor,
};

/// Policy knobs for building pipelines; one factory per keying domain (the
/// control link and each mapping get their own).
#[derive(Clone)]
pub struct FactoryConfig {
	pub enable_compression: bool,
	pub enable_encryption:  bool,
	pub encryption_key:     Option<[u8; KEY_LEN]>,
	pub cipher:             CipherKind,
	pub enable_rate_limit:  bool,
	pub rate_bps:           u64,
	pub buffer_size:        usize,
}

impl Default for FactoryConfig {
	fn default() -> Self {
		FactoryConfig {
			enable_compression: false,
			enable_encryption:  false,
			encryption_key:     None,
			cipher:             CipherKind::default(),
			enable_rate_limit:  false,
			rate_bps:           0,
			buffer_size:        crate::DEFAULT_BUFFER_SIZE,
		}
	}
}

/// Composes the transform stack described by a [`FactoryConfig`] around a
/// freshly dialed byte stream.
pub struct StreamFactory {
	config: FactoryConfig,
}

impl StreamFactory {
	pub fn new(config: FactoryConfig) -> Self {
		StreamFactory { config }
	}

	pub fn config(&self) -> &FactoryConfig {
		&self.config
	}

	pub fn compression(&self) -> bool {
		self.config.enable_compression
	}

	pub fn wrap<S>(&self, stream: S, cancel: CancellationToken) -> Result<Arc<StreamProcessor>>
	where
		S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
	{
		let cipher = if self.config.enable_encryption {
			let key = self.config.encryption_key.context(InvalidParameterSnafu {
				what:  "encryption_key",
				value: "missing".to_string(),
			})?;
			Some(AeadCipher::new(self.config.cipher, &key))
		} else {
			None
		};
		let limiter = if self.config.enable_rate_limit {
			Some(Arc::new(RateLimiter::new(self.config.rate_bps)?))
		} else {
			None
		};
		Ok(Arc::new(StreamProcessor::new(
			stream,
			ProcessorOpts {
				cipher,
				limiter,
				buffer_size: self.config.buffer_size,
			},
			cancel,
		)))
	}
}

/// Registry of live pipelines by id. The quota enforcer walks it to retune
/// limiters; shutdown closes everything still registered.
#[derive(Default)]
pub struct StreamManager {
	streams: RwLock<HashMap<String, Arc<StreamProcessor>>>,
}

impl StreamManager {
	pub fn new() -> Self {
		StreamManager::default()
	}

	pub fn register(&self, id: impl Into<String>, stream: Arc<StreamProcessor>) -> Result<()> {
		let id = id.into();
		let mut streams = self.streams.write().expect("registry poisoned");
		ensure!(!streams.contains_key(&id), AlreadyExistsSnafu { id });
		streams.insert(id, stream);
		Ok(())
	}

	pub fn get(&self, id: &str) -> Result<Arc<StreamProcessor>> {
		let streams = self.streams.read().expect("registry poisoned");
		streams.get(id).cloned().context(NotFoundSnafu { id })
	}

	pub fn remove(&self, id: &str) -> Option<Arc<StreamProcessor>> {
		let mut streams = self.streams.write().expect("registry poisoned");
		streams.remove(id)
	}

	pub fn len(&self) -> usize {
		self.streams.read().expect("registry poisoned").len()
	}

	pub fn list_ids(&self) -> Vec<String> {
		self.streams.read().expect("registry poisoned").keys().cloned().collect()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Retune every live limiter; pipelines without one are untouched.
	pub fn set_rate_all(&self, rate_bps: u64) {
		let streams = self.streams.read().expect("registry poisoned");
		for (id, stream) in streams.iter() {
			if let Some(limiter) = stream.limiter() {
				if let Err(e) = limiter.set_rate(rate_bps) {
					debug!(target: "[STREAM]", "skipping limiter on `{id}`: {e}");
				}
			}
		}
	}

	pub async fn shutdown(&self) {
		let drained: Vec<_> = {
			let mut streams = self.streams.write().expect("registry poisoned");
			streams.drain().collect()
		};
		for (id, stream) in drained {
			debug!(target: "[STREAM]", "closing pipeline `{id}`");
			stream.close().await;
		}
	}
}

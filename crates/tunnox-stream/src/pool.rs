use std::sync::Mutex;

use bytes::BytesMut;

/// Default scratch buffer size, sized for the typical frame.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;
const MAX_POOLED: usize = 16;

/// A small free-list of scratch buffers to cut allocation pressure on the
/// per-frame hot path. Buffers handed back to callers are always copies, so
/// callers may retain them; only internal scratch cycles through here.
pub struct BufferPool {
	buffers:  Mutex<Vec<BytesMut>>,
	buf_size: usize,
}

impl BufferPool {
	pub fn new(buf_size: usize) -> Self {
		BufferPool {
			buffers: Mutex::new(Vec::with_capacity(MAX_POOLED)),
			buf_size,
		}
	}

	pub fn buf_size(&self) -> usize {
		self.buf_size
	}

	pub fn get(&self) -> BytesMut {
		let mut buffers = self.buffers.lock().expect("pool poisoned");
		buffers.pop().unwrap_or_else(|| BytesMut::with_capacity(self.buf_size))
	}

	pub fn put(&self, mut buf: BytesMut) {
		buf.clear();
		// Oversized one-offs are dropped rather than pinned in the pool.
		if buf.capacity() > self.buf_size * 4 {
			return;
		}
		let mut buffers = self.buffers.lock().expect("pool poisoned");
		if buffers.len() < MAX_POOLED {
			buffers.push(buf);
		}
	}
}

impl Default for BufferPool {
	fn default() -> Self {
		BufferPool::new(DEFAULT_BUFFER_SIZE)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_pool_recycles() {
		let pool = BufferPool::new(1024);
		let mut buf = pool.get();
		buf.extend_from_slice(&[1, 2, 3]);
		let cap = buf.capacity();
		pool.put(buf);
		let buf = pool.get();
		assert!(buf.is_empty());
		assert_eq!(buf.capacity(), cap);
	}

	#[test]
	fn test_oversized_buffers_dropped() {
		let pool = BufferPool::new(1024);
		pool.put(BytesMut::with_capacity(1024 * 1024));
		assert!(pool.get().capacity() <= 1024);
	}
}

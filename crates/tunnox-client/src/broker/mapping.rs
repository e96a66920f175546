use std::sync::atomic::{AtomicU64, Ordering};

use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tunnox_proto::payload::MappingConfig;

/// Per-mapping byte and tunnel counters, updated by the copy pumps and read
/// by the status surface and the quota reporter. Counters survive per-tunnel
/// churn; only mapping teardown drops them.
#[derive(Debug, Default)]
pub struct MappingStats {
	bytes_sent:     AtomicU64,
	bytes_received: AtomicU64,
	active_tunnels: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficSnapshot {
	pub bytes_sent:     u64,
	pub bytes_received: u64,
	pub active_tunnels: u64,
}

impl MappingStats {
	pub fn add_sent(&self, n: u64) {
		self.bytes_sent.fetch_add(n, Ordering::Relaxed);
	}

	pub fn add_received(&self, n: u64) {
		self.bytes_received.fetch_add(n, Ordering::Relaxed);
	}

	pub fn tunnel_started(&self) {
		self.active_tunnels.fetch_add(1, Ordering::Relaxed);
	}

	pub fn tunnel_finished(&self) {
		self.active_tunnels.fetch_sub(1, Ordering::Relaxed);
	}

	pub fn snapshot(&self) -> TrafficSnapshot {
		TrafficSnapshot {
			bytes_sent:     self.bytes_sent.load(Ordering::Relaxed),
			bytes_received: self.bytes_received.load(Ordering::Relaxed),
			active_tunnels: self.active_tunnels.load(Ordering::Relaxed),
		}
	}
}

/// A live mapping: its pushed/created config, its counters, and the token
/// whose cancellation tears down the listener and every tunnel under it.
#[derive(Debug)]
pub struct MappingHandle {
	pub config: MappingConfig,
	pub stats:  std::sync::Arc<MappingStats>,
	pub cancel: CancellationToken,
	bound:      std::sync::OnceLock<std::net::SocketAddr>,
}

impl MappingHandle {
	pub fn new(config: MappingConfig, parent: &CancellationToken) -> std::sync::Arc<Self> {
		std::sync::Arc::new(MappingHandle {
			config,
			stats: std::sync::Arc::new(MappingStats::default()),
			cancel: parent.child_token(),
			bound: std::sync::OnceLock::new(),
		})
	}

	pub fn is_expired(&self, now: OffsetDateTime) -> bool {
		matches!(self.config.expires_at, Some(at) if at <= now)
	}

	/// The address the listener actually bound, once it has. Differs from
	/// the configured one when the config asked for port 0.
	pub fn bound_addr(&self) -> Option<std::net::SocketAddr> {
		self.bound.get().copied()
	}

	pub(crate) fn set_bound_addr(&self, addr: std::net::SocketAddr) {
		let _ = self.bound.set(addr);
	}
}

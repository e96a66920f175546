use std::sync::Mutex;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{CancelledSnafu, InvalidParameterSnafu, Result};

/// Burst capacity is rate divided by this, clamped to `[MIN_BURST, rate]`.
pub const DEFAULT_BURST_RATIO: u64 = 10;
pub const MIN_BURST: u64 = 1024;
/// Reads and writes are split into chunks of at most this many bytes, each
/// chunk paying the bucket before it moves.
pub const MAX_IO_CHUNK: usize = 32 * 1024;

struct Bucket {
	rate:     u64,
	capacity: u64,
	tokens:   f64,
	refilled: Instant,
}

impl Bucket {
	fn refill(&mut self, now: Instant) {
		let elapsed = now.saturating_duration_since(self.refilled).as_secs_f64();
		self.tokens = (self.tokens + elapsed * self.rate as f64).min(self.capacity as f64);
		self.refilled = now;
	}
}

fn burst_capacity(rate: u64) -> u64 {
	(rate / DEFAULT_BURST_RATIO).max(MIN_BURST).min(rate)
}

/// Token bucket shaping the bytes a pipeline puts on (or takes off) the
/// wire. Shared via `Arc`; the quota enforcer retunes live limiters through
/// [`RateLimiter::set_rate`].
pub struct RateLimiter {
	bucket: Mutex<Bucket>,
}

impl RateLimiter {
	pub fn new(rate_bps: u64) -> Result<Self> {
		if rate_bps == 0 {
			return InvalidParameterSnafu {
				what:  "rate",
				value: "0".to_string(),
			}
			.fail();
		}
		let capacity = burst_capacity(rate_bps);
		Ok(RateLimiter {
			bucket: Mutex::new(Bucket {
				rate: rate_bps,
				capacity,
				tokens: capacity as f64,
				refilled: Instant::now(),
			}),
		})
	}

	pub fn rate(&self) -> u64 {
		self.bucket.lock().expect("bucket poisoned").rate
	}

	/// Retune the bucket. Capacity is recomputed and the current token count
	/// truncated so it can never exceed the new capacity.
	pub fn set_rate(&self, rate_bps: u64) -> Result<()> {
		if rate_bps == 0 {
			return InvalidParameterSnafu {
				what:  "rate",
				value: "0".to_string(),
			}
			.fail();
		}
		let mut bucket = self.bucket.lock().expect("bucket poisoned");
		bucket.refill(Instant::now());
		bucket.rate = rate_bps;
		bucket.capacity = burst_capacity(rate_bps);
		bucket.tokens = bucket.tokens.min(bucket.capacity as f64);
		Ok(())
	}

	/// Take `n` tokens, sleeping out the shortfall. The debt model keeps a
	/// single chunk larger than the burst capacity from stalling forever:
	/// tokens go negative and the sleep covers the deficit.
	pub async fn wait(&self, n: usize, cancel: &CancellationToken) -> Result<()> {
		let sleep_for = {
			let mut bucket = self.bucket.lock().expect("bucket poisoned");
			bucket.refill(Instant::now());
			bucket.tokens -= n as f64;
			if bucket.tokens >= 0.0 {
				None
			} else {
				Some(std::time::Duration::from_secs_f64(-bucket.tokens / bucket.rate as f64))
			}
		};
		if let Some(dur) = sleep_for {
			tokio::select! {
				_ = cancel.cancelled() => return CancelledSnafu.fail(),
				_ = tokio::time::sleep(dur) => {}
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use std::sync::Arc;

	use tokio::time::Instant;
	use tokio_util::sync::CancellationToken;

	use super::*;
	use crate::StreamError;

	#[test]
	fn test_burst_clamping() {
		// rate/10 below the floor
		assert_eq!(burst_capacity(4096), 1024);
		// floor above the rate itself
		assert_eq!(burst_capacity(512), 512);
		// plain ratio
		assert_eq!(burst_capacity(1024 * 1024), 104857);
	}

	#[tokio::test(start_paused = true)]
	async fn test_throughput_matches_rate() -> eyre::Result<()> {
		let rate = 1024 * 1024u64;
		let limiter = RateLimiter::new(rate)?;
		let cancel = CancellationToken::new();

		let total = 5 * 1024 * 1024usize;
		let start = Instant::now();
		let mut sent = 0;
		while sent < total {
			let n = MAX_IO_CHUNK.min(total - sent);
			limiter.wait(n, &cancel).await?;
			sent += n;
		}
		let elapsed = start.elapsed().as_secs_f64();
		let ideal = total as f64 / rate as f64;
		let burst = burst_capacity(rate) as f64 / rate as f64;
		assert!(elapsed >= ideal - burst - 0.05, "too fast: {elapsed}s");
		assert!(elapsed <= ideal + 0.5, "too slow: {elapsed}s");
		Ok(())
	}

	#[tokio::test(start_paused = true)]
	async fn test_set_rate_takes_effect() -> eyre::Result<()> {
		let limiter = Arc::new(RateLimiter::new(1024 * 1024)?);
		let cancel = CancellationToken::new();
		let five_mib = 5 * 1024 * 1024usize;

		let start = Instant::now();
		let mut sent = 0;
		while sent < five_mib {
			let n = MAX_IO_CHUNK.min(five_mib - sent);
			limiter.wait(n, &cancel).await?;
			sent += n;
		}
		let slow = start.elapsed().as_secs_f64();
		assert!((4.0..6.0).contains(&slow), "1 MiB/s leg took {slow}s");

		limiter.set_rate(5 * 1024 * 1024)?;
		let start = Instant::now();
		let mut sent = 0;
		while sent < five_mib {
			let n = MAX_IO_CHUNK.min(five_mib - sent);
			limiter.wait(n, &cancel).await?;
			sent += n;
		}
		let fast = start.elapsed().as_secs_f64();
		assert!((0.5..1.6).contains(&fast), "5 MiB/s leg took {fast}s");
		Ok(())
	}

	#[tokio::test(start_paused = true)]
	async fn test_set_rate_truncates_tokens() -> eyre::Result<()> {
		let limiter = RateLimiter::new(10 * 1024 * 1024)?;
		// Full bucket at 10 MiB/s, then drop to a tiny rate; the stored
		// tokens must shrink to the new capacity, not carry the old burst.
		limiter.set_rate(10_240)?;
		let bucket = limiter.bucket.lock().unwrap();
		assert!(bucket.tokens <= bucket.capacity as f64);
		assert_eq!(bucket.capacity, 1024);
		Ok(())
	}

	#[tokio::test(start_paused = true)]
	async fn test_wait_cancellable() -> eyre::Result<()> {
		let limiter = Arc::new(RateLimiter::new(1024)?);
		let cancel = CancellationToken::new();
		// Drain the bucket, then ask for more than a refill can cover soon.
		limiter.wait(1024, &cancel).await?;
		let limiter2 = limiter.clone();
		let cancel2 = cancel.clone();
		let waiter = tokio::spawn(async move { limiter2.wait(1024 * 1024, &cancel2).await });
		tokio::task::yield_now().await;
		cancel.cancel();
		let res = waiter.await?;
		assert!(matches!(res.unwrap_err(), StreamError::Cancelled));
		Ok(())
	}
}

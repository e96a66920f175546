//! Quota enforcement: a sync loop against the platform API, bandwidth
//! retuning of live pipelines, refusal of new opens once a user is over
//! their monthly budget, and aggregated traffic reporting.

use std::{
	pin::Pin,
	sync::{Arc, Mutex},
	time::Duration,
};

use time::OffsetDateTime;
use tracing::{debug, info, warn};
use tunnox_proto::payload::{QuotaStatus, TrafficReport};

use crate::{Result, TunnelBroker, broker::TrafficSnapshot};

/// Sentinel for "no limit" on any quota field.
pub const UNLIMITED: i64 = -1;

pub type QuotaFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// The platform API the enforcer syncs against. The binary wires a real
/// HTTP client in; tests script one.
pub trait QuotaApi: Send + Sync {
	fn fetch(&self, user_id: &str) -> QuotaFuture<'_, QuotaStatus>;
	fn report(&self, report: TrafficReport) -> QuotaFuture<'_, ()>;
}

pub struct QuotaEnforcerOpts {
	pub user_id:         String,
	pub sync_interval:   Duration,
	pub report_interval: Duration,
	/// Also tear down live tunnels when the quota flips to exceeded,
	/// instead of only refusing new ones.
	pub hard_cutoff:     bool,
}

impl QuotaEnforcerOpts {
	pub fn new(user_id: impl Into<String>) -> Self {
		QuotaEnforcerOpts {
			user_id:         user_id.into(),
			sync_interval:   Duration::from_secs(60),
			report_interval: Duration::from_secs(30),
			hard_cutoff:     false,
		}
	}
}

#[derive(Debug, Clone, Copy, Default)]
struct QuotaCache {
	status:    Option<QuotaStatus>,
	throttled: bool,
	/// Traffic totals as of the last report, for delta computation.
	reported:  (u64, u64),
}

pub struct QuotaEnforcer {
	api:   Arc<dyn QuotaApi>,
	opts:  QuotaEnforcerOpts,
	cache: Mutex<QuotaCache>,
}

impl QuotaEnforcer {
	pub fn new(api: Arc<dyn QuotaApi>, opts: QuotaEnforcerOpts) -> Arc<Self> {
		Arc::new(QuotaEnforcer {
			api,
			opts,
			cache: Mutex::new(QuotaCache::default()),
		})
	}

	pub fn status(&self) -> Option<QuotaStatus> {
		self.cache.lock().expect("cache poisoned").status
	}

	pub fn is_throttled(&self) -> bool {
		self.cache.lock().expect("cache poisoned").throttled
	}

	/// When a platform snapshot last landed in the cache.
	pub fn last_sync(&self) -> Option<OffsetDateTime> {
		self.cache
			.lock()
			.expect("cache poisoned")
			.status
			.and_then(|s| s.last_sync)
	}

	/// Run until the broker's token cancels. A final traffic report goes out
	/// before exit so the platform never loses the tail of a session.
	pub async fn run(self: Arc<Self>, broker: Arc<TunnelBroker>) {
		let token = broker.cancel_token().clone();
		let mut sync_tick = tokio::time::interval(self.opts.sync_interval);
		let mut report_tick = tokio::time::interval(self.opts.report_interval);

		loop {
			tokio::select! {
				_ = token.cancelled() => break,
				_ = sync_tick.tick() => self.sync_once(&broker).await,
				_ = report_tick.tick() => self.report_once(&broker).await,
			}
		}
		self.report_once(&broker).await;
		info!(target: "[QUOTA]", "final traffic report sent");
	}

	async fn sync_once(&self, broker: &Arc<TunnelBroker>) {
		let status = match self.api.fetch(&self.opts.user_id).await {
			Ok(status) => status,
			Err(e) => {
				warn!(target: "[QUOTA]", "sync failed: {e}");
				return;
			}
		};
		self.apply(broker, status).await;
	}

	/// Push a fresh platform snapshot into the running system: retune every
	/// live limiter on a bandwidth change, gate opens on `exceeded`.
	pub async fn apply(&self, broker: &Arc<TunnelBroker>, mut status: QuotaStatus) {
		status.last_sync = Some(OffsetDateTime::now_utc());
		let previous = {
			let mut cache = self.cache.lock().expect("cache poisoned");
			let previous = cache.status.replace(status);
			cache.throttled = status.bandwidth_limit_bps != UNLIMITED && status.bandwidth_limit_bps > 0;
			previous
		};

		let bandwidth_changed = previous.map(|p| p.bandwidth_limit_bps) != Some(status.bandwidth_limit_bps);
		if bandwidth_changed && status.bandwidth_limit_bps > 0 {
			info!(
				target: "[QUOTA]",
				"bandwidth limit now {} B/s, retuning live pipelines",
				status.bandwidth_limit_bps
			);
			broker.stream_manager().set_rate_all(status.bandwidth_limit_bps as u64);
		}

		let was_refusing = broker.refusing_opens();
		if status.exceeded && !was_refusing {
			warn!(target: "[QUOTA]", "user `{}` over quota, refusing new tunnels", self.opts.user_id);
			broker.set_refuse_opens(true);
			if self.opts.hard_cutoff {
				broker.stream_manager().shutdown().await;
			}
		} else if !status.exceeded && was_refusing {
			info!(target: "[QUOTA]", "user `{}` back under quota", self.opts.user_id);
			broker.set_refuse_opens(false);
		}
	}

	async fn report_once(&self, broker: &Arc<TunnelBroker>) {
		let snap: TrafficSnapshot = broker.total_traffic();
		let (sent_delta, received_delta) = {
			let mut cache = self.cache.lock().expect("cache poisoned");
			let (last_sent, last_received) = cache.reported;
			let delta = (
				snap.bytes_sent.saturating_sub(last_sent),
				snap.bytes_received.saturating_sub(last_received),
			);
			cache.reported = (snap.bytes_sent, snap.bytes_received);
			delta
		};
		if sent_delta == 0 && received_delta == 0 {
			return;
		}
		let report = TrafficReport {
			user_id:              self.opts.user_id.clone(),
			bytes_sent_delta:     sent_delta,
			bytes_received_delta: received_delta,
		};
		debug!(
			target: "[QUOTA]",
			"reporting +{}B sent, +{}B received", sent_delta, received_delta
		);
		if let Err(e) = self.api.report(report).await {
			warn!(target: "[QUOTA]", "traffic report failed: {e}");
			// Roll the window back so the delta is retried next tick.
			let mut cache = self.cache.lock().expect("cache poisoned");
			cache.reported = (
				cache.reported.0.saturating_sub(sent_delta),
				cache.reported.1.saturating_sub(received_delta),
			);
		}
	}
}

#[cfg(test)]
mod test {
	use std::sync::atomic::{AtomicBool, Ordering};

	use tokio_util::sync::CancellationToken;
	use tunnox_proto::payload::{Direction, MappingConfig, MappingProtocol};
	use tunnox_stream::{FactoryConfig, StreamFactory};
	use tunnox_transport::{ServerAddr, TransportKind};

	use super::*;
	use crate::{BrokerOpts, ClientError, ControlSession, Identity, SessionOpts};

	struct FakeApi {
		status:       Mutex<QuotaStatus>,
		reports:      Mutex<Vec<TrafficReport>>,
		fail_reports: AtomicBool,
	}

	impl FakeApi {
		fn new(status: QuotaStatus) -> Arc<Self> {
			Arc::new(FakeApi {
				status:       Mutex::new(status),
				reports:      Mutex::new(Vec::new()),
				fail_reports: AtomicBool::new(false),
			})
		}
	}

	impl QuotaApi for FakeApi {
		fn fetch(&self, _user_id: &str) -> QuotaFuture<'_, QuotaStatus> {
			Box::pin(async move { Ok(*self.status.lock().unwrap()) })
		}

		fn report(&self, report: TrafficReport) -> QuotaFuture<'_, ()> {
			Box::pin(async move {
				if self.fail_reports.load(Ordering::SeqCst) {
					return Err(ClientError::Network {
						source: Box::new(std::io::Error::other("platform down")),
					});
				}
				self.reports.lock().unwrap().push(report);
				Ok(())
			})
		}
	}

	fn snapshot(bandwidth_limit_bps: i64, exceeded: bool) -> QuotaStatus {
		QuotaStatus {
			monthly_limit_bytes: UNLIMITED,
			bandwidth_limit_bps,
			used_bytes: 0,
			exceeded,
			last_sync: None,
		}
	}

	fn broker() -> Arc<TunnelBroker> {
		let addr = ServerAddr::parse("127.0.0.1:1").unwrap();
		let session = ControlSession::new(
			SessionOpts::new(addr.clone(), TransportKind::Tcp),
			Identity::unassigned("dq"),
			None,
		);
		TunnelBroker::new(session, BrokerOpts::new(addr, TransportKind::Tcp))
	}

	#[test]
	fn test_unlimited_sentinel() {
		let status = snapshot(UNLIMITED, false);
		assert_eq!(status.monthly_limit_bytes, -1);
		assert_eq!(status.bandwidth_limit_bps, -1);
	}

	/// A bandwidth change retunes every live limiter; flipping `exceeded`
	/// gates new opens and clearing it reopens them. Each applied snapshot
	/// gets a sync stamp.
	#[tokio::test]
	async fn test_apply_retunes_and_gates() -> eyre::Result<()> {
		let broker = broker();
		let factory = StreamFactory::new(FactoryConfig {
			enable_rate_limit: true,
			rate_bps:          1024 * 1024,
			..Default::default()
		});
		let (a, _b) = tokio::io::duplex(64);
		let pipe = factory.wrap(a, CancellationToken::new())?;
		broker.stream_manager().register("pipe", pipe.clone())?;

		let api = FakeApi::new(snapshot(UNLIMITED, false));
		let enforcer = QuotaEnforcer::new(api, QuotaEnforcerOpts::new("u1"));
		assert!(enforcer.last_sync().is_none());

		enforcer.apply(&broker, snapshot(2048, false)).await;
		assert_eq!(pipe.limiter().unwrap().rate(), 2048);
		assert!(enforcer.is_throttled());
		assert!(!broker.refusing_opens());
		assert!(enforcer.last_sync().is_some());

		enforcer.apply(&broker, snapshot(2048, true)).await;
		assert!(broker.refusing_opens());

		enforcer.apply(&broker, snapshot(2048, false)).await;
		assert!(!broker.refusing_opens());

		enforcer.apply(&broker, snapshot(UNLIMITED, false)).await;
		assert!(!enforcer.is_throttled());
		// Unlimited leaves the last configured rate in place.
		assert_eq!(pipe.limiter().unwrap().rate(), 2048);
		Ok(())
	}

	/// Reports carry only the delta since the previous report, a failed
	/// report rolls the window back so the delta retries, and a quiet
	/// window reports nothing.
	#[tokio::test]
	async fn test_report_deltas_and_rollback() -> eyre::Result<()> {
		let broker = broker();
		broker
			.add_mapping(MappingConfig {
				mapping_id:     "m1".into(),
				direction:      Direction::Inbound,
				protocol:       MappingProtocol::Tcp,
				secret_key:     "s".into(),
				listen_address: None,
				target_address: Some("127.0.0.1:9".into()),
				expires_at:     None,
			})
			.await?;
		let mapping = broker.get_mapping("m1")?;

		let api = FakeApi::new(snapshot(UNLIMITED, false));
		let enforcer = QuotaEnforcer::new(api.clone(), QuotaEnforcerOpts::new("u1"));

		// Nothing moved yet, nothing reported.
		enforcer.report_once(&broker).await;
		assert!(api.reports.lock().unwrap().is_empty());

		mapping.stats.add_sent(100);
		mapping.stats.add_received(50);
		enforcer.report_once(&broker).await;
		{
			let reports = api.reports.lock().unwrap();
			assert_eq!(reports.len(), 1);
			assert_eq!(reports[0].user_id, "u1");
			assert_eq!(reports[0].bytes_sent_delta, 100);
			assert_eq!(reports[0].bytes_received_delta, 50);
		}

		// A failed report rolls the window back so the delta is retried.
		mapping.stats.add_sent(20);
		api.fail_reports.store(true, Ordering::SeqCst);
		enforcer.report_once(&broker).await;
		assert_eq!(api.reports.lock().unwrap().len(), 1);

		api.fail_reports.store(false, Ordering::SeqCst);
		enforcer.report_once(&broker).await;
		let reports = api.reports.lock().unwrap();
		assert_eq!(reports.len(), 2);
		assert_eq!(reports[1].bytes_sent_delta, 20);
		assert_eq!(reports[1].bytes_received_delta, 0);
		Ok(())
	}
}

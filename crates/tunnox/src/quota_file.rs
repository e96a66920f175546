//! File-backed quota collaborator: a platform agent drops status snapshots
//! into a JSON file, traffic reports append to a JSON-lines file. Stands in
//! for the HTTP platform API without pulling a web stack into the client.

use std::{io::Write as _, path::PathBuf};

use tracing::debug;
use tunnox_client::{ClientError, QuotaApi, quota::QuotaFuture};
use tunnox_proto::payload::{QuotaStatus, TrafficReport};

pub struct FileQuotaApi {
	status_path: Option<PathBuf>,
	report_path: Option<PathBuf>,
}

impl FileQuotaApi {
	pub fn new(status_path: Option<PathBuf>, report_path: Option<PathBuf>) -> Self {
		FileQuotaApi { status_path, report_path }
	}
}

impl QuotaApi for FileQuotaApi {
	fn fetch(&self, user_id: &str) -> QuotaFuture<'_, QuotaStatus> {
		let path = self.status_path.clone();
		let user_id = user_id.to_string();
		Box::pin(async move {
			let Some(path) = path else {
				// No snapshot source configured: everything unlimited.
				return Ok(QuotaStatus {
					monthly_limit_bytes: -1,
					bandwidth_limit_bps: -1,
					used_bytes:          0,
					exceeded:            false,
					last_sync:           None,
				});
			};
			let raw = tokio::fs::read_to_string(&path)
				.await
				.map_err(|e| ClientError::Network { source: Box::new(e) })?;
			let status: QuotaStatus =
				serde_json::from_str(&raw).map_err(|e| ClientError::Protocol { source: Box::new(e) })?;
			debug!(target: "[QUOTA]", "loaded snapshot for `{user_id}` from {}", path.display());
			Ok(status)
		})
	}

	fn report(&self, report: TrafficReport) -> QuotaFuture<'_, ()> {
		let path = self.report_path.clone();
		Box::pin(async move {
			let Some(path) = path else { return Ok(()) };
			let line = serde_json::to_string(&report)
				.map_err(|e| ClientError::Protocol { source: Box::new(e) })?;
			let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
				let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
				writeln!(file, "{line}")
			})
			.await;
			match result {
				Ok(Ok(())) => Ok(()),
				Ok(Err(e)) => Err(ClientError::Network { source: Box::new(e) }),
				Err(e) => Err(ClientError::Network { source: Box::new(e) }),
			}
		})
	}
}

//! The bidirectional copy loops of one tunnel: a local byte leg and a
//! tunnel leg carrying framed packets. Two independent pumps, one per
//! direction; either one finishing cancels the other through the shared
//! token.

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tunnox_proto::{Packet, PacketKind};
use tunnox_stream::{MAX_IO_CHUNK, StreamError, StreamProcessor};

use super::MappingStats;

/// Pump until either side finishes. EOF on a leg emits `TunnelClose` toward
/// the server before teardown; errors tear down without a close packet.
/// Both processors must have been built on children of `cancel`.
pub async fn run_pump(
	local: Arc<StreamProcessor>,
	tunnel: Arc<StreamProcessor>,
	stats: Arc<MappingStats>,
	compress: bool,
	cancel: CancellationToken,
) {
	stats.tunnel_started();
	tokio::join!(
		async {
			local_to_tunnel(&local, &tunnel, &stats, compress).await;
			cancel.cancel();
		},
		async {
			tunnel_to_local(&local, &tunnel, &stats).await;
			cancel.cancel();
		},
	);
	tunnel.close().await;
	local.close().await;
	stats.tunnel_finished();
}

async fn local_to_tunnel(
	local: &StreamProcessor,
	tunnel: &StreamProcessor,
	stats: &MappingStats,
	compress: bool,
) {
	loop {
		let data = match local.read_available(MAX_IO_CHUNK).await {
			Ok(data) if data.is_empty() => {
				// Clean local EOF: tell the server the flow is done.
				let _ = tunnel
					.write_packet(&Packet::new(PacketKind::TunnelClose, Bytes::new()), false)
					.await;
				return;
			}
			Ok(data) => data,
			Err(StreamError::Cancelled | StreamError::Closed) => return,
			Err(e) => {
				debug!(target: "[TUNNEL]", "local read failed: {e}");
				return;
			}
		};
		let len = data.len() as u64;
		if let Err(e) = tunnel
			.write_packet(&Packet::new(PacketKind::TunnelData, data), compress)
			.await
		{
			if !matches!(e, StreamError::Cancelled | StreamError::Closed) {
				debug!(target: "[TUNNEL]", "tunnel write failed: {e}");
			}
			return;
		}
		stats.add_sent(len);
	}
}

async fn tunnel_to_local(local: &StreamProcessor, tunnel: &StreamProcessor, stats: &MappingStats) {
	loop {
		let packet = match tunnel.read_packet().await {
			Ok(packet) => packet,
			Err(StreamError::Cancelled | StreamError::Closed) => return,
			Err(e) => {
				debug!(target: "[TUNNEL]", "tunnel read failed: {e}");
				return;
			}
		};
		match packet.kind {
			PacketKind::TunnelData => {
				let len = packet.body.len() as u64;
				if let Err(e) = local.write_exact(&packet.body).await {
					if !matches!(e, StreamError::Cancelled | StreamError::Closed) {
						debug!(target: "[TUNNEL]", "local write failed: {e}");
					}
					return;
				}
				stats.add_received(len);
			}
			// Peer finished sending but may still receive; keep pumping the
			// other direction until it closes for real.
			PacketKind::StreamEof => continue,
			PacketKind::TunnelClose => return,
			PacketKind::Heartbeat => continue,
			kind => {
				warn!(target: "[TUNNEL]", "unexpected {kind:?} on tunnel connection");
				return;
			}
		}
	}
}

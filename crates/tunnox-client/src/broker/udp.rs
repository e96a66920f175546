//! UDP mappings: one socket per mapping, one tunnel per remote peer, framed
//! as TunnelData packets so datagram boundaries survive the trip.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use tokio::{net::UdpSocket, sync::mpsc};
use tracing::{debug, warn};
use tunnox_proto::{Packet, PacketKind};
use tunnox_stream::StreamError;

use super::{MappingHandle, TunnelBroker};

const FLOW_QUEUE: usize = 64;

pub(crate) async fn run_udp_listener(
	broker: Arc<TunnelBroker>,
	mapping: Arc<MappingHandle>,
	socket: Arc<UdpSocket>,
) {
	let mut flows: HashMap<SocketAddr, mpsc::Sender<Bytes>> = HashMap::new();
	let mut buf = vec![0u8; 64 * 1024];
	loop {
		let (len, peer) = tokio::select! {
			_ = mapping.cancel.cancelled() => break,
			res = socket.recv_from(&mut buf) => match res {
				Ok(v) => v,
				Err(e) => {
					warn!(target: "[BROKER]", "udp recv on `{}` failed: {e}", mapping.config.mapping_id);
					break;
				}
			},
		};
		let datagram = Bytes::copy_from_slice(&buf[..len]);

		// Dead flows are pruned lazily, on their next datagram.
		if let Some(tx) = flows.get(&peer) {
			match tx.try_send(datagram) {
				Ok(()) => continue,
				Err(mpsc::error::TrySendError::Full(_)) => continue,
				Err(mpsc::error::TrySendError::Closed(dropped)) => {
					flows.remove(&peer);
					new_flow(&broker, &mapping, &socket, peer, &mut flows, dropped);
				}
			}
		} else {
			new_flow(&broker, &mapping, &socket, peer, &mut flows, datagram);
		}
	}
}

fn new_flow(
	broker: &Arc<TunnelBroker>,
	mapping: &Arc<MappingHandle>,
	socket: &Arc<UdpSocket>,
	peer: SocketAddr,
	flows: &mut HashMap<SocketAddr, mpsc::Sender<Bytes>>,
	first: Bytes,
) {
	let (tx, rx) = mpsc::channel(FLOW_QUEUE);
	if tx.try_send(first).is_err() {
		return;
	}
	flows.insert(peer, tx);

	let broker = broker.clone();
	let mapping = mapping.clone();
	let socket = socket.clone();
	broker.clone().spawn(async move {
		if let Err(e) = run_flow(broker.clone(), mapping.clone(), socket, peer, rx).await {
			debug!(
				target: "[BROKER]",
				"udp flow {peer} on `{}` ended: {e}",
				mapping.config.mapping_id
			);
		}
	});
}

/// One peer's flow: an exclusive tunnel, torn down after idle silence.
async fn run_flow(
	broker: Arc<TunnelBroker>,
	mapping: Arc<MappingHandle>,
	socket: Arc<UdpSocket>,
	peer: SocketAddr,
	mut rx: mpsc::Receiver<Bytes>,
) -> crate::Result<()> {
	let tunnel = broker.open_tunnel(&mapping).await?;
	let compress = broker.compression();
	let idle = broker.udp_idle_timeout();
	let stats = mapping.stats.clone();

	let outbound = {
		let tunnel = tunnel.clone();
		let stats = stats.clone();
		async move {
			loop {
				let datagram = match tokio::time::timeout(idle, rx.recv()).await {
					Ok(Some(datagram)) => datagram,
					// Idle expiry or the listener dropped the sender.
					Err(_) | Ok(None) => return,
				};
				let len = datagram.len() as u64;
				if tunnel
					.write_packet(&Packet::new(PacketKind::TunnelData, datagram), compress)
					.await
					.is_err()
				{
					return;
				}
				stats.add_sent(len);
			}
		}
	};

	let inbound = {
		let tunnel = tunnel.clone();
		let stats = stats.clone();
		async move {
			loop {
				let packet = match tunnel.read_packet().await {
					Ok(packet) => packet,
					Err(StreamError::Cancelled | StreamError::Closed) => return,
					Err(e) => {
						debug!(target: "[BROKER]", "udp tunnel read failed: {e}");
						return;
					}
				};
				match packet.kind {
					PacketKind::TunnelData => {
						let len = packet.body.len() as u64;
						if socket.send_to(&packet.body, peer).await.is_err() {
							return;
						}
						stats.add_received(len);
					}
					PacketKind::TunnelClose => return,
					PacketKind::Heartbeat => continue,
					kind => {
						warn!(target: "[BROKER]", "unexpected {kind:?} on udp tunnel");
						return;
					}
				}
			}
		}
	};

	stats.tunnel_started();
	tokio::select! {
		_ = mapping.cancel.cancelled() => {}
		_ = outbound => {}
		_ = inbound => {}
	}
	let _ = tunnel
		.write_packet(&Packet::new(PacketKind::TunnelClose, Bytes::new()), false)
		.await;
	broker.release_tunnel(&tunnel).await;
	stats.tunnel_finished();
	Ok(())
}

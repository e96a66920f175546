use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tunnox_stream::KEY_LEN;

/// Who this client is. The (client_id, secret_key) pair is server-assigned
/// on first handshake, persisted, and replayed on every reconnect; only the
/// device id is locally stable. A client_id of zero means unassigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
	pub client_id:  u64,
	pub secret_key: String,
	pub device_id:  String,
}

impl Identity {
	pub fn unassigned(device_id: impl Into<String>) -> Self {
		Identity {
			client_id:  0,
			secret_key: String::new(),
			device_id:  device_id.into(),
		}
	}

	pub fn is_assigned(&self) -> bool {
		self.client_id != 0
	}
}

/// Persistence collaborator the session writes an accepted identity through.
/// The config layer in the binary implements this; tests stub it.
pub trait ConfigStore: Send + Sync {
	fn save_identity(&self, identity: &Identity) -> std::io::Result<()>;
}

/// Stretch an opaque secret string into AEAD keying material.
pub fn derive_key(secret: &str) -> [u8; KEY_LEN] {
	let digest = Sha256::digest(secret.as_bytes());
	let mut key = [0u8; KEY_LEN];
	key.copy_from_slice(&digest);
	key
}

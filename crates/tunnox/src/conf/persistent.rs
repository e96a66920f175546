use std::{
	path::{Path, PathBuf},
	sync::Mutex,
	time::Duration,
};

use educe::Educe;
use figment::{
	Figment,
	providers::{Env, Format, Toml, Yaml},
};
use serde::{Deserialize, Serialize};
use tunnox_client::{ConfigStore, Identity};

#[derive(Debug, Clone, Deserialize, Serialize, Educe)]
#[educe(Default)]
#[serde(default)]
pub struct PersistentConfig {
	pub server:   ServerConfig,
	pub client:   ClientConfig,
	pub pipeline: PipelineConfig,
	pub mappings: Vec<MappingEntry>,
	pub quota:    QuotaConfig,
	pub log:      LogConfig,
	pub pprof:    PprofConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, Educe)]
#[educe(Default)]
#[serde(default)]
pub struct ServerConfig {
	/// Rendezvous endpoint, `host:port` or `scheme://host:port/path`.
	#[educe(Default = "127.0.0.1:9000")]
	pub address: String,

	/// One of tcp, websocket, kcp, quic. "ws" normalizes to "websocket".
	#[educe(Default = "tcp")]
	pub protocol: String,

	/// Accept self-signed certificates (websocket over https, quic).
	#[educe(Default = false)]
	pub insecure_skip_verify: bool,

	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_secs(10)))]
	pub connect_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize, Educe)]
#[educe(Default)]
#[serde(default)]
pub struct ClientConfig {
	/// Positive when the server already assigned one; zero requests one.
	#[educe(Default = 0)]
	pub client_id: u64,

	#[educe(Default = "")]
	pub secret_key: String,

	/// Stable local device identifier; generated and saved on first run
	/// when empty.
	#[educe(Default = "")]
	pub device_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Educe)]
#[educe(Default)]
#[serde(default)]
pub struct PipelineConfig {
	#[educe(Default = false)]
	pub compression: bool,

	#[educe(Default = false)]
	pub encryption: bool,

	/// Secret the control pipeline key derives from; mappings use their own.
	#[educe(Default = "")]
	pub encryption_secret: String,

	/// aes-256-gcm or xchacha20-poly1305
	#[educe(Default = "aes-256-gcm")]
	pub cipher: String,

	#[educe(Default = false)]
	pub rate_limit: bool,

	/// Bytes per second shaped onto the wire when rate_limit is on.
	#[educe(Default = 1_048_576)]
	pub rate_bps: u64,

	#[educe(Default = 32768)]
	pub buffer_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MappingEntry {
	pub mapping_id: String,

	/// inbound or outbound
	pub direction: String,

	/// tcp, udp, http or socks5
	pub protocol: String,

	pub secret_key: String,

	#[serde(default)]
	pub listen_address: Option<String>,

	#[serde(default)]
	pub target_address: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Educe)]
#[educe(Default)]
#[serde(default)]
pub struct QuotaConfig {
	#[educe(Default = false)]
	pub enabled: bool,

	#[educe(Default = "")]
	pub user_id: String,

	/// JSON file the platform agent drops quota snapshots into.
	#[educe(Default = None)]
	pub status_file: Option<PathBuf>,

	/// JSON-lines file traffic reports append to.
	#[educe(Default = None)]
	pub report_file: Option<PathBuf>,

	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_secs(60)))]
	pub sync_interval: Duration,

	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_secs(30)))]
	pub report_interval: Duration,

	#[educe(Default = false)]
	pub hard_cutoff: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, Educe)]
#[educe(Default)]
#[serde(default)]
pub struct LogConfig {
	#[educe(Default = "info")]
	pub level: String,

	#[educe(Default = "plain")]
	pub format: String,

	/// stdout, stderr, or file
	#[educe(Default = "stderr")]
	pub output: String,

	#[educe(Default = None)]
	pub file: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Educe)]
#[educe(Default)]
#[serde(default)]
pub struct PprofConfig {
	#[educe(Default = false)]
	pub enabled: bool,

	#[educe(Default = "127.0.0.1:6060")]
	pub address: String,
}

impl PersistentConfig {
	pub fn load(config_path: Option<PathBuf>, config_dir: Option<PathBuf>) -> eyre::Result<(Self, PathBuf)> {
		let mut figment = Figment::new();
		let mut origin = PathBuf::from("config.yaml");

		if let Some(dir) = &config_dir {
			for name in ["config.toml", "config.yaml"] {
				let candidate = dir.join(name);
				if candidate.exists() {
					figment = merge_file(figment, &candidate);
					origin = candidate;
				}
			}
		} else {
			for name in ["config.toml", "config.yaml"] {
				let candidate = Path::new(name);
				if candidate.exists() {
					figment = merge_file(figment, candidate);
					origin = candidate.to_path_buf();
				}
			}
		}

		if let Some(path) = config_path {
			figment = merge_file(figment, &path);
			origin = path;
		}

		figment = figment.merge(Env::prefixed("TUNNOX_").split("__"));
		let mut config: PersistentConfig = figment.extract()?;
		config.normalize();
		Ok((config, origin))
	}

	/// "ws" is accepted everywhere the protocol is named.
	fn normalize(&mut self) {
		if self.server.protocol == "ws" {
			self.server.protocol = "websocket".to_string();
		}
	}

	pub fn export_to_file(&self, file_path: &Path, format: &str) -> eyre::Result<()> {
		let content = match format.to_lowercase().as_str() {
			"yaml" => serde_yaml::to_string(&self)?,
			"toml" => toml::to_string_pretty(&self)?,
			other => return Err(eyre::eyre!("Unsupported file format: {other}")),
		};
		std::fs::write(file_path, content)?;
		Ok(())
	}
}

fn merge_file(figment: Figment, path: &Path) -> Figment {
	match path.extension().and_then(|e| e.to_str()) {
		Some("toml") => figment.merge(Toml::file(path)),
		_ => figment.merge(Yaml::file(path)),
	}
}

/// Writes the server-assigned identity back into the config file so the
/// next run replays it.
pub struct FileConfigStore {
	state: Mutex<(PersistentConfig, PathBuf)>,
}

impl FileConfigStore {
	pub fn new(config: PersistentConfig, path: PathBuf) -> Self {
		FileConfigStore {
			state: Mutex::new((config, path)),
		}
	}
}

impl ConfigStore for FileConfigStore {
	fn save_identity(&self, identity: &Identity) -> std::io::Result<()> {
		let mut state = self.state.lock().expect("config poisoned");
		state.0.client.client_id = identity.client_id;
		state.0.client.secret_key = identity.secret_key.clone();
		state.0.client.device_id = identity.device_id.clone();
		let format = match state.1.extension().and_then(|e| e.to_str()) {
			Some("toml") => "toml",
			_ => "yaml",
		};
		state
			.0
			.export_to_file(&state.1.clone(), format)
			.map_err(|e| std::io::Error::other(e.to_string()))
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_defaults_and_normalize() {
		let mut config = PersistentConfig::default();
		assert_eq!(config.server.protocol, "tcp");
		config.server.protocol = "ws".into();
		config.normalize();
		assert_eq!(config.server.protocol, "websocket");
	}

	#[test]
	fn test_yaml_roundtrip() -> eyre::Result<()> {
		let dir = tempfile::tempdir()?;
		let path = dir.path().join("config.yaml");
		let mut config = PersistentConfig::default();
		config.client.client_id = 42;
		config.export_to_file(&path, "yaml")?;

		let (loaded, origin) = PersistentConfig::load(Some(path.clone()), None)?;
		assert_eq!(loaded.client.client_id, 42);
		assert_eq!(origin, path);
		Ok(())
	}

	#[test]
	fn test_identity_write_through() -> eyre::Result<()> {
		let dir = tempfile::tempdir()?;
		let path = dir.path().join("config.yaml");
		PersistentConfig::default().export_to_file(&path, "yaml")?;

		let (config, origin) = PersistentConfig::load(Some(path.clone()), None)?;
		let store = FileConfigStore::new(config, origin);
		store.save_identity(&Identity {
			client_id:  10_000_001,
			secret_key: "k-abc".into(),
			device_id:  "d1".into(),
		})?;

		let (reloaded, _) = PersistentConfig::load(Some(path), None)?;
		assert_eq!(reloaded.client.client_id, 10_000_001);
		assert_eq!(reloaded.client.secret_key, "k-abc");
		Ok(())
	}
}

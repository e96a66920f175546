//! Conversion of the persisted config into the core's option structs.

use eyre::Context as _;
use tunnox_client::{BrokerOpts, SessionOpts, derive_key};
use tunnox_proto::payload::{Direction, MappingConfig, MappingProtocol};
use tunnox_stream::{CipherKind, FactoryConfig};
use tunnox_transport::{DialOpts, ServerAddr, TransportKind};

use super::{MappingEntry, PersistentConfig, PipelineConfig};

pub fn server_addr(config: &PersistentConfig) -> eyre::Result<ServerAddr> {
	ServerAddr::parse(&config.server.address).wrap_err("server.address")
}

pub fn transport_kind(config: &PersistentConfig) -> eyre::Result<TransportKind> {
	TransportKind::from_name(&config.server.protocol).wrap_err("server.protocol")
}

pub fn factory_config(pipeline: &PipelineConfig) -> eyre::Result<FactoryConfig> {
	let cipher = CipherKind::from_name(&pipeline.cipher).wrap_err("pipeline.cipher")?;
	let encryption_key = if pipeline.encryption {
		eyre::ensure!(
			!pipeline.encryption_secret.is_empty(),
			"pipeline.encryption_secret is required when encryption is on"
		);
		Some(derive_key(&pipeline.encryption_secret))
	} else {
		None
	};
	Ok(FactoryConfig {
		enable_compression: pipeline.compression,
		enable_encryption: pipeline.encryption,
		encryption_key,
		cipher,
		enable_rate_limit: pipeline.rate_limit,
		rate_bps: pipeline.rate_bps,
		buffer_size: pipeline.buffer_size,
	})
}

fn dial_opts(config: &PersistentConfig) -> DialOpts {
	DialOpts {
		connect_timeout: config.server.connect_timeout,
		insecure_skip_verify: config.server.insecure_skip_verify,
		..DialOpts::default()
	}
}

pub fn session_opts(config: &PersistentConfig) -> eyre::Result<SessionOpts> {
	let mut opts = SessionOpts::new(server_addr(config)?, transport_kind(config)?);
	opts.dial = dial_opts(config);
	opts.pipeline = factory_config(&config.pipeline)?;
	Ok(opts)
}

pub fn broker_opts(config: &PersistentConfig) -> eyre::Result<BrokerOpts> {
	let mut opts = BrokerOpts::new(server_addr(config)?, transport_kind(config)?);
	opts.dial = dial_opts(config);
	opts.pipeline = factory_config(&config.pipeline)?;
	Ok(opts)
}

pub fn mapping_config(entry: &MappingEntry) -> eyre::Result<MappingConfig> {
	let direction = match entry.direction.as_str() {
		"inbound" => Direction::Inbound,
		"outbound" => Direction::Outbound,
		other => eyre::bail!("mapping `{}`: unknown direction `{other}`", entry.mapping_id),
	};
	let protocol = match entry.protocol.as_str() {
		"tcp" => MappingProtocol::Tcp,
		"udp" => MappingProtocol::Udp,
		"http" => MappingProtocol::Http,
		"socks5" => MappingProtocol::Socks5,
		other => eyre::bail!("mapping `{}`: unknown protocol `{other}`", entry.mapping_id),
	};
	Ok(MappingConfig {
		mapping_id: entry.mapping_id.clone(),
		direction,
		protocol,
		secret_key: entry.secret_key.clone(),
		listen_address: entry.listen_address.clone(),
		target_address: entry.target_address.clone(),
		expires_at: None,
	})
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_ws_alias_flows_through() -> eyre::Result<()> {
		let mut config = PersistentConfig::default();
		config.server.protocol = "websocket".into();
		assert_eq!(transport_kind(&config)?, TransportKind::Websocket);
		Ok(())
	}

	#[test]
	fn test_encryption_requires_secret() {
		let mut pipeline = PipelineConfig::default();
		pipeline.encryption = true;
		assert!(factory_config(&pipeline).is_err());
		pipeline.encryption_secret = "shh".into();
		assert!(factory_config(&pipeline).is_ok());
	}

	#[test]
	fn test_bad_mapping_direction() {
		let entry = MappingEntry {
			mapping_id:     "m".into(),
			direction:      "sideways".into(),
			protocol:       "tcp".into(),
			secret_key:     "s".into(),
			listen_address: None,
			target_address: None,
		};
		assert!(mapping_config(&entry).is_err());
	}
}

use std::{process::ExitCode, sync::Arc, time::Duration};

use clap::Parser as _;
use tokio::io::AsyncWriteExt as _;
use tracing::{error, info, warn};
use tunnox_client::{
	ControlSession, Identity, QuotaEnforcer, QuotaEnforcerOpts, SessionState, TunnelBroker,
};
use tunnox_proto::payload::{GenerateCodeRequest, HttpDomainRequest};

use crate::{
	cli::{Cli, CodeAction, Commands, HttpDomainAction},
	conf::{FileConfigStore, PersistentConfig},
	quota_file::FileQuotaApi,
};

mod cli;
mod conf;
mod log;
mod quota_file;

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> ExitCode {
	let cli = match Cli::try_parse() {
		Ok(v) => v,
		Err(err) => {
			println!("{:#}", err);
			return ExitCode::SUCCESS;
		}
	};

	if cli.version {
		println!("tunnox {}", env!("CARGO_PKG_VERSION"));
		return ExitCode::SUCCESS;
	}

	let (config, origin) = match PersistentConfig::load(cli.config.clone(), cli.config_dir.clone()) {
		Ok(v) => v,
		Err(e) => {
			eprintln!("failed to load configuration: {e:#}");
			return ExitCode::from(1);
		}
	};
	if let Err(e) = log::init_log(&config.log) {
		eprintln!("failed to initialize logging: {e:#}");
		return ExitCode::from(1);
	}

	let result = match cli.command.unwrap_or(Commands::Run) {
		Commands::Init { format } => init_config(&config, format).await,
		Commands::Run => run(config, origin).await,
		Commands::Code { action } => one_shot(config, origin, OneShot::Code(action)).await,
		Commands::HttpDomain { action } => one_shot(config, origin, OneShot::HttpDomain(action)).await,
		Commands::Status => one_shot(config, origin, OneShot::Status).await,
	};

	match result {
		Ok(code) => code,
		Err(e) => {
			error!(target: "[MAIN]", "fatal: {e:#}");
			ExitCode::from(1)
		}
	}
}

async fn init_config(config: &PersistentConfig, format: cli::ConfigFormat) -> eyre::Result<ExitCode> {
	let (name, kind) = match format {
		cli::ConfigFormat::Yaml => ("config.yaml", "yaml"),
		cli::ConfigFormat::Toml => ("config.toml", "toml"),
	};
	config.export_to_file(std::path::Path::new(name), kind)?;
	println!("wrote {name}");
	Ok(ExitCode::SUCCESS)
}

fn build_session(
	config: &PersistentConfig,
	origin: std::path::PathBuf,
) -> eyre::Result<Arc<ControlSession>> {
	let mut identity = Identity {
		client_id:  config.client.client_id,
		secret_key: config.client.secret_key.clone(),
		device_id:  config.client.device_id.clone(),
	};
	if identity.device_id.is_empty() {
		identity.device_id = uuid::Uuid::new_v4().simple().to_string();
		info!(target: "[MAIN]", "generated device id {}", identity.device_id);
	}
	let opts = conf::session_opts(config)?;
	let store = Arc::new(FileConfigStore::new(config.clone(), origin));
	Ok(ControlSession::new(opts, identity, Some(store)))
}

async fn run(config: PersistentConfig, origin: std::path::PathBuf) -> eyre::Result<ExitCode> {
	info!(target: "[MAIN]", "tunnox {} starting", env!("CARGO_PKG_VERSION"));
	let session = build_session(&config, origin)?;
	if let Err(e) = session.connect().await {
		if matches!(e, tunnox_client::ClientError::Kicked { .. }) {
			error!(target: "[MAIN]", "{e}");
			return Ok(ExitCode::from(2));
		}
		return Err(e.into());
	}

	let broker = TunnelBroker::new(session.clone(), conf::broker_opts(&config)?);
	broker.start();
	for entry in &config.mappings {
		let mapping = conf::mapping_config(entry)?;
		broker.add_mapping(mapping).await?;
	}

	let quota_task = if config.quota.enabled {
		let api = Arc::new(FileQuotaApi::new(
			config.quota.status_file.clone(),
			config.quota.report_file.clone(),
		));
		let mut opts = QuotaEnforcerOpts::new(config.quota.user_id.clone());
		opts.sync_interval = config.quota.sync_interval;
		opts.report_interval = config.quota.report_interval;
		opts.hard_cutoff = config.quota.hard_cutoff;
		let enforcer = QuotaEnforcer::new(api, opts);
		Some(tokio::spawn(enforcer.run(broker.clone())))
	} else {
		None
	};

	if config.pprof.enabled {
		spawn_debug_endpoint(&config.pprof.address, session.clone(), broker.clone()).await?;
	}

	// Watchdog: nudge the session when the peer has gone quiet past the
	// heartbeat budget, or pick it back up from Disconnected.
	{
		let session = session.clone();
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(WATCHDOG_INTERVAL);
			ticker.tick().await;
			loop {
				ticker.tick().await;
				match session.state() {
					SessionState::Connected => {
						if session.inbound_idle() > WATCHDOG_INTERVAL * 4 {
							warn!(target: "[MAIN]", "watchdog: peer silent, forcing reconnect");
							session.request_reconnect();
						}
					}
					SessionState::Disconnected => {
						let _ = session.connect().await;
					}
					SessionState::Stopped | SessionState::Kicked => return,
					_ => {}
				}
			}
		});
	}

	// Run until the user stops us or the server kicks us.
	let mut state = session.subscribe_state();
	tokio::select! {
		_ = tokio::signal::ctrl_c() => {
			info!(target: "[MAIN]", "interrupt, shutting down");
		}
		_ = async {
			loop {
				if state.borrow_and_update().is_terminal() {
					break;
				}
				if state.changed().await.is_err() {
					break;
				}
			}
		} => {}
	}

	broker.stop().await;
	if let Some(task) = quota_task {
		// The enforcer sends its final traffic report on the way out.
		let _ = task.await;
	}
	session.stop().await;

	match session.kicked_reason() {
		Some(reason) => {
			error!(target: "[MAIN]", "kicked by server: {reason}");
			Ok(ExitCode::from(2))
		}
		None => Ok(ExitCode::SUCCESS),
	}
}

enum OneShot {
	Code(CodeAction),
	HttpDomain(HttpDomainAction),
	Status,
}

/// Connect, issue one control command, print the result, disconnect.
async fn one_shot(
	config: PersistentConfig,
	origin: std::path::PathBuf,
	action: OneShot,
) -> eyre::Result<ExitCode> {
	let session = build_session(&config, origin)?;
	session.connect().await?;

	let outcome = dispatch_one_shot(&session, action).await;
	session.stop().await;

	match outcome {
		Ok(output) => {
			println!("{output}");
			Ok(ExitCode::SUCCESS)
		}
		Err(e) => {
			error!(target: "[MAIN]", "command failed: {e:#}");
			Ok(ExitCode::from(1))
		}
	}
}

async fn dispatch_one_shot(session: &Arc<ControlSession>, action: OneShot) -> eyre::Result<String> {
	match action {
		OneShot::Code(CodeAction::Generate { target, activation_ttl, mapping_ttl }) => {
			let generated = session
				.generate_code(&GenerateCodeRequest {
					target_address:         target,
					activation_ttl_seconds: activation_ttl,
					mapping_ttl_seconds:    mapping_ttl,
				})
				.await?;
			Ok(serde_json::to_string_pretty(&generated)?)
		}
		OneShot::Code(CodeAction::Activate { code }) => {
			let mapping = session.activate_code(code).await?;
			Ok(serde_json::to_string_pretty(&mapping)?)
		}
		OneShot::Code(CodeAction::Revoke { code }) => {
			session.revoke_code(code.clone()).await?;
			Ok(format!("code {code} revoked"))
		}
		OneShot::Code(CodeAction::Query { code }) => {
			let info = session.query_code(code).await?;
			Ok(serde_json::to_string_pretty(&info)?)
		}
		OneShot::HttpDomain(HttpDomainAction::Generate) => {
			let generated = session.http_domain_generate().await?;
			Ok(serde_json::to_string_pretty(&generated)?)
		}
		OneShot::HttpDomain(HttpDomainAction::Check { subdomain }) => {
			let checked = session.http_domain_check(&subdomain).await?;
			Ok(serde_json::to_string_pretty(&checked)?)
		}
		OneShot::HttpDomain(HttpDomainAction::Create { subdomain, target }) => {
			let created = session
				.http_domain_create(&HttpDomainRequest {
					subdomain,
					target_address: Some(target),
				})
				.await?;
			Ok(serde_json::to_string_pretty(&created)?)
		}
		OneShot::HttpDomain(HttpDomainAction::Delete { subdomain, mapping_id }) => {
			session.http_domain_delete(&subdomain).await?;
			session.delete_mapping(&mapping_id).await?;
			Ok(format!("http domain {subdomain} deleted"))
		}
		OneShot::Status => {
			let mappings = session.list_mappings().await?;
			Ok(serde_json::to_string_pretty(&mappings)?)
		}
	}
}

/// Plain-text status dump on connect; stands in for a pprof endpoint.
async fn spawn_debug_endpoint(
	address: &str,
	session: Arc<ControlSession>,
	broker: Arc<TunnelBroker>,
) -> eyre::Result<()> {
	let listener = tokio::net::TcpListener::bind(address).await?;
	info!(target: "[MAIN]", "debug endpoint on {address}");
	tokio::spawn(async move {
		loop {
			let Ok((mut stream, _)) = listener.accept().await else { return };
			let mut report = format!(
				"state: {}\ngeneration: {}\nclient_id: {}\ninflight: {}\n",
				session.state(),
				session.generation(),
				session.identity().client_id,
				session.inflight_len(),
			);
			for handle in broker.list_mappings() {
				let snap = handle.stats.snapshot();
				report.push_str(&format!(
					"mapping {} sent={} received={} tunnels={}\n",
					handle.config.mapping_id, snap.bytes_sent, snap.bytes_received, snap.active_tunnels,
				));
			}
			let _ = stream.write_all(report.as_bytes()).await;
		}
	});
	Ok(())
}

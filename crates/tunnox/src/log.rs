use std::sync::Arc;

use time::macros::format_description;
use tracing::{Level, level_filters::LevelFilter};
use tracing_subscriber::{
	fmt::time::LocalTime, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

use crate::conf::LogConfig;

pub fn init_log(config: &LogConfig) -> eyre::Result<()> {
	let level: Level = config.level.parse().unwrap_or(Level::INFO);
	let filter = tracing_subscriber::filter::Targets::new()
		.with_targets(vec![
			("tunnox", level),
			("tunnox_client", level),
			("tunnox_stream", level),
			("tunnox_transport", level),
			("tunnox_proto", level),
		])
		.with_default(LevelFilter::WARN);

	let timer = LocalTime::new(format_description!(
		"[year repr:last_two]-[month]-[day] [hour]:[minute]:[second]"
	));
	let registry = tracing_subscriber::registry().with(filter);

	match config.output.as_str() {
		"file" => {
			let path = config.file.as_deref().unwrap_or("tunnox.log");
			let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
			registry
				.with(
					tracing_subscriber::fmt::layer()
						.with_target(true)
						.with_ansi(false)
						.with_timer(timer)
						.with_writer(Arc::new(file)),
				)
				.try_init()?;
		}
		"stdout" => {
			registry
				.with(
					tracing_subscriber::fmt::layer()
						.with_target(true)
						.with_timer(timer)
						.with_writer(std::io::stdout),
				)
				.try_init()?;
		}
		_ => {
			registry
				.with(
					tracing_subscriber::fmt::layer()
						.with_target(true)
						.with_timer(timer)
						.with_writer(std::io::stderr),
				)
				.try_init()?;
		}
	}
	Ok(())
}

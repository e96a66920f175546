use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser)]
#[command(about, long_about = None)]
pub struct Cli {
	/// Set a custom config file
	#[arg(short, visible_short_alias = 'f', long, value_name = "FILE")]
	pub config: Option<PathBuf>,

	/// Set configuration directory
	#[arg(short = 'C', visible_short_alias = 'd', long, value_name = "PATH")]
	pub config_dir: Option<PathBuf>,

	/// Show current version
	#[arg(short = 'v', visible_short_alias = 'V', long, action = ArgAction::SetTrue)]
	pub version: bool,

	#[command(subcommand)]
	pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
	/// Connect to the server and run the configured mappings (default)
	Run,

	/// Initialize a new default configuration file
	Init {
		/// Specify the configuration file format (yaml or toml)
		#[arg(short, long, value_enum, default_value = "yaml")]
		format: ConfigFormat,
	},

	/// Connection code operations
	Code {
		#[command(subcommand)]
		action: CodeAction,
	},

	/// HTTP subdomain operations
	HttpDomain {
		#[command(subcommand)]
		action: HttpDomainAction,
	},

	/// Show the server-side view of this client's mappings
	Status,
}

#[derive(Subcommand)]
pub enum CodeAction {
	/// Generate a one-shot connection code for a target address
	Generate {
		/// Target the activated mapping will reach, e.g. tcp://127.0.0.1:22
		target: String,

		/// Seconds the code stays activatable
		#[arg(long, default_value_t = 600)]
		activation_ttl: u64,

		/// Seconds the materialized mapping lives
		#[arg(long, default_value_t = 604_800)]
		mapping_ttl: u64,
	},

	/// Consume a code and materialize its mapping locally
	Activate { code: String },

	/// Revoke a code that nobody has activated yet
	Revoke { code: String },

	/// Inspect a code
	Query { code: String },
}

#[derive(Subcommand)]
pub enum HttpDomainAction {
	/// Ask the server for an available generated subdomain
	Generate,

	/// Check whether a subdomain is still available
	Check { subdomain: String },

	/// Register a subdomain bridged to a local target
	Create {
		subdomain: String,

		/// Local address traffic for the subdomain is forwarded to
		target: String,
	},

	/// Delete a registered subdomain
	Delete {
		subdomain: String,

		/// Mapping id the subdomain was registered under
		#[arg(long)]
		mapping_id: String,
	},
}

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum ConfigFormat {
	Yaml,
	Toml,
}

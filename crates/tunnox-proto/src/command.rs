use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use uuid::Uuid;

use crate::{EmptyFieldSnafu, Result};

/// Closed set of command kinds carried in `JsonCommand` / `CommandResp`
/// bodies. The numeric values are wire-visible; never renumber.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive, Serialize, Deserialize,
)]
#[repr(u32)]
#[serde(try_from = "u32", into = "u32")]
pub enum CommandKind {
	// Connection management
	Connect            = 1,
	Disconnect         = 2,
	Reconnect          = 3,
	KickClient         = 4,

	// Data transfer
	DataTransferStart  = 10,
	DataTransferStop   = 11,
	ProxyForward       = 12,

	// Mapping CRUD
	MappingCreate      = 20,
	MappingDelete      = 21,
	MappingUpdate      = 22,
	MappingList        = 23,

	// RPC
	RpcInvoke          = 30,

	// Connection codes
	CodeGenerate       = 40,
	CodeActivate       = 41,
	CodeRevoke         = 42,
	CodeQuery          = 43,

	// HTTP domain
	HttpDomainGenerate = 50,
	HttpDomainCheck    = 51,
	HttpDomainCreate   = 52,
	HttpDomainDelete   = 53,

	// SOCKS5
	Socks5Create       = 60,
	Socks5Delete       = 61,

	// Notifications (server originated)
	NotifyClient       = 70,
	SendNotifyToClient = 71,
	MappingUpdated     = 72,
}

impl CommandKind {
	/// Kinds the server originates as pushes rather than responses.
	pub fn is_push(self) -> bool {
		matches!(
			self,
			CommandKind::KickClient
				| CommandKind::ProxyForward
				| CommandKind::NotifyClient
				| CommandKind::SendNotifyToClient
				| CommandKind::MappingUpdated
		)
	}
}

/// The body of a `JsonCommand` or `CommandResp` packet.
///
/// `command_body` stays an opaque JSON string here; interpreting it by kind
/// is the caller's business. Marshal→parse→validate is the identity over
/// every valid command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
	pub command_type: CommandKind,
	pub command_id:   String,
	pub token:        String,
	pub sender_id:    String,
	pub receiver_id:  String,
	pub command_body: String,
}

impl Command {
	/// Cheap constructor, no validation. Validation lives in
	/// [`Command::validate`] so builders stay on the hot path.
	pub fn new(
		command_type: CommandKind,
		command_id: impl Into<String>,
		token: impl Into<String>,
		sender_id: impl Into<String>,
		receiver_id: impl Into<String>,
		command_body: impl Into<String>,
	) -> Self {
		Command {
			command_type,
			command_id: command_id.into(),
			token: token.into(),
			sender_id: sender_id.into(),
			receiver_id: receiver_id.into(),
			command_body: command_body.into(),
		}
	}

	/// A fresh correlation id, unique within a session.
	pub fn fresh_id() -> String {
		Uuid::new_v4().simple().to_string()
	}

	/// The token may be empty (responses carry none); every id field must
	/// not be. Reports the first violation.
	pub fn validate(&self) -> Result<()> {
		ensure!(!self.command_id.is_empty(), EmptyFieldSnafu { field: "command_id" });
		ensure!(!self.sender_id.is_empty(), EmptyFieldSnafu { field: "sender_id" });
		ensure!(!self.receiver_id.is_empty(), EmptyFieldSnafu { field: "receiver_id" });
		Ok(())
	}
}

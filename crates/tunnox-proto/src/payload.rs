//! Typed bodies for the commands the client issues or receives. Every type
//! here round-trips through `serde_json`; the opaque `command_body` string
//! of a [`crate::Command`] is one of these, interpreted by kind.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
	Inbound,
	Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingProtocol {
	Tcp,
	Udp,
	Http,
	Socks5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeStatus {
	Available,
	Activated,
	Revoked,
	Expired,
}

/// Body of a `Handshake` packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
	pub device_id:    String,
	/// Zero means unassigned; the server hands out an id in the response.
	#[serde(default)]
	pub client_id:    u64,
	#[serde(default)]
	pub secret_key:   String,
	#[serde(default)]
	pub capabilities: Vec<String>,
}

/// Body of a `HandshakeResp` packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeResponse {
	pub accepted:   bool,
	#[serde(default)]
	pub client_id:  u64,
	#[serde(default)]
	pub secret_key: String,
	#[serde(default)]
	pub reason:     Option<String>,
}

/// Rejection reason the server uses when the same identity logs in twice.
pub const REASON_DUPLICATE_LOGIN: &str = "duplicate-login";

/// Body of a `TunnelOpen` packet; authenticates the tunnel against the
/// mapping's secret, not the client secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelOpenEnvelope {
	pub mapping_id: String,
	pub secret_key: String,
	pub nonce:      String,
}

/// Body of a `TunnelOpenAck` packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelOpenAckBody {
	pub accepted: bool,
	#[serde(default)]
	pub reason:   Option<String>,
}

/// Mapping description as pushed by the server or submitted on create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingConfig {
	pub mapping_id:     String,
	pub direction:      Direction,
	pub protocol:       MappingProtocol,
	pub secret_key:     String,
	#[serde(default)]
	pub listen_address: Option<String>,
	#[serde(default)]
	pub target_address: Option<String>,
	#[serde(default, with = "time::serde::rfc3339::option")]
	pub expires_at:     Option<OffsetDateTime>,
}

/// `ProxyForward` push telling this client a remote flow wants a tunnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyForwardRequest {
	pub mapping_id: String,
	pub secret_key: String,
	pub tunnel_id:  String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateCodeRequest {
	pub target_address:         String,
	pub activation_ttl_seconds: u64,
	pub mapping_ttl_seconds:    u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateCodeResponse {
	pub code:       String,
	#[serde(with = "time::serde::rfc3339")]
	pub expires_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivateCodeRequest {
	pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevokeCodeRequest {
	pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryCodeRequest {
	pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionCodeInfo {
	pub code:                   String,
	pub target_address:         String,
	pub activation_ttl_seconds: u64,
	pub mapping_ttl_seconds:    u64,
	pub activated:              bool,
	#[serde(default)]
	pub activated_by:           Option<u64>,
	pub status:                 CodeStatus,
	#[serde(with = "time::serde::rfc3339")]
	pub expires_at:             OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpDomainRequest {
	pub subdomain:      String,
	#[serde(default)]
	pub target_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpDomainResponse {
	pub subdomain: String,
	#[serde(default)]
	pub available: bool,
	#[serde(default)]
	pub mapping:   Option<MappingConfig>,
}

/// `KickClient` push body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KickNotice {
	pub reason: String,
}

/// `NotifyClient` / `SendNotifyToClient` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyMessage {
	pub level:   String,
	pub message: String,
}

/// Per-user quota snapshot pulled from the platform API. A value of -1 means
/// unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaStatus {
	pub monthly_limit_bytes: i64,
	pub bandwidth_limit_bps: i64,
	pub used_bytes:          i64,
	pub exceeded:            bool,
	/// When this snapshot last landed in the client cache; stamped by the
	/// enforcer, absent on the wire unless the platform echoes it back.
	#[serde(default, with = "time::serde::rfc3339::option")]
	pub last_sync:           Option<OffsetDateTime>,
}

/// Aggregated traffic delta reported back to the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficReport {
	pub user_id:              String,
	pub bytes_sent_delta:     u64,
	pub bytes_received_delta: u64,
}

#[cfg(test)]
mod test {
	use time::OffsetDateTime;

	use super::*;

	#[test]
	fn test_payload_roundtrips() -> eyre::Result<()> {
		let req = HandshakeRequest {
			device_id:    "d1".into(),
			client_id:    0,
			secret_key:   String::new(),
			capabilities: vec!["gzip".into(), "aead".into()],
		};
		let parsed: HandshakeRequest = serde_json::from_str(&serde_json::to_string(&req)?)?;
		assert_eq!(parsed, req);

		let code = GenerateCodeResponse {
			code:       "ABC123".into(),
			expires_at: OffsetDateTime::from_unix_timestamp(1735689000)?,
		};
		let parsed: GenerateCodeResponse = serde_json::from_str(&serde_json::to_string(&code)?)?;
		assert_eq!(parsed, code);
		Ok(())
	}

	#[test]
	fn test_expires_at_wire_shape() -> eyre::Result<()> {
		// The server speaks RFC 3339 timestamps.
		let raw = r#"{"code":"ABC123","expires_at":"2025-01-01T00:10:00Z"}"#;
		let parsed: GenerateCodeResponse = serde_json::from_str(raw)?;
		assert_eq!(parsed.code, "ABC123");
		assert_eq!(parsed.expires_at.unix_timestamp(), 1735690200);
		Ok(())
	}

	#[test]
	fn test_mapping_protocol_lowercase() -> eyre::Result<()> {
		assert_eq!(serde_json::to_string(&MappingProtocol::Socks5)?, r#""socks5""#);
		assert_eq!(serde_json::to_string(&Direction::Outbound)?, r#""outbound""#);
		Ok(())
	}
}

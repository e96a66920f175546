//! Typed wrappers over the generic request path, one per control operation
//! the client issues.

use serde::{Serialize, de::DeserializeOwned};
use serde_json::json;
use tunnox_proto::{
	CommandKind,
	payload::{
		ActivateCodeRequest, ConnectionCodeInfo, GenerateCodeRequest, GenerateCodeResponse,
		HttpDomainRequest, HttpDomainResponse, MappingConfig, NotifyMessage, QueryCodeRequest,
		RevokeCodeRequest,
	},
};

use super::ControlSession;
use crate::{ClientError, Result};

impl ControlSession {
	async fn request_json<Req, Resp>(&self, kind: CommandKind, req: &Req) -> Result<Resp>
	where
		Req: Serialize,
		Resp: DeserializeOwned,
	{
		let body = serde_json::to_string(req).map_err(|e| ClientError::Protocol { source: Box::new(e) })?;
		let reply = self.request(kind, body).await?;
		serde_json::from_str(&reply).map_err(|e| ClientError::Protocol { source: Box::new(e) })
	}

	/// Fire a command whose reply body carries nothing we keep.
	async fn request_ack<Req: Serialize>(&self, kind: CommandKind, req: &Req) -> Result<()> {
		let body = serde_json::to_string(req).map_err(|e| ClientError::Protocol { source: Box::new(e) })?;
		self.request(kind, body).await?;
		Ok(())
	}

	pub async fn generate_code(&self, req: &GenerateCodeRequest) -> Result<GenerateCodeResponse> {
		self.request_json(CommandKind::CodeGenerate, req).await
	}

	/// Consumes a connection code; the server materializes and returns the
	/// mapping it stood for.
	pub async fn activate_code(&self, code: impl Into<String>) -> Result<MappingConfig> {
		self.request_json(CommandKind::CodeActivate, &ActivateCodeRequest { code: code.into() })
			.await
	}

	/// Codes are revocable until someone activates them.
	pub async fn revoke_code(&self, code: impl Into<String>) -> Result<()> {
		self.request_ack(CommandKind::CodeRevoke, &RevokeCodeRequest { code: code.into() })
			.await
	}

	pub async fn query_code(&self, code: impl Into<String>) -> Result<ConnectionCodeInfo> {
		self.request_json(CommandKind::CodeQuery, &QueryCodeRequest { code: code.into() })
			.await
	}

	pub async fn create_mapping(&self, config: &MappingConfig) -> Result<MappingConfig> {
		self.request_json(CommandKind::MappingCreate, config).await
	}

	pub async fn delete_mapping(&self, mapping_id: &str) -> Result<()> {
		self.request_ack(CommandKind::MappingDelete, &json!({ "mapping_id": mapping_id }))
			.await
	}

	pub async fn update_mapping(&self, config: &MappingConfig) -> Result<MappingConfig> {
		self.request_json(CommandKind::MappingUpdate, config).await
	}

	pub async fn list_mappings(&self) -> Result<Vec<MappingConfig>> {
		self.request_json(CommandKind::MappingList, &json!({})).await
	}

	pub async fn http_domain_generate(&self) -> Result<HttpDomainResponse> {
		self.request_json(CommandKind::HttpDomainGenerate, &json!({})).await
	}

	pub async fn http_domain_check(&self, subdomain: &str) -> Result<HttpDomainResponse> {
		self.request_json(
			CommandKind::HttpDomainCheck,
			&HttpDomainRequest {
				subdomain:      subdomain.to_string(),
				target_address: None,
			},
		)
		.await
	}

	pub async fn http_domain_create(&self, req: &HttpDomainRequest) -> Result<HttpDomainResponse> {
		self.request_json(CommandKind::HttpDomainCreate, req).await
	}

	pub async fn http_domain_delete(&self, subdomain: &str) -> Result<()> {
		self.request_ack(
			CommandKind::HttpDomainDelete,
			&HttpDomainRequest {
				subdomain:      subdomain.to_string(),
				target_address: None,
			},
		)
		.await
	}

	pub async fn socks5_create(&self, config: &MappingConfig) -> Result<MappingConfig> {
		self.request_json(CommandKind::Socks5Create, config).await
	}

	pub async fn socks5_delete(&self, mapping_id: &str) -> Result<()> {
		self.request_ack(CommandKind::Socks5Delete, &json!({ "mapping_id": mapping_id }))
			.await
	}

	/// Relay a notification to another client through the server.
	pub async fn send_notify(&self, receiver_client_id: u64, message: &NotifyMessage) -> Result<()> {
		self.request_ack(
			CommandKind::SendNotifyToClient,
			&json!({
				"receiver": receiver_client_id.to_string(),
				"notify": message,
			}),
		)
		.await
	}
}

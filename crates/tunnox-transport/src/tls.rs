use std::sync::{Arc, Once};

use rustls::{
	ClientConfig, DigitallySignedStruct, SignatureScheme,
	client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
	crypto::CryptoProvider,
	pki_types::{CertificateDer, ServerName, UnixTime},
};

static INSTALL: Once = Once::new();

fn provider() -> Arc<CryptoProvider> {
	INSTALL.call_once(|| {
		// Either we win the install or someone else already did; both fine.
		let _ = rustls::crypto::ring::default_provider().install_default();
	});
	CryptoProvider::get_default()
		.expect("crypto provider installed above")
		.clone()
}

/// Client TLS config used by the websocket and QUIC transports. The platform
/// verifier is the default; `skip_verify` accepts anything, for self-signed
/// development servers only.
pub fn client_config(skip_verify: bool) -> Result<ClientConfig, rustls::Error> {
	let provider = provider();
	let builder = ClientConfig::builder_with_provider(provider.clone())
		.with_protocol_versions(&[&rustls::version::TLS13])?;
	let config = if skip_verify {
		builder
			.dangerous()
			.with_custom_certificate_verifier(Arc::new(SkipServerVerification { provider }))
			.with_no_client_auth()
	} else {
		use rustls_platform_verifier::BuilderVerifierExt;
		builder.with_platform_verifier()?.with_no_client_auth()
	};
	Ok(config)
}

#[derive(Debug)]
struct SkipServerVerification {
	provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for SkipServerVerification {
	fn verify_server_cert(
		&self,
		_end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		_now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		Ok(ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		rustls::crypto::verify_tls12_signature(
			message,
			cert,
			dss,
			&self.provider.signature_verification_algorithms,
		)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		rustls::crypto::verify_tls13_signature(
			message,
			cert,
			dss,
			&self.provider.signature_verification_algorithms,
		)
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self.provider
			.signature_verification_algorithms
			.supported_schemes()
	}
}

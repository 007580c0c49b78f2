//! Immutable connection-info bundle, the unit of refresh.

// std
use std::collections::HashMap;
// crates.io
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
// self
use crate::{_prelude::*, instance::IpAddrType, verifier::InstanceIdentityVerifier};

/// TLS protocol versions accepted when dialing the server proxy.
const TLS_VERSIONS: &[&rustls::SupportedProtocolVersion] = rustls::ALL_VERSIONS;

/// Material for a mutually-authenticated TLS client to a single instance.
///
/// Server-identity verification is overridden to check the instance
/// identifier embedded in the server certificate rather than the DNS name or
/// IP address used to connect.
#[derive(Clone)]
pub struct SslContext {
	client_cert_chain: Arc<[CertificateDer<'static>]>,
	client_private_key_der: Arc<[u8]>,
	server_ca_roots: Arc<RootCertStore>,
	expected_instance: crate::instance::InstanceConnectionName,
}
impl SslContext {
	/// Assemble the TLS material for a single instance.
	pub fn new(
		client_cert_chain: Vec<CertificateDer<'static>>,
		client_private_key_pkcs8_der: Vec<u8>,
		server_ca_pem: &str,
		expected_instance: crate::instance::InstanceConnectionName,
	) -> Result<Self> {
		let mut server_ca_roots = RootCertStore::empty();
		let mut reader = std::io::Cursor::new(server_ca_pem.as_bytes());

		for cert in rustls_pemfile::certs(&mut reader) {
			let cert = cert?;

			server_ca_roots
				.add(cert)
				.map_err(|err| Error::HandshakeFailed(format!("invalid server CA certificate: {err}")))?;
		}

		Ok(Self {
			client_cert_chain: Arc::from(client_cert_chain),
			client_private_key_der: Arc::from(client_private_key_pkcs8_der),
			server_ca_roots: Arc::new(server_ca_roots),
			expected_instance,
		})
	}

	/// Build a fresh `rustls::ClientConfig` wired with the instance-identity verifier.
	pub fn client_config(&self) -> Result<ClientConfig> {
		let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
		let verifier = Arc::new(InstanceIdentityVerifier::new(
			self.server_ca_roots.clone(),
			self.expected_instance.clone(),
			provider.clone(),
		)?);
		let cert_chain = self.client_cert_chain.to_vec();
		let private_key =
			PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.client_private_key_der.to_vec()));
		let config = ClientConfig::builder_with_provider(provider)
			.with_protocol_versions(TLS_VERSIONS)
			.map_err(Error::Rustls)?
			.dangerous()
			.with_custom_certificate_verifier(verifier)
			.with_client_auth_cert(cert_chain, private_key)
			.map_err(Error::Rustls)?;

		Ok(config)
	}
}
impl std::fmt::Debug for SslContext {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SslContext")
			.field("expected_instance", &self.expected_instance)
			.finish_non_exhaustive()
	}
}

/// Immutable bundle of everything needed to dial and authenticate to an
/// instance; the unit of refresh.
#[derive(Clone, Debug)]
pub struct InstanceData {
	/// Absolute instant at which the ephemeral client certificate expires.
	pub expiration: Instant,
	/// Wall-clock mirror of `expiration`, for diagnostics and status reporting.
	pub expiration_wallclock: DateTime<Utc>,
	/// TLS material for a mutually-authenticated client.
	pub ssl_context: SslContext,
	/// IP endpoints by declared type.
	pub ip_addresses: HashMap<IpAddrType, String>,
	/// Server-reported database engine version, opaque to the refresh logic.
	pub database_version: Option<String>,
}
impl InstanceData {
	/// Look up the first IP address matching the caller's ordered preference.
	pub fn preferred_ip(&self, ip_types: &[IpAddrType]) -> Result<&str> {
		ip_types
			.iter()
			.find_map(|ip_type| self.ip_addresses.get(ip_type))
			.map(String::as_str)
			.ok_or_else(|| Error::IpTypeNotAvailable { requested: ip_types.to_vec() })
	}
}

//! Custom TLS server-identity verification.
//!
//! The server proxy presents a certificate whose subject embeds the instance
//! identifier rather than a DNS name; verification is overridden accordingly,
//! bypassing hostname checking but still anchoring trust in the server CA and
//! still verifying the certificate chain and handshake signatures.

// crates.io
use rustls::{
	DigitallySignedStruct, RootCertStore, SignatureScheme,
	client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
	crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature},
	pki_types::{CertificateDer, ServerName, UnixTime},
	server::ParsedCertificate,
};
use x509_parser::prelude::{GeneralName, X509Certificate};
// self
use crate::{_prelude::*, instance::InstanceConnectionName};

/// Verifies the server-presented certificate chains to a trusted CA and that
/// its subject/SAN embeds the expected instance identifier, regardless of the
/// DNS name or IP address used to connect.
#[derive(Debug)]
pub struct InstanceIdentityVerifier {
	roots: Arc<RootCertStore>,
	expected_instance: InstanceConnectionName,
	provider: Arc<CryptoProvider>,
}
impl InstanceIdentityVerifier {
	/// Build a verifier trusting `roots`, requiring the leaf certificate to
	/// identify `expected_instance`.
	pub fn new(
		roots: Arc<RootCertStore>,
		expected_instance: InstanceConnectionName,
		provider: Arc<CryptoProvider>,
	) -> Result<Self> {
		Ok(Self { roots, expected_instance, provider })
	}

	fn verify_identity(&self, end_entity: &CertificateDer<'_>) -> std::result::Result<(), rustls::Error> {
		let (_, cert) = X509Certificate::from_der(end_entity.as_ref()).map_err(|err| {
			rustls::Error::General(format!("failed to parse server certificate: {err}"))
		})?;
		let expected = self.expected_instance.to_string();

		if subject_matches(&cert, &expected) || sans_match(&cert, &expected) {
			Ok(())
		} else {
			Err(rustls::Error::General(format!(
				"server certificate does not identify instance '{expected}'"
			)))
		}
	}
}
impl ServerCertVerifier for InstanceIdentityVerifier {
	fn verify_server_cert(
		&self,
		end_entity: &CertificateDer<'_>,
		intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		now: UnixTime,
	) -> std::result::Result<ServerCertVerified, rustls::Error> {
		let cert = ParsedCertificate::try_from(end_entity)?;

		rustls::client::verify_server_cert_signed_by_trust_anchor(
			&cert,
			&self.roots,
			intermediates,
			now,
			self.provider.signature_verification_algorithms.all,
		)?;

		self.verify_identity(end_entity)?;

		Ok(ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
		verify_tls12_signature(
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
	) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
		verify_tls13_signature(
			message,
			cert,
			dss,
			&self.provider.signature_verification_algorithms,
		)
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self.provider.signature_verification_algorithms.supported_schemes()
	}
}

fn subject_matches(cert: &X509Certificate<'_>, expected: &str) -> bool {
	cert.subject()
		.iter_common_name()
		.filter_map(|cn| cn.as_str().ok())
		.any(|cn| cn == expected)
}

fn sans_match(cert: &X509Certificate<'_>, expected: &str) -> bool {
	let Ok(Some(sans)) = cert.subject_alternative_name() else {
		return false;
	};

	sans.value.general_names.iter().any(|name| matches!(name, GeneralName::DNSName(dns) if *dns == expected))
}

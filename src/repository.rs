//! Adapter to the remote admin API: metadata, CA trust material, and ephemeral
//! client certificate issuance.

// std
use std::{collections::HashMap, future::Future, sync::Mutex};
// crates.io
use reqwest::{Client, StatusCode};
use rustls_pki_types::CertificateDer;
use serde::Deserialize;
// self
use crate::{
	_prelude::*,
	data::{InstanceData, SslContext},
	instance::{ConnectionConfig, IpAddrType},
	keypair::KeyPair,
};

/// Adapter to the remote admin API.
///
/// No retries are performed at this layer; the caller (the refresher) owns
/// retry and rate-limiting policy.
pub trait ConnectionInfoRepository: std::fmt::Debug + Send + Sync {
	/// Resolve metadata and an ephemeral client certificate for `config.instance`,
	/// signing `key_pair`'s public key into the returned certificate.
	fn fetch(
		&self,
		config: &ConnectionConfig,
		key_pair: &KeyPair,
	) -> impl Future<Output = Result<InstanceData>> + Send;
}

/// `reqwest`-backed implementation submitting requests to the Cloud SQL-style
/// admin API.
///
/// The application name is held behind a shared, mutable cell rather than
/// baked into the `User-Agent` at construction time, so a pre-first-use
/// [`ConnectorRegistry::set_application_name`](crate::ConnectorRegistry::set_application_name)
/// call (sharing the same cell via [`AdminApiRepository::with_shared_application_name`])
/// genuinely changes the header sent on every subsequent request.
#[derive(Clone, Debug)]
pub struct AdminApiRepository {
	client: Client,
	base_url: url::Url,
	application_name: Arc<Mutex<String>>,
	quota_project: Option<Arc<str>>,
}
impl AdminApiRepository {
	/// Build a repository pointed at `base_url`, using the given process-wide
	/// application name in the admin API `User-Agent`.
	pub fn new(base_url: url::Url, application_name: &str) -> Result<Self> {
		Self::with_shared_application_name(
			base_url,
			Arc::new(Mutex::new(application_name.to_string())),
		)
	}

	/// Build a repository pointed at `base_url`, reading the `User-Agent`
	/// application name from `application_name` on every request. Sharing this
	/// cell with a [`ConnectorRegistry`](crate::ConnectorRegistry) lets
	/// `set_application_name` take effect on already-issued requests.
	pub fn with_shared_application_name(
		base_url: url::Url,
		application_name: Arc<Mutex<String>>,
	) -> Result<Self> {
		let client = Client::builder().connect_timeout(Duration::from_secs(10)).build()?;

		Ok(Self { client, base_url, application_name, quota_project: None })
	}

	/// Build a repository using the supplied HTTP client (primarily for tests).
	pub fn with_client(base_url: url::Url, client: Client) -> Self {
		Self { client, base_url, application_name: Arc::new(Mutex::new(String::new())), quota_project: None }
	}

	/// Attach a quota project, sent as `X-Goog-User-Project` on every admin-API request.
	pub fn with_quota_project(mut self, quota_project: impl Into<Arc<str>>) -> Self {
		self.quota_project = Some(quota_project.into());

		self
	}

	/// The shared cell backing this repository's `User-Agent` application name.
	pub fn application_name_handle(&self) -> Arc<Mutex<String>> {
		self.application_name.clone()
	}
}
impl ConnectionInfoRepository for AdminApiRepository {
	#[tracing::instrument(skip(self, key_pair), fields(instance = %config.instance))]
	async fn fetch(&self, config: &ConnectionConfig, key_pair: &KeyPair) -> Result<InstanceData> {
		let instance = &config.instance;
		let connect_settings = self.fetch_connect_settings(instance).await?;
		let ephemeral_cert = self.generate_ephemeral_cert(instance, key_pair).await?;
		let expiration_wallclock = ephemeral_cert.expiration_time;
		let expiration = wallclock_to_instant(expiration_wallclock);
		let mut client_cert_chain = Vec::with_capacity(1);

		client_cert_chain.push(CertificateDer::from(pem_to_der(&ephemeral_cert.cert)?));

		let ssl_context = SslContext::new(
			client_cert_chain,
			key_pair.private_key_pkcs8_der()?,
			&connect_settings.server_ca_cert.cert,
			instance.clone(),
		)?;
		let ip_addresses = connect_settings
			.ip_addresses
			.into_iter()
			.map(|entry| (entry.kind, entry.ip_address))
			.collect::<HashMap<_, _>>();

		tracing::debug!(?expiration_wallclock, "fetched fresh connection info");

		Ok(InstanceData {
			expiration,
			expiration_wallclock,
			ssl_context,
			ip_addresses,
			database_version: connect_settings.database_version,
		})
	}
}
impl AdminApiRepository {
	async fn fetch_connect_settings(
		&self,
		instance: &crate::instance::InstanceConnectionName,
	) -> Result<ConnectSettingsResponse> {
		let url = self.base_url.join(&format!(
			"projects/{}/instances/{}/connectSettings",
			instance.project(),
			instance.instance()
		))?;
		let response = self.with_common_headers(self.client.get(url.clone())).send().await?;

		handle_response(response, &url).await
	}

	async fn generate_ephemeral_cert(
		&self,
		instance: &crate::instance::InstanceConnectionName,
		key_pair: &KeyPair,
	) -> Result<EphemeralCert> {
		let url = self.base_url.join(&format!(
			"projects/{}/instances/{}:generateEphemeralCert",
			instance.project(),
			instance.instance()
		))?;
		let body = GenerateEphemeralCertRequest { public_key: key_pair.public_key_pem().to_string() };
		let response =
			self.with_common_headers(self.client.post(url.clone())).json(&body).send().await?;
		let response: GenerateEphemeralCertResponse = handle_response(response, &url).await?;

		Ok(response.ephemeral_cert)
	}

	/// Attach the current `User-Agent` (read fresh from the shared cell) and, if
	/// configured, the `X-Goog-User-Project` quota header.
	fn with_common_headers(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		let application_name =
			self.application_name.lock().unwrap_or_else(|err| err.into_inner()).clone();
		let builder = builder.header(
			reqwest::header::USER_AGENT,
			format!("cloudsql-connect-core/{} {application_name}", env!("CARGO_PKG_VERSION")),
		);

		match &self.quota_project {
			Some(quota_project) => builder.header("X-Goog-User-Project", quota_project.as_ref()),
			None => builder,
		}
	}
}

async fn handle_response<T>(response: reqwest::Response, url: &url::Url) -> Result<T>
where
	T: for<'de> Deserialize<'de>,
{
	let status = response.status();

	if status.is_success() {
		return Ok(response.json().await?);
	}

	match status {
		StatusCode::FORBIDDEN => Err(Error::InstanceNotAuthorized),
		StatusCode::NOT_FOUND => Err(Error::InstanceNotFound),
		_ => {
			let body = response.text().await.ok();

			Err(Error::AdminApiFailed(format!(
				"upstream status {status} from {url}: {body:?}"
			)))
		},
	}
}

fn pem_to_der(pem: &str) -> Result<Vec<u8>> {
	let mut reader = std::io::Cursor::new(pem.as_bytes());
	let cert = rustls_pemfile::certs(&mut reader)
		.next()
		.ok_or_else(|| Error::AdminApiFailed("ephemeral certificate response was empty".into()))??;

	Ok(cert.to_vec())
}

fn wallclock_to_instant(expiration: DateTime<Utc>) -> Instant {
	let now_wall = Utc::now();
	let now_monotonic = Instant::now();

	match (expiration - now_wall).to_std() {
		Ok(remaining) => now_monotonic + remaining,
		Err(_) => now_monotonic,
	}
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectSettingsResponse {
	ip_addresses: Vec<IpAddressEntry>,
	server_ca_cert: ServerCaCert,
	#[serde(default)]
	database_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpAddressEntry {
	#[serde(rename = "type")]
	kind: IpAddrType,
	ip_address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerCaCert {
	cert: String,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateEphemeralCertRequest {
	public_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateEphemeralCertResponse {
	ephemeral_cert: EphemeralCert,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EphemeralCert {
	cert: String,
	expiration_time: DateTime<Utc>,
}

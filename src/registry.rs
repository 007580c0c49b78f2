//! Process-wide instance registry: the driver-shim entry point.
//!
//! Owns the shared RSA key pair, the process-wide application name, a bounded
//! concurrency gate over admin-API work, and the instance → cache map.

// std
use std::{
	collections::HashMap,
	sync::{
		Mutex,
		atomic::{AtomicBool, Ordering},
	},
};
// crates.io
use tokio::{net::UnixStream, sync::RwLock};
// self
use crate::{
	_prelude::*,
	cache::manager::ConnectionInfoCache,
	instance::{AuthType, ConnectionConfig, InstanceConnectionName},
	keypair::KeyPair,
	rate_limiter::RateLimiter,
	repository::{AdminApiRepository, ConnectionInfoRepository},
	socket::SERVER_PROXY_PORT,
};

/// Default base URL of the Cloud SQL Admin API, used unless overridden via
/// [`RegistryBuilder::admin_api_endpoint`].
pub const DEFAULT_ADMIN_API_ENDPOINT: &str = "https://sqladmin.googleapis.com/sql/v1beta4/";

/// Minimum interval enforced between consecutive refresh attempts for a given instance.
pub const MIN_REFRESH_DELAY: Duration = Duration::from_millis(30_000);
/// Default timeout budget supplied to `getData`-style calls.
pub const DEFAULT_MAX_REFRESH: Duration = Duration::from_millis(30_000);
/// Ceiling on concurrent in-flight admin-API operations.
///
/// Each instance's refresh needs at most two concurrent tasks (permit wait +
/// fetch) and the typical application registers a handful of instances, so 8
/// is a comfortable ceiling; large fleets should raise it via
/// [`RegistryBuilder::worker_pool_size`].
pub const DEFAULT_WORKER_POOL_SIZE: usize = 8;
/// Deprecated environment override forcing the Unix-socket pass-through path.
pub const FORCE_UNIX_SOCKET_ENV: &str = "CLOUD_SQL_FORCE_UNIX_SOCKET";

/// Either side of the driver-facing `connect` result.
#[derive(Debug)]
pub enum Connection {
	/// A mutually-authenticated TLS connection to the server proxy.
	Tls(tokio_rustls::client::TlsStream<tokio::net::TcpStream>),
	/// A pass-through Unix-domain-socket connection, bypassing TLS entirely.
	Unix(UnixStream),
}

/// Builder for [`ConnectorRegistry`].
#[derive(Debug)]
pub struct RegistryBuilder {
	worker_pool_size: usize,
	min_refresh_delay: Duration,
	admin_api_endpoint: url::Url,
	application_name: Option<String>,
	require_iam_auth: bool,
	quota_project: Option<String>,
}
impl RegistryBuilder {
	/// Start from the documented defaults.
	pub fn new() -> Self {
		Self {
			worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
			min_refresh_delay: MIN_REFRESH_DELAY,
			admin_api_endpoint: url::Url::parse(DEFAULT_ADMIN_API_ENDPOINT)
				.expect("DEFAULT_ADMIN_API_ENDPOINT is a valid URL"),
			application_name: None,
			require_iam_auth: false,
			quota_project: None,
		}
	}

	/// Override the ceiling on concurrent in-flight admin-API operations.
	pub fn worker_pool_size(mut self, size: usize) -> Self {
		self.worker_pool_size = size;

		self
	}

	/// Override the minimum interval between refresh attempts for a given instance.
	pub fn min_refresh_delay(mut self, delay: Duration) -> Self {
		self.min_refresh_delay = delay;

		self
	}

	/// Override the base URL of the admin API, used by [`RegistryBuilder::build_admin_api`].
	pub fn admin_api_endpoint(mut self, endpoint: url::Url) -> Self {
		self.admin_api_endpoint = endpoint;

		self
	}

	/// Set the process-wide application name appended to the admin-API `User-Agent`.
	///
	/// Takes effect through [`RegistryBuilder::build_admin_api`], whose
	/// [`AdminApiRepository`] reads this value from a cell shared with the
	/// built [`ConnectorRegistry`], so a later
	/// [`ConnectorRegistry::set_application_name`] call changes the header on
	/// every subsequent request. A caller-supplied repository passed to
	/// [`RegistryBuilder::build`] owns its own `User-Agent` logic and won't
	/// observe this setter unless it explicitly shares the registry's cell
	/// (see [`AdminApiRepository::with_shared_application_name`]).
	pub fn application_name(mut self, name: impl Into<String>) -> Self {
		self.application_name = Some(name.into());

		self
	}

	/// Require every connection request to use IAM-token authentication,
	/// rejecting [`AuthType::Password`] requests with [`Error::InvalidConfig`].
	pub fn require_iam_auth(mut self, require: bool) -> Self {
		self.require_iam_auth = require;

		self
	}

	/// Attach a quota project, billed for admin-API usage instead of the target
	/// instance's own project. Only takes effect through
	/// [`RegistryBuilder::build_admin_api`].
	pub fn quota_project(mut self, project: impl Into<String>) -> Self {
		self.quota_project = Some(project.into());

		self
	}

	/// Finalise the registry, wiring it to `repository` for every instance's fetches.
	pub fn build<R>(self, repository: R) -> ConnectorRegistry<R>
	where
		R: ConnectionInfoRepository + 'static,
	{
		let application_name = Arc::new(Mutex::new(self.application_name.clone().unwrap_or_default()));

		self.build_with_shared_name(repository, application_name)
	}

	/// Finalise the registry, building an [`AdminApiRepository`] from
	/// `admin_api_endpoint`, `application_name`, and `quota_project`, sharing
	/// the application-name cell with the registry so `set_application_name`
	/// genuinely changes the `User-Agent` on subsequent admin-API requests.
	pub fn build_admin_api(self) -> Result<ConnectorRegistry<AdminApiRepository>> {
		let application_name = Arc::new(Mutex::new(self.application_name.clone().unwrap_or_default()));
		let mut repository = AdminApiRepository::with_shared_application_name(
			self.admin_api_endpoint.clone(),
			application_name.clone(),
		)?;

		if let Some(quota_project) = self.quota_project.clone() {
			repository = repository.with_quota_project(quota_project);
		}

		Ok(self.build_with_shared_name(repository, application_name))
	}

	fn build_with_shared_name<R>(
		self,
		repository: R,
		application_name: Arc<Mutex<String>>,
	) -> ConnectorRegistry<R>
	where
		R: ConnectionInfoRepository + 'static,
	{
		ConnectorRegistry {
			repository: Arc::new(BoundedRepository {
				inner: repository,
				gate: Arc::new(tokio::sync::Semaphore::new(self.worker_pool_size.max(1))),
			}),
			min_refresh_delay: self.min_refresh_delay,
			key_pair: tokio::sync::OnceCell::new(),
			application_name,
			require_iam_auth: self.require_iam_auth,
			initialized: AtomicBool::new(false),
			caches: RwLock::new(HashMap::new()),
		}
	}
}
impl Default for RegistryBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Process-singleton map from instance identifier to [`ConnectionInfoCache`].
///
/// `R` is the admin-API adapter shared read-only by every instance; defaults
/// to [`AdminApiRepository`] but may be swapped for a test double.
#[derive(Debug)]
pub struct ConnectorRegistry<R = AdminApiRepository> {
	repository: Arc<BoundedRepository<R>>,
	min_refresh_delay: Duration,
	key_pair: tokio::sync::OnceCell<Arc<KeyPair>>,
	application_name: Arc<Mutex<String>>,
	require_iam_auth: bool,
	initialized: AtomicBool,
	caches: RwLock<HashMap<InstanceConnectionName, Arc<ConnectionInfoCache<BoundedRepository<R>>>>>,
}
impl<R> ConnectorRegistry<R>
where
	R: ConnectionInfoRepository + 'static,
{
	/// Build a registry with default settings, wired to `repository`.
	pub fn new(repository: R) -> Self {
		RegistryBuilder::new().build(repository)
	}

	/// Start a [`RegistryBuilder`] for advanced configuration.
	pub fn builder() -> RegistryBuilder {
		RegistryBuilder::new()
	}

	/// Set the process-wide application name appended to the admin-API User-Agent.
	///
	/// When this registry was built via [`RegistryBuilder::build_admin_api`],
	/// the underlying [`AdminApiRepository`] reads the same cell this setter
	/// writes to, so the change is reflected on the very next admin-API
	/// request. A repository passed directly to [`RegistryBuilder::build`]
	/// owns its own `User-Agent` logic and will only observe this setter if it
	/// was built sharing the same cell (see
	/// [`AdminApiRepository::with_shared_application_name`]). This method
	/// otherwise governs the mutability guard described by (I8)-adjacent
	/// process-wide state: it fails once the registry has served its first
	/// lookup.
	pub fn set_application_name(&self, name: impl Into<String>) -> Result<()> {
		if self.initialized.load(Ordering::SeqCst) {
			return Err(Error::AlreadyInitialised);
		}

		*self.application_name.lock().unwrap_or_else(|err| err.into_inner()) = name.into();

		Ok(())
	}

	/// Read back the configured application name.
	pub fn application_name(&self) -> String {
		self.application_name.lock().unwrap_or_else(|err| err.into_inner()).clone()
	}

	/// Driver-shim entry point.
	///
	/// Validates `config`, takes the Unix-socket pass-through branch when
	/// applicable, otherwise resolves the instance's cache, builds the TLS
	/// socket, and completes the handshake against `SERVER_PROXY_PORT`.
	#[tracing::instrument(skip(self, config), fields(instance = %config.instance))]
	pub async fn connect(&self, config: ConnectionConfig) -> Result<Connection> {
		self.validate_config(&config)?;

		if let Some(path) = self.unix_socket_path(&config) {
			tracing::debug!(path, "routing via Unix-domain-socket pass-through");

			let stream = UnixStream::connect(&path).await?;

			return Ok(Connection::Unix(stream));
		}

		let cache = self.get_or_create_cache(config.clone()).await;
		let stream = cache
			.create_ssl_socket(&config.ip_types, DEFAULT_MAX_REFRESH)
			.await?;

		Ok(Connection::Tls(stream))
	}

	/// Resolve the SSL material for `config.instance`, without dialing.
	pub async fn get_ssl_data(&self, config: &ConnectionConfig) -> Result<crate::data::SslContext> {
		self.validate_config(config)?;

		let cache = self.get_or_create_cache(config.clone()).await;

		cache.get_ssl_data(DEFAULT_MAX_REFRESH).await
	}

	/// Resolve the preferred IP for `config.instance`, without dialing.
	pub async fn get_host_ip(&self, config: &ConnectionConfig) -> Result<String> {
		self.validate_config(config)?;

		let cache = self.get_or_create_cache(config.clone()).await;

		cache.get_preferred_ip(&config.ip_types, DEFAULT_MAX_REFRESH).await
	}

	/// Validate `config` against spec.md §7's `InvalidConfig` kind, including
	/// this registry's `require_iam_auth` policy.
	fn validate_config(&self, config: &ConnectionConfig) -> Result<()> {
		config.validate()?;

		if self.require_iam_auth && config.auth_type != AuthType::Iam {
			return Err(Error::InvalidConfig {
				message: "this registry requires IAM-token authentication (auth_type = Iam).".into(),
			});
		}

		Ok(())
	}

	/// Force a refresh for `instance`, if a cache has been created for it.
	pub async fn force_refresh(&self, instance: &InstanceConnectionName) {
		let cache = { self.caches.read().await.get(instance).cloned() };

		if let Some(cache) = cache {
			cache.force_refresh().await;
		}
	}

	fn unix_socket_path(&self, config: &ConnectionConfig) -> Option<String> {
		if let Some(path) = config.effective_unix_socket_path() {
			return Some(path);
		}

		std::env::var(FORCE_UNIX_SOCKET_ENV).ok().map(|_| format!("/cloudsql/{}", config.instance))
	}

	async fn get_or_create_cache(
		&self,
		config: ConnectionConfig,
	) -> Arc<ConnectionInfoCache<BoundedRepository<R>>> {
		self.initialized.store(true, Ordering::SeqCst);

		let instance = config.instance.clone();

		if let Some(cache) = self.caches.read().await.get(&instance) {
			return cache.clone();
		}

		let mut caches = self.caches.write().await;

		if let Some(cache) = caches.get(&instance) {
			return cache.clone();
		}

		let key_pair = self
			.key_pair
			.get_or_init(|| async { Arc::new(KeyPair::generate().expect("RSA key generation")) })
			.await
			.clone();
		let rate_limiter = Arc::new(RateLimiter::new(self.min_refresh_delay));
		let cache = Arc::new(ConnectionInfoCache::new(
			config,
			self.repository.clone(),
			key_pair,
			rate_limiter,
		));

		caches.insert(instance, cache.clone());

		cache
	}
}

/// Wraps a [`ConnectionInfoRepository`] with a bounded-concurrency gate,
/// modelling the shared worker pool every instance's refresh draws from.
#[derive(Debug)]
pub struct BoundedRepository<R> {
	inner: R,
	gate: Arc<tokio::sync::Semaphore>,
}
impl<R> ConnectionInfoRepository for BoundedRepository<R>
where
	R: ConnectionInfoRepository,
{
	async fn fetch(&self, config: &ConnectionConfig, key_pair: &KeyPair) -> Result<crate::data::InstanceData> {
		let _permit = self.gate.acquire().await.expect("worker-pool semaphore is never closed");

		self.inner.fetch(config, key_pair).await
	}
}

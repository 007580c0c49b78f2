//! Per-instance facade combining the refresher, IP selection, and socket creation.

// crates.io
use tokio_rustls::client::TlsStream;
// self
use crate::{
	_prelude::*,
	cache::{refresher::Refresher, state::CacheStatus},
	data::SslContext,
	instance::{ConnectionConfig, IpAddrType},
	keypair::KeyPair,
	rate_limiter::RateLimiter,
	repository::ConnectionInfoRepository,
	socket::SocketBuilder,
};

/// Per-instance cache: owns a [`Refresher`] and exposes the operations driver
/// shims call into.
#[derive(Clone, Debug)]
pub struct ConnectionInfoCache<R> {
	refresher: Refresher<R>,
	socket_builder: SocketBuilder,
}
impl<R> ConnectionInfoCache<R>
where
	R: ConnectionInfoRepository + 'static,
{
	/// Build a cache for `config.instance`, starting its first refresh immediately.
	pub fn new(
		config: ConnectionConfig,
		repository: Arc<R>,
		key_pair: Arc<KeyPair>,
		rate_limiter: Arc<RateLimiter>,
	) -> Self {
		Self {
			refresher: Refresher::new(config, repository, key_pair, rate_limiter),
			socket_builder: SocketBuilder,
		}
	}

	/// Resolve the TLS material for this instance, blocking up to `timeout`.
	pub async fn get_ssl_data(&self, timeout: Duration) -> Result<SslContext> {
		Ok(self.refresher.get_data(timeout).await?.ssl_context)
	}

	/// Walk `ip_types` in order, returning the first IP address present.
	pub async fn get_preferred_ip(&self, ip_types: &[IpAddrType], timeout: Duration) -> Result<String> {
		let data = self.refresher.get_data(timeout).await?;

		data.preferred_ip(ip_types).map(str::to_string)
	}

	/// Build and hand-shake a mutually-authenticated TLS socket to this instance.
	///
	/// On socket-creation or handshake failure, forces a refresh (so a stale
	/// cert is shed) before propagating the error.
	#[tracing::instrument(skip(self))]
	pub async fn create_ssl_socket(
		&self,
		ip_types: &[IpAddrType],
		timeout: Duration,
	) -> Result<TlsStream<tokio::net::TcpStream>> {
		let data = self.refresher.get_data(timeout).await?;
		let ip = data.preferred_ip(ip_types)?;

		match self.socket_builder.connect(ip, &data.ssl_context).await {
			Ok(stream) => Ok(stream),
			Err(err) => {
				tracing::warn!(error = %err, "handshake failed; forcing refresh");

				self.refresher.force_refresh().await;

				Err(err)
			},
		}
	}

	/// Hint that the currently-held connection info is suspect.
	pub async fn force_refresh(&self) {
		self.refresher.force_refresh().await;
	}

	/// Capture a point-in-time view of this instance's refresh state, for diagnostics.
	pub async fn status(&self) -> CacheStatus {
		self.refresher.status().await
	}

	/// Access the per-instance metrics accumulator.
	#[cfg(feature = "metrics")]
	pub fn metrics(&self) -> Arc<crate::metrics::InstanceMetrics> {
		self.refresher.metrics()
	}
}

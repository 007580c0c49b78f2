//! End-to-end coverage of the refresh state machine through the public registry API:
//! happy path, expiry-soon immediate refresh, force-refresh dedup, and failure/retry.

// std
use std::{
	sync::{
		Arc,
		atomic::{AtomicUsize, Ordering},
	},
	time::Duration,
};
// crates.io
use cloudsql_connect_core::{
	AuthType, ConnectionConfig, ConnectionInfoRepository, ConnectorRegistry, Error, InstanceConnectionName,
	InstanceData, IpAddrType, KeyPair, RateLimiter, SslContext,
	cache::manager::ConnectionInfoCache,
};

#[derive(Clone, Debug)]
struct ScriptedRepository {
	calls: Arc<AtomicUsize>,
	failures_before_success: usize,
	lifetime: Duration,
	ip: String,
}
impl ScriptedRepository {
	fn new(failures_before_success: usize, lifetime: Duration, ip: impl Into<String>) -> Self {
		Self {
			calls: Arc::new(AtomicUsize::new(0)),
			failures_before_success,
			lifetime,
			ip: ip.into(),
		}
	}

	fn call_count(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}
}
impl ConnectionInfoRepository for ScriptedRepository {
	async fn fetch(
		&self,
		config: &ConnectionConfig,
		_key_pair: &KeyPair,
	) -> cloudsql_connect_core::Result<InstanceData> {
		let attempt = self.calls.fetch_add(1, Ordering::SeqCst);

		if attempt < self.failures_before_success {
			return Err(Error::AdminApiFailed("synthetic upstream failure".into()));
		}

		Ok(InstanceData {
			expiration: tokio::time::Instant::now() + self.lifetime,
			expiration_wallclock: chrono::Utc::now(),
			ssl_context: SslContext::new(Vec::new(), Vec::new(), "", config.instance.clone())
				.expect("empty CA bundle parses"),
			ip_addresses: [(IpAddrType::Primary, self.ip.clone())].into(),
			database_version: Some("POSTGRES_15".into()),
		})
	}
}

fn config(instance: &str) -> ConnectionConfig {
	let mut config = ConnectionConfig::new(InstanceConnectionName::parse(instance).unwrap());

	config.auth_type = AuthType::Password;

	config
}

/// S1: mock admin API returns fresh data; `getSslData`/`getPreferredIp` succeed immediately.
#[tokio::test]
async fn happy_path_resolves_ssl_data_and_preferred_ip() {
	let _ = tracing_subscriber::fmt::try_init();

	let repository = ScriptedRepository::new(0, Duration::from_secs(2 * 3600), "10.0.0.5");
	let registry = ConnectorRegistry::builder()
		.min_refresh_delay(Duration::from_millis(5))
		.build(repository.clone());
	let config = config("proj:region1:inst1");

	registry.get_ssl_data(&config).await.expect("ssl data resolves");

	let ip = registry.get_host_ip(&config).await.expect("preferred ip resolves");

	assert_eq!(ip, "10.0.0.5");
	assert_eq!(repository.call_count(), 1);
}

/// S2: a cert with under an hour of remaining lifetime schedules its successor immediately,
/// so a second fetch is observed shortly after the first without any forced refresh.
#[tokio::test]
async fn expiry_soon_certificate_triggers_an_immediate_second_fetch() {
	let _ = tracing_subscriber::fmt::try_init();

	let repository = ScriptedRepository::new(0, Duration::from_secs(30 * 60), "10.0.0.6");
	let registry = ConnectorRegistry::builder()
		.min_refresh_delay(Duration::from_millis(5))
		.build(repository.clone());
	let config = config("proj:region1:inst2");

	registry.get_ssl_data(&config).await.expect("first fetch resolves");

	tokio::time::sleep(Duration::from_millis(100)).await;

	assert!(
		repository.call_count() >= 2,
		"expected an immediate follow-up fetch, saw {} calls",
		repository.call_count()
	);
}

/// S3: any number of concurrent force-refresh calls during an already-completed attempt
/// collapse onto a single additional fetch; no further admin-API calls are observed.
#[tokio::test]
async fn force_refresh_storms_collapse_onto_a_single_attempt() {
	let _ = tracing_subscriber::fmt::try_init();

	let repository = ScriptedRepository::new(0, Duration::from_secs(3600), "10.0.0.7");
	let registry = Arc::new(
		ConnectorRegistry::builder()
			.min_refresh_delay(Duration::from_millis(5))
			.build(repository.clone()),
	);
	let config = config("proj:region1:inst3");

	registry.get_ssl_data(&config).await.expect("initial fetch resolves");

	let instance = config.instance.clone();
	let handles: Vec<_> = (0..100)
		.map(|_| {
			let registry = registry.clone();
			let instance = instance.clone();

			tokio::spawn(async move { registry.force_refresh(&instance).await })
		})
		.collect();

	for handle in handles {
		handle.await.expect("force_refresh task did not panic");
	}

	// Give the single collapsed attempt time to land before asserting.
	tokio::time::sleep(Duration::from_millis(50)).await;

	// Exactly one additional fetch beyond the constructor's initial attempt.
	assert_eq!(repository.call_count(), 2, "expected exactly one collapsed refresh");
}

/// S4: the admin API fails repeatedly before succeeding; `getData` eventually returns the
/// successful value and each retry is spaced by at least the configured minimum delay.
#[tokio::test]
async fn failures_are_retried_with_rate_limited_spacing_then_succeed() {
	let _ = tracing_subscriber::fmt::try_init();

	let min_delay = Duration::from_millis(40);
	let repository = ScriptedRepository::new(3, Duration::from_secs(3600), "10.0.0.8");
	let registry =
		ConnectorRegistry::builder().min_refresh_delay(min_delay).build(repository.clone());
	let config = config("proj:region1:inst4");
	let started = tokio::time::Instant::now();

	let ip = registry.get_host_ip(&config).await.expect("eventual success");

	assert_eq!(ip, "10.0.0.8");
	assert_eq!(repository.call_count(), 4);
	// 3 retries, each gated by the rate limiter after the constructor's own ungated
	// first attempt; at least 3 minimum-delay intervals must have elapsed.
	assert!(
		started.elapsed() >= min_delay * 3,
		"expected retries to be spaced at least {min_delay:?} apart, took {:?}",
		started.elapsed()
	);
}

/// P4/P5: while the admin API has never succeeded, `getData` fails with the recorded cause
/// once at least one attempt has failed, rather than blocking for the full timeout budget.
#[tokio::test]
async fn persistent_failure_surfaces_the_last_cause_on_timeout() {
	let _ = tracing_subscriber::fmt::try_init();

	let repository = Arc::new(ScriptedRepository::new(usize::MAX, Duration::from_secs(3600), "unused"));
	let key_pair = Arc::new(KeyPair::generate().unwrap());
	let rate_limiter = Arc::new(RateLimiter::new(Duration::from_millis(5)));
	let cache =
		ConnectionInfoCache::new(config("proj:region1:inst5"), repository, key_pair, rate_limiter);

	let err = cache.get_ssl_data(Duration::from_millis(150)).await.unwrap_err();

	assert!(matches!(
		err,
		Error::ConnectionFailedWithCause { .. } | Error::ConnectionFailedTimeout(_)
	));
}

/// S6: a handshake/connect failure forces a refresh before the error is propagated,
/// so a stale certificate is shed rather than retried against indefinitely.
#[tokio::test]
async fn create_ssl_socket_forces_a_refresh_when_the_dial_fails() {
	let _ = tracing_subscriber::fmt::try_init();

	// Not a parseable IP address, so `SocketBuilder::connect` fails immediately
	// and deterministically, without touching the network.
	let repository = Arc::new(ScriptedRepository::new(0, Duration::from_secs(3600), "not-an-ip"));
	let key_pair = Arc::new(KeyPair::generate().unwrap());
	let rate_limiter = Arc::new(RateLimiter::new(Duration::from_millis(5)));
	let cache = ConnectionInfoCache::new(
		config("proj:region1:inst6"),
		repository.clone(),
		key_pair,
		rate_limiter,
	);

	let err = cache
		.create_ssl_socket(&[IpAddrType::Primary], Duration::from_secs(5))
		.await
		.unwrap_err();

	assert!(matches!(err, Error::HandshakeFailed(_)));
	assert_eq!(repository.call_count(), 1, "only the constructor's initial fetch so far");

	// `force_refresh`'s spawned retry needs a moment to land its own fetch.
	tokio::time::sleep(Duration::from_millis(50)).await;

	assert_eq!(
		repository.call_count(),
		2,
		"create_ssl_socket's failure path should have forced exactly one more fetch"
	);
}

//! Coverage of IP-type fallback selection (S5/P6) and registry identity/reuse (P7).

// std
use std::{sync::Arc, time::Duration};
// crates.io
use cloudsql_connect_core::{
	ConnectionConfig, ConnectionInfoRepository, ConnectorRegistry, Error, InstanceConnectionName,
	InstanceData, IpAddrType, KeyPair, SslContext,
};

#[derive(Clone, Debug)]
struct StaticRepository {
	ip_addresses: Vec<(IpAddrType, &'static str)>,
	calls: Arc<std::sync::atomic::AtomicUsize>,
}
impl StaticRepository {
	fn new(ip_addresses: Vec<(IpAddrType, &'static str)>) -> Self {
		Self { ip_addresses, calls: Arc::new(std::sync::atomic::AtomicUsize::new(0)) }
	}
}
impl ConnectionInfoRepository for StaticRepository {
	async fn fetch(
		&self,
		config: &ConnectionConfig,
		_key_pair: &KeyPair,
	) -> cloudsql_connect_core::Result<InstanceData> {
		self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

		Ok(InstanceData {
			expiration: tokio::time::Instant::now() + Duration::from_secs(3600),
			expiration_wallclock: chrono::Utc::now(),
			ssl_context: SslContext::new(Vec::new(), Vec::new(), "", config.instance.clone()).unwrap(),
			ip_addresses: self
				.ip_addresses
				.iter()
				.map(|(kind, ip)| (*kind, ip.to_string()))
				.collect(),
			database_version: None,
		})
	}
}

fn registry(
	repository: StaticRepository,
) -> ConnectorRegistry<StaticRepository> {
	ConnectorRegistry::builder().min_refresh_delay(Duration::from_millis(5)).build(repository)
}

fn config(instance: &str, ip_types: Vec<IpAddrType>) -> ConnectionConfig {
	let mut config = ConnectionConfig::new(InstanceConnectionName::parse(instance).unwrap());

	config.ip_types = ip_types;

	config
}

/// S5: preference list [PRIVATE, PRIMARY] falls back to PRIMARY when PRIVATE is absent.
#[tokio::test]
async fn preferred_ip_falls_back_through_the_requested_list() {
	let _ = tracing_subscriber::fmt::try_init();

	let registry = registry(StaticRepository::new(vec![(IpAddrType::Primary, "1.2.3.4")]));
	let config = config("p:r:fallback", vec![IpAddrType::Private, IpAddrType::Primary]);

	let ip = registry.get_host_ip(&config).await.expect("primary ip resolves");

	assert_eq!(ip, "1.2.3.4");
}

/// S5: a preference list containing only an unavailable type fails with `IpTypeNotAvailable`.
#[tokio::test]
async fn preferred_ip_fails_when_no_requested_type_is_available() {
	let _ = tracing_subscriber::fmt::try_init();

	let registry = registry(StaticRepository::new(vec![(IpAddrType::Primary, "1.2.3.4")]));
	let config = config("p:r:no-match", vec![IpAddrType::Private]);

	let err = registry.get_host_ip(&config).await.unwrap_err();

	assert!(
		matches!(err, Error::IpTypeNotAvailable { requested } if requested == vec![IpAddrType::Private])
	);
}

/// P6: PSC is honoured when it is first in the preference list and present.
#[tokio::test]
async fn psc_is_preferred_when_listed_first_and_present() {
	let _ = tracing_subscriber::fmt::try_init();

	let registry = registry(StaticRepository::new(vec![
		(IpAddrType::Primary, "1.2.3.4"),
		(IpAddrType::Psc, "5.6.7.8"),
	]));
	let config = config("p:r:psc", vec![IpAddrType::Psc, IpAddrType::Primary]);

	let ip = registry.get_host_ip(&config).await.expect("psc ip resolves");

	assert_eq!(ip, "5.6.7.8");
}

/// P7/I8: repeated lookups for the same instance identifier — including concurrent ones —
/// are served by exactly one underlying fetch, proving the registry returns (and reuses) a
/// single cache per instance rather than racing two independent ones into existence.
#[tokio::test]
async fn concurrent_lookups_for_the_same_instance_share_one_cache() {
	let _ = tracing_subscriber::fmt::try_init();

	let repository = StaticRepository::new(vec![(IpAddrType::Primary, "9.9.9.9")]);
	let calls = repository.calls.clone();
	let registry = Arc::new(registry(repository));
	let config = config("p:r:shared", vec![IpAddrType::Primary]);

	let handles: Vec<_> = (0..20)
		.map(|_| {
			let registry = registry.clone();
			let config = config.clone();

			tokio::spawn(async move { registry.get_host_ip(&config).await })
		})
		.collect();

	for handle in handles {
		assert_eq!(handle.await.unwrap().unwrap(), "9.9.9.9");
	}

	assert_eq!(
		calls.load(std::sync::atomic::Ordering::SeqCst),
		1,
		"expected a single fetch shared by every concurrent lookup"
	);
}

//! Coverage of `AdminApiRepository` against a mocked admin API: status-code mapping
//! (403/404) and a happy-path fetch that exercises real certificate parsing.

// std
use std::sync::Arc;
// crates.io
use cloudsql_connect_core::{
	AdminApiRepository, ConnectionConfig, ConnectionInfoRepository, ConnectorRegistry, Error,
	InstanceConnectionName, KeyPair,
};
use wiremock::{
	Mock, MockServer, ResponseTemplate,
	matchers::{header, header_regex, method, path},
};

const CA_CERT: &str = include_str!("../fixtures/ca.crt");
const LEAF_CERT: &str = include_str!("../fixtures/leaf.crt");

fn config(instance: &str) -> ConnectionConfig {
	ConnectionConfig::new(InstanceConnectionName::parse(instance).unwrap())
}

async fn repository(server: &MockServer) -> AdminApiRepository {
	let base_url = format!("{}/", server.uri()).parse().unwrap();

	AdminApiRepository::new(base_url, "integration-test").unwrap()
}

/// A 403 from `connectSettings` surfaces as `Error::InstanceNotAuthorized`.
#[tokio::test]
async fn forbidden_connect_settings_maps_to_not_authorized() {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/projects/p/instances/forbidden/connectSettings"))
		.respond_with(ResponseTemplate::new(403))
		.mount(&server)
		.await;

	let repository = repository(&server).await;
	let key_pair = KeyPair::generate().unwrap();
	let err = repository.fetch(&config("p:r:forbidden"), &key_pair).await.unwrap_err();

	assert!(matches!(err, Error::InstanceNotAuthorized));
}

/// A 404 from `connectSettings` surfaces as `Error::InstanceNotFound`.
#[tokio::test]
async fn missing_instance_maps_to_not_found() {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/projects/p/instances/missing/connectSettings"))
		.respond_with(ResponseTemplate::new(404))
		.mount(&server)
		.await;

	let repository = repository(&server).await;
	let key_pair = KeyPair::generate().unwrap();
	let err = repository.fetch(&config("p:r:missing"), &key_pair).await.unwrap_err();

	assert!(matches!(err, Error::InstanceNotFound));
}

/// A 403 from `generateEphemeralCert` (after a successful `connectSettings`) also maps
/// to `InstanceNotAuthorized`.
#[tokio::test]
async fn forbidden_ephemeral_cert_maps_to_not_authorized() {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/projects/p/instances/halfway/connectSettings"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
			"ipAddresses": [{"type": "PRIMARY", "ipAddress": "10.1.2.3"}],
			"serverCaCert": {"cert": CA_CERT},
		})))
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path("/projects/p/instances/halfway:generateEphemeralCert"))
		.respond_with(ResponseTemplate::new(403))
		.mount(&server)
		.await;

	let repository = repository(&server).await;
	let key_pair = KeyPair::generate().unwrap();
	let err = repository.fetch(&config("p:r:halfway"), &key_pair).await.unwrap_err();

	assert!(matches!(err, Error::InstanceNotAuthorized));
}

/// A full happy-path fetch parses a real CA certificate into the trust store and a real
/// ephemeral leaf certificate into the client certificate chain.
#[tokio::test]
async fn happy_path_fetch_builds_a_well_formed_instance_data() {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;
	let expiration = Arc::new(chrono::Utc::now() + chrono::Duration::hours(1));

	Mock::given(method("GET"))
		.and(path("/projects/proj/instances/ok/connectSettings"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
			"ipAddresses": [
				{"type": "PRIMARY", "ipAddress": "203.0.113.10"},
				{"type": "PRIVATE", "ipAddress": "10.20.30.40"},
			],
			"serverCaCert": {"cert": CA_CERT},
			"databaseVersion": "POSTGRES_15",
		})))
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path("/projects/proj/instances/ok:generateEphemeralCert"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
			"ephemeralCert": {
				"cert": LEAF_CERT,
				"expirationTime": expiration.to_rfc3339(),
			},
		})))
		.mount(&server)
		.await;

	let repository = repository(&server).await;
	let key_pair = KeyPair::generate().unwrap();
	let data = repository.fetch(&config("proj:region:ok"), &key_pair).await.expect("fetch succeeds");

	assert_eq!(data.database_version.as_deref(), Some("POSTGRES_15"));
	assert_eq!(
		data.preferred_ip(&[cloudsql_connect_core::IpAddrType::Private]).unwrap(),
		"10.20.30.40"
	);
	assert!(data.expiration_wallclock > chrono::Utc::now());
}

/// `with_quota_project` attaches `X-Goog-User-Project` to every admin-API request.
#[tokio::test]
async fn quota_project_is_sent_as_a_header_on_every_request() {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;
	let expiration = Arc::new(chrono::Utc::now() + chrono::Duration::hours(1));

	Mock::given(method("GET"))
		.and(path("/projects/p/instances/billed/connectSettings"))
		.and(header("X-Goog-User-Project", "billing-project"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
			"ipAddresses": [{"type": "PRIMARY", "ipAddress": "10.1.2.3"}],
			"serverCaCert": {"cert": CA_CERT},
		})))
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path("/projects/p/instances/billed:generateEphemeralCert"))
		.and(header("X-Goog-User-Project", "billing-project"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
			"ephemeralCert": {
				"cert": LEAF_CERT,
				"expirationTime": expiration.to_rfc3339(),
			},
		})))
		.mount(&server)
		.await;

	let base_url = format!("{}/", server.uri()).parse().unwrap();
	let repository =
		AdminApiRepository::new(base_url, "integration-test").unwrap().with_quota_project("billing-project");
	let key_pair = KeyPair::generate().unwrap();

	repository.fetch(&config("p:r:billed"), &key_pair).await.expect("fetch succeeds");
}

/// `ConnectorRegistry::set_application_name`, called before the registry serves its
/// first lookup, genuinely changes the `User-Agent` sent on every subsequent
/// admin-API request — not just the readback value — because `build_admin_api`
/// wires the registry and the repository to the same shared cell.
#[tokio::test]
async fn set_application_name_changes_the_user_agent_on_subsequent_requests() {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;
	let expiration = Arc::new(chrono::Utc::now() + chrono::Duration::hours(1));

	Mock::given(method("GET"))
		.and(path("/projects/p/instances/renamed/connectSettings"))
		.and(header_regex("User-Agent", "renamed-app"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
			"ipAddresses": [{"type": "PRIMARY", "ipAddress": "10.1.2.3"}],
			"serverCaCert": {"cert": CA_CERT},
		})))
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path("/projects/p/instances/renamed:generateEphemeralCert"))
		.and(header_regex("User-Agent", "renamed-app"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
			"ephemeralCert": {
				"cert": LEAF_CERT,
				"expirationTime": expiration.to_rfc3339(),
			},
		})))
		.mount(&server)
		.await;

	let base_url = format!("{}/", server.uri()).parse().unwrap();
	let registry = ConnectorRegistry::builder()
		.admin_api_endpoint(base_url)
		.application_name("original-app")
		.build_admin_api()
		.unwrap();

	registry.set_application_name("renamed-app").expect("registry has not served a lookup yet");

	// If the User-Agent still carried "original-app", neither mock above would
	// match and this fetch would fail against wiremock's unmatched-request 404.
	registry.get_ssl_data(&config("p:r:renamed")).await.expect("fetch succeeds with the renamed User-Agent");
}

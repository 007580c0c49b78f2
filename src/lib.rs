//! Async connection-info cache and refresh subsystem for mutually-authenticated TLS
//! connections to managed Cloud SQL-style database instances.
//!
//! Given only a logical `project:region:instance` identifier, [`ConnectorRegistry`] fetches
//! instance metadata and an ephemeral client certificate from a remote admin API, keeps them
//! fresh ahead of expiry, and hands back a connected, TLS-handshaken socket.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod cache;
#[cfg(feature = "metrics")] pub mod metrics;

mod data;
mod error;
mod instance;
mod keypair;
mod rate_limiter;
mod refresh_calculator;
mod registry;
mod repository;
mod socket;
mod verifier;
mod _prelude {
	pub use std::{sync::Arc, time::Duration};

	pub use chrono::{DateTime, Utc};
	pub use tokio::time::Instant;

	pub use crate::{Error, Result};
}

#[cfg(feature = "prometheus")] pub use crate::metrics::install_default_exporter;
pub use crate::{
	data::{InstanceData, SslContext},
	error::{Error, Result},
	instance::{AuthType, ConnectionConfig, InstanceConnectionName, IpAddrType},
	keypair::{KeyPair, RSA_KEY_SIZE},
	rate_limiter::RateLimiter,
	refresh_calculator::next_refresh_delay,
	registry::{
		Connection, ConnectorRegistry, RegistryBuilder, DEFAULT_ADMIN_API_ENDPOINT,
		DEFAULT_MAX_REFRESH, DEFAULT_WORKER_POOL_SIZE, FORCE_UNIX_SOCKET_ENV, MIN_REFRESH_DELAY,
	},
	repository::{AdminApiRepository, ConnectionInfoRepository},
	socket::{SERVER_PROXY_PORT, SocketBuilder},
	verifier::InstanceIdentityVerifier,
};

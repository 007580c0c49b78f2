//! Crate-wide error types and `Result` alias.

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the connection-info cache and refresh subsystem.
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Reqwest(#[from] reqwest::Error),
	#[error(transparent)]
	Serde(#[from] serde_json::Error),
	#[error(transparent)]
	Url(#[from] url::ParseError),
	#[error(transparent)]
	Rustls(#[from] rustls::Error),
	#[error(transparent)]
	Rsa(#[from] rsa::Error),

	#[error("Invalid instance connection name '{name}': {reason}")]
	InvalidInstanceName { name: String, reason: String },
	#[error("Invalid connection config: {message}")]
	InvalidConfig { message: String },
	#[error("Admin API request failed: {0}")]
	AdminApiFailed(String),
	#[error("Caller is not authorized to connect to this instance.")]
	InstanceNotAuthorized,
	#[error("Instance was not found by the admin API.")]
	InstanceNotFound,
	#[error("None of the requested IP types {requested:?} are available for this instance.")]
	IpTypeNotAvailable { requested: Vec<crate::instance::IpAddrType> },
	#[error("Timed out waiting for connection info after {0:?} with no completed refresh.")]
	ConnectionFailedTimeout(std::time::Duration),
	#[error("Timed out waiting for connection info after {timeout:?}; last refresh failed: {cause}")]
	ConnectionFailedWithCause { timeout: std::time::Duration, cause: String },
	#[error("{0}")]
	Upstream(std::sync::Arc<Error>),
	#[error("TLS handshake or connect failed: {0}")]
	HandshakeFailed(String),
	#[error("Process-wide state has already been initialised.")]
	AlreadyInitialised,
	#[error("Metrics error: {0}")]
	Metrics(String),
	#[error("Key encoding error: {0}")]
	KeyEncoding(String),
}
#[cfg(feature = "metrics")]
impl<T> From<metrics::SetRecorderError<T>> for Error
where
	T: std::fmt::Display,
{
	fn from(value: metrics::SetRecorderError<T>) -> Self {
		Self::Metrics(value.to_string())
	}
}

//! Instance identification and per-call connection configuration.

// crates.io
use serde::{Deserialize, Serialize};
// self
use crate::_prelude::*;

/// Validated `project:region:instance` identifier, opaque outside parsing.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceConnectionName {
	project: Arc<str>,
	region: Arc<str>,
	instance: Arc<str>,
}
impl InstanceConnectionName {
	/// Parse a `project:region:instance` string.
	pub fn parse(raw: impl AsRef<str>) -> Result<Self> {
		let raw = raw.as_ref();
		let mut parts = raw.split(':');
		let (project, region, instance) = match (parts.next(), parts.next(), parts.next(), parts.next())
		{
			(Some(project), Some(region), Some(instance), None)
				if !project.is_empty() && !region.is_empty() && !instance.is_empty() =>
				(project, region, instance),
			_ =>
				return Err(Error::InvalidInstanceName {
					name: raw.to_string(),
					reason: "Must have the form 'project:region:instance'.".into(),
				}),
		};

		Ok(Self { project: project.into(), region: region.into(), instance: instance.into() })
	}

	/// GCP-style project identifier.
	pub fn project(&self) -> &str {
		&self.project
	}

	/// Region in which the instance is provisioned.
	pub fn region(&self) -> &str {
		&self.region
	}

	/// Short instance name within the project/region.
	pub fn instance(&self) -> &str {
		&self.instance
	}
}
impl std::fmt::Display for InstanceConnectionName {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}:{}:{}", self.project, self.region, self.instance)
	}
}
impl TryFrom<String> for InstanceConnectionName {
	type Error = Error;

	fn try_from(value: String) -> Result<Self> {
		Self::parse(value)
	}
}
impl From<InstanceConnectionName> for String {
	fn from(value: InstanceConnectionName) -> Self {
		value.to_string()
	}
}

/// IP endpoint category exposed by an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IpAddrType {
	/// Public, internet-routable endpoint.
	Primary,
	/// VPC-private endpoint.
	Private,
	/// Private Service Connect endpoint.
	Psc,
}

/// Authentication mechanism used when establishing a connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuthType {
	/// Standard mutually-authenticated TLS using the ephemeral client certificate.
	#[default]
	Password,
	/// IAM-token based authentication layered on top of the TLS transport.
	Iam,
}

/// Immutable, per-call connection request.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
	/// Logical identifier of the target instance.
	pub instance: InstanceConnectionName,
	/// Ordered IP-type preference; the first present match wins.
	pub ip_types: Vec<IpAddrType>,
	/// Authentication mechanism requested by the caller.
	pub auth_type: AuthType,
	/// Optional service-account to impersonate when minting credentials.
	pub target_principal: Option<String>,
	/// Optional impersonation delegation chain, applied before `target_principal`.
	pub delegates: Vec<String>,
	/// Optional Unix-domain-socket path; when set, bypasses the TLS path entirely.
	pub unix_socket_path: Option<String>,
	/// Optional suffix appended to `unix_socket_path` unless already present.
	pub unix_socket_path_suffix: Option<String>,
}
impl ConnectionConfig {
	/// Construct a config with the given instance and the default IP-type preference.
	pub fn new(instance: InstanceConnectionName) -> Self {
		Self {
			instance,
			ip_types: vec![IpAddrType::Primary],
			auth_type: AuthType::Password,
			target_principal: None,
			delegates: Vec::new(),
			unix_socket_path: None,
			unix_socket_path_suffix: None,
		}
	}

	/// Validate that the config is well-formed enough to attempt a connection.
	///
	/// The instance identifier itself is validated at parse time by
	/// [`InstanceConnectionName::parse`]; this additionally rejects an empty
	/// IP-type preference list, since an empty list can never select an IP.
	pub fn validate(&self) -> Result<()> {
		if self.ip_types.is_empty() {
			return Err(Error::InvalidConfig {
				message: "ip_types must list at least one preferred IP type.".into(),
			});
		}

		Ok(())
	}

	/// Resolve the effective Unix-socket path, applying the suffix-concatenation rule.
	///
	/// `None` and `Some("")` are treated identically as "no suffix"; the suffix is
	/// appended only when the path does not already end with it.
	pub fn effective_unix_socket_path(&self) -> Option<String> {
		let path = self.unix_socket_path.as_ref()?;
		let suffix = self.unix_socket_path_suffix.as_deref().unwrap_or("");

		if suffix.is_empty() || path.ends_with(suffix) {
			Some(path.clone())
		} else {
			Some(format!("{path}{suffix}"))
		}
	}
}

use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use url::Url;

use crate::types::Patient;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	pub telemetry: TelemetryConfig,
	pub http: HttpServerConfig,
	pub dimse: DimseRuntimeConfig,
	pub token: TokenConfig,
	/// Tenant key -> tenant configuration.
	#[serde(default)]
	pub tenants: HashMap<String, TenantConfig>,
}

impl AppConfig {
	pub fn new() -> Result<Self, config::ConfigError> {
		use config::Config;
		let s = Config::builder()
			.add_source(config::File::from_str(
				include_str!("defaults.toml"),
				config::FileFormat::Toml,
			))
			.add_source(config::File::with_name("config.toml").required(false))
			.add_source(config::Environment::with_prefix("SMART_IMAGING").separator("__"))
			.build()?;

		s.try_deserialize()
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
	/// Log level for the stdout logger. Also configurable via RUST_LOG.
	#[serde(with = "level")]
	pub level: tracing::Level,
}

mod level {
	use serde::{Deserialize, Deserializer};
	use std::str::FromStr;

	pub fn deserialize<'de, D>(deserializer: D) -> Result<tracing::Level, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = String::deserialize(deserializer)?;
		tracing::Level::from_str(&value).map_err(serde::de::Error::custom)
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpServerConfig {
	/// The interface the HTTP server binds to.
	pub interface: IpAddr,
	pub port: u16,
	/// The externally reachable base URL, embedded into minted retrieval endpoints.
	pub public_base_url: Url,
	/// Per-request timeout in seconds.
	pub request_timeout: u64,
	pub graceful_shutdown: bool,
}

/// Process-wide settings for the DIMSE download machinery.
#[derive(Debug, Clone, Deserialize)]
pub struct DimseRuntimeConfig {
	/// Root directory for per-study download directories.
	pub root: PathBuf,
	/// Seconds a finished download is kept on disk after its last reader detaches.
	pub grace_period: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenConfig {
	/// Passphrase the capability-token key is derived from.
	/// When unset, a random per-process key is used and tokens do not survive restarts.
	#[serde(default)]
	pub passphrase: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TenantConfig {
	pub dicom: DicomConfig,
	pub authorization: AuthorizationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DicomConfig {
	#[serde(flatten)]
	pub backend: BackendConfig,
	#[serde(default)]
	pub lookup: LookupMode,
	#[serde(default)]
	pub delay: Option<DelayConfig>,
	/// Identifier type code used to pick the MRN from a Patient resource.
	#[serde(default = "default_mrn_type_code")]
	pub mrn_type_code: String,
}

fn default_mrn_type_code() -> String {
	String::from("MR")
}

/// Backend discriminator. New transports are added here and dispatched
/// through [`crate::provider::create`] without touching call sites.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum BackendConfig {
	#[serde(rename = "dicom-web")]
	Web(WebBackendConfig),
	#[serde(rename = "dicom-dimse")]
	Dimse(DimseBackendConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebBackendConfig {
	/// DICOMweb origin, e.g. `https://pacs.example.org/dicom-web`.
	pub endpoint: Url,
	#[serde(default)]
	pub authentication: UpstreamAuth,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DimseBackendConfig {
	/// Archive host.
	pub host: String,
	pub port: u16,
	/// Application entity title the gateway presents to the archive.
	pub calling_aet: String,
	/// Application entity title of the archive.
	pub called_aet: String,
	/// Move destination, i.e. the AE title of the local store receiver.
	pub destination_aet: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type")]
pub enum UpstreamAuth {
	#[default]
	#[serde(rename = "open")]
	Open,
	#[serde(rename = "http-basic")]
	HttpBasic { username: String, password: String },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Deserialize)]
pub enum LookupMode {
	#[serde(rename = "all-studies-on-server")]
	AllStudiesOnServer,
	#[default]
	#[serde(rename = "studies-by-mrn")]
	StudiesByMrn,
}

/// Artificial delay windows for test/demo tenants, as Unix timestamps.
#[derive(Debug, Copy, Clone, Default, Deserialize)]
pub struct DelayConfig {
	#[serde(default)]
	pub lookup_until: Option<f64>,
	#[serde(default)]
	pub retrieve_until: Option<f64>,
}

/// Introspection strategy discriminator. Each variant encodes the quirks of
/// one EHR vendor's SMART-on-FHIR implementation.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum AuthorizationConfig {
	#[serde(rename = "smart-on-fhir")]
	Smart(SmartAuthorizationConfig),
	#[serde(rename = "smart-on-fhir-with-epic-bugfixes")]
	Epic(SmartAuthorizationConfig),
	#[serde(rename = "smart-on-fhir-with-meditech-bugfixes")]
	Meditech(SmartAuthorizationConfig),
	#[serde(rename = "mock")]
	Mock(MockAuthorizationConfig),
}

impl AuthorizationConfig {
	pub const fn fhir_base_url(&self) -> Option<&Url> {
		match self {
			Self::Smart(config) | Self::Epic(config) | Self::Meditech(config) => {
				Some(&config.fhir_base_url)
			}
			Self::Mock(_) => None,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmartAuthorizationConfig {
	pub fhir_base_url: Url,
	pub client_id: String,
	#[serde(default)]
	pub client_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MockAuthorizationConfig {
	#[serde(default)]
	pub patient: Option<Patient>,
	#[serde(default)]
	pub disable_authz_checks: bool,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_deserialize() {
		let config: AppConfig = config::Config::builder()
			.add_source(config::File::from_str(
				include_str!("defaults.toml"),
				config::FileFormat::Toml,
			))
			.build()
			.unwrap()
			.try_deserialize()
			.unwrap();

		assert_eq!(config.http.port, 8000);
		assert_eq!(config.dimse.grace_period, 3600);
		assert!(config.tenants.is_empty());
	}

	#[test]
	fn backend_discriminator_selects_variant() {
		let web: DicomConfig = serde_json::from_value(serde_json::json!({
			"type": "dicom-web",
			"endpoint": "https://pacs.example.org/dicom-web",
			"lookup": "all-studies-on-server",
		}))
		.unwrap();
		assert!(matches!(web.backend, BackendConfig::Web(_)));
		assert_eq!(web.lookup, LookupMode::AllStudiesOnServer);
		assert_eq!(web.mrn_type_code, "MR");

		let dimse: DicomConfig = serde_json::from_value(serde_json::json!({
			"type": "dicom-dimse",
			"host": "archive.example.org",
			"port": 4242,
			"calling_aet": "GATEWAY",
			"called_aet": "ARCHIVE",
			"destination_aet": "GATEWAY-SCP",
		}))
		.unwrap();
		assert!(matches!(dimse.backend, BackendConfig::Dimse(_)));
		assert_eq!(dimse.lookup, LookupMode::StudiesByMrn);
	}
}

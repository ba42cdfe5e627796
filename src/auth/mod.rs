//! Tenant authorization: the `Authorizer` decision object plus the
//! `Introspector` strategies that build one from an inbound bearer token.
//!
//! Each strategy encodes one EHR vendor's SMART-on-FHIR quirks; only the
//! steps that differ (introspection endpoint derivation, patient resolution,
//! scope allow-list) are overridden.

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::config::{AuthorizationConfig, SmartAuthorizationConfig};
use crate::error::AuthorizationError;
use crate::types::{IntrospectionResponse, Patient, QueryRestrictions};

/// SMART scopes that grant imaging access on a standards-conforming EHR.
const IMAGING_SCOPES: &[&str] = &[
	"patient/*.*",
	"patient/*.read",
	"patient/*.rs",
	"patient/ImagingStudy.read",
	"patient/ImagingStudy.*",
	"patient/ImagingStudy.rs",
];

/// Narrower allow-list for vendors that do not grant wildcard scopes.
const VENDOR_IMAGING_SCOPES: &[&str] =
	&["patient/DiagnosticReport.read", "patient/ImagingStudy.read"];

/// The authorization decision for one request.
///
/// Bound to a tenant and (usually) a patient; a deny-all instance is used
/// when introspection failed so downstream code never branches on "maybe
/// authorized".
#[derive(Debug, Clone)]
pub struct Authorizer {
	pub tenant_key: String,
	pub patient: Option<Patient>,
	allow_any_patient: bool,
	denied: bool,
}

impl Authorizer {
	pub fn new(tenant_key: impl Into<String>, patient: Option<Patient>) -> Self {
		Self {
			tenant_key: tenant_key.into(),
			patient,
			allow_any_patient: false,
			denied: false,
		}
	}

	/// For mock tenants with `disable_authz_checks`.
	pub fn permissive(tenant_key: impl Into<String>, patient: Option<Patient>) -> Self {
		Self {
			tenant_key: tenant_key.into(),
			patient,
			allow_any_patient: true,
			denied: false,
		}
	}

	/// An authorizer that rejects every query.
	pub fn deny_all(tenant_key: impl Into<String>) -> Self {
		Self {
			tenant_key: tenant_key.into(),
			patient: None,
			allow_any_patient: false,
			denied: true,
		}
	}

	/// Checks that `restrictions` are satisfied by this authorization:
	/// same tenant, and the restriction resolves to the bound patient
	/// (by id or by identifier value).
	pub fn ensure_query_allowed(
		&self,
		restrictions: &QueryRestrictions,
	) -> Result<(), AuthorizationError> {
		if restrictions.tenant_key != self.tenant_key {
			// Authorizations never cross tenants, even for the same patient.
			return Err(AuthorizationError::NotAllowed);
		}
		if self.denied {
			return Err(AuthorizationError::NotAllowed);
		}
		if self.allow_any_patient {
			return Ok(());
		}

		if let Some(by_patient_id) = &restrictions.by_patient_id {
			if self
				.patient
				.as_ref()
				.is_some_and(|patient| &patient.id == by_patient_id)
			{
				return Ok(());
			}
		}
		if let Some(by_identifier) = &restrictions.by_patient_identifier {
			if self.patient.as_ref().is_some_and(|patient| {
				patient
					.identifier
					.iter()
					.any(|identifier| identifier.value == by_identifier.value)
			}) {
				return Ok(());
			}
		}

		Err(AuthorizationError::NotAllowed)
	}

	/// Resolves a patient id within this authorization context.
	pub fn resolve_patient(&self, patient_id: &str) -> Result<&Patient, AuthorizationError> {
		self.patient
			.as_ref()
			.filter(|patient| patient.id == patient_id)
			.ok_or(AuthorizationError::NoPatient)
	}
}

/// Builds an [`Authorizer`] from the inbound bearer token.
#[async_trait]
pub trait Introspector: Send + Sync {
	/// Never fails outward: an introspection failure yields a deny-all
	/// authorizer so the 403 surfaces where the query is checked.
	async fn authorize(&self, tenant_key: &str, bearer: Option<&str>) -> Authorizer;
}

/// Selects the introspection strategy for a tenant.
pub fn create(config: &AuthorizationConfig) -> Box<dyn Introspector> {
	match config {
		AuthorizationConfig::Smart(smart) => Box::new(SmartIntrospector {
			config: smart.clone(),
			vendor: Vendor::Standard,
			smart_configuration: Mutex::new(None),
			http: reqwest::Client::new(),
		}),
		AuthorizationConfig::Epic(smart) => Box::new(SmartIntrospector {
			config: smart.clone(),
			vendor: Vendor::Epic,
			smart_configuration: Mutex::new(None),
			http: reqwest::Client::new(),
		}),
		AuthorizationConfig::Meditech(smart) => Box::new(SmartIntrospector {
			config: smart.clone(),
			vendor: Vendor::Meditech,
			smart_configuration: Mutex::new(None),
			http: reqwest::Client::new(),
		}),
		AuthorizationConfig::Mock(mock) => Box::new(MockIntrospector {
			patient: mock.patient.clone(),
			disable_authz_checks: mock.disable_authz_checks,
		}),
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Vendor {
	Standard,
	Epic,
	Meditech,
}

/// `.well-known/smart-configuration` discovery document.
#[derive(Debug, Clone, Deserialize)]
struct SmartConfiguration {
	token_endpoint: String,
	#[serde(default)]
	introspection_endpoint: Option<String>,
}

struct SmartIntrospector {
	config: SmartAuthorizationConfig,
	vendor: Vendor,
	/// Discovery result, fetched once per process.
	smart_configuration: Mutex<Option<SmartConfiguration>>,
	http: reqwest::Client,
}

#[async_trait]
impl Introspector for SmartIntrospector {
	async fn authorize(&self, tenant_key: &str, bearer: Option<&str>) -> Authorizer {
		match self.try_authorize(tenant_key, bearer).await {
			Ok(authorizer) => authorizer,
			Err(err) => {
				warn!(tenant_key, "introspection failed: {err}");
				Authorizer::deny_all(tenant_key)
			}
		}
	}
}

impl SmartIntrospector {
	async fn try_authorize(
		&self,
		tenant_key: &str,
		bearer: Option<&str>,
	) -> Result<Authorizer, AuthorizationError> {
		let bearer = bearer.ok_or(AuthorizationError::InactiveToken)?;
		let introspected = self.introspect(bearer).await?;
		if !introspected.active {
			return Err(AuthorizationError::InactiveToken);
		}
		if !self.allows_imaging(&introspected.scope) {
			return Err(AuthorizationError::MissingScope);
		}

		let patient = self.resolve_patient(&introspected, bearer).await?;
		debug!(tenant_key, patient = %patient.id, "authorized");
		Ok(Authorizer::new(tenant_key, Some(patient)))
	}

	async fn smart_configuration(&self) -> Result<SmartConfiguration, AuthorizationError> {
		let mut cached = self.smart_configuration.lock().await;
		if let Some(configuration) = cached.as_ref() {
			return Ok(configuration.clone());
		}

		let url = join_url(&self.config.fhir_base_url, ".well-known/smart-configuration")?;
		let configuration: SmartConfiguration = self
			.http
			.get(url)
			.header(reqwest::header::ACCEPT, "application/json")
			.send()
			.await
			.map_err(|_| AuthorizationError::InactiveToken)?
			.json()
			.await
			.map_err(|_| AuthorizationError::InactiveToken)?;

		*cached = Some(configuration.clone());
		Ok(configuration)
	}

	async fn introspection_endpoint(&self) -> Result<String, AuthorizationError> {
		let configuration = self.smart_configuration().await?;
		match self.vendor {
			// Epic's discovery document omits the introspection endpoint;
			// it lives next to the token endpoint.
			Vendor::Epic => Ok(configuration
				.token_endpoint
				.trim_end_matches("/token")
				.to_owned() + "/introspect"),
			Vendor::Standard | Vendor::Meditech => configuration
				.introspection_endpoint
				.ok_or(AuthorizationError::InactiveToken),
		}
	}

	async fn introspect(
		&self,
		bearer: &str,
	) -> Result<IntrospectionResponse, AuthorizationError> {
		let endpoint = self.introspection_endpoint().await?;
		let mut request = self
			.http
			.post(&endpoint)
			.form(&[("token", bearer)]);

		// client_secret_basic where a secret is configured; Meditech accepts
		// nothing else.
		if let Some(secret) = &self.config.client_secret {
			let credentials = STANDARD.encode(format!("{}:{secret}", self.config.client_id));
			request = request.header(reqwest::header::AUTHORIZATION, format!("Basic {credentials}"));
		}

		let mut introspected: IntrospectionResponse = request
			.send()
			.await
			.map_err(|_| AuthorizationError::InactiveToken)?
			.json()
			.await
			.map_err(|_| AuthorizationError::InactiveToken)?;

		if self.vendor == Vendor::Meditech && introspected.patient.is_none() {
			// Meditech omits the patient claim; fall back to the unverified
			// token payload. Introspection already vouched for the token.
			introspected.patient = unverified_patient_claim(bearer);
		}

		Ok(introspected)
	}

	async fn resolve_patient(
		&self,
		introspected: &IntrospectionResponse,
		bearer: &str,
	) -> Result<Patient, AuthorizationError> {
		let patient_url = match self.vendor {
			// Epic carries an absolute patient URL in `sub`.
			Vendor::Epic => introspected
				.sub
				.clone()
				.ok_or(AuthorizationError::NoPatient)?,
			Vendor::Standard | Vendor::Meditech => {
				let patient_id = introspected
					.patient
					.as_ref()
					.ok_or(AuthorizationError::NoPatient)?;
				join_url(&self.config.fhir_base_url, &format!("Patient/{patient_id}"))?.to_string()
			}
		};

		self.http
			.get(patient_url)
			.header(reqwest::header::ACCEPT, "application/fhir+json")
			.bearer_auth(bearer)
			.send()
			.await
			.map_err(|_| AuthorizationError::NoPatient)?
			.json()
			.await
			.map_err(|_| AuthorizationError::NoPatient)
	}

	fn allows_imaging(&self, scope: &str) -> bool {
		let allowed = match self.vendor {
			Vendor::Standard => IMAGING_SCOPES,
			Vendor::Epic | Vendor::Meditech => VENDOR_IMAGING_SCOPES,
		};
		scope
			.split_whitespace()
			.any(|granted| allowed.contains(&granted))
	}
}

fn join_url(base: &Url, suffix: &str) -> Result<Url, AuthorizationError> {
	let joined = format!("{}/{suffix}", base.as_str().trim_end_matches('/'));
	Url::parse(&joined).map_err(|_| AuthorizationError::InactiveToken)
}

/// Reads the `patient` claim out of a JWT payload without verifying the
/// signature.
fn unverified_patient_claim(bearer: &str) -> Option<String> {
	let payload = bearer.split('.').nth(1)?;
	let decoded = URL_SAFE_NO_PAD.decode(payload).ok()?;
	let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
	claims
		.get("patient")
		.and_then(serde_json::Value::as_str)
		.map(str::to_owned)
}

/// Canned authorization for demo and test tenants.
struct MockIntrospector {
	patient: Option<Patient>,
	disable_authz_checks: bool,
}

#[async_trait]
impl Introspector for MockIntrospector {
	async fn authorize(&self, tenant_key: &str, _bearer: Option<&str>) -> Authorizer {
		if self.disable_authz_checks {
			Authorizer::permissive(tenant_key, self.patient.clone())
		} else {
			Authorizer::new(tenant_key, self.patient.clone())
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::Identifier;

	fn patient_with_identifier(id: &str, value: &str) -> Patient {
		Patient {
			id: id.to_owned(),
			identifier: vec![Identifier {
				system: Some(String::from("urn:mrn")),
				value: value.to_owned(),
				type_: None,
			}],
		}
	}

	fn restrictions(tenant: &str) -> QueryRestrictions {
		QueryRestrictions {
			tenant_key: tenant.to_owned(),
			by_patient_id: Some(String::from("pat-1")),
			by_patient_identifier: None,
		}
	}

	#[test]
	fn allows_matching_patient_id() {
		let authorizer = Authorizer::new("tenant-a", Some(patient_with_identifier("pat-1", "m1")));
		assert!(authorizer.ensure_query_allowed(&restrictions("tenant-a")).is_ok());
	}

	#[test]
	fn rejects_cross_tenant_even_with_matching_patient() {
		let authorizer = Authorizer::new("tenant-a", Some(patient_with_identifier("pat-1", "m1")));
		assert!(matches!(
			authorizer.ensure_query_allowed(&restrictions("tenant-b")),
			Err(AuthorizationError::NotAllowed)
		));
	}

	#[test]
	fn rejects_other_patient() {
		let authorizer = Authorizer::new("tenant-a", Some(patient_with_identifier("pat-2", "m2")));
		assert!(authorizer.ensure_query_allowed(&restrictions("tenant-a")).is_err());
	}

	#[test]
	fn allows_matching_identifier_value() {
		let authorizer = Authorizer::new("tenant-a", Some(patient_with_identifier("pat-1", "m1")));
		let query = QueryRestrictions {
			tenant_key: String::from("tenant-a"),
			by_patient_id: None,
			by_patient_identifier: Some(Identifier {
				system: None,
				value: String::from("m1"),
				type_: None,
			}),
		};
		assert!(authorizer.ensure_query_allowed(&query).is_ok());
	}

	#[test]
	fn deny_all_rejects_everything() {
		let authorizer = Authorizer::deny_all("tenant-a");
		assert!(authorizer.ensure_query_allowed(&restrictions("tenant-a")).is_err());
	}

	#[test]
	fn resolve_patient_requires_bound_patient() {
		let authorizer = Authorizer::new("tenant-a", Some(patient_with_identifier("pat-1", "m1")));
		assert!(authorizer.resolve_patient("pat-1").is_ok());
		assert!(authorizer.resolve_patient("pat-9").is_err());
	}

	#[test]
	fn unverified_patient_claim_reads_payload() {
		let payload = URL_SAFE_NO_PAD.encode(r#"{"patient":"pat-7"}"#);
		let token = format!("h.{payload}.s");
		assert_eq!(unverified_patient_claim(&token), Some(String::from("pat-7")));
		assert_eq!(unverified_patient_claim("garbage"), None);
	}
}

//! HTTP surface of the gateway.
//!
//! All routes are tenant-scoped: `/{tenant}/fhir/...` for metadata lookup and
//! `/{tenant}/wado/...` for capability-token-gated retrieval. The tenant is
//! resolved once per request through the [`Tenant`] extractor, which also runs
//! token introspection and builds the backend provider.

use axum::extract::{FromRef, FromRequestParts, Path};
use axum::http::header;
use axum::http::request::Parts;
use axum::Router;
use serde::Deserialize;

use crate::auth::Authorizer;
use crate::config::TenantConfig;
use crate::error::GatewayError;
use crate::provider::{self, DicomProvider};
use crate::AppState;

pub mod fhir;
pub mod wado;

pub fn routes() -> Router<AppState> {
	Router::new()
		.nest("/{tenant}/fhir", fhir::routes())
		.nest("/{tenant}/wado", wado::routes())
}

/// Per-request tenant context: resolved configuration, the caller's
/// authorization and the backend provider.
pub struct Tenant {
	pub key: String,
	pub config: TenantConfig,
	pub authorizer: Authorizer,
	pub provider: Box<dyn DicomProvider>,
	/// Absolute base for retrieval URLs minted for this tenant.
	pub wado_base: String,
}

impl<S> FromRequestParts<S> for Tenant
where
	AppState: FromRef<S>,
	S: Send + Sync,
{
	type Rejection = GatewayError;

	async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
		#[derive(Deserialize)]
		struct TenantPath {
			tenant: String,
		}

		let Path(TenantPath { tenant }) = Path::from_request_parts(parts, state)
			.await
			.map_err(|_| GatewayError::Configuration(String::from("cannot resolve tenant")))?;

		let state = AppState::from_ref(state);
		let config = state
			.config
			.tenants
			.get(&tenant)
			.cloned()
			.ok_or_else(|| GatewayError::Configuration(format!("unknown tenant {tenant}")))?;

		let bearer = parts
			.headers
			.get(header::AUTHORIZATION)
			.and_then(|value| value.to_str().ok())
			.and_then(|value| value.strip_prefix("Bearer "));

		let introspector = state
			.introspectors
			.get(&tenant)
			.ok_or_else(|| GatewayError::Configuration(format!("unknown tenant {tenant}")))?;
		let authorizer = introspector.authorize(&tenant, bearer).await;

		let provider = provider::create(&config.dicom, &state.downloads);
		let wado_base = format!(
			"{}/{tenant}/wado",
			state.config.http.public_base_url.as_str().trim_end_matches('/')
		);

		Ok(Self {
			key: tenant,
			config,
			authorizer,
			provider,
			wado_base,
		})
	}
}

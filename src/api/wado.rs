//! Capability-token-gated retrieval: validates the token against the path,
//! re-checks the caller's authorization, then streams the backend's bytes.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{self, HeaderName};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::instrument;

use crate::api::Tenant;
use crate::error::GatewayError;
use crate::provider::Activity;
use crate::AppState;

pub fn routes() -> Router<AppState> {
	Router::new().route("/{token}/studies/{*suffix}", get(retrieve))
}

/// The study UID is always the first segment below `studies/`.
fn study_uid_of(suffix: &str) -> &str {
	suffix.split('/').next().unwrap_or(suffix)
}

#[instrument(skip_all, fields(tenant = %tenant.key))]
async fn retrieve(
	tenant: Tenant,
	State(state): State<AppState>,
	Path((_tenant, token, suffix)): Path<(String, String, String)>,
	headers: HeaderMap,
) -> Result<Response, GatewayError> {
	let restrictions = state.tokens.redeem(&token, study_uid_of(&suffix))?;
	// The token proves it was not forged; this proves the current caller is
	// still entitled to the restriction it carries.
	tenant.authorizer.ensure_query_allowed(&restrictions)?;

	if let Some(seconds_remaining) = tenant.provider.delayed(Activity::Retrieve) {
		return Err(GatewayError::NotYetAvailable { seconds_remaining });
	}

	let accept = headers
		.get(header::ACCEPT)
		.and_then(|value| value.to_str().ok());
	let result = tenant.provider.evaluate_wado(&suffix, accept).await?;

	let mut response = Response::builder().status(StatusCode::OK);
	for (name, value) in &result.headers {
		if let (Ok(name), Ok(value)) = (
			name.parse::<HeaderName>(),
			HeaderValue::from_str(value),
		) {
			response = response.header(name, value);
		}
	}

	response
		.body(Body::from_stream(result.body))
		.map_err(|err| GatewayError::Upstream { source: err.into() })
		.map(IntoResponse::into_response)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn study_uid_is_the_first_path_segment() {
		assert_eq!(study_uid_of("1.2.3"), "1.2.3");
		assert_eq!(study_uid_of("1.2.3/series/4.5.6"), "1.2.3");
		assert_eq!(study_uid_of(""), "");
	}
}

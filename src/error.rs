use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::warn;

/// Top-level error taxonomy of the gateway.
///
/// Every failure a request can hit maps onto exactly one of these variants,
/// and the HTTP mapping lives in the single [`IntoResponse`] impl below.
/// None of these are retried by the gateway itself.
#[derive(Debug, Error)]
pub enum GatewayError {
	#[error(transparent)]
	Authorization(#[from] AuthorizationError),

	/// The archive or DICOMweb origin failed; for DIMSE this is also fanned
	/// out to every attached consumer of the affected study.
	#[error("upstream imaging backend unavailable: {source}")]
	Upstream {
		#[from]
		source: anyhow::Error,
	},

	/// Artificial delay window for test/demo tenants is still open.
	#[error("not yet available, retry in {seconds_remaining}s")]
	NotYetAvailable { seconds_remaining: u64 },

	#[error("configuration error: {0}")]
	Configuration(String),
}

/// Authorization failures. The variant is logged server-side; the HTTP
/// response never reveals which check failed.
#[derive(Debug, Error)]
pub enum AuthorizationError {
	#[error("failed to validate capability token")]
	InvalidToken,
	#[error("study uid mismatch: token bound to {bound}, path names {requested}")]
	StudyMismatch { bound: String, requested: String },
	#[error("query restrictions not allowed for this authorization")]
	NotAllowed,
	#[error("access token is not active")]
	InactiveToken,
	#[error("access token lacks an imaging scope")]
	MissingScope,
	#[error("no patient authorized in this context")]
	NoPatient,
}

impl IntoResponse for GatewayError {
	fn into_response(self) -> Response {
		match self {
			Self::Authorization(err) => {
				warn!("authorization rejected: {err}");
				(StatusCode::FORBIDDEN, "Not authorized").into_response()
			}
			Self::Upstream { source } => {
				warn!("upstream failure: {source:#}");
				(StatusCode::BAD_GATEWAY, "Imaging backend unavailable").into_response()
			}
			Self::NotYetAvailable { seconds_remaining } => (
				StatusCode::SERVICE_UNAVAILABLE,
				[(header::RETRY_AFTER, seconds_remaining.to_string())],
			)
				.into_response(),
			Self::Configuration(message) => {
				warn!("configuration error: {message}");
				(StatusCode::INTERNAL_SERVER_ERROR, "Misconfigured tenant").into_response()
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn authorization_maps_to_generic_403() {
		let response = GatewayError::from(AuthorizationError::StudyMismatch {
			bound: String::from("1.2.3"),
			requested: String::from("4.5.6"),
		})
		.into_response();
		assert_eq!(response.status(), StatusCode::FORBIDDEN);
	}

	#[test]
	fn delay_maps_to_503_with_retry_after() {
		let response = GatewayError::NotYetAvailable {
			seconds_remaining: 42,
		}
		.into_response();
		assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
		assert_eq!(response.headers()[header::RETRY_AFTER], "42");
	}
}

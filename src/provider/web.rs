//! Stateless HTTP passthrough to a DICOMweb QIDO/WADO origin.

use anyhow::anyhow;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use std::collections::BTreeMap;
use tracing::{debug, instrument};

use crate::config::{DelayConfig, DicomConfig, UpstreamAuth, WebBackendConfig};
use crate::error::GatewayError;
use crate::provider::{DicomProvider, DicomWebResult};
use crate::types::{tags, DetailLevel, QidoRecord, SeriesEnriched, StudyEnriched};

/// Accept header used when the caller did not request a specific rendition.
const DEFAULT_ACCEPT: &str = "multipart/related; type=application/dicom; transfer-syntax=*";

/// Studies are immutable once available, so responses are safe to cache
/// per requester.
const CACHE_CONTROL: &str = "private, max-age=3600";

pub struct WebDicomProvider {
	backend: WebBackendConfig,
	config: DicomConfig,
	http: reqwest::Client,
}

impl WebDicomProvider {
	pub fn new(backend: WebBackendConfig, config: DicomConfig) -> Self {
		Self {
			backend,
			config,
			http: reqwest::Client::new(),
		}
	}

	fn endpoint(&self, suffix: &str) -> String {
		format!(
			"{}/{suffix}",
			self.backend.endpoint.as_str().trim_end_matches('/')
		)
	}

	fn with_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		match &self.backend.authentication {
			UpstreamAuth::Open => request,
			UpstreamAuth::HttpBasic { username, password } => {
				request.basic_auth(username, Some(password))
			}
		}
	}

	/// One upstream QIDO query, shared by the study search and the
	/// enrichment fan-out. Upstreams answer 204 with an empty body for zero
	/// matches, which parses as an empty list here.
	async fn qido(&self, suffix: &str, query: &[(&str, &str)]) -> Result<Vec<QidoRecord>, GatewayError> {
		let response = self
			.with_auth(self.http.get(self.endpoint(suffix)).query(query))
			.send()
			.await
			.map_err(|err| GatewayError::Upstream { source: err.into() })?;

		if response.status() == reqwest::StatusCode::NO_CONTENT {
			return Ok(Vec::new());
		}
		if !response.status().is_success() {
			return Err(GatewayError::Upstream {
				source: anyhow!("QIDO upstream answered {}", response.status()),
			});
		}

		response
			.json()
			.await
			.map_err(|err| GatewayError::Upstream { source: err.into() })
	}
}

#[async_trait]
impl DicomProvider for WebDicomProvider {
	#[instrument(skip_all)]
	async fn evaluate_qido(
		&self,
		query: &BTreeMap<String, String>,
	) -> Result<Vec<QidoRecord>, GatewayError> {
		let mut params: Vec<(&str, &str)> = query
			.iter()
			.map(|(key, value)| (key.as_str(), value.as_str()))
			.collect();
		params.push(("includefield", "StudyDescription"));

		let studies = self.qido("studies", &params).await?;
		debug!("QIDO upstream returned {} studies", studies.len());
		Ok(studies)
	}

	#[instrument(skip_all, fields(path))]
	async fn evaluate_wado(
		&self,
		path: &str,
		accept: Option<&str>,
	) -> Result<DicomWebResult, GatewayError> {
		let response = self
			.with_auth(self.http.get(self.endpoint(&format!("studies/{path}"))))
			.header(
				reqwest::header::ACCEPT,
				accept.unwrap_or(DEFAULT_ACCEPT),
			)
			.send()
			.await
			.map_err(|err| GatewayError::Upstream { source: err.into() })?;

		if !response.status().is_success() {
			return Err(GatewayError::Upstream {
				source: anyhow!("WADO upstream answered {}", response.status()),
			});
		}

		// Only content negotiation headers survive the proxy hop.
		let mut headers = vec![(String::from("cache-control"), String::from(CACHE_CONTROL))];
		for name in ["content-type", "content-length"] {
			if let Some(value) = response
				.headers()
				.get(name)
				.and_then(|value| value.to_str().ok())
			{
				headers.push((name.to_owned(), value.to_owned()));
			}
		}

		Ok(DicomWebResult {
			headers,
			body: response.bytes_stream().map_err(anyhow::Error::from).boxed(),
		})
	}

	async fn enrich_studies(
		&self,
		studies: Vec<QidoRecord>,
		level: DetailLevel,
	) -> Result<Vec<StudyEnriched>, GatewayError> {
		let mut enriched = Vec::with_capacity(studies.len());
		for study in studies {
			let mut series = Vec::new();
			if level != DetailLevel::Study {
				if let Some(study_uid) = study.str_value(tags::STUDY_UID) {
					for series_record in
						self.qido(&format!("studies/{study_uid}/series"), &[]).await?
					{
						let instances = if level == DetailLevel::Instance {
							let series_uid = series_record
								.str_value(tags::SERIES_UID)
								.unwrap_or_default()
								.to_owned();
							Some(
								self.qido(
									&format!("studies/{study_uid}/series/{series_uid}/instances"),
									&[],
								)
								.await?,
							)
						} else {
							None
						};
						series.push(SeriesEnriched {
							series: series_record,
							instances,
						});
					}
				}
			}
			enriched.push(StudyEnriched { study, series });
		}
		Ok(enriched)
	}

	fn delay_config(&self) -> Option<&DelayConfig> {
		self.config.delay.as_ref()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{BackendConfig, LookupMode};
	use crate::provider::Activity;
	use std::time::{SystemTime, UNIX_EPOCH};

	fn provider(delay: Option<DelayConfig>) -> WebDicomProvider {
		let backend = WebBackendConfig {
			endpoint: "https://pacs.example.org/dicom-web".parse().unwrap(),
			authentication: UpstreamAuth::Open,
		};
		WebDicomProvider::new(
			backend.clone(),
			DicomConfig {
				backend: BackendConfig::Web(backend),
				lookup: LookupMode::StudiesByMrn,
				delay,
				mrn_type_code: String::from("MR"),
			},
		)
	}

	#[test]
	fn endpoint_joins_without_double_slash() {
		let provider = provider(None);
		assert_eq!(
			provider.endpoint("studies/1.2.3"),
			"https://pacs.example.org/dicom-web/studies/1.2.3"
		);
	}

	#[test]
	fn delay_window_reports_remaining_seconds() {
		let now = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap()
			.as_secs_f64();

		let delayed = provider(Some(DelayConfig {
			lookup_until: Some(now + 30.0),
			retrieve_until: None,
		}));
		let remaining = delayed.delayed(Activity::Lookup).unwrap();
		assert!(remaining >= 29 && remaining <= 31);
		assert_eq!(delayed.delayed(Activity::Retrieve), None);

		let expired = provider(Some(DelayConfig {
			lookup_until: Some(now - 10.0),
			retrieve_until: None,
		}));
		assert_eq!(expired.delayed(Activity::Lookup), None);

		assert_eq!(provider(None).delayed(Activity::Lookup), None);
	}
}

//! The query/retrieve contract shared by all imaging backends, plus the
//! factory that selects a backend from the tenant's configuration.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{BackendConfig, DelayConfig, DicomConfig};
use crate::error::GatewayError;
use crate::types::{DetailLevel, QidoRecord, SeriesEnriched, StudyEnriched};

pub mod dimse;
pub mod web;

/// A retrieved binary response: passthrough headers plus a lazily produced
/// byte stream. The body is never fully buffered in memory.
pub struct DicomWebResult {
	pub headers: Vec<(String, String)>,
	pub body: BoxStream<'static, Result<Bytes, anyhow::Error>>,
}

/// The activity a delay window applies to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Activity {
	Lookup,
	Retrieve,
}

/// Abstract query/retrieve contract over heterogeneous imaging backends.
#[async_trait]
pub trait DicomProvider: Send + Sync {
	/// Executes the study-level find against the backend. Zero matches is an
	/// empty vec, never an error. Ordering is backend-defined.
	async fn evaluate_qido(
		&self,
		query: &BTreeMap<String, String>,
	) -> Result<Vec<QidoRecord>, GatewayError>;

	/// Retrieves binary study/series/instance data below `studies/`.
	async fn evaluate_wado(
		&self,
		path: &str,
		accept: Option<&str>,
	) -> Result<DicomWebResult, GatewayError>;

	/// Fans out additional series/instance queries per study at the requested
	/// detail level. [`DetailLevel::Study`] performs no further calls, which
	/// is all the base implementation supports.
	async fn enrich_studies(
		&self,
		studies: Vec<QidoRecord>,
		_level: DetailLevel,
	) -> Result<Vec<StudyEnriched>, GatewayError> {
		Ok(studies
			.into_iter()
			.map(|study| StudyEnriched {
				study,
				series: Vec::<SeriesEnriched>::new(),
			})
			.collect())
	}

	fn delay_config(&self) -> Option<&DelayConfig>;

	/// Remaining seconds of the tenant's artificial delay window, if one is
	/// open for `activity`. Callers answer 503 + `Retry-After` without
	/// invoking the underlying operation.
	fn delayed(&self, activity: Activity) -> Option<u64> {
		let delay = self.delay_config()?;
		let until = match activity {
			Activity::Lookup => delay.lookup_until,
			Activity::Retrieve => delay.retrieve_until,
		}?;

		let now = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map_or(0.0, |elapsed| elapsed.as_secs_f64());
		let remaining = until - now;
		if remaining > 0.0 {
			#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
			Some(remaining.ceil() as u64)
		} else {
			None
		}
	}
}

/// Builds the provider for a tenant from the tagged backend configuration.
pub fn create(
	config: &DicomConfig,
	downloads: &dimse::StudyDownloadManager,
) -> Box<dyn DicomProvider> {
	match &config.backend {
		BackendConfig::Web(web) => Box::new(web::WebDicomProvider::new(web.clone(), config.clone())),
		BackendConfig::Dimse(archive) => Box::new(dimse::DimseDicomProvider::new(
			archive.clone(),
			config.clone(),
			downloads.clone(),
		)),
	}
}

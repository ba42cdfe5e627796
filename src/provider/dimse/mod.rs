//! Query/retrieve against a classic DIMSE archive through external tooling.
//!
//! Lookups run `findscu` with dataset extraction and convert each match to
//! its QIDO-RS JSON shape. Retrieval triggers a study-level C-MOVE towards a
//! co-deployed store receiver and streams the landed files back as
//! `multipart/related`, sharing one move across concurrent requesters.

use anyhow::anyhow;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::config::{DelayConfig, DicomConfig, DimseBackendConfig};
use crate::error::GatewayError;
use crate::provider::{DicomProvider, DicomWebResult};
use crate::types::QidoRecord;

pub mod cli;
mod manager;
mod multipart;
mod study;

pub use manager::StudyDownloadManager;
pub use multipart::MultipartAssembler;
pub use study::{Study, StudyPhase};

pub struct DimseDicomProvider {
	archive: DimseBackendConfig,
	config: DicomConfig,
	downloads: StudyDownloadManager,
	cli: Arc<dyn cli::DicomCli>,
}

impl DimseDicomProvider {
	pub fn new(
		archive: DimseBackendConfig,
		config: DicomConfig,
		downloads: StudyDownloadManager,
	) -> Self {
		Self {
			archive,
			config,
			downloads,
			cli: Arc::new(cli::SystemDicomCli),
		}
	}

	#[cfg(test)]
	fn with_cli(mut self, cli: Arc<dyn cli::DicomCli>) -> Self {
		self.cli = cli;
		self
	}
}

#[async_trait]
impl DicomProvider for DimseDicomProvider {
	#[instrument(skip_all)]
	async fn evaluate_qido(
		&self,
		query: &BTreeMap<String, String>,
	) -> Result<Vec<QidoRecord>, GatewayError> {
		let keys: Vec<(String, String)> = query
			.iter()
			.map(|(key, value)| (key.clone(), value.clone()))
			.collect();

		// findscu extracts one dataset file per match into a scratch
		// directory, which is removed once the records are converted.
		let out_dir = std::env::temp_dir().join(format!("qido-{}", Uuid::new_v4().simple()));
		tokio::fs::create_dir_all(&out_dir)
			.await
			.map_err(|err| GatewayError::Upstream { source: err.into() })?;

		let found = self.cli.find(&self.archive, &keys, &out_dir).await;

		let mut records = Vec::new();
		if found.is_ok() {
			let mut entries = tokio::fs::read_dir(&out_dir)
				.await
				.map_err(|err| GatewayError::Upstream { source: err.into() })?;
			while let Some(entry) = entries
				.next_entry()
				.await
				.map_err(|err| GatewayError::Upstream { source: err.into() })?
			{
				match self.cli.dataset_to_json(&entry.path()).await {
					Ok(record) => records.push(record),
					// One unparseable match must not sink the whole search.
					Err(err) => warn!("skipping dataset {}: {err}", entry.path().display()),
				}
			}
		}

		let scratch = out_dir.clone();
		tokio::spawn(async move {
			let _ = tokio::fs::remove_dir_all(&scratch).await;
		});

		found.map_err(|err| GatewayError::Upstream { source: err.into() })?;
		Ok(records)
	}

	#[instrument(skip_all, fields(path))]
	async fn evaluate_wado(
		&self,
		path: &str,
		_accept: Option<&str>,
	) -> Result<DicomWebResult, GatewayError> {
		// C-MOVE is study-level; series and instance subsets are not
		// expressible against this backend.
		if path.contains('/') {
			return Err(GatewayError::Upstream {
				source: anyhow!("this archive only supports study-level retrieval"),
			});
		}

		let (study, guard) = self.downloads.request(&self.archive, path)?;
		let assembler = MultipartAssembler::new();
		let content_type = assembler.content_type();
		let body = multipart::study_stream(assembler, &study, guard)
			.map_err(anyhow::Error::from)
			.boxed();

		Ok(DicomWebResult {
			headers: vec![(String::from("content-type"), content_type)],
			body,
		})
	}

	fn delay_config(&self) -> Option<&DelayConfig> {
		self.config.delay.as_ref()
	}
}

#[cfg(test)]
mod tests {
	use super::cli::{CliError, DicomCli, MoveHandle};
	use super::*;
	use crate::config::{BackendConfig, DimseRuntimeConfig, LookupMode};
	use crate::types::tags;
	use std::path::Path;

	struct FindOnlyCli;

	#[async_trait]
	impl DicomCli for FindOnlyCli {
		async fn find(
			&self,
			_archive: &DimseBackendConfig,
			keys: &[(String, String)],
			out_dir: &Path,
		) -> Result<(), CliError> {
			assert!(keys.iter().any(|(key, _)| key == "PatientID"));
			std::fs::write(out_dir.join("rsp0001.dcm"), b"")?;
			std::fs::write(out_dir.join("rsp0002.dcm"), b"")?;
			Ok(())
		}

		async fn dataset_to_json(&self, file: &Path) -> Result<QidoRecord, CliError> {
			if file.ends_with("rsp0002.dcm") {
				return Err(CliError::BadDataset(String::from("truncated")));
			}
			let value = serde_json::json!({
				tags::STUDY_UID: { "vr": "UI", "Value": ["1.2.3"] },
			});
			Ok(serde_json::from_value(value).unwrap())
		}

		fn start_move(
			&self,
			_archive: &DimseBackendConfig,
			_study_uid: &str,
		) -> Result<Box<dyn MoveHandle>, CliError> {
			Err(CliError::Aborted)
		}
	}

	fn provider(root: &Path) -> DimseDicomProvider {
		let archive = DimseBackendConfig {
			host: String::from("pacs.internal"),
			port: 104,
			calling_aet: String::from("GATEWAY"),
			called_aet: String::from("ARCHIVE"),
			destination_aet: String::from("STORE"),
		};
		let downloads = StudyDownloadManager::new(
			&DimseRuntimeConfig {
				root: root.to_owned(),
				grace_period: 3600,
			},
			Arc::new(FindOnlyCli),
		);
		DimseDicomProvider::new(
			archive.clone(),
			DicomConfig {
				backend: BackendConfig::Dimse(archive),
				lookup: LookupMode::StudiesByMrn,
				delay: None,
				mrn_type_code: String::from("MR"),
			},
			downloads,
		)
		.with_cli(Arc::new(FindOnlyCli))
	}

	#[tokio::test]
	async fn qido_converts_extracted_datasets_and_skips_bad_ones() {
		let tmp = tempfile::tempdir().unwrap();
		let provider = provider(tmp.path());

		let mut query = BTreeMap::new();
		query.insert(String::from("PatientID"), String::from("4711"));
		let records = provider.evaluate_qido(&query).await.unwrap();

		assert_eq!(records.len(), 1);
		assert_eq!(records[0].str_value(tags::STUDY_UID), Some("1.2.3"));
	}

	#[tokio::test]
	async fn wado_rejects_sub_study_paths() {
		let tmp = tempfile::tempdir().unwrap();
		let provider = provider(tmp.path());

		assert!(provider
			.evaluate_wado("1.2.3/series/4.5.6", None)
			.await
			.is_err());
	}
}

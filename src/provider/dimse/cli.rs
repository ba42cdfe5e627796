//! External DICOM command-line tools behind a capability trait.
//!
//! DIMSE wire encoding is out of scope for the gateway; C-FIND and C-MOVE are
//! delegated to the DCMTK tools (`findscu`, `movescu`, `dcm2json`). Tests
//! substitute a fake that emits canned files and exit codes without spawning
//! real processes.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, instrument};

use crate::config::DimseBackendConfig;
use crate::types::QidoRecord;

#[derive(Debug, Error)]
pub enum CliError {
	#[error("failed to spawn {tool}: {source}")]
	Spawn {
		tool: &'static str,
		source: std::io::Error,
	},
	#[error("{tool} exited with status {status}")]
	Failed { tool: &'static str, status: i32 },
	#[error("move operation aborted")]
	Aborted,
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error("unparseable dataset: {0}")]
	BadDataset(String),
}

/// Handle on a running C-MOVE operation.
#[async_trait]
pub trait MoveHandle: Send {
	/// Waits for the operation to finish; non-zero exit is an error.
	async fn wait(&mut self) -> Result<(), CliError>;
	/// Aborts the operation if it is still running.
	fn abort(&mut self);
}

#[async_trait]
pub trait DicomCli: Send + Sync {
	/// Runs a study-level C-FIND, extracting each matching dataset as a file
	/// into `out_dir`.
	async fn find(
		&self,
		archive: &DimseBackendConfig,
		keys: &[(String, String)],
		out_dir: &Path,
	) -> Result<(), CliError>;

	/// Converts one extracted dataset file to its QIDO-RS JSON shape.
	async fn dataset_to_json(&self, file: &Path) -> Result<QidoRecord, CliError>;

	/// Triggers a C-MOVE of `study_uid` towards the configured destination
	/// AE. Files land in the study's download directory through the external
	/// store receiver; this call only drives the move itself.
	fn start_move(
		&self,
		archive: &DimseBackendConfig,
		study_uid: &str,
	) -> Result<Box<dyn MoveHandle>, CliError>;
}

/// Production implementation spawning the DCMTK tools as subprocesses.
pub struct SystemDicomCli;

/// Attributes requested for every study-level find.
const FIND_KEYS: &[&str] = &[
	"StudyInstanceUID",
	"PatientName",
	"PatientID",
	"StudyDate",
	"StudyTime",
	"ModalitiesInStudy",
	"StudyDescription",
	"NumberOfStudyRelatedSeries",
	"NumberOfStudyRelatedInstances",
];

#[async_trait]
impl DicomCli for SystemDicomCli {
	#[instrument(skip_all, fields(archive = %archive.called_aet))]
	async fn find(
		&self,
		archive: &DimseBackendConfig,
		keys: &[(String, String)],
		out_dir: &Path,
	) -> Result<(), CliError> {
		let mut command = Command::new("findscu");
		command
			.current_dir(out_dir)
			.arg("-S")
			.args(["-aet", &archive.calling_aet])
			.args(["-aec", &archive.called_aet])
			.args(["-k", "QueryRetrieveLevel=STUDY"])
			.arg("--extract");
		for key in FIND_KEYS {
			command.args(["-k", key]);
		}
		for (key, value) in keys {
			command.args(["-k", &format!("{key}={value}")]);
		}
		command.arg(&archive.host).arg(archive.port.to_string());
		command.stdout(Stdio::null()).stderr(Stdio::null());

		debug!("running findscu against {}:{}", archive.host, archive.port);
		let status = command
			.status()
			.await
			.map_err(|source| CliError::Spawn {
				tool: "findscu",
				source,
			})?;
		if !status.success() {
			return Err(CliError::Failed {
				tool: "findscu",
				status: status.code().unwrap_or(-1),
			});
		}
		Ok(())
	}

	async fn dataset_to_json(&self, file: &Path) -> Result<QidoRecord, CliError> {
		let output = Command::new("dcm2json")
			.arg(file)
			.stderr(Stdio::null())
			.output()
			.await
			.map_err(|source| CliError::Spawn {
				tool: "dcm2json",
				source,
			})?;
		if !output.status.success() {
			return Err(CliError::Failed {
				tool: "dcm2json",
				status: output.status.code().unwrap_or(-1),
			});
		}

		serde_json::from_slice(&output.stdout)
			.map_err(|err| CliError::BadDataset(err.to_string()))
	}

	fn start_move(
		&self,
		archive: &DimseBackendConfig,
		study_uid: &str,
	) -> Result<Box<dyn MoveHandle>, CliError> {
		let child = Command::new("movescu")
			.arg("-S")
			.args(["-aet", &archive.calling_aet])
			.args(["-aec", &archive.called_aet])
			.args(["-aem", &archive.destination_aet])
			.args(["-k", "QueryRetrieveLevel=STUDY"])
			.args(["-k", &format!("StudyInstanceUID={study_uid}")])
			.arg(&archive.host)
			.arg(archive.port.to_string())
			.stdout(Stdio::null())
			.stderr(Stdio::null())
			.kill_on_drop(true)
			.spawn()
			.map_err(|source| CliError::Spawn {
				tool: "movescu",
				source,
			})?;

		Ok(Box::new(MoveProcess { child }))
	}
}

struct MoveProcess {
	child: Child,
}

#[async_trait]
impl MoveHandle for MoveProcess {
	async fn wait(&mut self) -> Result<(), CliError> {
		let status = self.child.wait().await?;
		if status.success() {
			Ok(())
		} else {
			Err(CliError::Failed {
				tool: "movescu",
				status: status.code().unwrap_or(-1),
			})
		}
	}

	fn abort(&mut self) {
		// Best effort; the process may have exited already.
		let _ = self.child.start_kill();
	}
}

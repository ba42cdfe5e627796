//! Shared registry of in-flight study downloads.
//!
//! Concurrent retrievals of the same study share one C-MOVE: the first
//! request spawns the move driver, every further request attaches as an
//! additional reader. Completed studies linger on disk for a grace period
//! after the last reader detaches, so a follow-up request streams straight
//! from disk instead of re-triggering the move.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::select;
use tracing::{debug, info, instrument, warn};

use super::cli::DicomCli;
use super::study::{spawn_watcher, Study, StudyPhase, COMPLETE_MARKER};
use crate::config::{DimseBackendConfig, DimseRuntimeConfig};
use crate::error::GatewayError;

/// Cloneable handle; all clones share one registry.
#[derive(Clone)]
pub struct StudyDownloadManager {
	inner: Arc<Inner>,
}

struct Inner {
	studies: Mutex<HashMap<String, Arc<Study>>>,
	cli: Arc<dyn DicomCli>,
	root: PathBuf,
	grace_period: Duration,
}

impl StudyDownloadManager {
	pub fn new(config: &DimseRuntimeConfig, cli: Arc<dyn DicomCli>) -> Self {
		Self {
			inner: Arc::new(Inner {
				studies: Mutex::new(HashMap::new()),
				cli,
				root: config.root.clone(),
				grace_period: Duration::from_secs(config.grace_period),
			}),
		}
	}

	/// Attaches a reader to the study, starting the download if no other
	/// reader holds it. Exactly one C-MOVE is ever in flight per study UID.
	///
	/// The returned guard releases the reader slot on drop; the caller must
	/// keep it alive for as long as it consumes the study's files.
	#[instrument(skip_all, fields(study_uid))]
	pub fn request(
		&self,
		archive: &DimseBackendConfig,
		study_uid: &str,
	) -> Result<(Arc<Study>, ReaderGuard), GatewayError> {
		if !study_uid
			.chars()
			.all(|c| c.is_ascii_digit() || c == '.')
		{
			return Err(GatewayError::Upstream {
				source: anyhow::anyhow!("malformed study instance UID"),
			});
		}

		let download_dir = self.inner.root.join(study_uid);
		// Studies evicted from the registry but still on disk resume as
		// complete without a new move.
		let already_complete = download_dir.join(COMPLETE_MARKER).exists();

		let (study, spawned) = {
			let mut studies = self.registry();
			if let Some(existing) = studies.get(study_uid) {
				existing.add_reader();
				(Arc::clone(existing), false)
			} else {
				let study = Arc::new(Study::new(study_uid, download_dir.clone(), already_complete));
				studies.insert(study_uid.to_owned(), Arc::clone(&study));
				(study, !already_complete)
			}
		};

		if spawned {
			if let Err(err) = std::fs::create_dir_all(&download_dir) {
				self.registry().remove(study_uid);
				return Err(GatewayError::Upstream {
					source: anyhow::Error::from(err).context("creating study download directory"),
				});
			}
			self.spawn_move(archive, &study);
		}

		let guard = ReaderGuard {
			manager: self.clone(),
			study_uid: study_uid.to_owned(),
		};
		Ok((study, guard))
	}

	/// Drives the external move and the directory watcher for a fresh study.
	fn spawn_move(&self, archive: &DimseBackendConfig, study: &Arc<Study>) {
		info!(study_uid = %study.study_uid(), "starting C-MOVE");

		let watcher = match spawn_watcher(study) {
			Ok(watcher) => Some(watcher),
			Err(err) => {
				study.fail(&format!("watching download directory: {err}"));
				self.evict(study.study_uid());
				return;
			}
		};

		let mut handle = match self.inner.cli.start_move(archive, study.study_uid()) {
			Ok(handle) => handle,
			Err(err) => {
				study.fail(&err.to_string());
				self.evict(study.study_uid());
				return;
			}
		};

		let manager = self.clone();
		let study = Arc::clone(study);
		tokio::spawn(async move {
			let outcome = select! {
				result = handle.wait() => result,
				() = study.aborted() => {
					handle.abort();
					let _ = handle.wait().await;
					Err(super::cli::CliError::Aborted)
				}
			};

			match outcome {
				Ok(()) => {
					// The marker both completes live consumers (through the
					// watcher) and flags the directory for later requests.
					if let Err(err) =
						tokio::fs::write(study.download_dir().join(COMPLETE_MARKER), []).await
					{
						study.fail(&format!("writing completion marker: {err}"));
					} else {
						study.complete();
						info!(study_uid = %study.study_uid(), "C-MOVE complete");
					}
				}
				Err(err) => study.fail(&err.to_string()),
			}

			if let Some(watcher) = watcher {
				watcher.abort();
			}
			if study.is_failed() {
				manager.evict(study.study_uid());
			}
		});
	}

	/// Releases one reader slot. Called exactly once per successful
	/// [`request`](Self::request), through the guard's drop.
	fn finished(&self, study_uid: &str) {
		let Some(study) = self.registry().get(study_uid).cloned() else {
			return;
		};
		if study.remove_reader() > 0 {
			return;
		}

		match study.phase() {
			// Nobody is left to receive the files; stop the move and clean up
			// through the driver's failure path.
			StudyPhase::Moving => {
				debug!(study_uid, "last reader detached mid-move, aborting");
				study.request_abort();
			}
			StudyPhase::Failed(_) => self.evict(study_uid),
			StudyPhase::Complete => {
				let manager = self.clone();
				let uid = study_uid.to_owned();
				let grace_period = self.inner.grace_period;
				study.arm_eviction(tokio::spawn(async move {
					tokio::time::sleep(grace_period).await;
					manager.evict_if_idle(&uid);
				}));
			}
		}
	}

	/// Unregisters the study and deletes its files.
	fn evict(&self, study_uid: &str) {
		let removed = self.registry().remove(study_uid);
		Self::delete_files(removed);
	}

	/// Grace timer body: a reader may have re-attached since arming, so the
	/// re-check and the removal happen under one registry guard. Otherwise a
	/// reader attaching between the two would have its files deleted from
	/// under it.
	fn evict_if_idle(&self, study_uid: &str) {
		let removed = {
			let mut studies = self.registry();
			if studies
				.get(study_uid)
				.is_some_and(|study| study.readers() == 0)
			{
				studies.remove(study_uid)
			} else {
				None
			}
		};
		Self::delete_files(removed);
	}

	fn delete_files(removed: Option<Arc<Study>>) {
		if let Some(study) = removed {
			debug!(study_uid = %study.study_uid(), "evicting study");
			let dir = study.download_dir().to_owned();
			tokio::spawn(async move {
				if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
					warn!("failed to remove {}: {err}", dir.display());
				}
			});
		}
	}

	fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Study>>> {
		self.inner.studies.lock().expect("study registry poisoned")
	}

	#[cfg(test)]
	pub(super) fn registered(&self, study_uid: &str) -> Option<Arc<Study>> {
		self.registry().get(study_uid).cloned()
	}
}

/// Holds one reader slot on a study; dropping it releases the slot.
pub struct ReaderGuard {
	manager: StudyDownloadManager,
	study_uid: String,
}

impl Drop for ReaderGuard {
	fn drop(&mut self) {
		self.manager.finished(&self.study_uid);
	}
}

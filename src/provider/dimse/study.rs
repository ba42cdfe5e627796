//! Per-study download state machine.
//!
//! A C-MOVE is a push protocol: the archive C-STOREs files to a listening
//! peer while the move subprocess runs. A `Study` turns that into a
//! multi-consumer sequence of "file ready" events. Each consumer gets its own
//! subscriber channel and its own dedup set, so late joiners replay
//! everything already on disk before picking up new arrivals, and no two
//! consumers interfere with each other.

use futures::Stream;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::cli::CliError;

/// Marker file signalling that every instance of the study has landed.
pub const COMPLETE_MARKER: &str = "study.complete";

/// Completed instances carry this extension; anything else in the download
/// directory is still in flight.
const DATASET_EXTENSION: &str = "dcm";

#[derive(Debug, Error)]
pub enum DownloadError {
	#[error("C-MOVE failed: {0}")]
	MoveFailed(String),
	#[error(transparent)]
	Cli(#[from] CliError),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub enum StudyEvent {
	FileReady(PathBuf),
	Complete,
	Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StudyPhase {
	Moving,
	Complete,
	Failed(String),
}

struct StudyState {
	phase: StudyPhase,
	readers: usize,
	subscribers: Vec<mpsc::UnboundedSender<StudyEvent>>,
	/// Pending grace-period eviction task, armed when the reader count
	/// reaches zero and cancelled when a new reader attaches.
	eviction: Option<JoinHandle<()>>,
}

/// One in-flight or recently completed study download.
///
/// Constructed exclusively by the
/// [`StudyDownloadManager`](super::manager::StudyDownloadManager); all
/// mutation happens under one mutex with no await point while held.
pub struct Study {
	study_uid: String,
	download_dir: PathBuf,
	state: Mutex<StudyState>,
	/// Signals the move driver to abort the subprocess.
	abort_move: Notify,
}

impl Study {
	pub(super) fn new(study_uid: &str, download_dir: PathBuf, already_complete: bool) -> Self {
		Self {
			study_uid: study_uid.to_owned(),
			download_dir,
			state: Mutex::new(StudyState {
				phase: if already_complete {
					StudyPhase::Complete
				} else {
					StudyPhase::Moving
				},
				readers: 1,
				subscribers: Vec::new(),
				eviction: None,
			}),
			abort_move: Notify::new(),
		}
	}

	pub fn study_uid(&self) -> &str {
		&self.study_uid
	}

	pub fn download_dir(&self) -> &Path {
		&self.download_dir
	}

	pub fn phase(&self) -> StudyPhase {
		self.lock().phase.clone()
	}

	pub fn is_failed(&self) -> bool {
		matches!(self.lock().phase, StudyPhase::Failed(_))
	}

	pub fn readers(&self) -> usize {
		self.lock().readers
	}

	#[cfg(test)]
	pub(super) fn has_pending_eviction(&self) -> bool {
		self.lock().eviction.is_some()
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, StudyState> {
		self.state.lock().expect("study state poisoned")
	}

	pub(super) fn add_reader(&self) {
		let mut state = self.lock();
		state.readers += 1;
		if let Some(eviction) = state.eviction.take() {
			// A new reader arrived before the grace timer fired.
			eviction.abort();
		}
	}

	/// Decrements the reader count; returns the remaining count.
	pub(super) fn remove_reader(&self) -> usize {
		let mut state = self.lock();
		state.readers = state.readers.saturating_sub(1);
		state.readers
	}

	pub(super) fn arm_eviction(&self, task: JoinHandle<()>) {
		let mut state = self.lock();
		// A previous timer may have fired without evicting (a reader had
		// re-attached by then); its spent handle must not block this one.
		if let Some(stale) = state.eviction.replace(task) {
			stale.abort();
		}
	}

	pub(super) fn request_abort(&self) {
		self.abort_move.notify_one();
	}

	pub(super) async fn aborted(&self) {
		self.abort_move.notified().await;
	}

	/// A completed instance landed on disk.
	pub(super) fn file_ready(&self, path: PathBuf) {
		let mut state = self.lock();
		if state.phase == StudyPhase::Moving {
			debug!(study_uid = %self.study_uid, file = %path.display(), "file ready");
			broadcast(&mut state, &StudyEvent::FileReady(path));
		}
	}

	/// The terminal marker landed: every file of the study is on disk.
	pub(super) fn complete(&self) {
		let mut state = self.lock();
		if state.phase == StudyPhase::Moving {
			state.phase = StudyPhase::Complete;
			broadcast(&mut state, &StudyEvent::Complete);
			state.subscribers.clear();
		}
	}

	/// The move failed; every attached consumer observes the same error.
	pub(super) fn fail(&self, message: &str) {
		let mut state = self.lock();
		if state.phase == StudyPhase::Moving {
			warn!(study_uid = %self.study_uid, "move failed: {message}");
			state.phase = StudyPhase::Failed(message.to_owned());
			broadcast(&mut state, &StudyEvent::Failed(message.to_owned()));
			state.subscribers.clear();
		}
	}

	/// Registers a subscriber channel and snapshots the phase atomically, so
	/// no event can fall between the snapshot and the subscription.
	fn subscribe(&self) -> (mpsc::UnboundedReceiver<StudyEvent>, StudyPhase) {
		let (tx, rx) = mpsc::unbounded_channel();
		let mut state = self.lock();
		let phase = state.phase.clone();
		if phase == StudyPhase::Moving {
			state.subscribers.push(tx);
		}
		(rx, phase)
	}

	/// The lazy per-consumer sequence of completed file paths.
	///
	/// Replays every file already on disk (deduplicated per consumer), then
	/// follows live events until the study completes or fails, and finally
	/// sweeps the directory once more to close the race between the last
	/// event and the phase transition. Forward-only: a path is yielded at
	/// most once per consumer.
	pub fn files(
		self: Arc<Self>,
	) -> impl Stream<Item = Result<PathBuf, DownloadError>> + Send + 'static {
		let study = self;
		async_stream::try_stream! {
			let (mut events, phase) = study.subscribe();
			let mut seen: HashSet<PathBuf> = HashSet::new();

			for path in sweep(study.download_dir()).await? {
				if seen.insert(path.clone()) {
					yield path;
				}
			}

			match phase {
				StudyPhase::Failed(message) => {
					// Late joiners observe the same failure as everyone else.
					Err(DownloadError::MoveFailed(message))?;
				}
				StudyPhase::Complete => {}
				StudyPhase::Moving => {
					while let Some(event) = events.recv().await {
						match event {
							StudyEvent::FileReady(path) => {
								if seen.insert(path.clone()) {
									yield path;
								}
							}
							StudyEvent::Complete => break,
							StudyEvent::Failed(message) => {
								Err(DownloadError::MoveFailed(message))?;
							}
						}
					}
					// Channel closed without a terminal event; re-check.
					if let StudyPhase::Failed(message) = study.phase() {
						Err(DownloadError::MoveFailed(message))?;
					}
				}
			}

			for path in sweep(study.download_dir()).await? {
				if seen.insert(path.clone()) {
					yield path;
				}
			}
		}
	}
}

fn broadcast(state: &mut StudyState, event: &StudyEvent) {
	// Consumers that went away are dropped from the subscriber list here.
	state
		.subscribers
		.retain(|subscriber| subscriber.send(event.clone()).is_ok());
}

/// Completed dataset files currently on disk, in landing order.
async fn sweep(dir: &Path) -> Result<Vec<PathBuf>, DownloadError> {
	let mut entries = match tokio::fs::read_dir(dir).await {
		Ok(entries) => entries,
		// The directory may already be evicted; treat as empty.
		Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
		Err(err) => return Err(err.into()),
	};

	let mut files = Vec::new();
	while let Some(entry) = entries.next_entry().await? {
		let path = entry.path();
		if path.extension().is_some_and(|ext| ext == DATASET_EXTENSION) {
			let modified = entry
				.metadata()
				.await
				.ok()
				.and_then(|metadata| metadata.modified().ok());
			files.push((modified, path));
		}
	}
	files.sort();
	Ok(files.into_iter().map(|(_, path)| path).collect())
}

/// Watches the download directory and feeds filesystem activity back into the
/// study: completed datasets become `FileReady` events, the terminal marker
/// completes the study.
pub(super) fn spawn_watcher(study: &Arc<Study>) -> notify::Result<JoinHandle<()>> {
	use notify::Watcher;

	let (tx, mut rx) = mpsc::unbounded_channel::<notify::Event>();
	let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
		if let Ok(event) = event {
			let _ = tx.send(event);
		}
	})?;
	watcher.watch(study.download_dir(), notify::RecursiveMode::NonRecursive)?;

	let study = Arc::clone(study);
	Ok(tokio::spawn(async move {
		// Keeps the watcher alive for as long as the study is moving.
		let _watcher = watcher;
		while let Some(event) = rx.recv().await {
			if !matches!(
				event.kind,
				notify::EventKind::Create(_) | notify::EventKind::Modify(_)
			) {
				continue;
			}
			for path in event.paths {
				if path.file_name().is_some_and(|name| name == COMPLETE_MARKER) {
					study.complete();
					return;
				}
				if path
					.extension()
					.is_some_and(|ext| ext == DATASET_EXTENSION)
				{
					study.file_ready(path);
				}
			}
			if !matches!(study.phase(), StudyPhase::Moving) {
				return;
			}
		}
	}))
}

#[cfg(test)]
mod tests {
	use super::*;
	use futures::{StreamExt, TryStreamExt};
	use std::time::Duration;

	fn write_dataset(dir: &Path, name: &str) -> PathBuf {
		let path = dir.join(name);
		std::fs::write(&path, name.as_bytes()).unwrap();
		path
	}

	#[tokio::test]
	async fn completed_study_replays_files_in_landing_order() {
		let tmp = tempfile::tempdir().unwrap();
		for name in ["a.dcm", "b.dcm", "c.dcm"] {
			write_dataset(tmp.path(), name);
			// Distinct mtimes pin the landing order.
			std::thread::sleep(Duration::from_millis(5));
		}
		std::fs::write(tmp.path().join("partial.tmp"), b"ignored").unwrap();

		let study = Arc::new(Study::new("1.2.3", tmp.path().to_owned(), true));
		let files: Vec<_> = study.files().try_collect().await.unwrap();

		let names: Vec<_> = files
			.iter()
			.map(|path| path.file_name().unwrap().to_str().unwrap())
			.collect();
		assert_eq!(names, ["a.dcm", "b.dcm", "c.dcm"]);
	}

	#[tokio::test]
	async fn live_events_reach_attached_consumer_without_duplicates() {
		let tmp = tempfile::tempdir().unwrap();
		let early = write_dataset(tmp.path(), "a.dcm");

		let study = Arc::new(Study::new("1.2.3", tmp.path().to_owned(), false));
		let consumer = {
			let study = Arc::clone(&study);
			tokio::spawn(async move { study.files().try_collect::<Vec<_>>().await })
		};
		// Let the consumer replay the early file and subscribe.
		tokio::time::sleep(Duration::from_millis(50)).await;

		// Redelivery of an already replayed path is deduplicated.
		study.file_ready(early);
		let late = write_dataset(tmp.path(), "b.dcm");
		study.file_ready(late);
		study.complete();

		let files = consumer.await.unwrap().unwrap();
		let names: Vec<_> = files
			.iter()
			.map(|path| path.file_name().unwrap().to_str().unwrap())
			.collect();
		assert_eq!(names, ["a.dcm", "b.dcm"]);
	}

	#[tokio::test]
	async fn failure_reaches_attached_and_late_consumers() {
		let tmp = tempfile::tempdir().unwrap();
		let study = Arc::new(Study::new("1.2.3", tmp.path().to_owned(), false));

		let attached = {
			let study = Arc::clone(&study);
			tokio::spawn(async move { study.files().try_collect::<Vec<_>>().await })
		};
		tokio::time::sleep(Duration::from_millis(50)).await;
		study.fail("move refused");

		let err = attached.await.unwrap().unwrap_err();
		assert!(matches!(err, DownloadError::MoveFailed(message) if message == "move refused"));

		// Attaching after the failure observes the same error.
		let late = study.files();
		futures::pin_mut!(late);
		assert!(matches!(
			late.next().await,
			Some(Err(DownloadError::MoveFailed(_)))
		));
	}

	#[tokio::test]
	async fn final_sweep_catches_files_landing_with_the_marker() {
		let tmp = tempfile::tempdir().unwrap();
		let study = Arc::new(Study::new("1.2.3", tmp.path().to_owned(), false));

		let consumer = {
			let study = Arc::clone(&study);
			tokio::spawn(async move { study.files().try_collect::<Vec<_>>().await })
		};
		tokio::time::sleep(Duration::from_millis(50)).await;

		// The file lands without an event, only the terminal marker fires.
		write_dataset(tmp.path(), "a.dcm");
		study.complete();

		let files = consumer.await.unwrap().unwrap();
		assert_eq!(files.len(), 1);
	}
}

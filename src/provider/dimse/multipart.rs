//! Incremental `multipart/related` framing for retrieved datasets.
//!
//! Parts are emitted as soon as their file is complete on disk, so the
//! response starts flowing while the C-MOVE is still running.

use bytes::Bytes;
use futures::Stream;
use std::sync::Arc;
use uuid::Uuid;

use super::manager::ReaderGuard;
use super::study::{DownloadError, Study};

/// Frames opaque payloads into `multipart/related` parts with a fixed
/// per-response boundary.
pub struct MultipartAssembler {
	boundary: String,
}

impl MultipartAssembler {
	pub fn new() -> Self {
		Self {
			boundary: Uuid::new_v4().simple().to_string(),
		}
	}

	pub fn boundary(&self) -> &str {
		&self.boundary
	}

	pub fn content_type(&self) -> String {
		format!(
			"multipart/related; type=\"application/dicom\"; boundary={}",
			self.boundary
		)
	}

	/// One complete part: delimiter, part headers, payload, trailing CRLF.
	pub fn part(&self, payload: &[u8]) -> Bytes {
		let header = format!(
			"--{}\r\nContent-Type: application/dicom\r\nMIME-Version: 1.0\r\n\r\n",
			self.boundary
		);
		let mut part = Vec::with_capacity(header.len() + payload.len() + 2);
		part.extend_from_slice(header.as_bytes());
		part.extend_from_slice(payload);
		part.extend_from_slice(b"\r\n");
		Bytes::from(part)
	}

	/// The closing delimiter ending the multipart body.
	pub fn finish(&self) -> Bytes {
		Bytes::from(format!("--{}--\r\n", self.boundary))
	}
}

impl Default for MultipartAssembler {
	fn default() -> Self {
		Self::new()
	}
}

/// Streams the study's datasets as multipart parts.
///
/// The reader guard travels inside the stream, so the reader slot is released
/// exactly when the response body is dropped, whether it ran to completion or
/// the client went away mid-transfer.
pub fn study_stream(
	assembler: MultipartAssembler,
	study: &Arc<Study>,
	guard: ReaderGuard,
) -> impl Stream<Item = Result<Bytes, DownloadError>> + Send + 'static {
	let files = Arc::clone(study).files();
	async_stream::try_stream! {
		let _guard = guard;
		futures::pin_mut!(files);
		while let Some(path) = futures::TryStreamExt::try_next(&mut files).await? {
			let payload = tokio::fs::read(&path).await?;
			yield assembler.part(&payload);
		}
		yield assembler.finish();
	}
}

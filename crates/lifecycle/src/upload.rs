use std::{
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::Stream;
use shared::{
    domain::{Video, VideoMetadata},
    error::ApiError,
};
use storage::{ProgressSink, Storage, TransferBackend};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{internal, store_error, ApiContext};

pub const MAX_FILENAME_BYTES: usize = 180;

const DEFAULT_MAX_UPLOAD_BYTES: u64 = 512 * 1024 * 1024;
const DEFAULT_ACCEPTED_FORMATS: [&str; 5] = ["mp4", "mov", "avi", "mkv", "webm"];

/// Limits checked before any byte is transferred.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub max_bytes: u64,
    /// Lowercase container extensions without the leading dot.
    pub accepted_formats: Vec<String>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            accepted_formats: DEFAULT_ACCEPTED_FORMATS
                .iter()
                .map(|f| f.to_string())
                .collect(),
        }
    }
}

impl UploadPolicy {
    pub fn check(&self, filename: &str, size_bytes: u64) -> Result<(), ApiError> {
        let extension = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        if !self.accepted_formats.iter().any(|f| *f == extension) {
            return Err(ApiError::upload_rejected(format!(
                "unsupported container format '{extension}', accepted: {}",
                self.accepted_formats.join(", ")
            )));
        }
        if size_bytes == 0 {
            return Err(ApiError::upload_rejected("file is empty"));
        }
        if size_bytes > self.max_bytes {
            return Err(ApiError::upload_rejected(format!(
                "file is {size_bytes} bytes, limit is {} bytes",
                self.max_bytes
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub filename: String,
    pub duration_seconds: f64,
    /// Shared with the caller's buffer; the transfer never copies it.
    pub bytes: Bytes,
}

/// Starts transferring `file`. Policy violations are returned here, before the transfer
/// begins and before any progress is reported.
pub fn begin_upload(ctx: &ApiContext, file: FileDescriptor) -> Result<UploadHandle, ApiError> {
    let filename = validate_filename(&file.filename)?;
    ctx.upload_policy
        .check(&filename, file.bytes.len() as u64)?;
    if !file.duration_seconds.is_finite() || file.duration_seconds <= 0.0 {
        return Err(ApiError::upload_rejected(format!(
            "invalid duration {}",
            file.duration_seconds
        )));
    }

    let upload_id = Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::unbounded_channel();
    let (cancel, cancelled) = oneshot::channel();

    info!(%upload_id, %filename, bytes = file.bytes.len(), "upload started");
    let job = UploadJob {
        upload_id: upload_id.clone(),
        storage_key: format!("{upload_id}_{filename}"),
        metadata: VideoMetadata {
            filename: filename.clone(),
            duration_seconds: file.duration_seconds,
            storage_ref: String::new(),
        },
        bytes: file.bytes,
        storage: ctx.storage.clone(),
        transfers: ctx.transfers.clone(),
    };
    let task = tokio::spawn(job.run(PercentReporter::new(tx), cancelled));

    Ok(UploadHandle {
        upload_id,
        filename,
        progress: UnboundedReceiverStream::new(rx),
        task: Some(task),
        cancel: Some(cancel),
    })
}

fn validate_filename(raw: &str) -> Result<String, ApiError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ApiError::upload_rejected("filename is required"));
    }
    if name.len() > MAX_FILENAME_BYTES {
        return Err(ApiError::upload_rejected("filename is too long"));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(ApiError::upload_rejected(
            "filename must not contain path separators",
        ));
    }
    Ok(name.to_string())
}

/// Background half of an upload. Owns the bytes, the progress sender and the cleanup of
/// partial data, so the outcome does not depend on the handle being polled or kept.
struct UploadJob {
    upload_id: String,
    storage_key: String,
    metadata: VideoMetadata,
    bytes: Bytes,
    storage: Storage,
    transfers: Arc<dyn TransferBackend>,
}

impl UploadJob {
    /// Transfer, then record. Cancellation is honored until the backend confirms the
    /// transfer; after that the record is written regardless. 100 follows the record.
    async fn run(
        mut self,
        reporter: PercentReporter,
        mut cancelled: oneshot::Receiver<()>,
    ) -> Result<Video, ApiError> {
        reporter.emit(0);

        let transferred = tokio::select! {
            result = self.transfers.upload_file(&self.storage_key, &self.bytes, &reporter) => {
                Some(result)
            }
            _ = &mut cancelled => None,
        };
        let storage_ref = match transferred {
            Some(Ok(storage_ref)) => storage_ref,
            Some(Err(err)) => {
                warn!(upload_id = %self.upload_id, error = %format!("{err:#}"), "transfer failed");
                self.discard().await;
                return Err(ApiError::upload_rejected(format!("transfer failed: {err:#}")));
            }
            None => {
                self.discard().await;
                info!(upload_id = %self.upload_id, "upload cancelled");
                return Err(ApiError::upload_rejected("upload cancelled"));
            }
        };

        self.metadata.storage_ref = storage_ref;
        match self.storage.create_video(&self.metadata).await {
            Ok(video) => {
                reporter.emit(100);
                info!(upload_id = %self.upload_id, video_id = %video.id, "upload stored");
                Ok(video)
            }
            Err(err) => {
                error!(upload_id = %self.upload_id, error = %err, "failed to record upload");
                self.discard().await;
                Err(store_error(err))
            }
        }
    }

    async fn discard(&self) {
        if let Err(err) = self.transfers.discard(&self.storage_key).await {
            warn!(upload_id = %self.upload_id, error = %format!("{err:#}"), "failed to discard transfer data");
        }
    }
}

/// An in-flight upload.
///
/// As a [`Stream`] it yields transfer progress in percent: non-decreasing, ending at 100
/// once the video record exists. The stream ends when the upload settles and cannot be
/// replayed. [`UploadHandle::finish`] resolves the upload into a stored [`Video`];
/// [`UploadHandle::cancel`] or dropping the handle abandons a transfer still in progress
/// and discards partial data.
pub struct UploadHandle {
    upload_id: String,
    filename: String,
    progress: UnboundedReceiverStream<u8>,
    task: Option<JoinHandle<Result<Video, ApiError>>>,
    /// Dropping the sender cancels as well.
    cancel: Option<oneshot::Sender<()>>,
}

impl UploadHandle {
    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub async fn finish(mut self) -> Result<Video, ApiError> {
        let Some(task) = self.task.take() else {
            return Err(internal("upload already settled"));
        };
        match task.await {
            Ok(result) => result,
            Err(join_error) => {
                error!(upload_id = %self.upload_id, error = %join_error, "upload task died");
                Err(ApiError::upload_rejected("transfer aborted"))
            }
        }
    }

    /// Abandons the upload. Returns the stored video when the transfer had already been
    /// confirmed, in which case the upload completes anyway.
    pub async fn cancel(mut self) -> Option<Video> {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        let task = self.task.take()?;
        match task.await {
            Ok(Ok(video)) => {
                info!(upload_id = %self.upload_id, video_id = %video.id, "upload completed before cancellation");
                Some(video)
            }
            _ => None,
        }
    }
}

impl Stream for UploadHandle {
    type Item = u8;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<u8>> {
        Pin::new(&mut self.progress).poll_next(cx)
    }
}

/// Converts byte counts into de-duplicated, non-decreasing percentages. Byte progress tops
/// out at 99; 100 is only sent once the upload is recorded.
struct PercentReporter {
    tx: mpsc::UnboundedSender<u8>,
    last: Mutex<Option<u8>>,
}

impl PercentReporter {
    fn new(tx: mpsc::UnboundedSender<u8>) -> Self {
        Self {
            tx,
            last: Mutex::new(None),
        }
    }

    fn emit(&self, percent: u8) {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if last.map_or(true, |prev| percent > prev) {
            *last = Some(percent);
            let _ = self.tx.send(percent);
        }
    }
}

impl ProgressSink for PercentReporter {
    fn transferred(&self, bytes_done: u64, bytes_total: u64) {
        if bytes_total == 0 {
            return;
        }
        let percent = (bytes_done.min(bytes_total) * 100 / bytes_total).min(99);
        self.emit(percent as u8);
    }
}

#[cfg(test)]
#[path = "tests/upload_tests.rs"]
mod tests;

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use detection::{AnalysisRequest, DetectionService};
use shared::domain::{Detection, EventType, Video, VideoMetadata};
use storage::{ProgressSink, Storage, TransferBackend};
use tokio::sync::Notify;

use crate::{ApiContext, UploadPolicy};

/// In-memory transfer target. Optionally fails, or parks after the first chunk until the
/// gate is opened.
#[derive(Default)]
pub(crate) struct MemoryTransfers {
    pub(crate) stored: Mutex<HashMap<String, Vec<u8>>>,
    pub(crate) discarded: Mutex<Vec<String>>,
    pub(crate) fail_after_first_chunk: bool,
    pub(crate) gate: Option<Arc<Notify>>,
    pub(crate) chunk_bytes: usize,
}

impl MemoryTransfers {
    pub(crate) fn chunked(chunk_bytes: usize) -> Self {
        Self {
            chunk_bytes,
            ..Self::default()
        }
    }

    pub(crate) fn stored_count(&self) -> usize {
        self.stored.lock().expect("stored lock").len()
    }
}

#[async_trait]
impl TransferBackend for MemoryTransfers {
    async fn upload_file(
        &self,
        storage_key: &str,
        bytes: &[u8],
        progress: &dyn ProgressSink,
    ) -> Result<String> {
        let total = bytes.len() as u64;
        let mut done = 0u64;
        for (index, chunk) in bytes.chunks(self.chunk_bytes.max(1)).enumerate() {
            done += chunk.len() as u64;
            progress.transferred(done, total);
            if index == 0 {
                if self.fail_after_first_chunk {
                    return Err(anyhow!("disk full"));
                }
                if let Some(gate) = &self.gate {
                    gate.notified().await;
                }
            }
        }
        self.stored
            .lock()
            .expect("stored lock")
            .insert(storage_key.to_string(), bytes.to_vec());
        Ok(format!("mem://{storage_key}"))
    }

    async fn discard(&self, storage_key: &str) -> Result<()> {
        self.stored.lock().expect("stored lock").remove(storage_key);
        self.discarded
            .lock()
            .expect("discarded lock")
            .push(storage_key.to_string());
        Ok(())
    }
}

pub(crate) enum Reply {
    Detections(Vec<Detection>),
    Fail(&'static str),
    Hang,
}

/// Detector double answering from a queue of replies; an empty queue answers with no
/// detections.
#[derive(Default)]
pub(crate) struct StubDetector {
    replies: Mutex<VecDeque<Reply>>,
    gate: Option<Arc<Notify>>,
    pub(crate) calls: AtomicUsize,
}

impl StubDetector {
    pub(crate) fn replying(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    pub(crate) fn gated(replies: Vec<Reply>, gate: Arc<Notify>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            gate: Some(gate),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DetectionService for StubDetector {
    async fn request_analysis(&self, _request: &AnalysisRequest) -> Result<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let reply = self.replies.lock().expect("replies lock").pop_front();
        match reply {
            None => Ok(Vec::new()),
            Some(Reply::Detections(detections)) => Ok(detections),
            Some(Reply::Fail(reason)) => Err(anyhow!(reason)),
            Some(Reply::Hang) => std::future::pending().await,
        }
    }
}

pub(crate) async fn context(
    transfers: Arc<dyn TransferBackend>,
    detector: Arc<dyn DetectionService>,
) -> ApiContext {
    ApiContext {
        storage: Storage::new("sqlite::memory:").await.expect("db"),
        transfers,
        detector,
        upload_policy: UploadPolicy {
            max_bytes: 1024,
            accepted_formats: vec!["mp4".into(), "mov".into()],
        },
        analysis_timeout: Duration::from_secs(5),
    }
}

pub(crate) async fn uploaded_video(ctx: &ApiContext, filename: &str, duration: f64) -> Video {
    ctx.storage
        .create_video(&VideoMetadata {
            filename: filename.to_string(),
            duration_seconds: duration,
            storage_ref: format!("mem://{filename}"),
        })
        .await
        .expect("video")
}

pub(crate) async fn analyzed_video(
    ctx: &ApiContext,
    filename: &str,
    detections: &[Detection],
) -> Video {
    let video = uploaded_video(ctx, filename, 300.0).await;
    let (_, claim) = ctx.storage.claim_analysis(&video.id).await.expect("claim");
    ctx.storage
        .attach_events(&video.id, &claim, detections)
        .await
        .expect("attach")
}

pub(crate) fn detection(timestamp: f64, event_type: EventType, confidence: f64) -> Detection {
    Detection {
        timestamp,
        event_type,
        confidence,
    }
}

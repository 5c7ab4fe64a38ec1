use std::{sync::Arc, time::Duration};

use detection::DetectionService;
use shared::{
    domain::{DetectionEvent, EventId, Video, VideoId},
    error::{ApiError, ErrorCode},
    protocol::VideoSummary,
};
use storage::{Storage, StoreError, TransferBackend};

mod analysis;
mod review;
mod upload;

pub use analysis::{analyze, recover_stalled_analyses, start_analysis, AnalysisHandle};
pub use review::{review, MAX_REVIEW_COMMENT_CHARS};
pub use upload::{begin_upload, FileDescriptor, UploadHandle, UploadPolicy, MAX_FILENAME_BYTES};

pub const DEFAULT_ANALYSIS_TIMEOUT: Duration = Duration::from_secs(300);

/// Everything the orchestrators need. The two stores behind `storage` are the only
/// mutable state; the orchestrators themselves hold none.
#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub transfers: Arc<dyn TransferBackend>,
    pub detector: Arc<dyn DetectionService>,
    pub upload_policy: UploadPolicy,
    pub analysis_timeout: Duration,
}

/// Videos in upload order. `filename_query` keeps only those whose filename contains it,
/// ignoring case; a blank query keeps everything.
pub async fn list_videos(
    ctx: &ApiContext,
    filename_query: Option<&str>,
) -> Result<Vec<VideoSummary>, ApiError> {
    let videos = ctx.storage.list_videos().await.map_err(store_error)?;
    Ok(videos
        .iter()
        .filter(|video| filename_query.map_or(true, |q| video.filename_matches(q)))
        .map(VideoSummary::from)
        .collect())
}

pub async fn get_video(ctx: &ApiContext, video_id: &VideoId) -> Result<Video, ApiError> {
    ctx.storage.get_video(video_id).await.map_err(store_error)
}

pub async fn events_for_video(
    ctx: &ApiContext,
    video_id: &VideoId,
) -> Result<Vec<DetectionEvent>, ApiError> {
    ctx.storage
        .events_for_video(video_id)
        .await
        .map_err(store_error)
}

pub async fn get_event(ctx: &ApiContext, event_id: &EventId) -> Result<DetectionEvent, ApiError> {
    ctx.storage.get_event(event_id).await.map_err(store_error)
}

pub(crate) fn store_error(err: StoreError) -> ApiError {
    match err {
        StoreError::VideoNotFound(id) => ApiError::not_found("video", id),
        StoreError::EventNotFound(id) => ApiError::not_found("event", id),
        err @ (StoreError::InvalidTransition { .. } | StoreError::NotAnalyzing { .. }) => {
            ApiError::new(ErrorCode::InvalidTransition, err.to_string())
        }
        err @ StoreError::ClaimLost(_) => ApiError::new(ErrorCode::AlreadyAnalyzing, err.to_string()),
        err @ (StoreError::Corrupt(_) | StoreError::Database(_)) => internal(err),
    }
}

pub(crate) fn internal(err: impl std::fmt::Display) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

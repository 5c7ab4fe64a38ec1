use detection::AnalysisRequest;
use shared::{
    domain::{Detection, LifecycleState, Video, VideoId},
    error::{ApiError, ErrorCode},
};
use storage::{AnalysisClaim, Storage, StoreError};
use tokio::{task::JoinHandle, time::timeout};
use tracing::{error, info, warn};

use crate::{store_error, ApiContext};

/// A submitted analysis. The video is already `Analyzing` when this handle exists; awaiting
/// [`AnalysisHandle::outcome`] yields the analyzed video or `AnalysisFailed`, in which case
/// the video is back in `Uploaded` and may be resubmitted.
pub struct AnalysisHandle {
    video: Video,
    claim: AnalysisClaim,
    task: JoinHandle<Result<Video, ApiError>>,
    storage: Storage,
}

impl AnalysisHandle {
    /// Snapshot taken right after the move to `Analyzing`.
    pub fn video(&self) -> &Video {
        &self.video
    }

    pub async fn outcome(self) -> Result<Video, ApiError> {
        match self.task.await {
            Ok(result) => result,
            Err(join_error) => {
                error!(video_id = %self.video.id, error = %join_error, "analysis task died");
                release(&self.storage, &self.video.id, &self.claim).await;
                Err(ApiError::analysis_failed("analysis task died"))
            }
        }
    }
}

/// Marks the video `Analyzing` and hands it to the detector in the background.
///
/// A second request while one is in flight fails with `AlreadyAnalyzing`; the `Analyzing`
/// state itself is the in-flight marker, claimed with a single conditional update. Every
/// later write for this analysis is bound to that claim.
pub async fn start_analysis(
    ctx: &ApiContext,
    video_id: &VideoId,
) -> Result<AnalysisHandle, ApiError> {
    let (video, claim) = ctx
        .storage
        .claim_analysis(video_id)
        .await
        .map_err(|err| match err {
            StoreError::InvalidTransition {
                from: LifecycleState::Analyzing,
                ..
            } => ApiError::new(
                ErrorCode::AlreadyAnalyzing,
                format!("video {video_id} is already being analyzed"),
            ),
            other => store_error(other),
        })?;
    info!(video_id = %video.id, "analysis requested");

    let task_ctx = ctx.clone();
    let snapshot = video.clone();
    let task_claim = claim.clone();
    let task =
        tokio::spawn(async move { complete_analysis(&task_ctx, snapshot, &task_claim).await });

    Ok(AnalysisHandle {
        video,
        claim,
        task,
        storage: ctx.storage.clone(),
    })
}

/// Submits the video and waits for the result.
pub async fn analyze(ctx: &ApiContext, video_id: &VideoId) -> Result<Video, ApiError> {
    start_analysis(ctx, video_id).await?.outcome().await
}

/// Returns videos stranded in `Analyzing` to `Uploaded`. Only claims older than the
/// analysis timeout are touched; a younger one may belong to a detector call still running.
pub async fn recover_stalled_analyses(ctx: &ApiContext) -> Result<Vec<VideoId>, ApiError> {
    let reverted = ctx
        .storage
        .revert_stalled_analyses(ctx.analysis_timeout)
        .await
        .map_err(store_error)?;
    for video_id in &reverted {
        warn!(%video_id, "reverted stalled analysis");
    }
    Ok(reverted)
}

async fn complete_analysis(
    ctx: &ApiContext,
    video: Video,
    claim: &AnalysisClaim,
) -> Result<Video, ApiError> {
    let request = AnalysisRequest {
        video_id: video.id.clone(),
        storage_ref: video.storage_ref.clone(),
        duration_seconds: video.duration_seconds,
    };

    let detections = match timeout(ctx.analysis_timeout, ctx.detector.request_analysis(&request))
        .await
    {
        Ok(Ok(detections)) => prepare_detections(detections, video.duration_seconds),
        Ok(Err(err)) => Err(format!("detection service error: {err:#}")),
        Err(_) => Err(format!(
            "detection service timed out after {}s",
            ctx.analysis_timeout.as_secs_f64()
        )),
    };

    let detections = match detections {
        Ok(detections) => detections,
        Err(reason) => {
            warn!(video_id = %video.id, %reason, "analysis failed");
            release(&ctx.storage, &video.id, claim).await;
            return Err(ApiError::analysis_failed(reason));
        }
    };

    match ctx.storage.attach_events(&video.id, claim, &detections).await {
        Ok(analyzed) => {
            info!(video_id = %analyzed.id, events = analyzed.events.len(), "analysis completed");
            Ok(analyzed)
        }
        Err(err) => {
            error!(video_id = %video.id, error = %err, "failed to attach detections");
            release(&ctx.storage, &video.id, claim).await;
            Err(ApiError::analysis_failed(format!(
                "failed to store detections: {err}"
            )))
        }
    }
}

/// Checks every detection against the video and orders them by timestamp. Ties keep the
/// detector's order.
fn prepare_detections(
    mut detections: Vec<Detection>,
    duration_seconds: f64,
) -> Result<Vec<Detection>, String> {
    for detection in &detections {
        if !detection.timestamp.is_finite()
            || detection.timestamp < 0.0
            || detection.timestamp > duration_seconds
        {
            return Err(format!(
                "detection at {}s lies outside the video (0..={duration_seconds}s)",
                detection.timestamp
            ));
        }
        if !detection.confidence.is_finite() || !(0.0..=1.0).contains(&detection.confidence) {
            return Err(format!(
                "detection confidence {} is outside [0, 1]",
                detection.confidence
            ));
        }
    }
    detections.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
    Ok(detections)
}

/// Hands the video back to `Uploaded` if `claim` still owns it. A recovered or superseded
/// claim leaves the video to whoever holds it now.
async fn release(storage: &Storage, video_id: &VideoId, claim: &AnalysisClaim) {
    match storage.release_analysis(video_id, claim).await {
        Ok(true) => {}
        Ok(false) => warn!(%video_id, "analysis claim was taken over; leaving video as is"),
        Err(err) => {
            error!(%video_id, error = %err, "failed to revert video after analysis failure")
        }
    }
}

#[cfg(test)]
#[path = "tests/analysis_tests.rs"]
mod tests;

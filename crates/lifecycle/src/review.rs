use shared::{
    domain::{DetectionEvent, EventId, ReviewOutcome, ReviewState, VideoId},
    error::{ApiError, ErrorCode},
};
use tracing::info;

use crate::{store_error, ApiContext};

pub const MAX_REVIEW_COMMENT_CHARS: usize = 2000;

/// Sets the current review of an event, replacing any earlier one.
///
/// The write goes straight to the event store, so the owning video's event list and direct
/// event reads both reflect it. The video's lifecycle state is never touched.
pub async fn review(
    ctx: &ApiContext,
    video_id: &VideoId,
    event_id: &EventId,
    outcome: ReviewOutcome,
    comment: Option<String>,
) -> Result<DetectionEvent, ApiError> {
    if !ctx
        .storage
        .video_exists(video_id)
        .await
        .map_err(store_error)?
    {
        return Err(ApiError::not_found("video", video_id));
    }
    let event = ctx.storage.get_event(event_id).await.map_err(store_error)?;
    if event.video_id != *video_id {
        return Err(ApiError::new(
            ErrorCode::Mismatch,
            format!("event {event_id} does not belong to video {video_id}"),
        ));
    }

    let comment = normalize_comment(comment)?;
    let updated = ctx
        .storage
        .update_event_review(event_id, &ReviewState::Reviewed { outcome, comment })
        .await
        .map_err(store_error)?;
    info!(%video_id, %event_id, %outcome, "event reviewed");
    Ok(updated)
}

fn normalize_comment(comment: Option<String>) -> Result<Option<String>, ApiError> {
    let Some(comment) = comment else {
        return Ok(None);
    };
    let trimmed = comment.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.chars().count() > MAX_REVIEW_COMMENT_CHARS {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("comment exceeds {MAX_REVIEW_COMMENT_CHARS} characters"),
        ));
    }
    Ok(Some(trimmed.to_string()))
}

#[cfg(test)]
#[path = "tests/review_tests.rs"]
mod tests;

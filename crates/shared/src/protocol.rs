use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        ConfidenceBand, DetectionEvent, EventId, EventType, LifecycleState, ReviewOutcome,
        ReviewState, Video, VideoId,
    },
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoSummary {
    pub id: VideoId,
    pub filename: String,
    pub upload_timestamp: DateTime<Utc>,
    pub duration_seconds: f64,
    pub lifecycle_state: LifecycleState,
}

impl From<&Video> for VideoSummary {
    fn from(video: &Video) -> Self {
        Self {
            id: video.id.clone(),
            filename: video.filename.clone(),
            upload_timestamp: video.uploaded_at,
            duration_seconds: video.duration_seconds,
            lifecycle_state: video.state,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub id: EventId,
    pub video_id: VideoId,
    pub timestamp: f64,
    pub event_type: EventType,
    pub confidence: f64,
    pub confidence_band: ConfidenceBand,
    pub review_state: ReviewState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,
}

impl From<&DetectionEvent> for EventPayload {
    fn from(event: &DetectionEvent) -> Self {
        Self {
            id: event.id.clone(),
            video_id: event.video_id.clone(),
            timestamp: event.timestamp,
            event_type: event.event_type,
            confidence: event.confidence,
            confidence_band: ConfidenceBand::for_confidence(event.confidence),
            review_state: event.review.clone(),
            reviewed_at: event.reviewed_at,
        }
    }
}

/// Full view of a video: summary fields plus its ordered events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoDetail {
    #[serde(flatten)]
    pub summary: VideoSummary,
    pub events: Vec<EventPayload>,
    pub review_stats: ReviewStats,
}

impl From<&Video> for VideoDetail {
    fn from(video: &Video) -> Self {
        Self {
            summary: VideoSummary::from(video),
            events: video.events.iter().map(EventPayload::from).collect(),
            review_stats: ReviewStats::from_events(&video.events),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewStats {
    pub total: usize,
    pub unreviewed: usize,
    pub correct: usize,
    pub false_positive: usize,
    pub missed: usize,
}

impl ReviewStats {
    pub fn from_events(events: &[DetectionEvent]) -> Self {
        let mut stats = Self {
            total: events.len(),
            ..Self::default()
        };
        for event in events {
            match event.review.outcome() {
                None => stats.unreviewed += 1,
                Some(ReviewOutcome::Correct) => stats.correct += 1,
                Some(ReviewOutcome::FalsePositive) => stats.false_positive += 1,
                Some(ReviewOutcome::Missed) => stats.missed += 1,
            }
        }
        stats
    }

    pub fn reviewed(&self) -> usize {
        self.total - self.unreviewed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub video_id: VideoId,
    pub outcome: ReviewOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    UploadProgress {
        upload_id: String,
        filename: String,
        percent: u8,
    },
    VideoUploaded {
        upload_id: String,
        video: VideoSummary,
    },
    UploadFailed {
        upload_id: String,
        error: ApiError,
    },
    AnalysisStarted {
        video_id: VideoId,
    },
    AnalysisCompleted {
        video: VideoSummary,
        event_count: usize,
    },
    AnalysisFailed {
        video_id: VideoId,
        error: ApiError,
    },
    EventReviewed {
        event: EventPayload,
    },
}

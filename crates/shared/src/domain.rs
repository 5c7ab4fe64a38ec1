use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(VideoId);
id_newtype!(EventId);

/// Coarse processing phase of a video.
///
/// Legal moves are `Uploaded -> Analyzing`, `Analyzing -> Analyzed` and the failure
/// revert `Analyzing -> Uploaded`. Every target state has exactly one legal predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uploaded,
    Analyzing,
    Analyzed,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Analyzing => "analyzing",
            Self::Analyzed => "analyzed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "uploaded" => Some(Self::Uploaded),
            "analyzing" => Some(Self::Analyzing),
            "analyzed" => Some(Self::Analyzed),
            _ => None,
        }
    }

    /// The only state from which `self` may be entered.
    pub fn predecessor(self) -> Self {
        match self {
            Self::Uploaded => Self::Analyzing,
            Self::Analyzing => Self::Uploaded,
            Self::Analyzed => Self::Analyzing,
        }
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        next.predecessor() == self
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Fall,
    Fire,
    Smoke,
    Violence,
    Inactivity,
}

impl EventType {
    pub const ALL: [EventType; 5] = [
        Self::Fall,
        Self::Fire,
        Self::Smoke,
        Self::Violence,
        Self::Inactivity,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fall => "fall",
            Self::Fire => "fire",
            Self::Smoke => "smoke",
            Self::Violence => "violence",
            Self::Inactivity => "inactivity",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewOutcome {
    Correct,
    FalsePositive,
    Missed,
}

impl ReviewOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Correct => "correct",
            Self::FalsePositive => "false_positive",
            Self::Missed => "missed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "correct" => Some(Self::Correct),
            "false_positive" => Some(Self::FalsePositive),
            "missed" => Some(Self::Missed),
            _ => None,
        }
    }
}

impl fmt::Display for ReviewOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReviewState {
    Unreviewed,
    Reviewed {
        outcome: ReviewOutcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
    },
}

impl ReviewState {
    pub fn is_reviewed(&self) -> bool {
        matches!(self, Self::Reviewed { .. })
    }

    pub fn outcome(&self) -> Option<ReviewOutcome> {
        match self {
            Self::Unreviewed => None,
            Self::Reviewed { outcome, .. } => Some(*outcome),
        }
    }
}

/// How the detector's score is presented to reviewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBand {
    High,
    Medium,
    Low,
}

impl ConfidenceBand {
    pub fn for_confidence(confidence: f64) -> Self {
        if confidence >= 0.8 {
            Self::High
        } else if confidence >= 0.6 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// Immutable metadata captured when a transfer completes.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoMetadata {
    pub filename: String,
    pub duration_seconds: f64,
    pub storage_ref: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionEvent {
    pub id: EventId,
    pub video_id: VideoId,
    pub timestamp: f64,
    pub event_type: EventType,
    pub confidence: f64,
    pub review: ReviewState,
    pub reviewed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Video {
    pub id: VideoId,
    pub filename: String,
    pub uploaded_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub storage_ref: String,
    pub state: LifecycleState,
    pub events: Vec<DetectionEvent>,
}

impl Video {
    /// Case-insensitive substring match on the filename. A blank query matches every video.
    pub fn filename_matches(&self, query: &str) -> bool {
        let query = query.trim();
        query.is_empty() || self.filename.to_lowercase().contains(&query.to_lowercase())
    }
}

/// A detection as reported by the external service, before it is attached to a video.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub timestamp: f64,
    pub event_type: EventType,
    pub confidence: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_only_allows_forward_moves_and_failure_revert() {
        use LifecycleState::*;
        assert!(Uploaded.can_transition_to(Analyzing));
        assert!(Analyzing.can_transition_to(Analyzed));
        assert!(Analyzing.can_transition_to(Uploaded));

        assert!(!Uploaded.can_transition_to(Analyzed));
        assert!(!Analyzed.can_transition_to(Uploaded));
        assert!(!Analyzed.can_transition_to(Analyzing));
        assert!(!Analyzing.can_transition_to(Analyzing));
    }

    #[test]
    fn review_state_serializes_with_status_tag() {
        let reviewed = ReviewState::Reviewed {
            outcome: ReviewOutcome::FalsePositive,
            comment: Some("shadow".into()),
        };
        let json = serde_json::to_value(&reviewed).expect("json");
        assert_eq!(json["status"], "reviewed");
        assert_eq!(json["outcome"], "false_positive");
        assert_eq!(json["comment"], "shadow");

        let json = serde_json::to_value(ReviewState::Unreviewed).expect("json");
        assert_eq!(json, serde_json::json!({ "status": "unreviewed" }));
    }

    #[test]
    fn event_type_parses_only_known_names() {
        assert_eq!(EventType::parse("inactivity"), Some(EventType::Inactivity));
        assert_eq!(EventType::parse("normal"), None);
    }

    #[test]
    fn confidence_bands_match_reviewer_thresholds() {
        assert_eq!(ConfidenceBand::for_confidence(0.92), ConfidenceBand::High);
        assert_eq!(ConfidenceBand::for_confidence(0.8), ConfidenceBand::High);
        assert_eq!(ConfidenceBand::for_confidence(0.61), ConfidenceBand::Medium);
        assert_eq!(ConfidenceBand::for_confidence(0.2), ConfidenceBand::Low);
    }

    #[test]
    fn filename_match_ignores_case_and_blank_queries() {
        let video = Video {
            id: VideoId::from("v1"),
            filename: "Hallway_Cam2.MP4".into(),
            uploaded_at: Utc::now(),
            duration_seconds: 120.0,
            storage_ref: "blob".into(),
            state: LifecycleState::Uploaded,
            events: Vec::new(),
        };
        assert!(video.filename_matches("hallway"));
        assert!(video.filename_matches("CAM2.mp4"));
        assert!(video.filename_matches("  "));
        assert!(!video.filename_matches("lobby"));
    }
}

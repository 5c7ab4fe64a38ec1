use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::domain::{Detection, EventType, VideoId};
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub video_id: VideoId,
    pub storage_ref: String,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub events: Vec<Detection>,
}

/// The opaque detector. Returned detections are unordered and unvalidated.
#[async_trait]
pub trait DetectionService: Send + Sync {
    async fn request_analysis(&self, request: &AnalysisRequest) -> Result<Vec<Detection>>;
}

/// Talks to a detector that accepts `POST {base}/analyze` with an [`AnalysisRequest`] body
/// and answers with an [`AnalysisResponse`].
#[derive(Debug, Clone)]
pub struct HttpDetectionService {
    client: Client,
    endpoint: Url,
}

impl HttpDetectionService {
    pub fn new(base_url: &str) -> Result<Self> {
        let mut base = Url::parse(base_url)
            .with_context(|| format!("invalid detection service url '{base_url}'"))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base.join("analyze")?;
        Ok(Self {
            client: Client::new(),
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl DetectionService for HttpDetectionService {
    async fn request_analysis(&self, request: &AnalysisRequest) -> Result<Vec<Detection>> {
        debug!(video_id = %request.video_id, endpoint = %self.endpoint, "requesting analysis");
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(request)
            .send()
            .await
            .context("detection service unreachable")?
            .error_for_status()
            .context("detection service rejected request")?;
        let body: AnalysisResponse = response
            .json()
            .await
            .context("detection service returned malformed body")?;
        Ok(body.events)
    }
}

/// Returns a fixed set of detections, dropping those that fall past the end of the video.
/// Stands in for the real detector during development.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDetectionService {
    detections: Vec<Detection>,
}

impl ScriptedDetectionService {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self { detections }
    }

    pub fn demo() -> Self {
        Self::new(vec![
            Detection {
                timestamp: 45.0,
                event_type: EventType::Fall,
                confidence: 0.92,
            },
            Detection {
                timestamp: 120.0,
                event_type: EventType::Fire,
                confidence: 0.85,
            },
        ])
    }
}

#[async_trait]
impl DetectionService for ScriptedDetectionService {
    async fn request_analysis(&self, request: &AnalysisRequest) -> Result<Vec<Detection>> {
        Ok(self
            .detections
            .iter()
            .copied()
            .filter(|d| d.timestamp <= request.duration_seconds)
            .collect())
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

use super::*;

use detection::AnalysisRequest;
use shared::domain::VideoId;

fn request(duration_seconds: f64) -> AnalysisRequest {
    AnalysisRequest {
        video_id: VideoId::from("v1"),
        storage_ref: "blob".into(),
        duration_seconds,
    }
}

#[tokio::test]
async fn scripted_detector_is_used_without_a_detection_url() {
    let settings = Settings::default();
    let detector = select_detector(&settings).expect("detector");

    let detections = detector
        .request_analysis(&request(60.0))
        .await
        .expect("detections");
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].timestamp, 45.0);
}

#[test]
fn malformed_detection_url_is_a_startup_error() {
    let settings = Settings {
        detection_url: Some("not a url".into()),
        ..Settings::default()
    };
    assert!(select_detector(&settings).is_err());
}

#[tokio::test]
async fn context_carries_upload_policy_and_timeout() {
    let blobs = tempfile::tempdir().expect("tempdir");
    let settings = Settings {
        blob_dir: blobs.path().to_path_buf(),
        max_upload_bytes: 4096,
        accepted_formats: vec!["mp4".into()],
        analysis_timeout: std::time::Duration::from_secs(12),
        ..Settings::default()
    };
    let storage = Storage::new("sqlite::memory:").await.expect("db");

    let ctx = build_context(&settings, storage).expect("context");

    assert_eq!(ctx.upload_policy.max_bytes, 4096);
    assert_eq!(ctx.upload_policy.accepted_formats, vec!["mp4".to_string()]);
    assert_eq!(ctx.analysis_timeout, std::time::Duration::from_secs(12));
}

#[tokio::test]
async fn startup_recovery_reverts_only_claims_older_than_the_timeout() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let mut videos = Vec::new();
    for filename in ["stuck.mp4", "busy.mp4"] {
        let video = storage
            .create_video(&shared::domain::VideoMetadata {
                filename: filename.into(),
                duration_seconds: 30.0,
                storage_ref: "blob".into(),
            })
            .await
            .expect("video");
        storage.claim_analysis(&video.id).await.expect("claim");
        videos.push(video.id);
    }

    let patient = build_context(&Settings::default(), storage.clone()).expect("context");
    let reverted = recover_stalled_analyses(&patient).await.expect("recover");
    assert!(reverted.is_empty());

    let impatient = build_context(
        &Settings {
            analysis_timeout: std::time::Duration::ZERO,
            ..Settings::default()
        },
        storage,
    )
    .expect("context");
    let mut reverted = recover_stalled_analyses(&impatient).await.expect("recover");
    reverted.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    videos.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    assert_eq!(reverted, videos);
}

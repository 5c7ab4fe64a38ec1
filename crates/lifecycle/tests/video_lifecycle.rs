use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use detection::ScriptedDetectionService;
use futures::StreamExt;
use lifecycle::{
    analyze, begin_upload, get_event, list_videos, review, ApiContext, FileDescriptor,
    UploadPolicy,
};
use shared::{
    domain::{Detection, EventType, LifecycleState, ReviewOutcome, ReviewState, VideoId},
    error::ErrorCode,
};
use storage::{FsTransferBackend, Storage};
use tempfile::TempDir;

async fn context(blobs: &TempDir, detections: Vec<Detection>) -> ApiContext {
    ApiContext {
        storage: Storage::new("sqlite::memory:").await.expect("db"),
        transfers: Arc::new(FsTransferBackend::new(blobs.path(), 256)),
        detector: Arc::new(ScriptedDetectionService::new(detections)),
        upload_policy: UploadPolicy {
            max_bytes: 4096,
            ..UploadPolicy::default()
        },
        analysis_timeout: Duration::from_secs(5),
    }
}

fn hallway_detections() -> Vec<Detection> {
    vec![
        Detection {
            timestamp: 110.0,
            event_type: EventType::Inactivity,
            confidence: 0.61,
        },
        Detection {
            timestamp: 45.0,
            event_type: EventType::Fall,
            confidence: 0.92,
        },
    ]
}

#[tokio::test]
async fn upload_analyze_and_review_a_video() {
    let blobs = tempfile::tempdir().expect("tempdir");
    let ctx = context(&blobs, hallway_detections()).await;

    let mut upload = begin_upload(
        &ctx,
        FileDescriptor {
            filename: "hallway.mp4".into(),
            duration_seconds: 120.0,
            bytes: Bytes::from(vec![1u8; 1000]),
        },
    )
    .expect("begin upload");
    let mut progress = Vec::new();
    while let Some(percent) = upload.next().await {
        progress.push(percent);
    }
    assert_eq!(progress.first(), Some(&0));
    assert_eq!(progress.last(), Some(&100));
    assert!(progress.windows(2).all(|w| w[0] < w[1]));

    let video = upload.finish().await.expect("finish upload");
    assert_eq!(video.state, LifecycleState::Uploaded);
    assert!(std::path::Path::new(&video.storage_ref).exists());

    let listed = list_videos(&ctx, None).await.expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, video.id);

    let analyzed = analyze(&ctx, &video.id).await.expect("analyze");
    assert_eq!(analyzed.state, LifecycleState::Analyzed);
    let found: Vec<(f64, EventType)> = analyzed
        .events
        .iter()
        .map(|e| (e.timestamp, e.event_type))
        .collect();
    assert_eq!(
        found,
        vec![(45.0, EventType::Fall), (110.0, EventType::Inactivity)]
    );

    let fall = analyzed.events[0].id.clone();
    review(&ctx, &video.id, &fall, ReviewOutcome::Correct, None)
        .await
        .expect("review");

    let event = get_event(&ctx, &fall).await.expect("event");
    assert_eq!(event.review.outcome(), Some(ReviewOutcome::Correct));
    let video = lifecycle::get_video(&ctx, &video.id).await.expect("video");
    assert_eq!(video.state, LifecycleState::Analyzed);
    assert_eq!(video.events[1].review, ReviewState::Unreviewed);
}

#[tokio::test]
async fn rejected_upload_leaves_nothing_behind() {
    let blobs = tempfile::tempdir().expect("tempdir");
    let ctx = context(&blobs, Vec::new()).await;

    let err = begin_upload(
        &ctx,
        FileDescriptor {
            filename: "huge.mp4".into(),
            duration_seconds: 60.0,
            bytes: Bytes::from(vec![0u8; 5000]),
        },
    )
    .err()
    .expect("oversized upload");

    assert_eq!(err.code, ErrorCode::UploadRejected);
    assert!(list_videos(&ctx, None).await.expect("list").is_empty());
    assert_eq!(std::fs::read_dir(blobs.path()).map(|d| d.count()).unwrap_or(0), 0);
}

#[tokio::test]
async fn analyzing_an_unknown_video_changes_nothing() {
    let blobs = tempfile::tempdir().expect("tempdir");
    let ctx = context(&blobs, hallway_detections()).await;

    let err = analyze(&ctx, &VideoId::from("zzz"))
        .await
        .expect_err("unknown video");

    assert_eq!(err.code, ErrorCode::NotFound);
    assert!(list_videos(&ctx, None).await.expect("list").is_empty());
}

use super::*;
use axum::{http::StatusCode, routing::post, Json, Router};

async fn spawn_detector(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}/v1")
}

fn request(duration_seconds: f64) -> AnalysisRequest {
    AnalysisRequest {
        video_id: VideoId::from("video-1"),
        storage_ref: "blobs/hallway.mp4".into(),
        duration_seconds,
    }
}

#[test]
fn endpoint_is_joined_under_base_path() {
    let service = HttpDetectionService::new("http://detector.local/api").expect("service");
    assert_eq!(
        service.endpoint().as_str(),
        "http://detector.local/api/analyze"
    );
}

#[test]
fn rejects_unparsable_base_url() {
    assert!(HttpDetectionService::new("not a url").is_err());
}

#[tokio::test]
async fn http_service_posts_request_and_decodes_events() {
    let app = Router::new().route(
        "/v1/analyze",
        post(|Json(req): Json<AnalysisRequest>| async move {
            assert_eq!(req.video_id.as_str(), "video-1");
            Json(serde_json::json!({
                "events": [
                    { "timestamp": 110.0, "event_type": "inactivity", "confidence": 0.61 },
                    { "timestamp": 45.0, "event_type": "fall", "confidence": 0.92 }
                ]
            }))
        }),
    );
    let base = spawn_detector(app).await;

    let service = HttpDetectionService::new(&base).expect("service");
    let detections = service
        .request_analysis(&request(120.0))
        .await
        .expect("analysis");
    assert_eq!(detections.len(), 2);
    assert_eq!(detections[0].event_type, EventType::Inactivity);
    assert_eq!(detections[1].timestamp, 45.0);
}

#[tokio::test]
async fn http_service_surfaces_server_errors() {
    let app = Router::new().route(
        "/v1/analyze",
        post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "model crashed") }),
    );
    let base = spawn_detector(app).await;

    let service = HttpDetectionService::new(&base).expect("service");
    let err = service
        .request_analysis(&request(120.0))
        .await
        .expect_err("should fail");
    assert!(err.to_string().contains("rejected"));
}

#[tokio::test]
async fn scripted_service_drops_detections_past_the_end() {
    let service = ScriptedDetectionService::demo();
    let short = service
        .request_analysis(&request(60.0))
        .await
        .expect("analysis");
    assert_eq!(short.len(), 1);
    assert_eq!(short[0].event_type, EventType::Fall);

    let long = service
        .request_analysis(&request(600.0))
        .await
        .expect("analysis");
    assert_eq!(long.len(), 2);
}

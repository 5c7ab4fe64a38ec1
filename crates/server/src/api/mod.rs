use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        DefaultBodyLimit, Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use lifecycle::{begin_upload, review, start_analysis, FileDescriptor};
use serde::Deserialize;
use shared::{
    domain::{EventId, VideoId},
    error::{ApiError, ErrorCode},
    protocol::{EventPayload, ReviewRequest, ServerEvent, VideoDetail, VideoSummary},
};
use tokio::sync::broadcast::error::RecvError;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, warn};

use crate::app_state::AppState;

type HttpResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    /// Case-insensitive filename substring.
    q: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    filename: String,
    duration_seconds: f64,
}

pub(crate) fn build_router(state: Arc<AppState>) -> Router {
    let upload_limit = usize::try_from(state.api.upload_policy.max_bytes).unwrap_or(usize::MAX);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/videos", get(http_list_videos))
        .route(
            "/videos/upload",
            post(upload_video)
                .layer::<_, std::convert::Infallible>(DefaultBodyLimit::disable())
                .layer(RequestBodyLimitLayer::new(upload_limit)),
        )
        .route("/videos/:video_id", get(http_get_video))
        .route("/videos/:video_id/events", get(http_video_events))
        .route("/videos/:video_id/analyze", post(http_analyze))
        .route("/events/:event_id", get(http_get_event))
        .route("/events/:event_id/review", post(http_review))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match err.code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::InvalidTransition | ErrorCode::AlreadyAnalyzing => StatusCode::CONFLICT,
        ErrorCode::Mismatch | ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::UploadRejected => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::AnalysisFailed => StatusCode::BAD_GATEWAY,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, StatusCode> {
    state.api.storage.health_check().await.map_err(|error| {
        warn!(error = %format!("{error:#}"), "health check failed");
        StatusCode::SERVICE_UNAVAILABLE
    })?;
    Ok("ok")
}

async fn http_list_videos(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> HttpResult<Json<Vec<VideoSummary>>> {
    let videos = lifecycle::list_videos(&state.api, query.q.as_deref())
        .await
        .map_err(reject)?;
    Ok(Json(videos))
}

/// Streams the raw request body through the upload orchestrator, relaying progress as
/// notifications. The video exists only once the response is sent.
async fn upload_video(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UploadQuery>,
    body: Bytes,
) -> HttpResult<(StatusCode, Json<VideoSummary>)> {
    let mut upload = begin_upload(
        &state.api,
        FileDescriptor {
            filename: q.filename,
            duration_seconds: q.duration_seconds,
            bytes: body,
        },
    )
    .map_err(reject)?;

    let upload_id = upload.upload_id().to_string();
    let filename = upload.filename().to_string();
    while let Some(percent) = upload.next().await {
        let _ = state.events.send(ServerEvent::UploadProgress {
            upload_id: upload_id.clone(),
            filename: filename.clone(),
            percent,
        });
    }

    match upload.finish().await {
        Ok(video) => {
            let summary = VideoSummary::from(&video);
            let _ = state.events.send(ServerEvent::VideoUploaded {
                upload_id,
                video: summary.clone(),
            });
            Ok((StatusCode::CREATED, Json(summary)))
        }
        Err(error) => {
            let _ = state.events.send(ServerEvent::UploadFailed {
                upload_id,
                error: error.clone(),
            });
            Err(reject(error))
        }
    }
}

async fn http_get_video(
    State(state): State<Arc<AppState>>,
    Path(video_id): Path<VideoId>,
) -> HttpResult<Json<VideoDetail>> {
    let video = lifecycle::get_video(&state.api, &video_id)
        .await
        .map_err(reject)?;
    Ok(Json(VideoDetail::from(&video)))
}

async fn http_video_events(
    State(state): State<Arc<AppState>>,
    Path(video_id): Path<VideoId>,
) -> HttpResult<Json<Vec<EventPayload>>> {
    let events = lifecycle::events_for_video(&state.api, &video_id)
        .await
        .map_err(reject)?;
    Ok(Json(events.iter().map(EventPayload::from).collect()))
}

/// Accepts the request once the video is `Analyzing`; completion or failure is announced
/// on the notification stream.
async fn http_analyze(
    State(state): State<Arc<AppState>>,
    Path(video_id): Path<VideoId>,
) -> HttpResult<(StatusCode, Json<VideoSummary>)> {
    let handle = start_analysis(&state.api, &video_id)
        .await
        .map_err(reject)?;
    let summary = VideoSummary::from(handle.video());
    let _ = state.events.send(ServerEvent::AnalysisStarted {
        video_id: video_id.clone(),
    });

    let events = state.events.clone();
    tokio::spawn(async move {
        let notice = match handle.outcome().await {
            Ok(video) => ServerEvent::AnalysisCompleted {
                event_count: video.events.len(),
                video: VideoSummary::from(&video),
            },
            Err(error) => ServerEvent::AnalysisFailed { video_id, error },
        };
        let _ = events.send(notice);
    });

    Ok((StatusCode::ACCEPTED, Json(summary)))
}

async fn http_get_event(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<EventId>,
) -> HttpResult<Json<EventPayload>> {
    let event = lifecycle::get_event(&state.api, &event_id)
        .await
        .map_err(reject)?;
    Ok(Json(EventPayload::from(&event)))
}

async fn http_review(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<EventId>,
    Json(req): Json<ReviewRequest>,
) -> HttpResult<Json<EventPayload>> {
    let event = review(&state.api, &req.video_id, &event_id, req.outcome, req.comment)
        .await
        .map_err(reject)?;
    let payload = EventPayload::from(&event);
    let _ = state.events.send(ServerEvent::EventReviewed {
        event: payload.clone(),
    });
    Ok(Json(payload))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.events.subscribe();

    let send_task = tokio::spawn(async move {
        loop {
            let event = match events_rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "notification subscriber lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;

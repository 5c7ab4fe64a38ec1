use anyhow::{Context, Result};
use chrono::{DateTime, SubsecRound, Utc};
use shared::domain::{
    Detection, DetectionEvent, EventId, EventType, LifecycleState, ReviewOutcome, ReviewState,
    Video, VideoId, VideoMetadata,
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite, SqliteConnection,
};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;

mod transfer;

pub use transfer::{FsTransferBackend, ProgressSink, TransferBackend};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("video {0} not found")]
    VideoNotFound(VideoId),
    #[error("event {0} not found")]
    EventNotFound(EventId),
    #[error("video {video_id} cannot move from {from} to {to}")]
    InvalidTransition {
        video_id: VideoId,
        from: LifecycleState,
        to: LifecycleState,
    },
    #[error("video {video_id} is {current}; events attach only while analyzing")]
    NotAnalyzing {
        video_id: VideoId,
        current: LifecycleState,
    },
    #[error("video {0} is being analyzed under a different claim")]
    ClaimLost(VideoId),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Proof of ownership of one `analyzing` period. Only the holder can attach events to the
/// video or hand it back to `uploaded`; a claim that was recovered or superseded is inert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisClaim(String);

impl AnalysisClaim {
    fn issue() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Video Record Store and Detection Event Store over one SQLite pool.
///
/// Every mutation is a single statement or a single transaction, so readers never observe
/// a partially attached event set or a half-written review.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    // ---- video records -------------------------------------------------------------

    pub async fn create_video(&self, metadata: &VideoMetadata) -> StoreResult<Video> {
        let video = Video {
            id: VideoId::generate(),
            filename: metadata.filename.clone(),
            uploaded_at: Utc::now().trunc_subsecs(3),
            duration_seconds: metadata.duration_seconds,
            storage_ref: metadata.storage_ref.clone(),
            state: LifecycleState::Uploaded,
            events: Vec::new(),
        };

        sqlx::query(
            "INSERT INTO videos (id, filename, uploaded_at, duration_seconds, storage_ref, lifecycle_state)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(video.id.as_str())
        .bind(&video.filename)
        .bind(video.uploaded_at)
        .bind(video.duration_seconds)
        .bind(&video.storage_ref)
        .bind(video.state.as_str())
        .execute(&self.pool)
        .await?;
        Ok(video)
    }

    pub async fn get_video(&self, video_id: &VideoId) -> StoreResult<Video> {
        let mut tx = self.pool.begin().await?;
        let video = fetch_video(&mut tx, video_id)
            .await?
            .ok_or_else(|| StoreError::VideoNotFound(video_id.clone()))?;
        tx.commit().await?;
        Ok(video)
    }

    pub async fn video_exists(&self, video_id: &VideoId) -> StoreResult<bool> {
        let row = sqlx::query("SELECT 1 FROM videos WHERE id = ?")
            .bind(video_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// All videos in insertion order, each with its ordered events.
    pub async fn list_videos(&self) -> StoreResult<Vec<Video>> {
        let mut tx = self.pool.begin().await?;
        let video_rows = sqlx::query(
            "SELECT id, filename, uploaded_at, duration_seconds, storage_ref, lifecycle_state
             FROM videos
             ORDER BY seq ASC",
        )
        .fetch_all(&mut *tx)
        .await?;
        let event_rows = sqlx::query(
            "SELECT id, video_id, timestamp, event_type, confidence, review_outcome, review_comment, reviewed_at
             FROM detection_events
             ORDER BY video_id, timestamp ASC, position ASC",
        )
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut events_by_video: HashMap<VideoId, Vec<DetectionEvent>> = HashMap::new();
        for row in &event_rows {
            let event = event_from_row(row)?;
            events_by_video
                .entry(event.video_id.clone())
                .or_default()
                .push(event);
        }

        video_rows
            .iter()
            .map(|row| {
                let mut video = video_from_row(row)?;
                video.events = events_by_video.remove(&video.id).unwrap_or_default();
                Ok(video)
            })
            .collect()
    }

    /// Moves a video into `next` if, and only if, it currently sits in the single legal
    /// predecessor state. The check and the write are one conditional update.
    ///
    /// Entering `analyzing` this way issues a claim nobody holds, and leaving it drops
    /// whatever claim was active. Orchestrators go through [`Storage::claim_analysis`].
    pub async fn set_video_state(
        &self,
        video_id: &VideoId,
        next: LifecycleState,
    ) -> StoreResult<Video> {
        let claim = (next == LifecycleState::Analyzing).then(AnalysisClaim::issue);
        self.transition(video_id, next, claim.as_ref()).await
    }

    /// Moves an `uploaded` video to `analyzing` and returns the claim that owns this
    /// analysis. Fails with `InvalidTransition` from `analyzing` while another claim is live.
    pub async fn claim_analysis(&self, video_id: &VideoId) -> StoreResult<(Video, AnalysisClaim)> {
        let claim = AnalysisClaim::issue();
        let video = self
            .transition(video_id, LifecycleState::Analyzing, Some(&claim))
            .await?;
        Ok((video, claim))
    }

    async fn transition(
        &self,
        video_id: &VideoId,
        next: LifecycleState,
        claim: Option<&AnalysisClaim>,
    ) -> StoreResult<Video> {
        let started_at = claim.map(|_| Utc::now().timestamp_millis());
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE videos
             SET lifecycle_state = ?, analysis_claim = ?, analysis_started_at = ?,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ? AND lifecycle_state = ?",
        )
        .bind(next.as_str())
        .bind(claim.map(AnalysisClaim::as_str))
        .bind(started_at)
        .bind(video_id.as_str())
        .bind(next.predecessor().as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(match current_state(&mut tx, video_id).await? {
                None => StoreError::VideoNotFound(video_id.clone()),
                Some(from) => StoreError::InvalidTransition {
                    video_id: video_id.clone(),
                    from,
                    to: next,
                },
            });
        }

        let video = fetch_video(&mut tx, video_id)
            .await?
            .ok_or_else(|| StoreError::VideoNotFound(video_id.clone()))?;
        tx.commit().await?;
        Ok(video)
    }

    /// Replaces the event set of a video analyzing under `claim` and marks it analyzed, in
    /// one transaction. Detections are stored in the order given.
    pub async fn attach_events(
        &self,
        video_id: &VideoId,
        claim: &AnalysisClaim,
        detections: &[Detection],
    ) -> StoreResult<Video> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE videos
             SET lifecycle_state = 'analyzed', analysis_claim = NULL, analysis_started_at = NULL,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ? AND lifecycle_state = 'analyzing' AND analysis_claim = ?",
        )
        .bind(video_id.as_str())
        .bind(claim.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(match current_state(&mut tx, video_id).await? {
                None => StoreError::VideoNotFound(video_id.clone()),
                Some(LifecycleState::Analyzing) => StoreError::ClaimLost(video_id.clone()),
                Some(current) => StoreError::NotAnalyzing {
                    video_id: video_id.clone(),
                    current,
                },
            });
        }

        sqlx::query("DELETE FROM detection_events WHERE video_id = ?")
            .bind(video_id.as_str())
            .execute(&mut *tx)
            .await?;

        for (position, detection) in detections.iter().enumerate() {
            sqlx::query(
                "INSERT INTO detection_events (id, video_id, position, timestamp, event_type, confidence)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(EventId::generate().as_str())
            .bind(video_id.as_str())
            .bind(i64::try_from(position).unwrap_or(i64::MAX))
            .bind(detection.timestamp)
            .bind(detection.event_type.as_str())
            .bind(detection.confidence)
            .execute(&mut *tx)
            .await?;
        }

        let video = fetch_video(&mut tx, video_id)
            .await?
            .ok_or_else(|| StoreError::VideoNotFound(video_id.clone()))?;
        tx.commit().await?;
        Ok(video)
    }

    /// Hands a video analyzing under `claim` back to `uploaded`. Returns `false`, changing
    /// nothing, when the claim is no longer the active one.
    pub async fn release_analysis(
        &self,
        video_id: &VideoId,
        claim: &AnalysisClaim,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE videos
             SET lifecycle_state = 'uploaded', analysis_claim = NULL, analysis_started_at = NULL,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ? AND lifecycle_state = 'analyzing' AND analysis_claim = ?",
        )
        .bind(video_id.as_str())
        .bind(claim.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Returns videos whose analysis was claimed at least `older_than` ago to `uploaded`.
    /// Younger claims may still have a live owner and are left alone. Their holders find
    /// the claim gone and change nothing.
    pub async fn revert_stalled_analyses(&self, older_than: Duration) -> StoreResult<Vec<VideoId>> {
        let age = i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp_millis().saturating_sub(age);
        let rows = sqlx::query(
            "UPDATE videos
             SET lifecycle_state = 'uploaded', analysis_claim = NULL, analysis_started_at = NULL,
                 updated_at = CURRENT_TIMESTAMP
             WHERE lifecycle_state = 'analyzing'
               AND (analysis_started_at IS NULL OR analysis_started_at <= ?)
             RETURNING id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| VideoId(r.get::<String, _>(0)))
            .collect())
    }

    // ---- detection events ----------------------------------------------------------

    pub async fn events_for_video(&self, video_id: &VideoId) -> StoreResult<Vec<DetectionEvent>> {
        let mut tx = self.pool.begin().await?;
        if current_state(&mut tx, video_id).await?.is_none() {
            return Err(StoreError::VideoNotFound(video_id.clone()));
        }
        let events = fetch_events(&mut tx, video_id).await?;
        tx.commit().await?;
        Ok(events)
    }

    pub async fn get_event(&self, event_id: &EventId) -> StoreResult<DetectionEvent> {
        let row = sqlx::query(
            "SELECT id, video_id, timestamp, event_type, confidence, review_outcome, review_comment, reviewed_at
             FROM detection_events
             WHERE id = ?",
        )
        .bind(event_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => event_from_row(&row),
            None => Err(StoreError::EventNotFound(event_id.clone())),
        }
    }

    /// Sets the review state of one event. Concurrent writers to the same event are
    /// serialized by SQLite and the last write wins.
    pub async fn update_event_review(
        &self,
        event_id: &EventId,
        review: &ReviewState,
    ) -> StoreResult<DetectionEvent> {
        let (outcome, comment, reviewed_at) = match review {
            ReviewState::Unreviewed => (None, None, None),
            ReviewState::Reviewed { outcome, comment } => (
                Some(outcome.as_str()),
                comment.as_deref(),
                Some(Utc::now().trunc_subsecs(3)),
            ),
        };

        let row = sqlx::query(
            "UPDATE detection_events
             SET review_outcome = ?, review_comment = ?, reviewed_at = ?
             WHERE id = ?
             RETURNING id, video_id, timestamp, event_type, confidence, review_outcome, review_comment, reviewed_at",
        )
        .bind(outcome)
        .bind(comment)
        .bind(reviewed_at)
        .bind(event_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => event_from_row(&row),
            None => Err(StoreError::EventNotFound(event_id.clone())),
        }
    }
}

async fn current_state(
    conn: &mut SqliteConnection,
    video_id: &VideoId,
) -> StoreResult<Option<LifecycleState>> {
    let row = sqlx::query("SELECT lifecycle_state FROM videos WHERE id = ?")
        .bind(video_id.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|r| parse_state(&r.get::<String, _>(0))).transpose()
}

async fn fetch_video(conn: &mut SqliteConnection, video_id: &VideoId) -> StoreResult<Option<Video>> {
    let row = sqlx::query(
        "SELECT id, filename, uploaded_at, duration_seconds, storage_ref, lifecycle_state
         FROM videos
         WHERE id = ?",
    )
    .bind(video_id.as_str())
    .fetch_optional(&mut *conn)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let mut video = video_from_row(&row)?;
    video.events = fetch_events(conn, video_id).await?;
    Ok(Some(video))
}

async fn fetch_events(
    conn: &mut SqliteConnection,
    video_id: &VideoId,
) -> StoreResult<Vec<DetectionEvent>> {
    let rows = sqlx::query(
        "SELECT id, video_id, timestamp, event_type, confidence, review_outcome, review_comment, reviewed_at
         FROM detection_events
         WHERE video_id = ?
         ORDER BY timestamp ASC, position ASC",
    )
    .bind(video_id.as_str())
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(event_from_row).collect()
}

fn video_from_row(row: &SqliteRow) -> StoreResult<Video> {
    Ok(Video {
        id: VideoId(row.try_get("id")?),
        filename: row.try_get("filename")?,
        uploaded_at: row.try_get::<DateTime<Utc>, _>("uploaded_at")?,
        duration_seconds: row.try_get("duration_seconds")?,
        storage_ref: row.try_get("storage_ref")?,
        state: parse_state(&row.try_get::<String, _>("lifecycle_state")?)?,
        events: Vec::new(),
    })
}

fn event_from_row(row: &SqliteRow) -> StoreResult<DetectionEvent> {
    let raw_type: String = row.try_get("event_type")?;
    let event_type = EventType::parse(&raw_type)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown event type '{raw_type}'")))?;

    let review = match row.try_get::<Option<String>, _>("review_outcome")? {
        None => ReviewState::Unreviewed,
        Some(raw) => ReviewState::Reviewed {
            outcome: ReviewOutcome::parse(&raw)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown review outcome '{raw}'")))?,
            comment: row.try_get("review_comment")?,
        },
    };

    Ok(DetectionEvent {
        id: EventId(row.try_get("id")?),
        video_id: VideoId(row.try_get("video_id")?),
        timestamp: row.try_get("timestamp")?,
        event_type,
        confidence: row.try_get("confidence")?,
        review,
        reviewed_at: row.try_get::<Option<DateTime<Utc>>, _>("reviewed_at")?,
    })
}

fn parse_state(raw: &str) -> StoreResult<LifecycleState> {
    LifecycleState::parse(raw)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown lifecycle state '{raw}'")))
}

pub fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

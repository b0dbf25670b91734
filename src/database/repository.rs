//! Repository traits over the persistent store.
//!
//! Pipeline code only talks to these traits, never to SQL. Every write is a
//! single-row statement keyed by a primary identifier; there are no
//! cross-row transactions, so related rows (a video's `processed` flag and
//! its frames' statuses) are only eventually consistent after a crash.

use anyhow::Result;
use chrono::{DateTime, Utc};

use super::models::*;

pub trait QueueRepository: Send + Sync {
    /// Insert a pending item unless one already exists for the content id.
    /// Returns the stored row and whether it was newly created.
    fn insert_queue_item_if_absent(&self, item: &NewQueueItem) -> Result<(QueueItem, bool)>;

    fn get_queue_item(&self, content_id: &str) -> Result<Option<QueueItem>>;

    /// Next pending item ordered by (failed_attempts, created_at, id).
    fn next_pending_queue_item(&self) -> Result<Option<QueueItem>>;

    fn count_pending_queue_items(&self) -> Result<i64>;

    fn list_queue_items(&self) -> Result<Vec<QueueItem>>;

    fn set_queue_status(&self, id: i64, status: QueueStatus) -> Result<()>;

    /// Persist the outcome of a failed attempt: new attempt count, the status
    /// the retry policy chose, and the error text.
    fn record_queue_failure(
        &self,
        id: i64,
        failed_attempts: i32,
        status: QueueStatus,
        error: &str,
    ) -> Result<()>;

    /// Put an existing item back to pending with a clean attempt count.
    fn requeue_item(&self, content_id: &str, metadata: &QueueMetadata)
        -> Result<Option<QueueItem>>;

    fn remove_queue_item(&self, content_id: &str) -> Result<bool>;

    /// Crash recovery: items left in `processing` go back to `pending`.
    fn reset_stuck_processing(&self) -> Result<usize>;

    /// Retention cleanup of completed/failed items last touched before `cutoff`.
    fn purge_finished_queue_items(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

pub trait VideoRepository: Send + Sync {
    /// Fetch the video for a content id, creating it on first reference.
    fn ensure_video(&self, content_id: &str, name: &str) -> Result<Video>;

    fn get_video(&self, id: i64) -> Result<Option<Video>>;

    fn get_video_by_content_id(&self, content_id: &str) -> Result<Option<Video>>;

    fn is_video_processed(&self, content_id: &str) -> Result<bool>;

    fn set_video_processing(&self, id: i64, processing: bool) -> Result<()>;

    fn set_video_processed(&self, id: i64, processed: bool) -> Result<()>;

    fn set_video_source(&self, id: i64, local_path: &str, duration_seconds: Option<f64>)
        -> Result<()>;

    fn set_video_audio_path(&self, id: i64, audio_path: Option<&str>) -> Result<()>;

    fn set_stage_flag(&self, id: i64, flag: StageFlag, value: bool) -> Result<()>;

    fn set_report_path(&self, id: i64, report_path: Option<&str>) -> Result<()>;

    fn record_video_error(&self, id: i64, error: &str) -> Result<()>;

    fn clear_video_error(&self, id: i64) -> Result<()>;
}

pub trait FrameRepository: Send + Sync {
    fn insert_frames(&self, video_id: i64, frames: &[NewFrame]) -> Result<usize>;

    fn delete_frames(&self, video_id: i64) -> Result<usize>;

    fn list_frames(&self, video_id: i64) -> Result<Vec<Frame>>;

    /// Frames still waiting for analysis, in frame index order.
    fn pending_frames(&self, video_id: i64) -> Result<Vec<Frame>>;

    fn count_frames(&self, video_id: i64) -> Result<FrameCounts>;

    fn update_frame_primary_path(&self, frame_id: i64, path: &str) -> Result<()>;

    fn mark_frame_retrying(&self, frame_id: i64, attempts: i32, error: &str) -> Result<()>;

    fn mark_frame_completed(
        &self,
        frame_id: i64,
        attempts: i32,
        analysis: &serde_json::Value,
    ) -> Result<()>;

    fn mark_frame_failed(&self, frame_id: i64, attempts: i32, error: &str) -> Result<()>;

    /// Forced re-analysis: every frame of the video goes back to pending.
    fn reset_frames_to_pending(&self, video_id: i64) -> Result<usize>;

    /// A fresh analysis pass gives previously failed frames another chance.
    fn retry_failed_frames(&self, video_id: i64) -> Result<usize>;

    /// Crash recovery: frames left in `retrying` go back to `pending`.
    fn reset_stuck_frames(&self) -> Result<usize>;
}

pub trait ContentRepository: Send + Sync {
    fn replace_transcript(&self, video_id: i64, segments: &[TranscriptSegment]) -> Result<usize>;

    fn get_transcript(&self, video_id: i64) -> Result<Vec<TranscriptSegment>>;

    fn upsert_summary(&self, summary: &Summary) -> Result<()>;

    fn get_summary(&self, video_id: i64) -> Result<Option<Summary>>;

    fn upsert_quiz(&self, quiz: &Quiz) -> Result<()>;

    fn get_quiz(&self, video_id: i64) -> Result<Option<Quiz>>;
}

/// Everything the pipeline needs from persistence.
pub trait Store: QueueRepository + VideoRepository + FrameRepository + ContentRepository {}

impl<T> Store for T where T: QueueRepository + VideoRepository + FrameRepository + ContentRepository
{}

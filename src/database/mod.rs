pub mod models;
pub mod repository;


use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

pub use models::*;
pub use repository::*;

/// SQLite-backed store. One connection behind a mutex; WAL keeps readers
/// from blocking on the single writer.
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// Timestamps are RFC 3339 with microseconds so `created_at` ordering is
/// stable for items enqueued within the same second.
pub(crate) fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("opening database at {:?}", db_path))?;

        // Enable WAL mode for concurrent reads
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA cache_size=10000;
            PRAGMA temp_store=MEMORY;
            PRAGMA foreign_keys=ON;
        ",
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        Ok(db)
    }

    /// A poisoned lock only means another thread panicked mid-statement;
    /// SQLite itself is still consistent, so keep going.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS queue_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content_id TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                failed_attempts INTEGER NOT NULL DEFAULT 0,
                metadata_json TEXT NOT NULL,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_queue_items_order
                ON queue_items(status, failed_attempts, created_at);

            CREATE TABLE IF NOT EXISTS videos (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content_id TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                local_path TEXT,
                audio_path TEXT,
                duration_seconds REAL,
                has_transcription INTEGER NOT NULL DEFAULT 0,
                has_frame_analysis INTEGER NOT NULL DEFAULT 0,
                has_summary INTEGER NOT NULL DEFAULT 0,
                has_quiz INTEGER NOT NULL DEFAULT 0,
                processed INTEGER NOT NULL DEFAULT 0,
                processing INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                last_error_at TEXT,
                report_path TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS frames (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                video_id INTEGER NOT NULL,
                primary_path TEXT NOT NULL,
                alternative_path TEXT,
                timestamp_seconds REAL NOT NULL,
                frame_index INTEGER NOT NULL,
                analysis_json TEXT,
                analysis_status TEXT NOT NULL DEFAULT 'pending',
                analysis_error TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (video_id) REFERENCES videos(id) ON DELETE CASCADE,
                UNIQUE(video_id, frame_index)
            );

            CREATE INDEX IF NOT EXISTS idx_frames_video_status
                ON frames(video_id, analysis_status);

            CREATE TABLE IF NOT EXISTS transcript_segments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                video_id INTEGER NOT NULL,
                start_time REAL NOT NULL,
                end_time REAL NOT NULL,
                text TEXT NOT NULL,
                confidence REAL,
                FOREIGN KEY (video_id) REFERENCES videos(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_segments_video ON transcript_segments(video_id);

            CREATE TABLE IF NOT EXISTS summaries (
                video_id INTEGER PRIMARY KEY,
                text TEXT NOT NULL,
                key_points_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (video_id) REFERENCES videos(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS quizzes (
                video_id INTEGER PRIMARY KEY,
                questions_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (video_id) REFERENCES videos(id) ON DELETE CASCADE
            );
        "#,
        )?;

        Ok(())
    }
}

// =========================================================================
// Row mapping
// =========================================================================

fn json_column<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

const QUEUE_COLUMNS: &str = "id, content_id, display_name, status, failed_attempts,
    metadata_json, last_error, created_at, updated_at";

fn queue_item_from_row(row: &Row<'_>) -> rusqlite::Result<QueueItem> {
    Ok(QueueItem {
        id: row.get(0)?,
        content_id: row.get(1)?,
        display_name: row.get(2)?,
        status: row.get::<_, String>(3)?.into(),
        failed_attempts: row.get(4)?,
        metadata: json_column(row, 5)?,
        last_error: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

const VIDEO_COLUMNS: &str = "id, content_id, name, local_path, audio_path, duration_seconds,
    has_transcription, has_frame_analysis, has_summary, has_quiz, processed, processing,
    last_error, last_error_at, report_path, created_at, updated_at";

fn video_from_row(row: &Row<'_>) -> rusqlite::Result<Video> {
    Ok(Video {
        id: row.get(0)?,
        content_id: row.get(1)?,
        name: row.get(2)?,
        local_path: row.get(3)?,
        audio_path: row.get(4)?,
        duration_seconds: row.get(5)?,
        has_transcription: row.get::<_, i32>(6)? == 1,
        has_frame_analysis: row.get::<_, i32>(7)? == 1,
        has_summary: row.get::<_, i32>(8)? == 1,
        has_quiz: row.get::<_, i32>(9)? == 1,
        processed: row.get::<_, i32>(10)? == 1,
        processing: row.get::<_, i32>(11)? == 1,
        last_error: row.get(12)?,
        last_error_at: row.get(13)?,
        report_path: row.get(14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
    })
}

const FRAME_COLUMNS: &str = "id, video_id, primary_path, alternative_path, timestamp_seconds,
    frame_index, analysis_json, analysis_status, analysis_error, attempts";

fn frame_from_row(row: &Row<'_>) -> rusqlite::Result<Frame> {
    let analysis = match row.get::<_, Option<String>>(6)? {
        Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?),
        None => None,
    };
    Ok(Frame {
        id: row.get(0)?,
        video_id: row.get(1)?,
        primary_path: row.get(2)?,
        alternative_path: row.get(3)?,
        timestamp_seconds: row.get(4)?,
        frame_index: row.get(5)?,
        analysis,
        analysis_status: row.get::<_, String>(7)?.into(),
        analysis_error: row.get(8)?,
        attempts: row.get(9)?,
    })
}

// =========================================================================
// Queue queries
// =========================================================================

impl QueueRepository for Database {
    fn insert_queue_item_if_absent(&self, item: &NewQueueItem) -> Result<(QueueItem, bool)> {
        let conn = self.conn();
        let metadata_json = serde_json::to_string(&item.metadata)?;
        let now = now();

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO queue_items
                (content_id, display_name, status, failed_attempts, metadata_json, created_at, updated_at)
             VALUES (?, ?, 'pending', 0, ?, ?, ?)",
            params![item.content_id, item.display_name, metadata_json, now, now],
        )?;

        let stored = conn.query_row(
            &format!("SELECT {} FROM queue_items WHERE content_id = ?", QUEUE_COLUMNS),
            params![item.content_id],
            queue_item_from_row,
        )?;

        Ok((stored, inserted == 1))
    }

    fn get_queue_item(&self, content_id: &str) -> Result<Option<QueueItem>> {
        let conn = self.conn();
        let item = conn
            .query_row(
                &format!("SELECT {} FROM queue_items WHERE content_id = ?", QUEUE_COLUMNS),
                params![content_id],
                queue_item_from_row,
            )
            .optional()?;
        Ok(item)
    }

    /// Rows whose metadata cannot be decoded are failed in place (metadata
    /// reset to the default, decode error kept as `last_error`) and skipped.
    fn next_pending_queue_item(&self) -> Result<Option<QueueItem>> {
        let conn = self.conn();
        loop {
            let head: Option<(i64, String)> = conn
                .query_row(
                    "SELECT id, content_id FROM queue_items
                     WHERE status = 'pending'
                     ORDER BY failed_attempts ASC, created_at ASC, id ASC
                     LIMIT 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((id, content_id)) = head else {
                return Ok(None);
            };

            match conn.query_row(
                &format!("SELECT {} FROM queue_items WHERE id = ?", QUEUE_COLUMNS),
                params![id],
                queue_item_from_row,
            ) {
                Ok(item) => return Ok(Some(item)),
                Err(rusqlite::Error::FromSqlConversionFailure(_, _, e)) => {
                    let error = format!("unreadable queue metadata: {}", e);
                    log::error!("{} failed permanently: {}", content_id, error);
                    conn.execute(
                        "UPDATE queue_items
                         SET status = 'failed', last_error = ?, metadata_json = ?, updated_at = ?
                         WHERE id = ?",
                        params![
                            error,
                            serde_json::to_string(&QueueMetadata::default())?,
                            now(),
                            id
                        ],
                    )?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn count_pending_queue_items(&self) -> Result<i64> {
        let conn = self.conn();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM queue_items WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn list_queue_items(&self) -> Result<Vec<QueueItem>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM queue_items ORDER BY failed_attempts ASC, created_at ASC, id ASC",
            QUEUE_COLUMNS
        ))?;
        let items = stmt
            .query_map([], queue_item_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    fn set_queue_status(&self, id: i64, status: QueueStatus) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE queue_items SET status = ?, updated_at = ? WHERE id = ?",
            params![status.as_str(), now(), id],
        )?;
        Ok(())
    }

    fn record_queue_failure(
        &self,
        id: i64,
        failed_attempts: i32,
        status: QueueStatus,
        error: &str,
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE queue_items
             SET failed_attempts = ?, status = ?, last_error = ?, updated_at = ?
             WHERE id = ?",
            params![failed_attempts, status.as_str(), error, now(), id],
        )?;
        Ok(())
    }

    fn requeue_item(
        &self,
        content_id: &str,
        metadata: &QueueMetadata,
    ) -> Result<Option<QueueItem>> {
        let conn = self.conn();
        let metadata_json = serde_json::to_string(metadata)?;
        let changed = conn.execute(
            "UPDATE queue_items
             SET status = 'pending', failed_attempts = 0, last_error = NULL,
                 metadata_json = ?, updated_at = ?
             WHERE content_id = ? AND status != 'processing'",
            params![metadata_json, now(), content_id],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        let item = conn
            .query_row(
                &format!("SELECT {} FROM queue_items WHERE content_id = ?", QUEUE_COLUMNS),
                params![content_id],
                queue_item_from_row,
            )
            .optional()?;
        Ok(item)
    }

    fn remove_queue_item(&self, content_id: &str) -> Result<bool> {
        let conn = self.conn();
        let removed = conn.execute(
            "DELETE FROM queue_items WHERE content_id = ? AND status != 'processing'",
            params![content_id],
        )?;
        Ok(removed > 0)
    }

    fn reset_stuck_processing(&self) -> Result<usize> {
        let conn = self.conn();
        let count = conn.execute(
            "UPDATE queue_items SET status = 'pending', updated_at = ? WHERE status = 'processing'",
            params![now()],
        )?;
        conn.execute("UPDATE videos SET processing = 0 WHERE processing = 1", [])?;
        if count > 0 {
            log::info!("Reset {} stuck processing items to pending", count);
        }
        Ok(count)
    }

    fn purge_finished_queue_items(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn();
        let cutoff = cutoff.to_rfc3339_opts(SecondsFormat::Micros, true);
        let count = conn.execute(
            "DELETE FROM queue_items
             WHERE status IN ('completed', 'failed') AND updated_at < ?",
            params![cutoff],
        )?;
        Ok(count)
    }
}

// =========================================================================
// Video queries
// =========================================================================

impl Database {
    fn update_video(&self, sql: &str, params: impl rusqlite::Params) -> Result<()> {
        let conn = self.conn();
        let changed = conn.execute(sql, params)?;
        if changed == 0 {
            anyhow::bail!("video not found");
        }
        Ok(())
    }
}

impl VideoRepository for Database {
    fn ensure_video(&self, content_id: &str, name: &str) -> Result<Video> {
        let conn = self.conn();
        let now = now();
        conn.execute(
            "INSERT OR IGNORE INTO videos (content_id, name, created_at, updated_at)
             VALUES (?, ?, ?, ?)",
            params![content_id, name, now, now],
        )?;
        let video = conn.query_row(
            &format!("SELECT {} FROM videos WHERE content_id = ?", VIDEO_COLUMNS),
            params![content_id],
            video_from_row,
        )?;
        Ok(video)
    }

    fn get_video(&self, id: i64) -> Result<Option<Video>> {
        let conn = self.conn();
        let video = conn
            .query_row(
                &format!("SELECT {} FROM videos WHERE id = ?", VIDEO_COLUMNS),
                params![id],
                video_from_row,
            )
            .optional()?;
        Ok(video)
    }

    fn get_video_by_content_id(&self, content_id: &str) -> Result<Option<Video>> {
        let conn = self.conn();
        let video = conn
            .query_row(
                &format!("SELECT {} FROM videos WHERE content_id = ?", VIDEO_COLUMNS),
                params![content_id],
                video_from_row,
            )
            .optional()?;
        Ok(video)
    }

    fn is_video_processed(&self, content_id: &str) -> Result<bool> {
        let conn = self.conn();
        let processed: Option<i32> = conn
            .query_row(
                "SELECT processed FROM videos WHERE content_id = ?",
                params![content_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(processed == Some(1))
    }

    fn set_video_processing(&self, id: i64, processing: bool) -> Result<()> {
        self.update_video(
            "UPDATE videos SET processing = ?, updated_at = ? WHERE id = ?",
            params![processing as i32, now(), id],
        )
    }

    fn set_video_processed(&self, id: i64, processed: bool) -> Result<()> {
        self.update_video(
            "UPDATE videos SET processed = ?, updated_at = ? WHERE id = ?",
            params![processed as i32, now(), id],
        )
    }

    fn set_video_source(
        &self,
        id: i64,
        local_path: &str,
        duration_seconds: Option<f64>,
    ) -> Result<()> {
        self.update_video(
            "UPDATE videos SET local_path = ?, duration_seconds = COALESCE(?, duration_seconds),
                 updated_at = ?
             WHERE id = ?",
            params![local_path, duration_seconds, now(), id],
        )
    }

    fn set_video_audio_path(&self, id: i64, audio_path: Option<&str>) -> Result<()> {
        self.update_video(
            "UPDATE videos SET audio_path = ?, updated_at = ? WHERE id = ?",
            params![audio_path, now(), id],
        )
    }

    fn set_stage_flag(&self, id: i64, flag: StageFlag, value: bool) -> Result<()> {
        let sql = format!(
            "UPDATE videos SET {} = ?, updated_at = ? WHERE id = ?",
            flag.column()
        );
        self.update_video(&sql, params![value as i32, now(), id])
    }

    fn set_report_path(&self, id: i64, report_path: Option<&str>) -> Result<()> {
        self.update_video(
            "UPDATE videos SET report_path = ?, updated_at = ? WHERE id = ?",
            params![report_path, now(), id],
        )
    }

    fn record_video_error(&self, id: i64, error: &str) -> Result<()> {
        let now = now();
        self.update_video(
            "UPDATE videos SET last_error = ?, last_error_at = ?, updated_at = ? WHERE id = ?",
            params![error, now, now, id],
        )
    }

    fn clear_video_error(&self, id: i64) -> Result<()> {
        self.update_video(
            "UPDATE videos SET last_error = NULL, last_error_at = NULL, updated_at = ? WHERE id = ?",
            params![now(), id],
        )
    }
}

// =========================================================================
// Frame queries
// =========================================================================

impl FrameRepository for Database {
    fn insert_frames(&self, video_id: i64, frames: &[NewFrame]) -> Result<usize> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "INSERT OR REPLACE INTO frames
                (video_id, primary_path, alternative_path, timestamp_seconds, frame_index,
                 analysis_status, attempts)
             VALUES (?, ?, ?, ?, ?, 'pending', 0)",
        )?;
        let mut inserted = 0;
        for frame in frames {
            inserted += stmt.execute(params![
                video_id,
                frame.primary_path,
                frame.alternative_path,
                frame.timestamp_seconds,
                frame.frame_index,
            ])?;
        }
        Ok(inserted)
    }

    fn delete_frames(&self, video_id: i64) -> Result<usize> {
        let conn = self.conn();
        let count = conn.execute("DELETE FROM frames WHERE video_id = ?", params![video_id])?;
        Ok(count)
    }

    fn list_frames(&self, video_id: i64) -> Result<Vec<Frame>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM frames WHERE video_id = ? ORDER BY frame_index ASC",
            FRAME_COLUMNS
        ))?;
        let frames = stmt
            .query_map(params![video_id], frame_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(frames)
    }

    fn pending_frames(&self, video_id: i64) -> Result<Vec<Frame>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM frames
             WHERE video_id = ? AND analysis_status = 'pending'
             ORDER BY frame_index ASC",
            FRAME_COLUMNS
        ))?;
        let frames = stmt
            .query_map(params![video_id], frame_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(frames)
    }

    fn count_frames(&self, video_id: i64) -> Result<FrameCounts> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT analysis_status, COUNT(*) FROM frames WHERE video_id = ? GROUP BY analysis_status",
        )?;
        let mut counts = FrameCounts::default();
        let rows = stmt.query_map(params![video_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            match FrameStatus::from(status) {
                FrameStatus::Pending => counts.pending += count,
                FrameStatus::Retrying => counts.retrying += count,
                FrameStatus::Completed => counts.completed += count,
                FrameStatus::Failed => counts.failed += count,
            }
        }
        Ok(counts)
    }

    fn update_frame_primary_path(&self, frame_id: i64, path: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE frames SET primary_path = ? WHERE id = ?",
            params![path, frame_id],
        )?;
        Ok(())
    }

    fn mark_frame_retrying(&self, frame_id: i64, attempts: i32, error: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE frames SET analysis_status = 'retrying', attempts = ?, analysis_error = ?
             WHERE id = ?",
            params![attempts, error, frame_id],
        )?;
        Ok(())
    }

    fn mark_frame_completed(
        &self,
        frame_id: i64,
        attempts: i32,
        analysis: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.conn();
        let analysis_json = serde_json::to_string(analysis)?;
        conn.execute(
            "UPDATE frames
             SET analysis_status = 'completed', attempts = ?, analysis_json = ?, analysis_error = NULL
             WHERE id = ?",
            params![attempts, analysis_json, frame_id],
        )?;
        Ok(())
    }

    fn mark_frame_failed(&self, frame_id: i64, attempts: i32, error: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE frames SET analysis_status = 'failed', attempts = ?, analysis_error = ?
             WHERE id = ?",
            params![attempts, error, frame_id],
        )?;
        Ok(())
    }

    fn reset_frames_to_pending(&self, video_id: i64) -> Result<usize> {
        let conn = self.conn();
        let count = conn.execute(
            "UPDATE frames
             SET analysis_status = 'pending', attempts = 0, analysis_json = NULL, analysis_error = NULL
             WHERE video_id = ?",
            params![video_id],
        )?;
        Ok(count)
    }

    fn retry_failed_frames(&self, video_id: i64) -> Result<usize> {
        let conn = self.conn();
        let count = conn.execute(
            "UPDATE frames SET analysis_status = 'pending', attempts = 0
             WHERE video_id = ? AND analysis_status = 'failed'",
            params![video_id],
        )?;
        Ok(count)
    }

    fn reset_stuck_frames(&self) -> Result<usize> {
        let conn = self.conn();
        let count = conn.execute(
            "UPDATE frames SET analysis_status = 'pending' WHERE analysis_status = 'retrying'",
            [],
        )?;
        if count > 0 {
            log::info!("Reset {} frames stuck in retrying to pending", count);
        }
        Ok(count)
    }
}

// =========================================================================
// Transcript / summary / quiz
// =========================================================================

impl ContentRepository for Database {
    fn replace_transcript(&self, video_id: i64, segments: &[TranscriptSegment]) -> Result<usize> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM transcript_segments WHERE video_id = ?",
            params![video_id],
        )?;
        let mut stmt = conn.prepare(
            "INSERT INTO transcript_segments (video_id, start_time, end_time, text, confidence)
             VALUES (?, ?, ?, ?, ?)",
        )?;
        for segment in segments {
            stmt.execute(params![
                video_id,
                segment.start_time,
                segment.end_time,
                segment.text,
                segment.confidence,
            ])?;
        }
        Ok(segments.len())
    }

    fn get_transcript(&self, video_id: i64) -> Result<Vec<TranscriptSegment>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT video_id, start_time, end_time, text, confidence
             FROM transcript_segments WHERE video_id = ? ORDER BY start_time ASC, id ASC",
        )?;
        let segments = stmt
            .query_map(params![video_id], |row| {
                Ok(TranscriptSegment {
                    video_id: row.get(0)?,
                    start_time: row.get(1)?,
                    end_time: row.get(2)?,
                    text: row.get(3)?,
                    confidence: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(segments)
    }

    fn upsert_summary(&self, summary: &Summary) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO summaries (video_id, text, key_points_json, created_at)
             VALUES (?, ?, ?, ?)",
            params![
                summary.video_id,
                summary.text,
                serde_json::to_string(&summary.key_points)?,
                summary.created_at,
            ],
        )?;
        Ok(())
    }

    fn get_summary(&self, video_id: i64) -> Result<Option<Summary>> {
        let conn = self.conn();
        let summary = conn
            .query_row(
                "SELECT video_id, text, key_points_json, created_at FROM summaries WHERE video_id = ?",
                params![video_id],
                |row| {
                    Ok(Summary {
                        video_id: row.get(0)?,
                        text: row.get(1)?,
                        key_points: json_column(row, 2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(summary)
    }

    fn upsert_quiz(&self, quiz: &Quiz) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO quizzes (video_id, questions_json, created_at) VALUES (?, ?, ?)",
            params![
                quiz.video_id,
                serde_json::to_string(&quiz.questions)?,
                quiz.created_at,
            ],
        )?;
        Ok(())
    }

    fn get_quiz(&self, video_id: i64) -> Result<Option<Quiz>> {
        let conn = self.conn();
        let quiz = conn
            .query_row(
                "SELECT video_id, questions_json, created_at FROM quizzes WHERE video_id = ?",
                params![video_id],
                |row| {
                    Ok(Quiz {
                        video_id: row.get(0)?,
                        questions: json_column(row, 1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(quiz)
    }
}

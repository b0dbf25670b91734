use serde::{Deserialize, Serialize};

// ============================================================================
// Status enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for QueueStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Analysis state of a single frame.
///
/// `Retrying` is only ever observed while the batcher is between attempts;
/// a frame left in it after a crash is reset to `Pending` on startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameStatus {
    #[default]
    Pending,
    Retrying,
    Completed,
    Failed,
}

impl FrameStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for FrameStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for FrameStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "retrying" => Self::Retrying,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

// ============================================================================
// Queue
// ============================================================================

/// Where a queue item came from. Stored as JSON in `queue_items.metadata_json`
/// and parsed back on every read, so a malformed row surfaces as an error
/// instead of a silently empty blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueMetadata {
    Discovered {
        mime_type: Option<String>,
        size_bytes: Option<u64>,
    },
    Requested {
        #[serde(default)]
        force: bool,
        requested_by: Option<String>,
    },
}

impl QueueMetadata {
    pub fn force(&self) -> bool {
        matches!(self, Self::Requested { force: true, .. })
    }
}

impl Default for QueueMetadata {
    fn default() -> Self {
        Self::Requested {
            force: false,
            requested_by: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    pub content_id: String,
    pub display_name: String,
    pub status: QueueStatus,
    pub failed_attempts: i32,
    pub metadata: QueueMetadata,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub content_id: String,
    pub display_name: String,
    pub metadata: QueueMetadata,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueSnapshot {
    pub pending: Vec<QueueItem>,
    pub processing: Vec<QueueItem>,
    pub completed: Vec<QueueItem>,
    pub failed: Vec<QueueItem>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
}

// ============================================================================
// Videos
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Video {
    pub id: i64,
    pub content_id: String,
    pub name: String,
    pub local_path: Option<String>,
    pub audio_path: Option<String>,
    pub duration_seconds: Option<f64>,
    pub has_transcription: bool,
    pub has_frame_analysis: bool,
    pub has_summary: bool,
    pub has_quiz: bool,
    pub processed: bool,
    pub processing: bool,
    pub last_error: Option<String>,
    pub last_error_at: Option<String>,
    pub report_path: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Video {
    pub fn stage_flags(&self) -> StageFlags {
        StageFlags {
            has_transcription: self.has_transcription,
            has_frame_analysis: self.has_frame_analysis,
            has_summary: self.has_summary,
            has_quiz: self.has_quiz,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFlags {
    pub has_transcription: bool,
    pub has_frame_analysis: bool,
    pub has_summary: bool,
    pub has_quiz: bool,
}

/// One column of the `videos` table that a pipeline stage flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageFlag {
    Transcription,
    FrameAnalysis,
    Summary,
    Quiz,
}

impl StageFlag {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            Self::Transcription => "has_transcription",
            Self::FrameAnalysis => "has_frame_analysis",
            Self::Summary => "has_summary",
            Self::Quiz => "has_quiz",
        }
    }
}

// ============================================================================
// Frames
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: i64,
    pub video_id: i64,
    pub primary_path: String,
    pub alternative_path: Option<String>,
    pub timestamp_seconds: f64,
    pub frame_index: i64,
    pub analysis: Option<serde_json::Value>,
    pub analysis_status: FrameStatus,
    pub analysis_error: Option<String>,
    pub attempts: i32,
}

#[derive(Debug, Clone)]
pub struct NewFrame {
    pub primary_path: String,
    pub alternative_path: Option<String>,
    pub timestamp_seconds: f64,
    pub frame_index: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrameCounts {
    pub pending: i64,
    pub retrying: i64,
    pub completed: i64,
    pub failed: i64,
}

impl FrameCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.retrying + self.completed + self.failed
    }
}

// ============================================================================
// Derived content
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub video_id: i64,
    pub start_time: f64,
    pub end_time: f64,
    pub text: String,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub video_id: i64,
    pub text: String,
    pub key_points: Vec<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizQuestion {
    pub question: String,
    pub options: Vec<String>,
    pub answer_index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quiz {
    pub video_id: i64,
    pub questions: Vec<QuizQuestion>,
    pub created_at: String,
}

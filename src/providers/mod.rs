//! Boundaries to the outside world.
//!
//! The pipeline only sees these traits. Each has one shipped implementation
//! (HTTP gateway, Ollama + whisper.cpp, ffmpeg, Markdown report) and tests
//! substitute in-memory fakes.

pub mod analyzer;
pub mod ffmpeg;
pub mod gateway;
pub mod ollama;
pub mod report;
pub mod whisper;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::database::{Frame, FrameCounts, Quiz, QuizQuestion, Summary, TranscriptSegment, Video};

// ============================================================================
// Content network
// ============================================================================

/// One entry of the remote content listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl RemoteItem {
    /// Media filter: explicit `video/*` MIME type, or a video type guessed
    /// from the file name when the listing carries no usable MIME type.
    pub fn is_video(&self) -> bool {
        if let Some(mime) = self.mime_type.as_deref() {
            if mime.to_ascii_lowercase().starts_with("video/") {
                return true;
            }
        }
        mime_guess::from_path(&self.name)
            .iter()
            .any(|m| m.type_() == mime_guess::mime::VIDEO)
    }
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub dest_dir: PathBuf,
    pub file_name: String,
}

#[async_trait]
pub trait ContentProvider: Send + Sync {
    async fn list(&self) -> Result<Vec<RemoteItem>>;

    /// Fetch the content into `opts.dest_dir` and return the local path.
    async fn download(&self, id: &str, opts: &DownloadOptions) -> Result<PathBuf>;

    async fn pin(&self, id: &str) -> Result<()>;
}

// ============================================================================
// Analysis
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisContext {
    pub video_name: String,
    pub timestamp_seconds: f64,
    pub frame_index: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptChunk {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameNote {
    pub timestamp_seconds: f64,
    pub analysis: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryInput {
    pub video_name: String,
    pub duration_seconds: Option<f64>,
    pub transcript: Vec<TranscriptSegment>,
    pub frame_notes: Vec<FrameNote>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryDraft {
    pub text: String,
    #[serde(default)]
    pub key_points: Vec<String>,
}

#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    async fn analyze_image(
        &self,
        path: &Path,
        context: &AnalysisContext,
    ) -> Result<serde_json::Value>;

    async fn transcribe(&self, audio_path: &Path) -> Result<Vec<TranscriptChunk>>;

    async fn summarize(&self, input: &SummaryInput) -> Result<SummaryDraft>;

    async fn generate_quiz(&self, summary: &Summary) -> Result<Vec<QuizQuestion>>;
}

// ============================================================================
// Decode / transcode
// ============================================================================

#[async_trait]
pub trait MediaTool: Send + Sync {
    async fn probe_duration(&self, video: &Path) -> Result<f64>;

    /// Write a single still taken at `at_seconds` to `out`.
    async fn extract_frame(&self, video: &Path, at_seconds: f64, out: &Path) -> Result<()>;

    /// Write the audio track to `out` as 16 kHz mono PCM WAV.
    async fn extract_audio(&self, video: &Path, out: &Path) -> Result<()>;
}

// ============================================================================
// Reports
// ============================================================================

#[derive(Debug, Clone)]
pub struct ReportInput {
    pub video: Video,
    pub summary: Option<Summary>,
    pub quiz: Option<Quiz>,
    pub transcript: Vec<TranscriptSegment>,
    pub frame_counts: FrameCounts,
    pub analyzed_frames: Vec<Frame>,
}

#[async_trait]
pub trait ReportRenderer: Send + Sync {
    async fn render(&self, input: &ReportInput, out_dir: &Path) -> Result<PathBuf>;
}

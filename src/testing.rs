//! In-memory providers for unit tests.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

use crate::database::{QuizQuestion, Summary};
use crate::providers::{
    AnalysisContext, AnalysisProvider, ContentProvider, DownloadOptions, MediaTool, RemoteItem,
    ReportInput, ReportRenderer, SummaryDraft, SummaryInput, TranscriptChunk,
};

// ============================================================================
// Media
// ============================================================================

pub struct FakeMedia {
    duration: f64,
    frames_written: AtomicUsize,
    fail_audio: AtomicBool,
}

impl FakeMedia {
    pub fn new(duration: f64) -> Self {
        Self {
            duration,
            frames_written: AtomicUsize::new(0),
            fail_audio: AtomicBool::new(false),
        }
    }

    pub fn failing_audio(self) -> Self {
        self.fail_audio.store(true, Ordering::SeqCst);
        self
    }

    pub fn frames_written(&self) -> usize {
        self.frames_written.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaTool for FakeMedia {
    async fn probe_duration(&self, _video: &Path) -> Result<f64> {
        Ok(self.duration)
    }

    async fn extract_frame(&self, _video: &Path, at_seconds: f64, out: &Path) -> Result<()> {
        tokio::fs::write(out, format!("still@{:.3}", at_seconds)).await?;
        self.frames_written.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn extract_audio(&self, _video: &Path, out: &Path) -> Result<()> {
        if self.fail_audio.load(Ordering::SeqCst) {
            anyhow::bail!("no audio stream");
        }
        tokio::fs::write(out, b"RIFF....WAVEfmt ").await?;
        Ok(())
    }
}

// ============================================================================
// Analysis
// ============================================================================

#[derive(Default)]
pub struct FakeAnalysis {
    failing: HashSet<i64>,
    flaky: Mutex<HashMap<i64, usize>>,
    delay: Option<Duration>,
    fail_summary: bool,
    image_calls: AtomicUsize,
    transcribe_calls: AtomicUsize,
    summarize_calls: AtomicUsize,
    quiz_calls: AtomicUsize,
}

impl FakeAnalysis {
    /// Frames with these indexes fail on every attempt.
    pub fn failing_frames(mut self, indexes: impl IntoIterator<Item = i64>) -> Self {
        self.failing.extend(indexes);
        self
    }

    /// The frame fails its first `failures` attempts, then succeeds.
    pub fn flaky_frame(self, index: i64, failures: usize) -> Self {
        if let Ok(mut flaky) = self.flaky.lock() {
            flaky.insert(index, failures);
        }
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing_summary(mut self) -> Self {
        self.fail_summary = true;
        self
    }

    pub fn image_calls(&self) -> usize {
        self.image_calls.load(Ordering::SeqCst)
    }

    pub fn transcribe_calls(&self) -> usize {
        self.transcribe_calls.load(Ordering::SeqCst)
    }

    pub fn summarize_calls(&self) -> usize {
        self.summarize_calls.load(Ordering::SeqCst)
    }

    pub fn quiz_calls(&self) -> usize {
        self.quiz_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnalysisProvider for FakeAnalysis {
    async fn analyze_image(
        &self,
        _path: &Path,
        context: &AnalysisContext,
    ) -> Result<serde_json::Value> {
        self.image_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.contains(&context.frame_index) {
            anyhow::bail!("vision model rejected frame {}", context.frame_index);
        }
        {
            let mut flaky = self.flaky.lock().unwrap();
            if let Some(remaining) = flaky.get_mut(&context.frame_index) {
                if *remaining > 0 {
                    *remaining -= 1;
                    anyhow::bail!("connection reset");
                }
            }
        }
        Ok(json!({
            "description": format!("slide at {:.1}s", context.timestamp_seconds),
            "text": ["Agenda"],
        }))
    }

    async fn transcribe(&self, _audio_path: &Path) -> Result<Vec<TranscriptChunk>> {
        self.transcribe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![
            TranscriptChunk {
                start: 0.0,
                end: 2.5,
                text: " Welcome to the talk.".to_string(),
                confidence: Some(0.9),
            },
            TranscriptChunk {
                start: 2.5,
                end: 3.0,
                text: "   ".to_string(),
                confidence: None,
            },
            TranscriptChunk {
                start: 3.0,
                end: 6.0,
                text: "Today we cover queues.".to_string(),
                confidence: Some(0.8),
            },
        ])
    }

    async fn summarize(&self, input: &SummaryInput) -> Result<SummaryDraft> {
        self.summarize_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_summary {
            anyhow::bail!("text model unavailable");
        }
        Ok(SummaryDraft {
            text: format!(
                "{}: {} segments, {} frames",
                input.video_name,
                input.transcript.len(),
                input.frame_notes.len()
            ),
            key_points: vec!["queues".to_string()],
        })
    }

    async fn generate_quiz(&self, _summary: &Summary) -> Result<Vec<QuizQuestion>> {
        self.quiz_calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![QuizQuestion {
            question: "What does the talk cover?".to_string(),
            options: vec!["Queues".to_string(), "Cooking".to_string()],
            answer_index: 0,
        }])
    }
}

// ============================================================================
// Content network
// ============================================================================

pub struct FakeContent {
    items: Vec<RemoteItem>,
    list_failures: AtomicUsize,
    fail_download: AtomicBool,
    list_calls: AtomicUsize,
    downloads: AtomicUsize,
    pins: AtomicUsize,
    gated: bool,
    list_started: Notify,
    release: Semaphore,
}

impl FakeContent {
    pub fn new(items: Vec<RemoteItem>) -> Self {
        Self {
            items,
            list_failures: AtomicUsize::new(0),
            fail_download: AtomicBool::new(false),
            list_calls: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
            pins: AtomicUsize::new(0),
            gated: false,
            list_started: Notify::new(),
            release: Semaphore::new(0),
        }
    }

    /// The first `n` listings fail.
    pub fn failing_lists(self, n: usize) -> Self {
        self.list_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn failing_downloads(self) -> Self {
        self.fail_download.store(true, Ordering::SeqCst);
        self
    }

    /// Listings block until [`FakeContent::release_list`] is called.
    pub fn gated(mut self) -> Self {
        self.gated = true;
        self
    }

    pub async fn wait_list_started(&self) {
        self.list_started.notified().await;
    }

    pub fn release_list(&self) {
        self.release.add_permits(1);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn pins(&self) -> usize {
        self.pins.load(Ordering::SeqCst)
    }
}

pub fn remote_item(id: &str, name: &str, mime_type: Option<&str>) -> RemoteItem {
    RemoteItem {
        id: id.to_string(),
        name: name.to_string(),
        mime_type: mime_type.map(str::to_string),
        size: Some(1024),
    }
}

#[async_trait]
impl ContentProvider for FakeContent {
    async fn list(&self) -> Result<Vec<RemoteItem>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.gated {
            self.list_started.notify_one();
            self.release.acquire().await?.forget();
        }
        let remaining = self.list_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.list_failures.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("gateway returned 503");
        }
        Ok(self.items.clone())
    }

    async fn download(&self, id: &str, opts: &DownloadOptions) -> Result<PathBuf> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if self.fail_download.load(Ordering::SeqCst) {
            anyhow::bail!("download of {} timed out", id);
        }
        tokio::fs::create_dir_all(&opts.dest_dir).await?;
        let path = opts.dest_dir.join(&opts.file_name);
        tokio::fs::write(&path, format!("video bytes of {}", id)).await?;
        Ok(path)
    }

    async fn pin(&self, _id: &str) -> Result<()> {
        self.pins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Reports
// ============================================================================

#[derive(Default)]
pub struct FakeRenderer {
    renders: AtomicUsize,
}

impl FakeRenderer {
    pub fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReportRenderer for FakeRenderer {
    async fn render(&self, input: &ReportInput, out_dir: &Path) -> Result<PathBuf> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        tokio::fs::create_dir_all(out_dir).await?;
        let path = out_dir.join("report.md");
        tokio::fs::write(&path, format!("# {}\n", input.video.name)).await?;
        Ok(path)
    }
}

//! Per-video stage pipeline.
//!
//! Stages run in the order given, each one skipped when its output already
//! exists (unless forced). Outcomes are collected into a [`RunReport`]
//! instead of being thrown; a failed stage blocks the stages that depend on
//! it unless `continue_on_error` is set.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use super::batcher::FrameAnalysisBatcher;
use super::frames::{self, FRAMES_DIR};
use crate::config::Config;
use crate::database::{
    now, FrameStatus, Quiz, StageFlag, Store, Summary, TranscriptSegment, Video,
};
use crate::providers::gateway::safe_file_name;
use crate::providers::{
    AnalysisProvider, ContentProvider, DownloadOptions, FrameNote, MediaTool, ReportInput,
    ReportRenderer, SummaryInput,
};

const AUDIO_FILE: &str = "audio.wav";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Download,
    ExtractFrames,
    AnalyzeFrames,
    ExtractAudio,
    Transcribe,
    Summarize,
    GenerateQuiz,
    RenderReport,
}

impl Stage {
    /// The full sequence, in execution order.
    pub const ALL: [Stage; 8] = [
        Stage::Download,
        Stage::ExtractFrames,
        Stage::AnalyzeFrames,
        Stage::ExtractAudio,
        Stage::Transcribe,
        Stage::Summarize,
        Stage::GenerateQuiz,
        Stage::RenderReport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::ExtractFrames => "extract_frames",
            Self::AnalyzeFrames => "analyze_frames",
            Self::ExtractAudio => "extract_audio",
            Self::Transcribe => "transcribe",
            Self::Summarize => "summarize",
            Self::GenerateQuiz => "generate_quiz",
            Self::RenderReport => "render_report",
        }
    }

    /// Stages whose failure blocks this one.
    pub fn dependencies(&self) -> &'static [Stage] {
        match self {
            Self::Download => &[],
            Self::ExtractFrames | Self::ExtractAudio => &[Stage::Download],
            Self::AnalyzeFrames => &[Stage::ExtractFrames],
            Self::Transcribe => &[Stage::ExtractAudio],
            Self::Summarize => &[Stage::AnalyzeFrames],
            Self::GenerateQuiz | Self::RenderReport => &[Stage::Summarize],
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    pub force: bool,
    pub continue_on_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    Completed,
    /// Tolerated partial completion (frame analysis above threshold).
    Partial { completed: usize, attempted: usize },
    AlreadyDone,
    Blocked { by: Stage },
    Failed { error: String },
}

impl StageOutcome {
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Partial { .. } | Self::AlreadyDone
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Blocked { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageResult {
    pub stage: Stage,
    #[serde(flatten)]
    pub outcome: StageOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub video_id: i64,
    pub content_id: String,
    pub results: Vec<StageResult>,
    pub processed: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn outcome(&self, stage: Stage) -> Option<&StageOutcome> {
        self.results
            .iter()
            .find(|r| r.stage == stage)
            .map(|r| &r.outcome)
    }

    /// `"<stage>: <error>"` for the first failed stage.
    pub fn first_error(&self) -> Option<String> {
        self.results.iter().find_map(|r| match &r.outcome {
            StageOutcome::Failed { error } => Some(format!("{}: {}", r.stage, error)),
            _ => None,
        })
    }

    /// Whether any stage actually ran.
    pub fn did_work(&self) -> bool {
        self.results.iter().any(|r| {
            matches!(
                r.outcome,
                StageOutcome::Completed | StageOutcome::Partial { .. } | StageOutcome::Failed { .. }
            )
        })
    }
}

/// The external collaborators a pipeline run drives.
#[derive(Clone)]
pub struct Providers {
    pub content: Arc<dyn ContentProvider>,
    pub analysis: Arc<dyn AnalysisProvider>,
    pub media: Arc<dyn MediaTool>,
    pub renderer: Arc<dyn ReportRenderer>,
}

pub struct PipelineRunner {
    store: Arc<dyn Store>,
    providers: Providers,
    batcher: FrameAnalysisBatcher,
    videos_dir: PathBuf,
    sample_rate: f64,
    max_frames: usize,
}

fn existing_file(path: Option<&str>) -> Option<PathBuf> {
    path.map(PathBuf::from).filter(|p| p.is_file())
}

impl PipelineRunner {
    pub fn new(store: Arc<dyn Store>, providers: Providers, config: &Config) -> Self {
        Self {
            batcher: FrameAnalysisBatcher::new(
                store.clone(),
                providers.analysis.clone(),
                config.batcher.clone(),
            ),
            store,
            providers,
            videos_dir: config.storage.videos_dir(),
            sample_rate: config.pipeline.sample_rate,
            max_frames: config.pipeline.max_frames,
        }
    }

    /// Working directory of one video: download, audio, frames, report.
    pub fn video_dir(&self, video: &Video) -> PathBuf {
        self.videos_dir.join(safe_file_name(&video.content_id))
    }

    pub fn frames_dir(&self, video: &Video) -> PathBuf {
        self.video_dir(video).join(FRAMES_DIR)
    }

    pub async fn run(&self, video_id: i64, stages: &[Stage], options: RunOptions) -> Result<RunReport> {
        let video = self
            .store
            .get_video(video_id)?
            .with_context(|| format!("video {} not found", video_id))?;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        if video.processed && !options.force {
            log::info!(
                "Video {} ({}) already processed, nothing to do",
                video.id,
                video.content_id
            );
            return Ok(RunReport {
                run_id,
                video_id,
                content_id: video.content_id,
                results: stages
                    .iter()
                    .map(|&stage| StageResult {
                        stage,
                        outcome: StageOutcome::AlreadyDone,
                    })
                    .collect(),
                processed: true,
                started_at,
                finished_at: Utc::now(),
            });
        }

        log::info!(
            "Run {} for video {} ({}): {} stages, force={}, continue_on_error={}",
            run_id,
            video.id,
            video.content_id,
            stages.len(),
            options.force,
            options.continue_on_error
        );

        self.store.set_video_processing(video.id, true)?;
        let results = self.run_stages(video.id, stages, options).await;
        let finished = self.finish(video.id, &results);
        if let Err(e) = self.store.set_video_processing(video.id, false) {
            log::warn!("Failed to clear processing flag of video {}: {:#}", video.id, e);
        }
        let processed = finished?;

        let report = RunReport {
            run_id,
            video_id,
            content_id: video.content_id,
            results,
            processed,
            started_at,
            finished_at: Utc::now(),
        };
        log::info!(
            "Run {} finished: processed={}, first error={:?}",
            run_id,
            report.processed,
            report.first_error()
        );
        Ok(report)
    }

    async fn run_stages(&self, video_id: i64, stages: &[Stage], options: RunOptions) -> Vec<StageResult> {
        let mut results: Vec<StageResult> = Vec::with_capacity(stages.len());

        for &stage in stages {
            if !options.continue_on_error {
                let blocker = stage.dependencies().iter().copied().find(|dep| {
                    results
                        .iter()
                        .any(|r| r.stage == *dep && r.outcome.is_failure())
                });
                if let Some(by) = blocker {
                    log::warn!("Video {}: {} blocked by failed {}", video_id, stage, by);
                    results.push(StageResult {
                        stage,
                        outcome: StageOutcome::Blocked { by },
                    });
                    continue;
                }
            }

            let outcome = match self.run_stage(video_id, stage, options.force).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let error = format!("{:#}", e);
                    log::error!("Video {}: {} failed: {}", video_id, stage, error);
                    StageOutcome::Failed { error }
                }
            };
            results.push(StageResult { stage, outcome });
        }

        results
    }

    /// Recompute `processed` from persisted state and record the run's
    /// first error on the video.
    fn finish(&self, video_id: i64, results: &[StageResult]) -> Result<bool> {
        let video = self
            .store
            .get_video(video_id)?
            .with_context(|| format!("video {} disappeared during run", video_id))?;

        let mut processed = true;
        for stage in Stage::ALL {
            if !self.stage_done(&video, stage)? {
                processed = false;
                break;
            }
        }
        self.store.set_video_processed(video.id, processed)?;

        let first_error = results.iter().find_map(|r| match &r.outcome {
            StageOutcome::Failed { error } => Some(format!("{}: {}", r.stage, error)),
            _ => None,
        });
        match first_error {
            Some(error) => self.store.record_video_error(video.id, &error)?,
            None if processed => self.store.clear_video_error(video.id)?,
            None => {}
        }
        Ok(processed)
    }

    /// Whether the stage's output already exists.
    fn stage_done(&self, video: &Video, stage: Stage) -> Result<bool> {
        Ok(match stage {
            Stage::Download => existing_file(video.local_path.as_deref()).is_some(),
            Stage::ExtractFrames => self.store.count_frames(video.id)?.total() > 0,
            Stage::AnalyzeFrames => video.has_frame_analysis,
            Stage::ExtractAudio => existing_file(video.audio_path.as_deref()).is_some(),
            Stage::Transcribe => video.has_transcription,
            Stage::Summarize => video.has_summary,
            Stage::GenerateQuiz => video.has_quiz,
            Stage::RenderReport => existing_file(video.report_path.as_deref()).is_some(),
        })
    }

    async fn run_stage(&self, video_id: i64, stage: Stage, force: bool) -> Result<StageOutcome> {
        let video = self
            .store
            .get_video(video_id)?
            .with_context(|| format!("video {} not found", video_id))?;

        if !force && self.stage_done(&video, stage)? {
            log::debug!("Video {}: {} already done", video.id, stage);
            return Ok(StageOutcome::AlreadyDone);
        }

        log::info!("Video {}: {} starting", video.id, stage);
        match stage {
            Stage::Download => self.download(&video).await,
            Stage::ExtractFrames => self.extract_frames(&video).await,
            Stage::AnalyzeFrames => self.analyze_frames(&video, force).await,
            Stage::ExtractAudio => self.extract_audio(&video).await,
            Stage::Transcribe => self.transcribe(&video).await,
            Stage::Summarize => self.summarize(&video).await,
            Stage::GenerateQuiz => self.generate_quiz(&video).await,
            Stage::RenderReport => self.render_report(&video).await,
        }
    }

    fn local_source(&self, video: &Video) -> Result<PathBuf> {
        existing_file(video.local_path.as_deref())
            .with_context(|| format!("video {} has not been downloaded", video.id))
    }

    // ========================================================================
    // Stages
    // ========================================================================

    async fn download(&self, video: &Video) -> Result<StageOutcome> {
        if let Err(e) = self.providers.content.pin(&video.content_id).await {
            log::warn!("Pin of {} failed, downloading anyway: {:#}", video.content_id, e);
        }

        let opts = DownloadOptions {
            dest_dir: self.video_dir(video),
            file_name: video.name.clone(),
        };
        let path = self
            .providers
            .content
            .download(&video.content_id, &opts)
            .await?;

        let duration = match self.providers.media.probe_duration(&path).await {
            Ok(duration) => Some(duration),
            Err(e) => {
                log::warn!("Could not probe duration of {:?}: {:#}", path, e);
                None
            }
        };
        self.store
            .set_video_source(video.id, &path.to_string_lossy(), duration)?;
        Ok(StageOutcome::Completed)
    }

    async fn extract_frames(&self, video: &Video) -> Result<StageOutcome> {
        let source = self.local_source(video)?;
        let duration = match video.duration_seconds {
            Some(duration) => duration,
            None => {
                let duration = self.providers.media.probe_duration(&source).await?;
                self.store
                    .set_video_source(video.id, &source.to_string_lossy(), Some(duration))?;
                duration
            }
        };

        let frames = frames::extract_frames(
            self.providers.media.as_ref(),
            &source,
            &self.frames_dir(video),
            duration,
            self.sample_rate,
            self.max_frames,
        )
        .await?;

        // New frames invalidate any earlier analysis
        let replaced = self.store.delete_frames(video.id)?;
        self.store
            .set_stage_flag(video.id, StageFlag::FrameAnalysis, false)?;
        let inserted = self.store.insert_frames(video.id, &frames)?;
        log::info!(
            "Video {}: stored {} frames (replaced {})",
            video.id,
            inserted,
            replaced
        );
        Ok(StageOutcome::Completed)
    }

    async fn analyze_frames(&self, video: &Video, force: bool) -> Result<StageOutcome> {
        if force {
            self.store.reset_frames_to_pending(video.id)?;
        } else {
            self.store.retry_failed_frames(video.id)?;
        }

        let report = self
            .batcher
            .analyze_frames(video, &self.frames_dir(video))
            .await?;
        if !report.success {
            anyhow::bail!(
                "only {} of {} frames analyzed, below the {:.0}% threshold",
                report.completed,
                report.attempted,
                self.batcher.config().success_threshold * 100.0
            );
        }

        self.store
            .set_stage_flag(video.id, StageFlag::FrameAnalysis, true)?;
        if report.failed > 0 {
            Ok(StageOutcome::Partial {
                completed: report.completed,
                attempted: report.attempted,
            })
        } else {
            Ok(StageOutcome::Completed)
        }
    }

    async fn extract_audio(&self, video: &Video) -> Result<StageOutcome> {
        let source = self.local_source(video)?;
        let dir = self.video_dir(video);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {:?}", dir))?;

        let out = dir.join(AUDIO_FILE);
        self.providers.media.extract_audio(&source, &out).await?;
        self.store
            .set_video_audio_path(video.id, Some(&out.to_string_lossy()))?;
        Ok(StageOutcome::Completed)
    }

    async fn transcribe(&self, video: &Video) -> Result<StageOutcome> {
        let audio = existing_file(video.audio_path.as_deref())
            .with_context(|| format!("video {} has no extracted audio", video.id))?;
        let chunks = self.providers.analysis.transcribe(&audio).await?;

        let segments: Vec<TranscriptSegment> = chunks
            .into_iter()
            .filter(|chunk| !chunk.text.trim().is_empty())
            .map(|chunk| TranscriptSegment {
                video_id: video.id,
                start_time: chunk.start,
                end_time: chunk.end,
                text: chunk.text.trim().to_string(),
                confidence: chunk.confidence,
            })
            .collect();
        self.store.replace_transcript(video.id, &segments)?;
        self.store
            .set_stage_flag(video.id, StageFlag::Transcription, true)?;
        log::info!("Video {}: {} transcript segments", video.id, segments.len());
        Ok(StageOutcome::Completed)
    }

    async fn summarize(&self, video: &Video) -> Result<StageOutcome> {
        let frame_notes = self
            .store
            .list_frames(video.id)?
            .into_iter()
            .filter_map(|frame| {
                frame.analysis.map(|analysis| FrameNote {
                    timestamp_seconds: frame.timestamp_seconds,
                    analysis,
                })
            })
            .collect();
        let input = SummaryInput {
            video_name: video.name.clone(),
            duration_seconds: video.duration_seconds,
            transcript: self.store.get_transcript(video.id)?,
            frame_notes,
        };

        let draft = self.providers.analysis.summarize(&input).await?;
        if draft.text.trim().is_empty() {
            anyhow::bail!("summary came back empty");
        }
        self.store.upsert_summary(&Summary {
            video_id: video.id,
            text: draft.text.trim().to_string(),
            key_points: draft.key_points,
            created_at: now(),
        })?;
        self.store
            .set_stage_flag(video.id, StageFlag::Summary, true)?;
        Ok(StageOutcome::Completed)
    }

    async fn generate_quiz(&self, video: &Video) -> Result<StageOutcome> {
        let summary = self
            .store
            .get_summary(video.id)?
            .with_context(|| format!("video {} has no summary to build a quiz from", video.id))?;
        let questions = self.providers.analysis.generate_quiz(&summary).await?;
        if questions.is_empty() {
            anyhow::bail!("quiz came back without questions");
        }
        self.store.upsert_quiz(&Quiz {
            video_id: video.id,
            questions,
            created_at: now(),
        })?;
        self.store.set_stage_flag(video.id, StageFlag::Quiz, true)?;
        Ok(StageOutcome::Completed)
    }

    async fn render_report(&self, video: &Video) -> Result<StageOutcome> {
        let analyzed_frames = self
            .store
            .list_frames(video.id)?
            .into_iter()
            .filter(|frame| frame.analysis_status == FrameStatus::Completed)
            .collect();
        let input = ReportInput {
            video: video.clone(),
            summary: self.store.get_summary(video.id)?,
            quiz: self.store.get_quiz(video.id)?,
            transcript: self.store.get_transcript(video.id)?,
            frame_counts: self.store.count_frames(video.id)?,
            analyzed_frames,
        };

        let path = self
            .providers
            .renderer
            .render(&input, &self.video_dir(video))
            .await?;
        self.store
            .set_report_path(video.id, Some(&path.to_string_lossy()))?;
        Ok(StageOutcome::Completed)
    }
}

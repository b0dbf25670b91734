//! Bounded-concurrency frame analysis.
//!
//! Pending frames are taken in index order and split into fixed-size
//! batches. Frames of one batch run concurrently; the next batch starts once
//! the whole batch has settled, after a short pause for the analysis
//! backend.

use anyhow::Result;
use futures_util::future::join_all;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::resolver::FramePathResolver;
use super::retry::RetryDecision;
use crate::config::BatcherConfig;
use crate::database::{Frame, Store, Video};
use crate::providers::{AnalysisContext, AnalysisProvider};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameAnalysisReport {
    pub attempted: usize,
    pub completed: usize,
    pub failed: usize,
    /// `completed / attempted` met the configured threshold, or there was
    /// nothing to analyze.
    pub success: bool,
}

impl FrameAnalysisReport {
    pub fn ratio(&self) -> f64 {
        if self.attempted == 0 {
            1.0
        } else {
            self.completed as f64 / self.attempted as f64
        }
    }
}

pub struct FrameAnalysisBatcher {
    store: Arc<dyn Store>,
    analysis: Arc<dyn AnalysisProvider>,
    resolver: FramePathResolver,
    config: BatcherConfig,
}

impl FrameAnalysisBatcher {
    pub fn new(
        store: Arc<dyn Store>,
        analysis: Arc<dyn AnalysisProvider>,
        config: BatcherConfig,
    ) -> Self {
        Self {
            resolver: FramePathResolver::new(store.clone()),
            store,
            analysis,
            config,
        }
    }

    pub fn config(&self) -> &BatcherConfig {
        &self.config
    }

    /// Analyze every pending frame of `video`. Store failures abort the
    /// stage; provider failures only fail the frame.
    pub async fn analyze_frames(&self, video: &Video, frames_dir: &Path) -> Result<FrameAnalysisReport> {
        let pending = self.store.pending_frames(video.id)?;
        let attempted = pending.len();
        if attempted == 0 {
            log::info!("No pending frames for video {}", video.id);
            return Ok(FrameAnalysisReport {
                attempted: 0,
                completed: 0,
                failed: 0,
                success: true,
            });
        }

        let batch_size = self.config.batch_size.max(1);
        let batch_count = attempted.div_ceil(batch_size);
        log::info!(
            "Analyzing {} frames of video {} in {} batches of up to {}",
            attempted,
            video.id,
            batch_count,
            batch_size
        );

        let mut completed = 0;
        for (n, batch) in pending.chunks(batch_size).enumerate() {
            if n > 0 {
                tokio::time::sleep(self.config.inter_batch_delay()).await;
            }

            let results = join_all(
                batch
                    .iter()
                    .map(|frame| self.analyze_frame(video, frame, frames_dir)),
            )
            .await;

            let mut batch_completed = 0;
            for result in results {
                if result? {
                    batch_completed += 1;
                }
            }
            completed += batch_completed;
            log::debug!(
                "Batch {}/{} for video {}: {}/{} frames analyzed",
                n + 1,
                batch_count,
                video.id,
                batch_completed,
                batch.len()
            );
        }

        let mut report = FrameAnalysisReport {
            attempted,
            completed,
            failed: attempted - completed,
            success: false,
        };
        report.success = report.ratio() >= self.config.success_threshold;
        log::info!(
            "Frame analysis for video {}: {}/{} completed ({:.0}%), threshold {:.0}%",
            video.id,
            completed,
            attempted,
            report.ratio() * 100.0,
            self.config.success_threshold * 100.0
        );
        Ok(report)
    }

    /// Returns whether the frame ended up completed.
    async fn analyze_frame(&self, video: &Video, frame: &Frame, frames_dir: &Path) -> Result<bool> {
        let path: PathBuf = match self.resolver.resolve(frame, frames_dir) {
            Some(path) => path,
            None => {
                log::warn!(
                    "Frame {} of video {} has no file on disk",
                    frame.frame_index,
                    video.id
                );
                self.store
                    .mark_frame_failed(frame.id, frame.attempts, "frame file not found")?;
                return Ok(false);
            }
        };

        let context = AnalysisContext {
            video_name: video.name.clone(),
            timestamp_seconds: frame.timestamp_seconds,
            frame_index: frame.frame_index,
        };
        let policy = self.config.retry;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let outcome = tokio::time::timeout(
                self.config.analysis_timeout(),
                self.analysis.analyze_image(&path, &context),
            )
            .await;

            let error = match outcome {
                Ok(Ok(analysis)) => {
                    self.store
                        .mark_frame_completed(frame.id, attempts as i32, &analysis)?;
                    return Ok(true);
                }
                Ok(Err(e)) => format!("{:#}", e),
                Err(_) => format!(
                    "analysis timed out after {}s",
                    self.config.analysis_timeout_secs
                ),
            };

            match policy.decide(attempts) {
                RetryDecision::RetryAfter(delay) => {
                    log::debug!(
                        "Frame {} attempt {} failed, retrying in {:?}: {}",
                        frame.frame_index,
                        attempts,
                        delay,
                        error
                    );
                    self.store
                        .mark_frame_retrying(frame.id, attempts as i32, &error)?;
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => {
                    log::warn!(
                        "Frame {} of video {} failed after {} attempts: {}",
                        frame.frame_index,
                        video.id,
                        attempts,
                        error
                    );
                    self.store
                        .mark_frame_failed(frame.id, attempts as i32, &error)?;
                    return Ok(false);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Database, FrameRepository, FrameStatus, NewFrame, VideoRepository};
    use crate::testing::FakeAnalysis;
    use tempfile::TempDir;

    fn fast_config() -> BatcherConfig {
        BatcherConfig {
            batch_size: 4,
            analysis_timeout_secs: 5,
            retry: crate::worker::retry::RetryPolicy::linear(3, 1),
            success_threshold: 0.6,
            inter_batch_delay_ms: 0,
        }
    }

    /// `count` frames on disk under their primary names.
    fn setup(count: i64) -> (Arc<Database>, Video, PathBuf, TempDir) {
        let temp = TempDir::new().unwrap();
        let db = Arc::new(Database::new(&temp.path().join("test.db")).unwrap());
        let video = db.ensure_video("bafy1", "talk.mp4").unwrap();
        let dir = temp.path().join("frames");
        std::fs::create_dir_all(&dir).unwrap();
        let frames: Vec<NewFrame> = (0..count)
            .map(|i| {
                let primary = dir.join(format!("frame_at_{:.3}s.jpg", i as f64 * 0.5));
                std::fs::write(&primary, format!("frame {}", i)).unwrap();
                NewFrame {
                    primary_path: primary.to_string_lossy().to_string(),
                    alternative_path: None,
                    timestamp_seconds: i as f64 * 0.5,
                    frame_index: i,
                }
            })
            .collect();
        db.insert_frames(video.id, &frames).unwrap();
        (db, video, dir, temp)
    }

    #[tokio::test]
    async fn test_six_of_ten_frames_is_success() {
        let (db, video, dir, _temp) = setup(10);
        // Frames 6..10 fail on every attempt
        let analysis = Arc::new(FakeAnalysis::default().failing_frames(6..10));
        let batcher = FrameAnalysisBatcher::new(db.clone(), analysis.clone(), fast_config());

        let report = batcher.analyze_frames(&video, &dir).await.unwrap();
        assert_eq!(report.attempted, 10);
        assert_eq!(report.completed, 6);
        assert_eq!(report.failed, 4);
        assert!(report.success);

        let frames = db.list_frames(video.id).unwrap();
        for frame in &frames[6..] {
            assert_eq!(frame.analysis_status, FrameStatus::Failed);
            assert_eq!(frame.attempts, 3);
            assert!(frame.analysis_error.is_some());
        }
        assert!(frames[..6]
            .iter()
            .all(|f| f.analysis_status == FrameStatus::Completed && f.analysis.is_some()));
        // 6 successes + 4 frames x 3 attempts
        assert_eq!(analysis.image_calls(), 18);
    }

    #[tokio::test]
    async fn test_below_threshold_is_failure() {
        let (db, video, dir, _temp) = setup(10);
        let analysis = Arc::new(FakeAnalysis::default().failing_frames(5..10));
        let batcher = FrameAnalysisBatcher::new(db.clone(), analysis, fast_config());

        let report = batcher.analyze_frames(&video, &dir).await.unwrap();
        assert_eq!(report.completed, 5);
        assert!(!report.success);
    }

    #[tokio::test]
    async fn test_flaky_frame_recovers_on_retry() {
        let (db, video, dir, _temp) = setup(1);
        let analysis = Arc::new(FakeAnalysis::default().flaky_frame(0, 2));
        let batcher = FrameAnalysisBatcher::new(db.clone(), analysis, fast_config());

        let report = batcher.analyze_frames(&video, &dir).await.unwrap();
        assert_eq!(report.completed, 1);
        let frame = db.list_frames(video.id).unwrap().remove(0);
        assert_eq!(frame.analysis_status, FrameStatus::Completed);
        assert_eq!(frame.attempts, 3);
        assert!(frame.analysis_error.is_none());
    }

    #[tokio::test]
    async fn test_missing_file_fails_without_retry() {
        let (db, video, dir, _temp) = setup(2);
        let first = db.list_frames(video.id).unwrap().remove(0);
        std::fs::remove_file(&first.primary_path).unwrap();
        std::fs::remove_file(dir.join("frame_at_0.500s.jpg")).unwrap();

        let analysis = Arc::new(FakeAnalysis::default());
        let batcher = FrameAnalysisBatcher::new(db.clone(), analysis.clone(), fast_config());
        let report = batcher.analyze_frames(&video, &dir).await.unwrap();

        assert_eq!(report.completed, 0);
        assert_eq!(analysis.image_calls(), 0);
        let frames = db.list_frames(video.id).unwrap();
        assert!(frames
            .iter()
            .all(|f| f.analysis_error.as_deref() == Some("frame file not found")));
    }

    #[tokio::test]
    async fn test_no_pending_frames_is_trivial_success() {
        let (db, video, dir, _temp) = setup(0);
        let batcher = FrameAnalysisBatcher::new(db, Arc::new(FakeAnalysis::default()), fast_config());
        let report = batcher.analyze_frames(&video, &dir).await.unwrap();
        assert!(report.success);
        assert_eq!(report.attempted, 0);
    }

    #[tokio::test]
    async fn test_slow_analysis_times_out() {
        let (db, video, dir, _temp) = setup(1);
        let analysis = Arc::new(FakeAnalysis::default().with_delay(std::time::Duration::from_secs(2)));
        let mut config = fast_config();
        config.analysis_timeout_secs = 1;
        config.retry = crate::worker::retry::RetryPolicy::linear(1, 0);
        let batcher = FrameAnalysisBatcher::new(db.clone(), analysis, config);

        let report = batcher.analyze_frames(&video, &dir).await.unwrap();
        assert_eq!(report.failed, 1);
        let frame = db.list_frames(video.id).unwrap().remove(0);
        assert!(frame.analysis_error.unwrap().contains("timed out"));
    }
}

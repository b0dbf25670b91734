pub mod batcher;
pub mod frames;
pub mod monitor;
pub mod pipeline;
pub mod resolver;
pub mod retry;

use anyhow::Result;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::QueueConfig;
use crate::database::{
    NewQueueItem, QueueCounts, QueueItem, QueueMetadata, QueueSnapshot, QueueStatus, Store,
};
use pipeline::{PipelineRunner, RunOptions, RunReport, Stage};

/// Persisted FIFO of videos to process, drained one item at a time.
///
/// Ordering is `(failed_attempts, created_at)`: an item that keeps failing
/// sinks behind fresh work but is still retried until the policy gives up.
pub struct QueueManager {
    store: Arc<dyn Store>,
    runner: Arc<PipelineRunner>,
    config: QueueConfig,
    continue_on_error: bool,
    busy: AtomicBool,
    started: AtomicBool,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl QueueManager {
    pub fn new(
        store: Arc<dyn Store>,
        runner: Arc<PipelineRunner>,
        config: QueueConfig,
        continue_on_error: bool,
    ) -> Self {
        Self {
            store,
            runner,
            config,
            continue_on_error,
            busy: AtomicBool::new(false),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Recover from an unclean shutdown, apply retention and start draining.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let stuck = self.store.reset_stuck_processing()?;
        if stuck > 0 {
            log::info!("Startup: {} queue items were stuck in processing, back to pending", stuck);
        }
        let frames = self.store.reset_stuck_frames()?;
        if frames > 0 {
            log::info!("Startup: {} frames were stuck in retrying, back to pending", frames);
        }

        let cutoff = Utc::now() - chrono::Duration::days(self.config.retention_days);
        match self.store.purge_finished_queue_items(cutoff) {
            Ok(0) => {}
            Ok(purged) => log::info!("Startup: purged {} finished queue items older than {}", purged, cutoff),
            Err(e) => log::warn!("Failed to purge old queue items: {:#}", e),
        }

        self.started.store(true, Ordering::SeqCst);
        log::info!("Queue manager started");
        self.kick();
        Ok(())
    }

    /// Stop taking new items and wait for the one in flight.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("Queue worker task ended abnormally: {}", e);
            }
        }
        log::info!("Queue manager stopped");
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Queue operations
    // ========================================================================

    /// Add an item unless its content id is already queued, then make sure
    /// the worker is draining.
    pub fn enqueue(self: &Arc<Self>, item: NewQueueItem) -> Result<(QueueItem, bool)> {
        let (stored, created) = self.store.insert_queue_item_if_absent(&item)?;
        if created {
            log::info!("Queued {} ({})", stored.content_id, stored.display_name);
        } else {
            log::debug!(
                "{} already queued with status {}",
                stored.content_id,
                stored.status
            );
        }
        self.kick();
        Ok((stored, created))
    }

    pub fn dequeue_next(&self) -> Result<Option<QueueItem>> {
        self.store.next_pending_queue_item()
    }

    pub fn mark_processing(&self, item: &QueueItem) -> Result<()> {
        self.store.set_queue_status(item.id, QueueStatus::Processing)
    }

    pub fn mark_completed(&self, item: &QueueItem) -> Result<()> {
        self.store.set_queue_status(item.id, QueueStatus::Completed)
    }

    /// Count one more failed attempt. The item returns to pending until the
    /// retry policy runs out, then it is failed for good.
    pub fn mark_failed_or_requeue(&self, item: &QueueItem, error: &str) -> Result<QueueStatus> {
        let attempts = item.failed_attempts + 1;
        let status = if self.config.retry.should_retry(attempts.max(0) as u32) {
            QueueStatus::Pending
        } else {
            QueueStatus::Failed
        };
        self.store
            .record_queue_failure(item.id, attempts, status, error)?;

        if let Some(video) = self.store.get_video_by_content_id(&item.content_id)? {
            self.store.record_video_error(video.id, error)?;
        }

        match status {
            QueueStatus::Failed => log::error!(
                "{} failed permanently after {} attempts: {}",
                item.content_id,
                attempts,
                error
            ),
            _ => log::warn!(
                "{} failed (attempt {} of {}), will retry: {}",
                item.content_id,
                attempts,
                self.config.retry.max_attempts,
                error
            ),
        }
        Ok(status)
    }

    /// Put an existing item back to pending with a clean attempt count.
    pub fn requeue(self: &Arc<Self>, content_id: &str, metadata: &QueueMetadata) -> Result<Option<QueueItem>> {
        let item = self.store.requeue_item(content_id, metadata)?;
        if item.is_some() {
            log::info!("Requeued {}", content_id);
            self.kick();
        }
        Ok(item)
    }

    pub fn remove(&self, content_id: &str) -> Result<bool> {
        self.store.remove_queue_item(content_id)
    }

    pub fn snapshot(&self) -> Result<QueueSnapshot> {
        let mut snapshot = QueueSnapshot::default();
        for item in self.store.list_queue_items()? {
            match item.status {
                QueueStatus::Pending => snapshot.pending.push(item),
                QueueStatus::Processing => snapshot.processing.push(item),
                QueueStatus::Completed => snapshot.completed.push(item),
                QueueStatus::Failed => snapshot.failed.push(item),
            }
        }
        Ok(snapshot)
    }

    pub fn counts(&self) -> Result<QueueCounts> {
        let snapshot = self.snapshot()?;
        let pending = snapshot.pending.len() as i64;
        let processing = snapshot.processing.len() as i64;
        let completed = snapshot.completed.len() as i64;
        let failed = snapshot.failed.len() as i64;
        Ok(QueueCounts {
            pending,
            processing,
            completed,
            failed,
            total: pending + processing + completed + failed,
        })
    }

    // ========================================================================
    // Worker loop
    // ========================================================================

    /// Start draining unless a drain is already running.
    pub fn kick(self: &Arc<Self>) {
        if !self.started.load(Ordering::SeqCst) || self.cancel.is_cancelled() {
            return;
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.drain().await });
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    async fn drain(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.process_next().await {
                Ok(true) => {}
                Ok(false) => {
                    self.busy.store(false, Ordering::SeqCst);
                    // An enqueue may have slipped in between the empty
                    // dequeue and the flag reset
                    if self.has_pending() && !self.cancel.is_cancelled() {
                        if self
                            .busy
                            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                            .is_ok()
                        {
                            continue;
                        }
                    }
                    return;
                }
                Err(e) => {
                    log::error!("Queue worker error: {:#}", e);
                    break;
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.next_item_delay()) => {}
            }
        }
        self.busy.store(false, Ordering::SeqCst);
    }

    fn has_pending(&self) -> bool {
        match self.store.count_pending_queue_items() {
            Ok(count) => count > 0,
            Err(e) => {
                log::warn!("Failed to count pending queue items: {:#}", e);
                false
            }
        }
    }

    /// Take the next pending item through the pipeline and account for the
    /// result. Returns `false` when the queue was empty.
    pub async fn process_next(&self) -> Result<bool> {
        let item = match self.dequeue_next()? {
            Some(item) => item,
            None => return Ok(false),
        };
        self.mark_processing(&item)?;
        log::info!(
            "Processing {} ({}), previous failures: {}",
            item.content_id,
            item.display_name,
            item.failed_attempts
        );

        match self.run_item(&item).await {
            Ok(report) if report.processed => {
                self.mark_completed(&item)?;
                log::info!("Completed {}", item.content_id);
            }
            Ok(report) => {
                let error = report
                    .first_error()
                    .unwrap_or_else(|| "pipeline ended without processing the video".to_string());
                self.mark_failed_or_requeue(&item, &error)?;
            }
            Err(e) => {
                self.mark_failed_or_requeue(&item, &format!("{:#}", e))?;
            }
        }
        Ok(true)
    }

    async fn run_item(&self, item: &QueueItem) -> Result<RunReport> {
        let video = self
            .store
            .ensure_video(&item.content_id, &item.display_name)?;
        let options = RunOptions {
            force: item.metadata.force(),
            continue_on_error: self.continue_on_error,
        };

        // A panicking stage must not take the worker down with it
        let runner = self.runner.clone();
        let video_id = video.id;
        match tokio::spawn(async move { runner.run(video_id, &Stage::ALL, options).await }).await {
            Ok(result) => result,
            Err(e) => {
                if let Err(reset) = self.store.set_video_processing(video_id, false) {
                    log::warn!("Failed to clear processing flag of video {}: {:#}", video_id, reset);
                }
                Err(anyhow::anyhow!("pipeline task aborted: {}", e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BatcherConfig, Config};
    use crate::database::{Database, QueueRepository, VideoRepository};
    use crate::testing::{FakeAnalysis, FakeContent, FakeMedia, FakeRenderer};
    use crate::worker::pipeline::Providers;
    use crate::worker::retry::RetryPolicy;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        db: Arc<Database>,
        queue: Arc<QueueManager>,
        content: Arc<FakeContent>,
        _temp: TempDir,
    }

    fn fixture_with(content: FakeContent) -> Fixture {
        fixture_with_analysis(content, FakeAnalysis::default())
    }

    fn fixture_with_analysis(content: FakeContent, analysis: FakeAnalysis) -> Fixture {
        let temp = TempDir::new().unwrap();
        let db = Arc::new(Database::new(&temp.path().join("test.db")).unwrap());
        let mut config = Config::default();
        config.storage.data_dir = temp.path().to_path_buf();
        config.batcher = BatcherConfig {
            batch_size: 8,
            analysis_timeout_secs: 5,
            retry: RetryPolicy::linear(3, 1),
            success_threshold: 0.6,
            inter_batch_delay_ms: 0,
        };
        config.queue.next_item_delay_ms = 1;

        let content = Arc::new(content);
        let providers = Providers {
            content: content.clone(),
            analysis: Arc::new(analysis),
            media: Arc::new(FakeMedia::new(3.0)),
            renderer: Arc::new(FakeRenderer::default()),
        };
        let runner = Arc::new(PipelineRunner::new(db.clone(), providers, &config));
        let queue = Arc::new(QueueManager::new(
            db.clone(),
            runner,
            config.queue.clone(),
            false,
        ));
        Fixture {
            db,
            queue,
            content,
            _temp: temp,
        }
    }

    fn new_item(content_id: &str) -> NewQueueItem {
        NewQueueItem {
            content_id: content_id.to_string(),
            display_name: format!("{}.mp4", content_id),
            metadata: QueueMetadata::default(),
        }
    }

    async fn wait_until_idle(queue: &QueueManager) {
        for _ in 0..500 {
            if !queue.is_busy() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("queue never went idle");
    }

    #[tokio::test]
    async fn test_three_failures_walk_to_terminal_failed() {
        let fx = fixture_with(FakeContent::new(vec![]).failing_downloads());
        fx.queue.enqueue(new_item("bafybad")).unwrap();

        let mut statuses = Vec::new();
        for _ in 0..3 {
            assert!(fx.queue.process_next().await.unwrap());
            let item = fx.db.get_queue_item("bafybad").unwrap().unwrap();
            statuses.push((item.status, item.failed_attempts));
        }
        assert_eq!(
            statuses,
            vec![
                (QueueStatus::Pending, 1),
                (QueueStatus::Pending, 2),
                (QueueStatus::Failed, 3),
            ]
        );
        // Terminal: nothing left to pick up
        assert!(!fx.queue.process_next().await.unwrap());

        let item = fx.db.get_queue_item("bafybad").unwrap().unwrap();
        assert!(item.last_error.unwrap().starts_with("download: "));
        let video = fx.db.get_video_by_content_id("bafybad").unwrap().unwrap();
        assert!(video.last_error.is_some());
        assert!(!video.processing);
        assert_eq!(fx.content.downloads(), 3);
    }

    #[tokio::test]
    async fn test_successful_item_is_completed() {
        let fx = fixture_with(FakeContent::new(vec![]));
        let (item, created) = fx.queue.enqueue(new_item("bafygood")).unwrap();
        assert!(created);
        assert_eq!(item.status, QueueStatus::Pending);

        assert!(fx.queue.process_next().await.unwrap());
        let item = fx.db.get_queue_item("bafygood").unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Completed);
        assert!(fx.db.is_video_processed("bafygood").unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_is_a_noop() {
        let fx = fixture_with(FakeContent::new(vec![]));
        fx.queue.enqueue(new_item("bafy1")).unwrap();
        let (again, created) = fx.queue.enqueue(new_item("bafy1")).unwrap();
        assert!(!created);
        assert_eq!(again.content_id, "bafy1");
        assert_eq!(fx.queue.counts().unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_started_queue_drains_everything() {
        let fx = fixture_with(FakeContent::new(vec![]));
        fx.queue.start().unwrap();
        for id in ["bafy1", "bafy2", "bafy3"] {
            fx.queue.enqueue(new_item(id)).unwrap();
        }

        wait_until_idle(&fx.queue).await;
        let counts = fx.queue.counts().unwrap();
        assert_eq!(counts.completed, 3);
        assert_eq!(counts.pending, 0);
        // Single flight: each item was downloaded exactly once
        assert_eq!(fx.content.downloads(), 3);
        fx.queue.stop().await;
    }

    #[tokio::test]
    async fn test_start_recovers_stuck_items() {
        let fx = fixture_with(FakeContent::new(vec![]));
        let (item, _) = fx.db.insert_queue_item_if_absent(&new_item("bafystuck")).unwrap();
        fx.db
            .set_queue_status(item.id, QueueStatus::Processing)
            .unwrap();

        fx.queue.start().unwrap();
        wait_until_idle(&fx.queue).await;
        let item = fx.db.get_queue_item("bafystuck").unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Completed);
        fx.queue.stop().await;
    }

    #[tokio::test]
    async fn test_enqueue_before_start_does_not_process() {
        let fx = fixture_with(FakeContent::new(vec![]));
        fx.queue.enqueue(new_item("bafy1")).unwrap();
        assert!(!fx.queue.is_busy());
        let item = fx.db.get_queue_item("bafy1").unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Pending);
    }

    #[tokio::test]
    async fn test_requeue_resets_failed_item() {
        let fx = fixture_with(FakeContent::new(vec![]).failing_downloads());
        fx.queue.enqueue(new_item("bafybad")).unwrap();
        for _ in 0..3 {
            fx.queue.process_next().await.unwrap();
        }

        let metadata = QueueMetadata::Requested {
            force: true,
            requested_by: Some("ops".to_string()),
        };
        let item = fx.queue.requeue("bafybad", &metadata).unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.failed_attempts, 0);
        assert!(item.metadata.force());

        let snapshot = fx.queue.snapshot().unwrap();
        assert_eq!(snapshot.pending.len(), 1);
        assert!(snapshot.failed.is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_item_does_not_stall_the_queue() {
        let fx = fixture_with(FakeContent::new(vec![]));
        fx.queue.enqueue(new_item("bafybroken")).unwrap();
        fx.queue.enqueue(new_item("bafygood")).unwrap();
        let raw = rusqlite::Connection::open(fx._temp.path().join("test.db")).unwrap();
        raw.execute(
            "UPDATE queue_items SET metadata_json = 'garbage' WHERE content_id = 'bafybroken'",
            [],
        )
        .unwrap();

        fx.queue.start().unwrap();
        wait_until_idle(&fx.queue).await;

        let good = fx.db.get_queue_item("bafygood").unwrap().unwrap();
        assert_eq!(good.status, QueueStatus::Completed);
        let broken = fx.db.get_queue_item("bafybroken").unwrap().unwrap();
        assert_eq!(broken.status, QueueStatus::Failed);
        assert!(broken.last_error.is_some());
        assert_eq!(fx.content.downloads(), 1);
        fx.queue.stop().await;
    }

    #[tokio::test]
    async fn test_stop_waits_for_item_in_flight() {
        let fx = fixture_with_analysis(
            FakeContent::new(vec![]),
            FakeAnalysis::default().with_delay(Duration::from_millis(200)),
        );
        fx.queue.start().unwrap();
        fx.queue.enqueue(new_item("bafyslow")).unwrap();
        fx.queue.enqueue(new_item("bafynext")).unwrap();

        for _ in 0..100 {
            let item = fx.db.get_queue_item("bafyslow").unwrap().unwrap();
            if item.status == QueueStatus::Processing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        fx.queue.stop().await;
        let slow = fx.db.get_queue_item("bafyslow").unwrap().unwrap();
        assert_eq!(slow.status, QueueStatus::Completed);
        // Nothing new is taken after the stop
        let next = fx.db.get_queue_item("bafynext").unwrap().unwrap();
        assert_eq!(next.status, QueueStatus::Pending);
        assert!(!fx.queue.is_busy());
    }

    #[tokio::test]
    async fn test_stop_prevents_further_kicks() {
        let fx = fixture_with(FakeContent::new(vec![]));
        fx.queue.start().unwrap();
        fx.queue.stop().await;

        fx.queue.enqueue(new_item("bafylate")).unwrap();
        assert!(!fx.queue.is_busy());
        let item = fx.db.get_queue_item("bafylate").unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Pending);
    }
}

//! Periodic discovery of new videos on the content network.

use anyhow::Result;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::retry::{RetryDecision, RetryPolicy};
use super::QueueManager;
use crate::database::{NewQueueItem, QueueMetadata, Store};
use crate::providers::{ContentProvider, RemoteItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckOutcome {
    Completed {
        listed: usize,
        media: usize,
        enqueued: usize,
    },
    /// Another check was still running.
    Skipped,
}

pub struct Monitor {
    store: Arc<dyn Store>,
    content: Arc<dyn ContentProvider>,
    queue: Arc<QueueManager>,
    list_retry: RetryPolicy,
    check_lock: tokio::sync::Mutex<()>,
    cancel: Mutex<CancellationToken>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Monitor {
    pub fn new(
        store: Arc<dyn Store>,
        content: Arc<dyn ContentProvider>,
        queue: Arc<QueueManager>,
        list_retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            content,
            queue,
            list_retry,
            check_lock: tokio::sync::Mutex::new(()),
            cancel: Mutex::new(CancellationToken::new()),
            timer: Mutex::new(None),
        }
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Check once right away, then every `interval` until stopped.
    ///
    /// Returns `false` (and changes nothing) while polling is already
    /// running. Polling can be started again after [`Monitor::stop_polling`].
    pub fn start_polling(self: &Arc<Self>, interval: Duration) -> bool {
        let mut timer = self.timer.lock().unwrap_or_else(|e| e.into_inner());
        if timer.as_ref().is_some_and(|h| !h.is_finished()) {
            log::warn!("Monitor is already polling, ignoring start");
            return false;
        }

        let cancel = {
            let mut token = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
            token.clone()
        };
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            log::info!("Monitor polling every {:?}", interval);
            loop {
                match this.check_for_new_videos().await {
                    Ok(CheckOutcome::Completed { enqueued, .. }) if enqueued > 0 => {
                        log::info!("Monitor queued {} new videos", enqueued)
                    }
                    Ok(_) => {}
                    Err(e) => log::error!("Monitor check failed: {:#}", e),
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            log::info!("Monitor polling stopped");
        });
        *timer = Some(handle);
        true
    }

    /// Cancel the timer and wait for a check in progress to finish.
    pub async fn stop_polling(&self) {
        self.cancel_token().cancel();
        let handle = self.timer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("Monitor task ended abnormally: {}", e);
            }
        }
        // Manual checks don't run on the timer task
        let _drained = self.check_lock.lock().await;
    }

    /// List remote content and queue every video not processed yet. A call
    /// made while another check runs is skipped.
    pub async fn check_for_new_videos(&self) -> Result<CheckOutcome> {
        let _guard = match self.check_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                // Every skipped tick leaves a log line; nothing waits behind the running check
                log::info!("Previous check still running, skipping this one");
                return Ok(CheckOutcome::Skipped);
            }
        };

        let items = self.list_with_retry().await?;
        let listed = items.len();
        let media: Vec<RemoteItem> = items.into_iter().filter(RemoteItem::is_video).collect();
        log::debug!("Listing returned {} items, {} videos", listed, media.len());

        let mut enqueued = 0;
        for item in &media {
            let video = self.store.ensure_video(&item.id, &item.name)?;
            if video.processed {
                continue;
            }
            let (_, created) = self.queue.enqueue(NewQueueItem {
                content_id: item.id.clone(),
                display_name: item.name.clone(),
                metadata: QueueMetadata::Discovered {
                    mime_type: item.mime_type.clone(),
                    size_bytes: item.size,
                },
            })?;
            if created {
                enqueued += 1;
            }
        }

        Ok(CheckOutcome::Completed {
            listed,
            media: media.len(),
            enqueued,
        })
    }

    async fn list_with_retry(&self) -> Result<Vec<RemoteItem>> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let error = match self.content.list().await {
                Ok(items) => return Ok(items),
                Err(e) => e,
            };

            match self.list_retry.decide(attempts) {
                RetryDecision::RetryAfter(delay) => {
                    log::warn!(
                        "Listing failed (attempt {}), retrying in {:?}: {:#}",
                        attempts,
                        delay,
                        error
                    );
                    let cancel = self.cancel_token();
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(error.context("monitor stopped while retrying the listing"));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::GiveUp => {
                    return Err(error.context(format!("listing failed after {} attempts", attempts)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::database::{Database, QueueRepository, VideoRepository};
    use crate::testing::{remote_item, FakeAnalysis, FakeContent, FakeMedia, FakeRenderer};
    use crate::worker::pipeline::{PipelineRunner, Providers};
    use tempfile::TempDir;

    struct Fixture {
        db: Arc<Database>,
        monitor: Arc<Monitor>,
        content: Arc<FakeContent>,
        _temp: TempDir,
    }

    fn fixture_with(content: FakeContent, list_retry: RetryPolicy) -> Fixture {
        let temp = TempDir::new().unwrap();
        let db = Arc::new(Database::new(&temp.path().join("test.db")).unwrap());
        let mut config = Config::default();
        config.storage.data_dir = temp.path().to_path_buf();

        let content = Arc::new(content);
        let providers = Providers {
            content: content.clone(),
            analysis: Arc::new(FakeAnalysis::default()),
            media: Arc::new(FakeMedia::new(1.0)),
            renderer: Arc::new(FakeRenderer::default()),
        };
        let runner = Arc::new(PipelineRunner::new(db.clone(), providers, &config));
        // Never started: the monitor only fills the queue here
        let queue = Arc::new(QueueManager::new(db.clone(), runner, config.queue.clone(), false));
        let monitor = Arc::new(Monitor::new(db.clone(), content.clone(), queue, list_retry));
        Fixture {
            db,
            monitor,
            content,
            _temp: temp,
        }
    }

    fn listing() -> Vec<RemoteItem> {
        vec![
            remote_item("bafy1", "intro.mp4", Some("video/mp4")),
            remote_item("bafy2", "notes.txt", Some("text/plain")),
            remote_item("bafy3", "demo.webm", None),
        ]
    }

    #[tokio::test]
    async fn test_check_queues_only_videos() {
        let fx = fixture_with(FakeContent::new(listing()), RetryPolicy::exponential(4, 1, 2.0));
        let outcome = fx.monitor.check_for_new_videos().await.unwrap();
        assert_eq!(
            outcome,
            CheckOutcome::Completed {
                listed: 3,
                media: 2,
                enqueued: 2
            }
        );
        assert!(fx.db.get_queue_item("bafy2").unwrap().is_none());
        let item = fx.db.get_queue_item("bafy3").unwrap().unwrap();
        assert_eq!(
            item.metadata,
            QueueMetadata::Discovered {
                mime_type: None,
                size_bytes: Some(1024)
            }
        );

        // A second pass finds nothing new
        let outcome = fx.monitor.check_for_new_videos().await.unwrap();
        assert!(matches!(outcome, CheckOutcome::Completed { enqueued: 0, .. }));
    }

    #[tokio::test]
    async fn test_processed_videos_are_not_queued() {
        let fx = fixture_with(FakeContent::new(listing()), RetryPolicy::exponential(4, 1, 2.0));
        let video = fx.db.ensure_video("bafy1", "intro.mp4").unwrap();
        fx.db.set_video_processed(video.id, true).unwrap();

        let outcome = fx.monitor.check_for_new_videos().await.unwrap();
        assert!(matches!(outcome, CheckOutcome::Completed { enqueued: 1, .. }));
        assert!(fx.db.get_queue_item("bafy1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overlapping_check_is_skipped() {
        let fx = fixture_with(
            FakeContent::new(listing()).gated(),
            RetryPolicy::exponential(4, 1, 2.0),
        );

        let monitor = fx.monitor.clone();
        let first = tokio::spawn(async move { monitor.check_for_new_videos().await });
        fx.content.wait_list_started().await;

        let second = fx.monitor.check_for_new_videos().await.unwrap();
        assert_eq!(second, CheckOutcome::Skipped);

        fx.content.release_list();
        let first = first.await.unwrap().unwrap();
        assert!(matches!(first, CheckOutcome::Completed { enqueued: 2, .. }));
        assert_eq!(fx.content.list_calls(), 1);
        assert_eq!(fx.db.list_queue_items().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_listing_is_retried_then_succeeds() {
        let fx = fixture_with(
            FakeContent::new(listing()).failing_lists(3),
            RetryPolicy::exponential(4, 1, 2.0),
        );
        let outcome = fx.monitor.check_for_new_videos().await.unwrap();
        assert!(matches!(outcome, CheckOutcome::Completed { listed: 3, .. }));
        assert_eq!(fx.content.list_calls(), 4);
    }

    #[tokio::test]
    async fn test_listing_gives_up_for_the_tick() {
        let fx = fixture_with(
            FakeContent::new(listing()).failing_lists(10),
            RetryPolicy::exponential(4, 1, 2.0),
        );
        let err = fx.monitor.check_for_new_videos().await.unwrap_err();
        assert!(format!("{:#}", err).contains("after 4 attempts"));
        assert_eq!(fx.content.list_calls(), 4);
        assert!(fx.db.list_queue_items().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_polling_checks_immediately_and_stops() {
        let fx = fixture_with(FakeContent::new(listing()), RetryPolicy::exponential(4, 1, 2.0));
        fx.monitor.start_polling(Duration::from_secs(3600));

        for _ in 0..100 {
            if fx.content.list_calls() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        fx.monitor.stop_polling().await;

        assert_eq!(fx.content.list_calls(), 1);
        assert_eq!(fx.db.list_queue_items().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_polling_waits_for_check_in_flight() {
        let fx = fixture_with(
            FakeContent::new(listing()).gated(),
            RetryPolicy::exponential(4, 1, 2.0),
        );
        fx.monitor.start_polling(Duration::from_secs(3600));
        fx.content.wait_list_started().await;

        let monitor = fx.monitor.clone();
        let stop = tokio::spawn(async move { monitor.stop_polling().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stop.is_finished());
        assert!(fx.db.list_queue_items().unwrap().is_empty());

        fx.content.release_list();
        stop.await.unwrap();
        assert_eq!(fx.db.list_queue_items().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_second_start_is_ignored_and_restart_works() {
        let fx = fixture_with(FakeContent::new(listing()), RetryPolicy::exponential(4, 1, 2.0));
        assert!(fx.monitor.start_polling(Duration::from_secs(3600)));
        assert!(!fx.monitor.start_polling(Duration::from_secs(3600)));

        for _ in 0..100 {
            if fx.content.list_calls() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        fx.monitor.stop_polling().await;
        assert_eq!(fx.content.list_calls(), 1);

        // A restarted loop gets a fresh token and checks right away again
        assert!(fx.monitor.start_polling(Duration::from_secs(3600)));
        for _ in 0..100 {
            if fx.content.list_calls() > 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        fx.monitor.stop_polling().await;
        assert_eq!(fx.content.list_calls(), 2);
    }
}

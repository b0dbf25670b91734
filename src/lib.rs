pub mod commands;
pub mod config;
pub mod database;
pub mod error;
pub mod providers;
pub mod worker;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use commands::JobService;
use config::Config;
use database::{Database, Store};
use providers::analyzer::LocalAnalyzer;
use providers::ffmpeg::Ffmpeg;
use providers::gateway::GatewayClient;
use providers::report::MarkdownReport;
use worker::monitor::Monitor;
use worker::pipeline::{PipelineRunner, Providers};
use worker::QueueManager;

/// The running services. Dropping it does not stop them; call
/// [`Daemon::shutdown`].
pub struct Daemon {
    pub jobs: JobService,
    queue: Arc<QueueManager>,
    monitor: Option<Arc<Monitor>>,
}

/// Open the store, build the shipped providers and start the queue worker
/// and (if enabled) the monitor.
pub async fn start(config: &Config) -> Result<Daemon> {
    std::fs::create_dir_all(&config.storage.data_dir)
        .with_context(|| format!("creating data dir {:?}", config.storage.data_dir))?;
    std::fs::create_dir_all(config.storage.videos_dir())
        .with_context(|| format!("creating videos dir {:?}", config.storage.videos_dir()))?;

    let db_path = config.storage.database_path();
    log::info!("Opening database at {:?}", db_path);
    let store: Arc<dyn Store> = Arc::new(Database::new(&db_path)?);

    let analyzer = Arc::new(LocalAnalyzer::new(&config.analysis)?);
    analyzer.log_health().await;

    let content = Arc::new(GatewayClient::new(&config.gateway)?);
    let providers = Providers {
        content: content.clone(),
        analysis: analyzer,
        media: Arc::new(Ffmpeg::new(&config.media)),
        renderer: Arc::new(MarkdownReport),
    };

    let runner = Arc::new(PipelineRunner::new(store.clone(), providers, config));
    let queue = Arc::new(QueueManager::new(
        store.clone(),
        runner,
        config.queue.clone(),
        config.pipeline.continue_on_error,
    ));
    queue.start()?;

    let monitor = if config.monitor.enabled {
        let monitor = Arc::new(Monitor::new(
            store.clone(),
            content,
            queue.clone(),
            config.monitor.list_retry,
        ));
        monitor.start_polling(Duration::from_secs(config.monitor.interval_minutes * 60));
        Some(monitor)
    } else {
        log::info!("Monitor disabled, videos are only queued on request");
        None
    };

    Ok(Daemon {
        jobs: JobService::new(store, queue.clone()),
        queue,
        monitor,
    })
}

impl Daemon {
    /// Stop polling, then let the item in flight finish.
    pub async fn shutdown(self) {
        if let Some(monitor) = &self.monitor {
            monitor.stop_polling().await;
        }
        self.queue.stop().await;
    }
}

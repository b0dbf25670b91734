use anyhow::Result;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use video_ingest::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // `log` records from the library are bridged by the fmt subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = Config::resolve_path(std::env::args_os().nth(1).map(PathBuf::from));
    let config = Config::load(&config_path)?;
    tracing::info!(
        "video-ingest starting (config {:?}, data dir {:?})",
        config_path,
        config.storage.data_dir
    );

    let daemon = video_ingest::start(&config).await?;
    let counts = daemon.jobs.queue_counts()?;
    tracing::info!(
        "Queue: {} pending, {} completed, {} failed",
        counts.pending,
        counts.completed,
        counts.failed
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down, waiting for in-flight work");
    daemon.shutdown().await;
    Ok(())
}

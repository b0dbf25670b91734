//! Daemon configuration.
//!
//! Read from a YAML file where every field has a default, then selectively
//! overridden from the process environment or a `.env` file in the data
//! directory (gateway / Ollama / whisper settings only).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::worker::retry::RetryPolicy;

pub const CONFIG_ENV_VAR: &str = "VIDEO_INGEST_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub gateway: GatewayConfig,
    pub analysis: AnalysisConfig,
    pub media: MediaConfig,
    pub queue: QueueConfig,
    pub monitor: MonitorConfig,
    pub pipeline: PipelineConfig,
    pub batcher: BatcherConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/video_ingest.db`.
    pub database_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database_path: None,
        }
    }
}

impl StorageConfig {
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("video_ingest.db"))
    }

    pub fn videos_dir(&self) -> PathBuf {
        self.data_dir.join("videos")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub connect_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub download_retry: RetryPolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            api_token: None,
            connect_timeout_secs: 30,
            download_timeout_secs: 1800,
            download_retry: RetryPolicy::exponential(3, 2000, 4.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub ollama_url: String,
    pub vision_model: String,
    pub text_model: String,
    pub request_timeout_secs: u64,
    pub whisper_cli_path: PathBuf,
    pub whisper_model_path: PathBuf,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            vision_model: "llava:7b".to_string(),
            text_model: "llama3.2:3b".to_string(),
            request_timeout_secs: 120,
            whisper_cli_path: home.join("bin").join("whisper-cli"),
            whisper_model_path: home.join("models").join("ggml-medium.bin"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Only `max_attempts` matters here: queue retries are driven by the
    /// next dequeue, not by sleeping.
    pub retry: RetryPolicy,
    pub next_item_delay_ms: u64,
    pub retention_days: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::linear(3, 0),
            next_item_delay_ms: 250,
            retention_days: 30,
        }
    }
}

impl QueueConfig {
    pub fn next_item_delay(&self) -> Duration {
        Duration::from_millis(self.next_item_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub list_retry: RetryPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 10,
            list_retry: RetryPolicy::exponential(4, 5000, 2.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Frames sampled per second of video.
    pub sample_rate: f64,
    /// Upper bound on stills per video; longer videos fail frame extraction.
    pub max_frames: usize,
    pub continue_on_error: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 2.0,
            max_frames: 20_000,
            continue_on_error: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    pub batch_size: usize,
    pub analysis_timeout_secs: u64,
    pub retry: RetryPolicy,
    /// Fraction of attempted frames that must complete for the stage to pass.
    pub success_threshold: f64,
    pub inter_batch_delay_ms: u64,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 15,
            analysis_timeout_secs: 60,
            retry: RetryPolicy::linear(3, 2000),
            success_threshold: 0.6,
            inter_batch_delay_ms: 1000,
        }
    }
}

impl BatcherConfig {
    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.analysis_timeout_secs)
    }

    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("video-ingest")
}

impl Config {
    /// Resolve the config path: explicit argument, then `$VIDEO_INGEST_CONFIG`,
    /// then `<default data dir>/config.yaml`.
    pub fn resolve_path(explicit: Option<PathBuf>) -> PathBuf {
        explicit
            .or_else(|| std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from))
            .unwrap_or_else(|| default_data_dir().join("config.yaml"))
    }

    /// Load the YAML file if present (defaults otherwise) and apply
    /// environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {:?}", path))?;
            serde_yaml::from_str::<Config>(&raw)
                .with_context(|| format!("parsing config {:?}", path))?
        } else {
            log::info!("No config file at {:?}, using defaults", path);
            Config::default()
        };

        let env_dir = config.storage.data_dir.clone();
        config.apply_env_overrides(&env_dir);
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self, env_dir: &Path) {
        if let Some(url) = load_env_value(env_dir, "VIDEO_INGEST_GATEWAY_URL") {
            self.gateway.base_url = url;
        }
        if let Some(token) = load_env_value(env_dir, "VIDEO_INGEST_GATEWAY_TOKEN") {
            self.gateway.api_token = Some(token);
        }
        if let Some(url) = load_env_value(env_dir, "OLLAMA_URL") {
            self.analysis.ollama_url = url;
        }
        if let Some(model) = load_env_value(env_dir, "OLLAMA_VISION_MODEL") {
            self.analysis.vision_model = model;
        }
        if let Some(model) = load_env_value(env_dir, "OLLAMA_TEXT_MODEL") {
            self.analysis.text_model = model;
        }
        if let Some(path) = load_env_value(env_dir, "WHISPER_CLI") {
            self.analysis.whisper_cli_path = PathBuf::from(path);
        }
        if let Some(path) = load_env_value(env_dir, "WHISPER_MODEL") {
            self.analysis.whisper_model_path = PathBuf::from(path);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline.sample_rate <= 0.0 || !self.pipeline.sample_rate.is_finite() {
            anyhow::bail!("pipeline.sample_rate must be a positive number");
        }
        if self.pipeline.max_frames == 0 {
            anyhow::bail!("pipeline.max_frames must be at least 1");
        }
        if self.batcher.batch_size == 0 {
            anyhow::bail!("batcher.batch_size must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.batcher.success_threshold) {
            anyhow::bail!("batcher.success_threshold must be between 0 and 1");
        }
        if self.batcher.retry.max_attempts == 0 || self.queue.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.monitor.interval_minutes == 0 {
            anyhow::bail!("monitor.interval_minutes must be at least 1");
        }
        Ok(())
    }
}

/// Look a key up in the process environment, then in `<dir>/.env`.
pub fn load_env_value(dir: &Path, key: &str) -> Option<String> {
    if let Ok(value) = std::env::var(key) {
        if !value.trim().is_empty() {
            return Some(value);
        }
    }

    let env_path = dir.join(".env");
    let prefix = format!("{}=", key);
    let content = std::fs::read_to_string(&env_path).ok()?;
    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix(&prefix) {
            let value = rest.trim().trim_matches('"').trim_matches('\'');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        std::fs::write(
            &path,
            format!(
                "storage:\n  data_dir: {:?}\nbatcher:\n  batch_size: 4\n  success_threshold: 0.75\n",
                temp.path()
            ),
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.batcher.batch_size, 4);
        assert_eq!(config.batcher.success_threshold, 0.75);
        assert_eq!(config.batcher.analysis_timeout_secs, 60);
        assert_eq!(config.pipeline.sample_rate, 2.0);
        assert_eq!(config.queue.retry.max_attempts, 3);
        assert_eq!(
            config.storage.database_path(),
            temp.path().join("video_ingest.db")
        );
    }

    #[test]
    fn test_missing_file_means_defaults() {
        let temp = TempDir::new().unwrap();
        let config = Config::load(&temp.path().join("absent.yaml")).unwrap();
        assert_eq!(config.batcher.batch_size, 15);
        assert_eq!(config.monitor.list_retry.max_attempts, 4);
    }

    #[test]
    fn test_invalid_threshold_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        std::fs::write(&path, "batcher:\n  success_threshold: 1.5\n").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_dotenv_values_are_unquoted() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(".env"),
            "# comment\nVIDEO_INGEST_TEST_ONLY_KEY=\"http://gateway:9000\"\nVIDEO_INGEST_EMPTY_TEST_KEY=\n",
        )
        .unwrap();

        assert_eq!(
            load_env_value(temp.path(), "VIDEO_INGEST_TEST_ONLY_KEY").as_deref(),
            Some("http://gateway:9000")
        );
        assert_eq!(load_env_value(temp.path(), "VIDEO_INGEST_EMPTY_TEST_KEY"), None);
    }
}

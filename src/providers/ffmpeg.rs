//! `MediaTool` backed by the ffmpeg / ffprobe binaries.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use super::MediaTool;
use crate::config::MediaConfig;

pub struct Ffmpeg {
    ffmpeg_path: PathBuf,
    ffprobe_path: PathBuf,
}

impl Ffmpeg {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            ffprobe_path: config.ffprobe_path.clone(),
        }
    }

    fn ffmpeg(&self) -> Command {
        let mut command = Command::new(&self.ffmpeg_path);
        command
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    async fn run(&self, mut command: Command, what: &str) -> Result<()> {
        let output = command
            .output()
            .await
            .with_context(|| format!("Failed to spawn ffmpeg at {:?}", self.ffmpeg_path))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("ffmpeg {} failed ({}): {}", what, output.status, stderr.trim());
        }
        Ok(())
    }
}

/// ffprobe prints the container duration as a bare decimal.
fn parse_duration(stdout: &str) -> Result<f64> {
    let trimmed = stdout.trim();
    let duration: f64 = trimmed
        .parse()
        .with_context(|| format!("Unexpected ffprobe duration output: {:?}", trimmed))?;
    if !duration.is_finite() {
        anyhow::bail!("ffprobe reported a non-finite duration");
    }
    Ok(duration)
}

#[async_trait]
impl MediaTool for Ffmpeg {
    async fn probe_duration(&self, video: &Path) -> Result<f64> {
        let output = Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(video)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to spawn ffprobe at {:?}", self.ffprobe_path))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("ffprobe failed ({}): {}", output.status, stderr.trim());
        }
        parse_duration(&String::from_utf8_lossy(&output.stdout))
    }

    async fn extract_frame(&self, video: &Path, at_seconds: f64, out: &Path) -> Result<()> {
        let at = format!("{:.3}", at_seconds);
        let mut command = self.ffmpeg();
        command
            .arg("-ss")
            .arg(&at)
            .arg("-i")
            .arg(video)
            .args(["-frames:v", "1", "-q:v", "2"])
            .arg(out);
        self.run(command, "frame extraction").await?;

        if !out.exists() {
            anyhow::bail!("ffmpeg produced no frame at {}s", at);
        }
        Ok(())
    }

    async fn extract_audio(&self, video: &Path, out: &Path) -> Result<()> {
        // 16 kHz mono 16-bit PCM, what the transcriber expects
        let mut command = self.ffmpeg();
        command
            .arg("-i")
            .arg(video)
            .args(["-vn", "-ac", "1", "-ar", "16000", "-c:a", "pcm_s16le"])
            .arg(out);
        self.run(command, "audio extraction").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("12.480000\n").unwrap(), 12.48);
        assert!(parse_duration("N/A").is_err());
        assert!(parse_duration("").is_err());
    }
}

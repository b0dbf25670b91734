//! whisper.cpp CLI transcription.
//!
//! Runs `whisper-cli` with full JSON output (`-ojf`) next to the audio file
//! and turns the `transcription` array into [`TranscriptChunk`]s.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::TranscriptChunk;

pub struct WhisperCli {
    cli_path: PathBuf,
    model_path: PathBuf,
}

impl WhisperCli {
    pub fn new(cli_path: PathBuf, model_path: PathBuf) -> Self {
        Self {
            cli_path,
            model_path,
        }
    }

    pub async fn transcribe(&self, audio_path: &Path) -> Result<Vec<TranscriptChunk>> {
        if !audio_path.exists() {
            anyhow::bail!("Audio file not found: {:?}", audio_path);
        }
        if !self.model_path.exists() {
            anyhow::bail!("Model not found: {:?}", self.model_path);
        }

        let output_base = audio_path.with_extension("");
        log::info!("Running whisper-cli on {:?}", audio_path);

        let mut child = Command::new(&self.cli_path)
            .arg("-m")
            .arg(&self.model_path)
            .arg("-f")
            .arg(audio_path)
            .arg("-ojf")
            .arg("-of")
            .arg(&output_base)
            .arg("-pp")
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn whisper-cli at {:?}", self.cli_path))?;

        if let Some(stderr) = child.stderr.take() {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if let Some(progress) = parse_progress(&line) {
                    log::debug!("whisper-cli progress {}%: {:?}", progress, audio_path);
                }
            }
        }

        let status = child
            .wait()
            .await
            .context("Failed to wait for whisper-cli")?;
        if !status.success() {
            anyhow::bail!("whisper-cli failed with status: {}", status);
        }

        let json_path = output_base.with_extension("json");
        let raw = tokio::fs::read_to_string(&json_path)
            .await
            .with_context(|| format!("Failed to read whisper output {:?}", json_path))?;
        let chunks = parse_whisper_json(&raw)?;
        log::info!(
            "Transcription of {:?} produced {} segments",
            audio_path,
            chunks.len()
        );
        Ok(chunks)
    }
}

#[derive(Debug, Deserialize)]
struct WhisperOutput {
    transcription: Vec<WhisperSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    offsets: WhisperOffsets,
    text: String,
    #[serde(default)]
    tokens: Vec<WhisperToken>,
}

#[derive(Debug, Deserialize)]
struct WhisperOffsets {
    from: i64,
    to: i64,
}

#[derive(Debug, Deserialize)]
struct WhisperToken {
    text: String,
    p: f64,
}

/// Segments with blank text are dropped. Confidence is the mean token
/// probability, ignoring special tokens like `[_BEG_]`.
pub fn parse_whisper_json(raw: &str) -> Result<Vec<TranscriptChunk>> {
    let output: WhisperOutput =
        serde_json::from_str(raw).context("Failed to parse whisper JSON output")?;

    let chunks = output
        .transcription
        .into_iter()
        .filter_map(|segment| {
            let text = segment.text.trim().to_string();
            if text.is_empty() {
                return None;
            }
            let probabilities: Vec<f64> = segment
                .tokens
                .iter()
                .filter(|t| !(t.text.starts_with("[_") && t.text.ends_with(']')))
                .map(|t| t.p)
                .collect();
            let confidence = if probabilities.is_empty() {
                None
            } else {
                Some(probabilities.iter().sum::<f64>() / probabilities.len() as f64)
            };
            Some(TranscriptChunk {
                start: segment.offsets.from as f64 / 1000.0,
                end: segment.offsets.to as f64 / 1000.0,
                text,
                confidence,
            })
        })
        .collect();
    Ok(chunks)
}

/// Parse progress percentage from whisper-cli output
fn parse_progress(line: &str) -> Option<i32> {
    if !line.contains("progress") {
        return None;
    }
    line.split_whitespace()
        .filter_map(|part| part.trim_end_matches('%').parse::<i32>().ok())
        .find(|n| (0..=100).contains(n))
}

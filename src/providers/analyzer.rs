//! Local analysis provider: Ollama for vision and text, whisper.cpp for
//! speech.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use super::ollama::{encode_image, OllamaClient};
use super::whisper::WhisperCli;
use super::{AnalysisContext, AnalysisProvider, SummaryDraft, SummaryInput, TranscriptChunk};
use crate::config::AnalysisConfig;
use crate::database::{QuizQuestion, Summary};

/// Transcript text beyond this many characters is cut before prompting.
const MAX_TRANSCRIPT_CHARS: usize = 24_000;
const MAX_FRAME_NOTES: usize = 40;
const QUIZ_QUESTIONS: usize = 5;

const VISION_SYSTEM: &str = "You describe still frames taken from educational videos. \
Always respond with a single JSON object.";

const TEXT_SYSTEM: &str = "You turn video transcripts and frame descriptions into study material. \
Always respond with valid JSON.";

pub struct LocalAnalyzer {
    vision: OllamaClient,
    text: OllamaClient,
    whisper: WhisperCli,
}

impl LocalAnalyzer {
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        Ok(Self {
            vision: OllamaClient::new(&config.ollama_url, &config.vision_model, timeout)?,
            text: OllamaClient::new(&config.ollama_url, &config.text_model, timeout)?,
            whisper: WhisperCli::new(
                config.whisper_cli_path.clone(),
                config.whisper_model_path.clone(),
            ),
        })
    }

    /// Log whether the configured models are pulled. Never fails startup.
    pub async fn log_health(&self) {
        for client in [&self.vision, &self.text] {
            match client.health_check().await {
                Ok(status) if status.model_available => {
                    log::info!("Ollama model {} available", status.model)
                }
                Ok(status) => log::warn!(
                    "Ollama model {} not pulled (have: {})",
                    status.model,
                    status.available_models.join(", ")
                ),
                Err(e) => log::warn!("Ollama health check for {} failed: {:#}", client.model(), e),
            }
        }
    }
}

fn summary_prompt(input: &SummaryInput) -> String {
    let mut prompt = format!("Video: {}\n", input.video_name);
    if let Some(duration) = input.duration_seconds {
        let _ = writeln!(prompt, "Duration: {:.0} seconds", duration);
    }

    prompt.push_str("\nTRANSCRIPT:\n");
    let mut used = 0;
    for segment in &input.transcript {
        if used + segment.text.len() > MAX_TRANSCRIPT_CHARS {
            prompt.push_str("[transcript truncated]\n");
            break;
        }
        used += segment.text.len();
        let _ = writeln!(prompt, "[{:.0}s] {}", segment.start_time, segment.text);
    }
    if input.transcript.is_empty() {
        prompt.push_str("(no speech)\n");
    }

    prompt.push_str("\nFRAMES:\n");
    let step = (input.frame_notes.len() / MAX_FRAME_NOTES).max(1);
    for note in input.frame_notes.iter().step_by(step).take(MAX_FRAME_NOTES) {
        let _ = writeln!(prompt, "[{:.1}s] {}", note.timestamp_seconds, note.analysis);
    }

    prompt.push_str(
        "\nWrite a concise summary of the video. Respond as \
         {\"summary\": \"...\", \"key_points\": [\"...\"]}.",
    );
    prompt
}

#[derive(Debug, Deserialize)]
struct SummaryReply {
    #[serde(alias = "text")]
    summary: String,
    #[serde(default)]
    key_points: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct QuizReply {
    questions: Vec<QuizQuestion>,
}

/// Drop questions the model got structurally wrong.
fn valid_questions(questions: Vec<QuizQuestion>) -> Vec<QuizQuestion> {
    questions
        .into_iter()
        .filter(|q| {
            !q.question.trim().is_empty() && q.options.len() >= 2 && q.answer_index < q.options.len()
        })
        .collect()
}

#[async_trait]
impl AnalysisProvider for LocalAnalyzer {
    async fn analyze_image(
        &self,
        path: &Path,
        context: &AnalysisContext,
    ) -> Result<serde_json::Value> {
        let image = encode_image(path).await?;
        let prompt = format!(
            "This frame comes from \"{}\" at {:.1}s (frame {}). Respond as \
             {{\"description\": \"...\", \"objects\": [\"...\"], \"text_on_screen\": \"...\"}}.",
            context.video_name, context.timestamp_seconds, context.frame_index
        );
        self.vision
            .generate_json(&prompt, Some(VISION_SYSTEM), vec![image])
            .await
    }

    async fn transcribe(&self, audio_path: &Path) -> Result<Vec<TranscriptChunk>> {
        self.whisper.transcribe(audio_path).await
    }

    async fn summarize(&self, input: &SummaryInput) -> Result<SummaryDraft> {
        let json = self
            .text
            .generate_json(&summary_prompt(input), Some(TEXT_SYSTEM), Vec::new())
            .await?;
        let reply: SummaryReply =
            serde_json::from_value(json).context("Summary reply has the wrong shape")?;
        Ok(SummaryDraft {
            text: reply.summary,
            key_points: reply.key_points,
        })
    }

    async fn generate_quiz(&self, summary: &Summary) -> Result<Vec<QuizQuestion>> {
        let prompt = format!(
            "SUMMARY:\n{}\n\nKEY POINTS:\n- {}\n\nWrite {} multiple-choice questions. Respond as \
             {{\"questions\": [{{\"question\": \"...\", \"options\": [\"...\"], \"answer_index\": 0}}]}}.",
            summary.text,
            summary.key_points.join("\n- "),
            QUIZ_QUESTIONS
        );
        let json = self
            .text
            .generate_json(&prompt, Some(TEXT_SYSTEM), Vec::new())
            .await?;
        let reply: QuizReply =
            serde_json::from_value(json).context("Quiz reply has the wrong shape")?;
        let questions = valid_questions(reply.questions);
        if questions.is_empty() {
            anyhow::bail!("Quiz reply contained no usable questions");
        }
        Ok(questions)
    }
}

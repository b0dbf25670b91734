//! Ollama REST client used for frame description, summaries and quizzes.

use anyhow::{Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Ollama client bound to one model
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create Ollama HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Check if Ollama is running and the model is available
    pub async fn health_check(&self) -> Result<OllamaStatus> {
        let tags_url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&tags_url)
            .send()
            .await
            .context("Ollama not running")?;

        if !response.status().is_success() {
            anyhow::bail!("Ollama server returned {}", response.status());
        }

        let tags: TagsResponse = response
            .json()
            .await
            .context("Failed to parse Ollama response")?;

        let family = self.model.split(':').next().unwrap_or(&self.model);
        let model_available = tags.models.iter().any(|m| m.name.starts_with(family));

        Ok(OllamaStatus {
            model: self.model.clone(),
            model_available,
            available_models: tags.models.into_iter().map(|m| m.name).collect(),
        })
    }

    /// Generate a completion, optionally attaching images (vision models).
    pub async fn generate(
        &self,
        prompt: &str,
        system: Option<&str>,
        images: Vec<String>,
    ) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);

        let request = GenerateRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            system: system.map(|s| s.to_string()),
            images,
            stream: false,
            format: Some("json".to_string()),
            options: Some(GenerateOptions {
                temperature: 0.2,
                num_predict: 2048,
            }),
        };

        log::debug!(
            "Sending request to Ollama: model={}, prompt_len={}, images={}",
            self.model,
            prompt.len(),
            request.images.len()
        );

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to call Ollama")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama returned {}: {}", status, body);
        }

        let result: GenerateResponse = response
            .json()
            .await
            .context("Failed to parse Ollama response")?;

        log::debug!(
            "Ollama response received: {} chars, eval_duration={:?}ms",
            result.response.len(),
            result.eval_duration.map(|d| d / 1_000_000)
        );

        Ok(result.response)
    }

    /// Generate and parse the reply as JSON.
    pub async fn generate_json(
        &self,
        prompt: &str,
        system: Option<&str>,
        images: Vec<String>,
    ) -> Result<serde_json::Value> {
        let response = self.generate(prompt, system, images).await?;
        extract_json_from_response(&response).with_context(|| {
            let preview: String = response.chars().take(200).collect();
            format!("Ollama reply was not JSON: {}", preview)
        })
    }
}

/// Read an image from disk and base64-encode it for the `images` field.
pub async fn encode_image(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read image {:?}", path))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Extract JSON from LLM response (handles markdown code blocks)
pub fn extract_json_from_response(response: &str) -> Option<serde_json::Value> {
    let trimmed = response.trim();

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return Some(json);
    }

    if let Some(start) = trimmed.find("```json") {
        let after_marker = &trimmed[start + 7..];
        if let Some(end) = after_marker.find("```") {
            let json_str = after_marker[..end].trim();
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(json_str) {
                return Some(json);
            }
        }
    }

    // First balanced object or array embedded in prose, whichever opens first
    let mut openers: Vec<(usize, char, char)> = [('{', '}'), ('[', ']')]
        .into_iter()
        .filter_map(|(open, close)| trimmed.find(open).map(|pos| (pos, open, close)))
        .collect();
    openers.sort_by_key(|(pos, _, _)| *pos);

    for (start, open, close) in openers {
        let mut depth = 0;
        let mut end = None;
        for (i, c) in trimmed[start..].char_indices() {
            if c == open {
                depth += 1;
            } else if c == close {
                depth -= 1;
                if depth == 0 {
                    end = Some(start + i + c.len_utf8());
                    break;
                }
            }
        }
        if let Some(end) = end {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(&trimmed[start..end]) {
                return Some(json);
            }
        }
    }

    None
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<GenerateOptions>,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: i32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    eval_duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaStatus {
    pub model: String,
    pub model_available: bool,
    pub available_models: Vec<String>,
}

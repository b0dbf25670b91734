//! HTTP client for the content network gateway.
//!
//! Gateway endpoints:
//! - `GET  {base}/content`       → JSON array of listing entries
//! - `GET  {base}/content/{id}`  → raw bytes
//! - `POST {base}/pins/{id}`     → pin the content on the gateway node

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use super::{ContentProvider, DownloadOptions, RemoteItem};
use crate::config::GatewayConfig;
use crate::worker::retry::{RetryDecision, RetryPolicy};

pub struct GatewayClient {
    client: reqwest::Client,
    download_client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
    retry: RetryPolicy,
}

/// Listing entry as the gateway spells it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListingEntry {
    #[serde(alias = "cid")]
    id: String,
    name: String,
    #[serde(default, alias = "mime_type")]
    mime_type: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

impl From<ListingEntry> for RemoteItem {
    fn from(entry: ListingEntry) -> Self {
        RemoteItem {
            id: entry.id,
            name: entry.name,
            mime_type: entry.mime_type,
            size: entry.size,
        }
    }
}

impl GatewayClient {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to create HTTP client")?;
        let download_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.download_timeout_secs))
            .build()
            .context("Failed to create download HTTP client")?;

        Ok(Self {
            client,
            download_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            retry: config.download_retry,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Single download attempt with streaming and Content-Length validation
    async fn try_download(&self, id: &str, file_path: &Path) -> Result<u64> {
        log::info!("Downloading {} to: {:?}", id, file_path);

        let url = format!("{}/content/{}", self.base_url, id);
        let response = self
            .authorize(self.download_client.get(&url))
            .send()
            .await
            .context("Failed to start download")?;

        if !response.status().is_success() {
            anyhow::bail!("Download failed with status: {}", response.status());
        }

        let content_length = response.content_length();
        let mut stream = response.bytes_stream();
        let mut file = tokio::fs::File::create(file_path)
            .await
            .context("Failed to create file")?;
        let mut downloaded: u64 = 0;

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.context("Error reading download stream")?;
            file.write_all(&chunk)
                .await
                .context("Failed to write chunk")?;
            downloaded += chunk.len() as u64;
        }

        file.flush().await.context("Failed to flush file")?;

        if let Some(expected) = content_length {
            if downloaded != expected {
                anyhow::bail!(
                    "Download incomplete: got {} bytes, expected {}",
                    downloaded,
                    expected
                );
            }
        }

        log::info!("Download complete: {} bytes", downloaded);
        Ok(downloaded)
    }
}

/// Keep file names portable: anything that is not alphanumeric, dot, dash,
/// underscore or space becomes an underscore.
pub fn safe_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        "video".to_string()
    } else {
        trimmed.to_string()
    }
}

#[async_trait]
impl ContentProvider for GatewayClient {
    async fn list(&self) -> Result<Vec<RemoteItem>> {
        let url = format!("{}/content", self.base_url);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .with_context(|| format!("Failed to list content at {}", url))?;

        if !response.status().is_success() {
            anyhow::bail!("Listing failed with status: {}", response.status());
        }

        let entries: Vec<ListingEntry> = response
            .json()
            .await
            .context("Failed to parse content listing")?;
        Ok(entries.into_iter().map(RemoteItem::from).collect())
    }

    /// Download with streaming, timeouts, and automatic retry
    async fn download(&self, id: &str, opts: &DownloadOptions) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&opts.dest_dir)
            .await
            .with_context(|| format!("Failed to create {:?}", opts.dest_dir))?;
        let file_path = opts.dest_dir.join(safe_file_name(&opts.file_name));

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.try_download(id, &file_path).await {
                Ok(_) => return Ok(file_path),
                Err(e) => {
                    // Clean up partial file
                    let _ = tokio::fs::remove_file(&file_path).await;

                    match self.retry.decide(attempts) {
                        RetryDecision::RetryAfter(delay) => {
                            log::warn!(
                                "Download attempt {} failed, retrying in {:?}: {:#}",
                                attempts,
                                delay,
                                e
                            );
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::GiveUp => {
                            return Err(e.context(format!(
                                "Download failed after {} attempts",
                                attempts
                            )));
                        }
                    }
                }
            }
        }
    }

    async fn pin(&self, id: &str) -> Result<()> {
        let url = format!("{}/pins/{}", self.base_url, id);
        let response = self
            .authorize(self.client.post(&url))
            .send()
            .await
            .with_context(|| format!("Failed to pin {}", id))?;

        if !response.status().is_success() {
            anyhow::bail!("Pin of {} failed with status: {}", id, response.status());
        }
        log::debug!("Pinned {}", id);
        Ok(())
    }
}

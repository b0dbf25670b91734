//! Frame sampling and on-disk naming.
//!
//! Every sampled still exists under two names in the video's frame
//! directory: `frame_at_{t:.3}s.jpg` (primary) and `frame_{i:06}.jpg`
//! (alternative). The second is a hard link to the first, or a byte copy on
//! filesystems without hard links.

use anyhow::{Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::database::NewFrame;
use crate::providers::MediaTool;

pub const FRAMES_DIR: &str = "frames";

/// `ceil(duration * rate)`, with float noise below 1e-9 treated as an exact
/// integer so 0.3s at 10/s yields 3 frames, not 4.
pub fn frame_count(duration_seconds: f64, rate: f64) -> usize {
    if !duration_seconds.is_finite() || !rate.is_finite() || duration_seconds <= 0.0 || rate <= 0.0
    {
        return 0;
    }
    let product = duration_seconds * rate;
    let nearest = product.round();
    if (product - nearest).abs() < 1e-9 {
        nearest as usize
    } else {
        product.ceil() as usize
    }
}

pub fn sample_instants(duration_seconds: f64, rate: f64) -> Vec<f64> {
    (0..frame_count(duration_seconds, rate))
        .map(|i| i as f64 / rate)
        .collect()
}

pub fn timestamp_file_name(timestamp_seconds: f64) -> String {
    format!("frame_at_{:.3}s.jpg", timestamp_seconds)
}

pub fn index_file_name(frame_index: i64) -> String {
    format!("frame_{:06}.jpg", frame_index)
}

fn timestamp_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^frame_at_(\d+(?:\.\d+)?)s\.jpe?g$").expect("valid frame timestamp regex")
    })
}

fn index_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^frame_(\d+)\.jpe?g$").expect("valid frame index regex"))
}

pub fn parse_timestamp_file_name(name: &str) -> Option<f64> {
    timestamp_pattern()
        .captures(name)
        .and_then(|c| c[1].parse().ok())
}

pub fn parse_index_file_name(name: &str) -> Option<i64> {
    index_pattern().captures(name).and_then(|c| c[1].parse().ok())
}

pub fn is_frame_file_name(name: &str) -> bool {
    timestamp_pattern().is_match(name) || index_pattern().is_match(name)
}

/// Make `dst` resolve to the same bytes as `src`.
pub async fn link_or_copy(src: &Path, dst: &Path) -> Result<()> {
    if tokio::fs::try_exists(dst).await.unwrap_or(false) {
        tokio::fs::remove_file(dst)
            .await
            .with_context(|| format!("Failed to replace {:?}", dst))?;
    }
    if let Err(e) = tokio::fs::hard_link(src, dst).await {
        log::debug!("Hard link {:?} -> {:?} failed ({}), copying", src, dst, e);
        tokio::fs::copy(src, dst)
            .await
            .with_context(|| format!("Failed to copy {:?} to {:?}", src, dst))?;
    }
    Ok(())
}

/// Write every sampled still for a video and return the rows to persist.
/// Fails without touching disk when the duration is not positive or would
/// need more than `max_frames` stills.
pub async fn extract_frames(
    media: &dyn MediaTool,
    video_path: &Path,
    frames_dir: &Path,
    duration_seconds: f64,
    rate: f64,
    max_frames: usize,
) -> Result<Vec<NewFrame>> {
    let count = frame_count(duration_seconds, rate);
    if count == 0 {
        anyhow::bail!(
            "Cannot sample frames from a video of duration {}s",
            duration_seconds
        );
    }
    if count > max_frames {
        anyhow::bail!(
            "A duration of {}s at {}/s needs {} frames, over the limit of {}",
            duration_seconds,
            rate,
            count,
            max_frames
        );
    }
    let instants = sample_instants(duration_seconds, rate);

    tokio::fs::create_dir_all(frames_dir)
        .await
        .with_context(|| format!("Failed to create frame dir {:?}", frames_dir))?;

    log::info!(
        "Extracting {} frames from {:?} ({:.1}s at {}/s)",
        instants.len(),
        video_path,
        duration_seconds,
        rate
    );

    let mut frames = Vec::with_capacity(instants.len());
    for (i, t) in instants.into_iter().enumerate() {
        let frame_index = i as i64;
        let primary: PathBuf = frames_dir.join(timestamp_file_name(t));
        let alternative: PathBuf = frames_dir.join(index_file_name(frame_index));

        media
            .extract_frame(video_path, t, &primary)
            .await
            .with_context(|| format!("Failed to extract frame {} at {:.3}s", frame_index, t))?;
        link_or_copy(&primary, &alternative).await?;

        frames.push(NewFrame {
            primary_path: primary.to_string_lossy().to_string(),
            alternative_path: Some(alternative.to_string_lossy().to_string()),
            timestamp_seconds: t,
            frame_index,
        });
    }

    Ok(frames)
}

//! Locate a frame's image on disk, repairing stale stored paths.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::frames::{is_frame_file_name, parse_index_file_name, parse_timestamp_file_name};
use crate::database::{Frame, Store};

/// File names encode timestamps with millisecond precision.
const TIMESTAMP_TOLERANCE: f64 = 0.001 + 1e-9;

pub struct FramePathResolver {
    store: Arc<dyn Store>,
}

impl FramePathResolver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Resolution order: stored primary path, stored alternative path, then a
    /// scan of `video_dir` by encoded timestamp, by index, and finally the
    /// first frame file by name. Any hit other than the primary path rewrites
    /// the stored primary path. `None` means no usable file exists.
    pub fn resolve(&self, frame: &Frame, video_dir: &Path) -> Option<PathBuf> {
        let primary = PathBuf::from(&frame.primary_path);
        if primary.is_file() {
            return Some(primary);
        }

        if let Some(alternative) = frame.alternative_path.as_deref().map(PathBuf::from) {
            if alternative.is_file() {
                self.heal(frame, &alternative);
                return Some(alternative);
            }
        }

        let found = scan_dir(frame, video_dir)?;
        self.heal(frame, &found);
        Some(found)
    }

    fn heal(&self, frame: &Frame, path: &Path) {
        let path = path.to_string_lossy();
        if path == frame.primary_path {
            return;
        }
        log::info!(
            "Frame {} primary path {} missing, now {}",
            frame.id,
            frame.primary_path,
            path
        );
        if let Err(e) = self.store.update_frame_primary_path(frame.id, &path) {
            log::warn!("Failed to update primary path for frame {}: {:#}", frame.id, e);
        }
    }
}

fn scan_dir(frame: &Frame, video_dir: &Path) -> Option<PathBuf> {
    let entries = match std::fs::read_dir(video_dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::debug!("Cannot scan {:?} for frame {}: {}", video_dir, frame.id, e);
            return None;
        }
    };

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| is_frame_file_name(name))
        .collect();
    names.sort();

    let by_timestamp = names.iter().find(|name| {
        parse_timestamp_file_name(name)
            .map(|t| (t - frame.timestamp_seconds).abs() <= TIMESTAMP_TOLERANCE)
            .unwrap_or(false)
    });
    let by_index = || {
        names
            .iter()
            .find(|name| parse_index_file_name(name) == Some(frame.frame_index))
    };

    by_timestamp
        .or_else(by_index)
        .or_else(|| names.first())
        .map(|name| video_dir.join(name))
}

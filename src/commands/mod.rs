//! Job submission API for an outer command layer (chat bot, HTTP shim).
//!
//! Everything here returns [`AppError`], which serializes as a plain string.

pub mod jobs;
pub mod queue;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::database::{FrameCounts, QueueStatus, StageFlags, Store};
use crate::worker::QueueManager;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EnqueueOptions {
    /// Shown in the queue; falls back to the known video name, then the id.
    pub display_name: Option<String>,
    pub force: bool,
    pub requested_by: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub content_id: String,
    pub name: String,
    pub stages: StageFlags,
    pub processed: bool,
    pub processing: bool,
    pub last_error: Option<String>,
    pub last_error_at: Option<String>,
    pub report_path: Option<String>,
    pub frames: FrameCounts,
    pub queue_status: Option<QueueStatus>,
    pub failed_attempts: Option<i32>,
}

#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn Store>,
    queue: Arc<QueueManager>,
}

impl JobService {
    pub fn new(store: Arc<dyn Store>, queue: Arc<QueueManager>) -> Self {
        Self { store, queue }
    }
}

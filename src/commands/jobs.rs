use super::{EnqueueOptions, JobService, JobStatus};
use crate::database::{NewQueueItem, QueueItem, QueueMetadata, QueueStatus};
use crate::error::AppError;

impl JobService {
    /// Queue a video by content id. Already-queued items are returned as is,
    /// unless `force` asks for a fresh run.
    pub fn enqueue_by_content_id(
        &self,
        content_id: &str,
        options: EnqueueOptions,
    ) -> Result<QueueItem, AppError> {
        let content_id = content_id.trim();
        if content_id.is_empty() {
            return Err(AppError::InvalidRequest("content id is empty".to_string()));
        }

        let known = self.store.get_video_by_content_id(content_id)?;
        let name = options
            .display_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .or_else(|| known.map(|v| v.name))
            .unwrap_or_else(|| content_id.to_string());
        self.store.ensure_video(content_id, &name)?;

        let metadata = QueueMetadata::Requested {
            force: options.force,
            requested_by: options.requested_by,
        };
        let (item, created) = self.queue.enqueue(NewQueueItem {
            content_id: content_id.to_string(),
            display_name: name,
            metadata: metadata.clone(),
        })?;

        if options.force && !created {
            return self.requeue(&item, &metadata);
        }
        Ok(item)
    }

    /// Stage flags, errors and queue position of one video.
    pub fn get_status(&self, content_id: &str) -> Result<JobStatus, AppError> {
        let video = self
            .store
            .get_video_by_content_id(content_id)?
            .ok_or_else(|| AppError::NotFound(content_id.to_string()))?;
        let item = self.store.get_queue_item(content_id)?;
        let frames = self.store.count_frames(video.id)?;

        Ok(JobStatus {
            stages: video.stage_flags(),
            content_id: video.content_id,
            name: video.name,
            processed: video.processed,
            processing: video.processing,
            last_error: video.last_error,
            last_error_at: video.last_error_at,
            report_path: video.report_path,
            frames,
            queue_status: item.as_ref().map(|i| i.status),
            failed_attempts: item.as_ref().map(|i| i.failed_attempts),
        })
    }

    /// Run every stage again for a known video.
    pub fn force_reprocess(&self, content_id: &str) -> Result<QueueItem, AppError> {
        let video = self
            .store
            .get_video_by_content_id(content_id)?
            .ok_or_else(|| AppError::NotFound(content_id.to_string()))?;
        log::info!("Forced reprocess requested for {}", content_id);

        self.enqueue_by_content_id(
            content_id,
            EnqueueOptions {
                display_name: Some(video.name),
                force: true,
                requested_by: None,
            },
        )
    }

    /// `item` may be stale: the worker can pick it up between the read and
    /// the requeue, so a refused requeue is re-checked against the store.
    pub(super) fn requeue(
        &self,
        item: &QueueItem,
        metadata: &QueueMetadata,
    ) -> Result<QueueItem, AppError> {
        if item.status == QueueStatus::Processing {
            return Err(being_processed(&item.content_id));
        }
        if let Some(requeued) = self.queue.requeue(&item.content_id, metadata)? {
            return Ok(requeued);
        }
        match self.store.get_queue_item(&item.content_id)? {
            Some(current) if current.status == QueueStatus::Processing => {
                Err(being_processed(&item.content_id))
            }
            _ => Err(AppError::NotFound(item.content_id.clone())),
        }
    }
}

fn being_processed(content_id: &str) -> AppError {
    AppError::InvalidRequest(format!("{} is being processed right now", content_id))
}

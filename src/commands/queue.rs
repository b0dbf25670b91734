use super::JobService;
use crate::database::{QueueCounts, QueueSnapshot, QueueStatus};
use crate::error::AppError;

impl JobService {
    pub fn queue(&self) -> Result<QueueSnapshot, AppError> {
        self.queue.snapshot().map_err(AppError::from)
    }

    pub fn queue_counts(&self) -> Result<QueueCounts, AppError> {
        self.queue.counts().map_err(AppError::from)
    }

    pub fn remove_from_queue(&self, content_id: &str) -> Result<(), AppError> {
        let item = self
            .store
            .get_queue_item(content_id)?
            .ok_or_else(|| AppError::NotFound(content_id.to_string()))?;
        if item.status == QueueStatus::Processing {
            return Err(AppError::InvalidRequest(format!(
                "{} is being processed right now",
                content_id
            )));
        }

        if !self.queue.remove(content_id)? {
            return Err(AppError::NotFound(content_id.to_string()));
        }
        log::info!("Removed {} from the queue", content_id);
        Ok(())
    }
}

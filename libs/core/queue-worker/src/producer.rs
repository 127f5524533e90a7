//! Job producer
//!
//! Publishes typed jobs as persistent JSON messages.

use crate::error::WorkerError;
use crate::registry::QueueJob;
use crate::transport::{PublishOptions, QueueTransport};
use std::sync::Arc;
use tracing::debug;

pub struct JobProducer<T: QueueTransport> {
    transport: Arc<T>,
    queue: String,
}

impl<T: QueueTransport> Clone for JobProducer<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            queue: self.queue.clone(),
        }
    }
}

impl<T: QueueTransport> JobProducer<T> {
    pub fn new(transport: Arc<T>, queue: impl Into<String>) -> Self {
        Self {
            transport,
            queue: queue.into(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Publish a job, returning the transport's message id
    pub async fn send<J: QueueJob>(&self, job: &J) -> Result<String, WorkerError> {
        let payload = serde_json::to_vec(job)?;
        let message_id = self
            .transport
            .publish(&self.queue, &payload, PublishOptions::persistent())
            .await?;

        debug!(
            queue = %self.queue,
            job_id = %job.job_id(),
            retry_count = job.retry_count(),
            message_id = %message_id,
            "Published job"
        );

        Ok(message_id)
    }
}

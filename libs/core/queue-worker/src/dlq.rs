//! Dead Letter Queue (DLQ)
//!
//! Records jobs the worker gave up on: invalid payloads, permanent failures,
//! exhausted retries and retries that could not be re-enqueued.

use crate::error::WorkerError;
use crate::metrics::WorkerMetrics;
use crate::registry::QueueJob;
use crate::transport::{PublishOptions, QueueTransport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    InvalidPayload,
    PermanentFailure,
    RetriesExhausted,
    RequeueFailed,
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeadLetterReason::InvalidPayload => "invalid_payload",
            DeadLetterReason::PermanentFailure => "permanent_failure",
            DeadLetterReason::RetriesExhausted => "retries_exhausted",
            DeadLetterReason::RequeueFailed => "requeue_failed",
        };
        f.write_str(s)
    }
}

/// Replacement value for masked payload fields
pub const REDACTED: &str = "[REDACTED]";

/// One DLQ entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job_id: Option<String>,
    /// The job as JSON, or the raw payload as a string when it was not valid JSON
    pub payload: serde_json::Value,
    pub error: String,
    pub reason: DeadLetterReason,
    pub retry_count: Option<u32>,
    pub source_queue: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn for_job<J: QueueJob>(
        job: &J,
        reason: DeadLetterReason,
        error: impl Into<String>,
        source_queue: impl Into<String>,
    ) -> Result<Self, WorkerError> {
        Ok(Self {
            job_id: Some(job.job_id().to_string()),
            payload: serde_json::to_value(job)?,
            error: error.into(),
            reason,
            retry_count: Some(job.retry_count()),
            source_queue: source_queue.into(),
            failed_at: Utc::now(),
        })
    }

    pub fn for_payload(
        payload: &[u8],
        reason: DeadLetterReason,
        error: impl Into<String>,
        source_queue: impl Into<String>,
    ) -> Self {
        let payload = serde_json::from_slice(payload).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(payload).into_owned())
        });

        Self {
            job_id: None,
            payload,
            error: error.into(),
            reason,
            retry_count: None,
            source_queue: source_queue.into(),
            failed_at: Utc::now(),
        }
    }

    /// Mask the given top-level payload fields. Non-object payloads are left as they are.
    pub fn redact(&mut self, fields: &[&str]) {
        let serde_json::Value::Object(map) = &mut self.payload else {
            return;
        };
        for field in fields {
            if let Some(value) = map.get_mut(*field) {
                *value = serde_json::Value::String(REDACTED.to_string());
            }
        }
    }
}

pub struct DeadLetterQueue<T: QueueTransport> {
    transport: Arc<T>,
    queue: String,
    redacted_fields: &'static [&'static str],
    metrics: WorkerMetrics,
}

impl<T: QueueTransport> DeadLetterQueue<T> {
    pub fn new(transport: Arc<T>, queue: impl Into<String>, metrics: WorkerMetrics) -> Self {
        Self {
            transport,
            queue: queue.into(),
            redacted_fields: &[],
            metrics,
        }
    }

    /// Fields masked in every entry this queue writes
    pub fn with_redacted_fields(mut self, fields: &'static [&'static str]) -> Self {
        self.redacted_fields = fields;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub async fn publish(&self, entry: &DeadLetter) -> Result<String, WorkerError> {
        let data = if self.redacted_fields.is_empty() {
            serde_json::to_vec(entry)?
        } else {
            let mut masked = entry.clone();
            masked.redact(self.redacted_fields);
            serde_json::to_vec(&masked)?
        };
        let id = self
            .transport
            .publish(&self.queue, &data, PublishOptions::persistent())
            .await?;

        info!(
            job_id = ?entry.job_id,
            dlq_id = %id,
            reason = %entry.reason,
            error = %entry.error,
            retry_count = ?entry.retry_count,
            "Moved job to DLQ"
        );
        self.metrics.dead_lettered(entry.reason);

        Ok(id)
    }

    /// Publish, logging instead of returning a failure. The job is lost if this fails.
    pub async fn record(&self, entry: DeadLetter) {
        if let Err(e) = self.publish(&entry).await {
            error!(
                job_id = ?entry.job_id,
                reason = %entry.reason,
                dlq = %self.queue,
                error = %e,
                "Failed to write DLQ entry, job is lost"
            );
        }
    }
}

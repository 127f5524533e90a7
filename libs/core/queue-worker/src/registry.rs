//! Queue definitions and the traits domain crates implement.
//!
//! - `QueueDef` names a queue and its defaults
//! - `QueueJob` is the typed job record carried by a queue
//! - `JobHandler` turns raw payloads into jobs and processes them

use crate::error::HandlerError;
use async_trait::async_trait;
use serde::Serialize;

/// Static description of a queue.
///
/// # Example
///
/// ```rust,ignore
/// pub struct OtpQueue;
///
/// impl QueueDef for OtpQueue {
///     const QUEUE_NAME: &'static str = "notifications";
///     const CONSUMER_GROUP: &'static str = "otp_workers";
///     const DEAD_LETTER_QUEUE: &'static str = "notifications:dlq";
/// }
/// ```
pub trait QueueDef: Send + Sync {
    /// Queue the worker consumes from and re-enqueues retries to
    const QUEUE_NAME: &'static str;

    /// Consumer group shared by all worker replicas
    const CONSUMER_GROUP: &'static str;

    /// Where terminally failed jobs are recorded
    const DEAD_LETTER_QUEUE: &'static str;

    /// Retries allowed after the first attempt
    const MAX_RETRIES: u32 = 3;

    /// Backoff base in milliseconds
    const BASE_DELAY_MS: u64 = 1000;

    /// Max unacknowledged messages per consumer
    const PREFETCH_COUNT: usize = 1;

    /// Approximate cap on queue length (oldest entries trimmed)
    const MAX_LENGTH: i64 = 100_000;

    /// Idle time before a crashed consumer's messages are claimed by another
    const CLAIM_IDLE_MS: u64 = 30_000;
}

/// A job record carried by a queue.
///
/// Records are immutable; a retry is a new record built by `with_retry`.
pub trait QueueJob: Serialize + Send + Sync + Clone + 'static {
    /// Correlation id for logging, preserved across retries
    fn job_id(&self) -> &str;

    /// Number of delivery attempts that already failed
    fn retry_count(&self) -> u32;

    /// New record with `retry_count + 1` and a fresh timestamp
    fn with_retry(&self) -> Self;

    /// Top-level fields masked in dead-letter entries
    const REDACTED_FIELDS: &'static [&'static str] = &[];

    /// True when another attempt would exceed `max_retries`
    fn exceeded_max_retries(&self, max_retries: u32) -> bool {
        self.retry_count() >= max_retries
    }
}

/// Decodes and processes jobs of type `J`.
#[async_trait]
pub trait JobHandler<J: QueueJob>: Send + Sync + 'static {
    /// Turn a raw payload into a validated job.
    ///
    /// Return `HandlerError::Invalid` for payloads that can never be processed.
    fn decode(&self, payload: &[u8]) -> Result<J, HandlerError>;

    /// Process one job. Transient errors are retried by the worker.
    async fn handle(&self, job: &J) -> Result<(), HandlerError>;

    /// Handler name for logs and metric labels.
    fn name(&self) -> &'static str;

    /// Checked once at startup; a failure is logged, not fatal.
    async fn health_check(&self) -> Result<bool, HandlerError> {
        Ok(true)
    }
}

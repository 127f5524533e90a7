//! Retry scheduling.
//!
//! A failed job is either re-enqueued after an exponential backoff delay with a
//! retry count one higher, or given up on once `max_retries` is reached. Each pending
//! retry is a tracked task bound to the shutdown signal, so shutdown can flush or
//! abandon them explicitly instead of losing them with the process.

use crate::backoff::Backoff;
use crate::config::{RetryShutdownPolicy, WorkerConfig};
use crate::dlq::{DeadLetter, DeadLetterQueue, DeadLetterReason};
use crate::error::{HandlerError, WorkerError};
use crate::lifecycle::wait_for_shutdown;
use crate::metrics::WorkerMetrics;
use crate::producer::JobProducer;
use crate::registry::QueueJob;
use crate::transport::QueueTransport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue pending after `delay`
    Scheduled { next_retry_count: u32, delay: Duration },
    /// Retries used up, the job is dropped
    Exhausted { retry_count: u32 },
}

pub struct RetryScheduler<T: QueueTransport> {
    producer: JobProducer<T>,
    dead_letters: Option<Arc<DeadLetterQueue<T>>>,
    backoff: Backoff,
    max_retries: u32,
    policy: RetryShutdownPolicy,
    shutdown: watch::Receiver<bool>,
    pending: Mutex<JoinSet<()>>,
    metrics: WorkerMetrics,
}

struct RetryTask<J, T: QueueTransport> {
    job: J,
    delay: Duration,
    producer: JobProducer<T>,
    dead_letters: Option<Arc<DeadLetterQueue<T>>>,
    policy: RetryShutdownPolicy,
    shutdown: watch::Receiver<bool>,
    metrics: WorkerMetrics,
}

impl<T: QueueTransport> RetryScheduler<T> {
    pub fn new(
        transport: Arc<T>,
        config: &WorkerConfig,
        shutdown: watch::Receiver<bool>,
        metrics: WorkerMetrics,
    ) -> Self {
        Self {
            producer: JobProducer::new(transport, config.queue_name.clone()),
            dead_letters: None,
            backoff: config.backoff(),
            max_retries: config.max_retries,
            policy: config.retry_shutdown_policy,
            shutdown,
            pending: Mutex::new(JoinSet::new()),
            metrics,
        }
    }

    pub fn with_dead_letters(mut self, dead_letters: Arc<DeadLetterQueue<T>>) -> Self {
        self.dead_letters = Some(dead_letters);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Decide between retry and give-up for a job whose delivery just failed.
    ///
    /// Returns as soon as the decision is made; the re-enqueue itself happens on a
    /// background task after the backoff delay.
    pub async fn schedule<J: QueueJob>(&self, job: &J, error: &HandlerError) -> RetryDecision {
        if job.exceeded_max_retries(self.max_retries) {
            error!(
                job_id = %job.job_id(),
                retry_count = job.retry_count(),
                max_retries = self.max_retries,
                error = %error,
                "Job FAILED permanently: retries exhausted"
            );
            self.metrics.retry_exhausted();

            if let Some(dead_letters) = &self.dead_letters {
                match DeadLetter::for_job(
                    job,
                    DeadLetterReason::RetriesExhausted,
                    error.to_string(),
                    self.producer.queue(),
                ) {
                    Ok(entry) => dead_letters.record(entry).await,
                    Err(e) => error!(job_id = %job.job_id(), error = %e, "Failed to build DLQ entry"),
                }
            }

            return RetryDecision::Exhausted {
                retry_count: job.retry_count(),
            };
        }

        let next_retry_count = job.retry_count() + 1;
        let delay = self.backoff.delay_for(next_retry_count);

        info!(
            job_id = %job.job_id(),
            next_retry_count,
            max_retries = self.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Scheduling retry"
        );
        self.metrics.retry_scheduled(next_retry_count);

        let task = RetryTask {
            job: job.clone(),
            delay,
            producer: self.producer.clone(),
            dead_letters: self.dead_letters.clone(),
            policy: self.policy,
            shutdown: self.shutdown.clone(),
            metrics: self.metrics.clone(),
        };

        let mut pending = self.pending.lock().await;
        pending.spawn(task.run());
        // Reap finished timers so the set only holds live retries
        while pending.try_join_next().is_some() {}
        self.metrics.pending_retries(pending.len());

        RetryDecision::Scheduled {
            next_retry_count,
            delay,
        }
    }

    /// Retries still waiting on their timer or publish
    pub async fn pending_count(&self) -> usize {
        let mut pending = self.pending.lock().await;
        while pending.try_join_next().is_some() {}
        pending.len()
    }

    /// Wait for every pending retry to finish.
    ///
    /// Once shutdown has been signalled each retry flushes or abandons immediately,
    /// per the configured policy. Before that, this waits out the full delays.
    pub async fn drain(&self) {
        let mut pending = std::mem::take(&mut *self.pending.lock().await);
        if !pending.is_empty() {
            info!(count = pending.len(), policy = %self.policy, "Draining pending retries");
        }

        while let Some(result) = pending.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Retry task failed");
            }
        }
        self.metrics.pending_retries(0);
    }
}

impl<J: QueueJob, T: QueueTransport> RetryTask<J, T> {
    async fn run(mut self) {
        let cut_short = tokio::select! {
            _ = tokio::time::sleep(self.delay) => false,
            _ = wait_for_shutdown(&mut self.shutdown) => true,
        };

        let next_retry_count = self.job.retry_count() + 1;

        if cut_short {
            match self.policy {
                RetryShutdownPolicy::Abandon => {
                    warn!(
                        job_id = %self.job.job_id(),
                        next_retry_count,
                        "Pending retry abandoned at shutdown"
                    );
                    self.metrics.retry_abandoned();
                    return;
                }
                RetryShutdownPolicy::Flush => {
                    info!(
                        job_id = %self.job.job_id(),
                        next_retry_count,
                        "Flushing pending retry at shutdown"
                    );
                }
            }
        }

        let retry = self.job.with_retry();
        match self.producer.send(&retry).await {
            Ok(message_id) => {
                info!(
                    job_id = %retry.job_id(),
                    retry_count = retry.retry_count(),
                    message_id = %message_id,
                    "Job re-enqueued for retry"
                );
                self.metrics.retry_published();
            }
            Err(e) => self.requeue_failed(&retry, e).await,
        }
    }

    async fn requeue_failed(&self, retry: &J, cause: WorkerError) {
        error!(
            job_id = %retry.job_id(),
            retry_count = retry.retry_count(),
            error = %cause,
            "Failed to re-enqueue job for retry"
        );
        self.metrics.requeue_failed();

        let Some(dead_letters) = &self.dead_letters else {
            error!(job_id = %retry.job_id(), "No DLQ configured, retry is lost");
            return;
        };

        match DeadLetter::for_job(
            retry,
            DeadLetterReason::RequeueFailed,
            cause.to_string(),
            self.producer.queue(),
        ) {
            Ok(entry) => dead_letters.record(entry).await,
            Err(e) => error!(job_id = %retry.job_id(), error = %e, "Failed to build DLQ entry"),
        }
    }
}

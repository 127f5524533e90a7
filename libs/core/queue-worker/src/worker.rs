//! The consumer loop.
//!
//! `QueueWorker` pulls deliveries from a transport, runs them through a
//! `JobHandler` and owns the acknowledgment discipline:
//!
//! | handler result            | disposition                                  |
//! |---------------------------|----------------------------------------------|
//! | success                   | ack                                          |
//! | invalid payload/permanent | ack, dead-letter                             |
//! | transient failure         | schedule retry (or give up), then ack        |
//! | unexpected error or panic | nack without requeue                         |
//!
//! At most `prefetch_count` deliveries are processed at once.

use crate::config::WorkerConfig;
use crate::dlq::{DeadLetter, DeadLetterQueue, DeadLetterReason};
use crate::error::{ErrorCategory, HandlerError, WorkerError};
use crate::lifecycle::{wait_for_shutdown, ShutdownHandle};
use crate::metrics::WorkerMetrics;
use crate::registry::{JobHandler, QueueJob};
use crate::scheduler::{RetryDecision, RetryScheduler};
use crate::transport::{Delivery, QueueTransport};
use futures::FutureExt;
use std::any::Any;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const MAX_BACKOFF_SECS: u64 = 30;

/// What happened to a single delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Processed successfully and acked
    Delivered,
    /// Invalid or permanently failing, acked without retry
    Rejected,
    /// Failed, retry scheduled, original acked
    RetryScheduled { next_retry_count: u32, delay: Duration },
    /// Failed with no retries left, acked
    RetriesExhausted,
    /// Unexpected error, nacked without requeue
    Failed,
    /// Arrived during shutdown, left unacknowledged for redelivery
    Skipped,
}

struct WorkerInner<J, H, T>
where
    J: QueueJob,
    H: JobHandler<J>,
    T: QueueTransport,
{
    transport: Arc<T>,
    handler: Arc<H>,
    scheduler: Arc<RetryScheduler<T>>,
    dead_letters: Option<Arc<DeadLetterQueue<T>>>,
    config: Arc<WorkerConfig>,
    permits: Arc<Semaphore>,
    shutdown: ShutdownHandle,
    metrics: WorkerMetrics,
    _phantom: PhantomData<J>,
}

/// Generic queue worker processing jobs of type `J` with handler `H`.
///
/// ```rust,ignore
/// let shutdown = ShutdownHandle::new();
/// let worker = QueueWorker::new(transport, processor, config, shutdown.clone());
/// worker.start().await?;
/// worker.run().await?;
/// ```
pub struct QueueWorker<J, H, T>
where
    J: QueueJob,
    H: JobHandler<J>,
    T: QueueTransport,
{
    inner: Arc<WorkerInner<J, H, T>>,
}

impl<J, H, T> QueueWorker<J, H, T>
where
    J: QueueJob,
    H: JobHandler<J>,
    T: QueueTransport,
{
    pub fn new(transport: Arc<T>, handler: H, config: WorkerConfig, shutdown: ShutdownHandle) -> Self {
        Self::with_arc_handler(transport, Arc::new(handler), config, shutdown)
    }

    pub fn with_arc_handler(
        transport: Arc<T>,
        handler: Arc<H>,
        config: WorkerConfig,
        shutdown: ShutdownHandle,
    ) -> Self {
        let metrics = WorkerMetrics::new(config.queue_name.clone(), handler.name());

        let dead_letters = config.dead_letter_queue.as_ref().map(|queue| {
            Arc::new(
                DeadLetterQueue::new(Arc::clone(&transport), queue.clone(), metrics.clone())
                    .with_redacted_fields(J::REDACTED_FIELDS),
            )
        });

        let mut scheduler = RetryScheduler::new(
            Arc::clone(&transport),
            &config,
            shutdown.subscribe(),
            metrics.clone(),
        );
        if let Some(dead_letters) = &dead_letters {
            scheduler = scheduler.with_dead_letters(Arc::clone(dead_letters));
        }

        Self {
            inner: Arc::new(WorkerInner {
                permits: Arc::new(Semaphore::new(config.prefetch_count.max(1))),
                transport,
                handler,
                scheduler: Arc::new(scheduler),
                dead_letters,
                config: Arc::new(config),
                shutdown,
                metrics,
                _phantom: PhantomData,
            }),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.inner.transport
    }

    pub fn scheduler(&self) -> &Arc<RetryScheduler<T>> {
        &self.inner.scheduler
    }

    pub fn shutdown_handle(&self) -> &ShutdownHandle {
        &self.inner.shutdown
    }

    /// Declare the queue (and DLQ) durable and apply the prefetch bound.
    pub async fn start(&self) -> Result<(), WorkerError> {
        let config = &self.inner.config;
        let transport = &self.inner.transport;

        transport.declare_queue(&config.queue_name).await?;
        if let Some(dlq) = &config.dead_letter_queue {
            transport.declare_queue(dlq).await?;
        }
        transport.set_prefetch(config.prefetch_count).await?;

        // Reported only; failed deliveries go through the retry path
        let handler = self.inner.handler.name();
        match self.inner.handler.health_check().await {
            Ok(true) => debug!(handler, "Handler health check passed"),
            Ok(false) => warn!(handler, "Handler reports unhealthy"),
            Err(e) => warn!(handler, error = %e, "Handler health check failed"),
        }

        info!(
            queue = %config.queue_name,
            dlq = ?config.dead_letter_queue,
            consumer_id = %config.consumer_id,
            prefetch_count = config.prefetch_count,
            max_retries = config.max_retries,
            base_delay_ms = config.base_delay_ms,
            transport = transport.name(),
            handler = self.inner.handler.name(),
            "Worker ready, waiting for messages"
        );
        Ok(())
    }

    /// Consume until shutdown is triggered, then wait for in-flight deliveries.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let inner = &self.inner;
        let mut shutdown = inner.shutdown.subscribe();
        let mut in_flight: JoinSet<MessageOutcome> = JoinSet::new();
        let mut consecutive_errors: u32 = 0;

        loop {
            if inner.shutdown.is_triggered() {
                break;
            }

            while let Some(finished) = in_flight.try_join_next() {
                Self::observe_task(finished);
            }
            inner.metrics.in_flight(in_flight.len());

            // Wait for a free prefetch slot, then grab whatever else is free
            let first = tokio::select! {
                permit = Arc::clone(&inner.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = wait_for_shutdown(&mut shutdown) => break,
            };
            let mut permits = vec![first];
            while let Ok(permit) = Arc::clone(&inner.permits).try_acquire_owned() {
                permits.push(permit);
            }

            let received = tokio::select! {
                received = inner.transport.receive(
                    &inner.config.queue_name,
                    permits.len(),
                    inner.config.block_timeout(),
                ) => received,
                _ = wait_for_shutdown(&mut shutdown) => break,
            };

            match received {
                Ok(deliveries) => {
                    if consecutive_errors > 0 {
                        info!(consecutive_errors, "Transport recovered");
                        consecutive_errors = 0;
                    }

                    for delivery in deliveries {
                        let permit = match permits.pop() {
                            Some(permit) => permit,
                            None => {
                                warn!(tag = %delivery.tag, "Transport returned more messages than requested");
                                match Arc::clone(&inner.permits).acquire_owned().await {
                                    Ok(permit) => permit,
                                    Err(_) => break,
                                }
                            }
                        };

                        inner.metrics.job_received();
                        let task_inner = Arc::clone(inner);
                        in_flight.spawn(async move {
                            let outcome = task_inner.process_delivery(delivery).await;
                            drop(permit);
                            outcome
                        });
                    }
                }
                Err(e) if e.is_closed() => {
                    warn!("Transport closed, stopping consumer");
                    break;
                }
                Err(e) => {
                    consecutive_errors += 1;

                    if e.is_nogroup_error() {
                        warn!("Consumer group missing, redeclaring queue");
                        if let Err(declare_err) =
                            inner.transport.declare_queue(&inner.config.queue_name).await
                        {
                            error!(error = %declare_err, "Failed to redeclare queue");
                        }
                    }

                    let backoff_secs =
                        std::cmp::min(2u64.pow(consecutive_errors.min(5)), MAX_BACKOFF_SECS);
                    warn!(
                        error = %e,
                        consecutive_errors,
                        backoff_secs,
                        "Receive failed, backing off"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                        _ = wait_for_shutdown(&mut shutdown) => break,
                    }
                }
            }
        }

        if !in_flight.is_empty() {
            info!(in_flight = in_flight.len(), "Waiting for in-flight messages");
        }
        while let Some(finished) = in_flight.join_next().await {
            Self::observe_task(finished);
        }
        inner.metrics.in_flight(0);

        info!(queue = %inner.config.queue_name, "Consumer stopped");
        Ok(())
    }

    /// Process one delivery end to end, including its ack or nack.
    pub async fn process_delivery(&self, delivery: Delivery) -> MessageOutcome {
        self.inner.process_delivery(delivery).await
    }

    fn observe_task(finished: Result<MessageOutcome, tokio::task::JoinError>) {
        match finished {
            Ok(outcome) => debug!(outcome = ?outcome, "Delivery settled"),
            Err(e) => error!(error = %e, "Delivery task aborted"),
        }
    }
}

impl<J, H, T> WorkerInner<J, H, T>
where
    J: QueueJob,
    H: JobHandler<J>,
    T: QueueTransport,
{
    async fn process_delivery(&self, delivery: Delivery) -> MessageOutcome {
        if self.shutdown.is_triggered() {
            debug!(tag = %delivery.tag, "Shutting down, leaving message for redelivery");
            return MessageOutcome::Skipped;
        }

        let started = Instant::now();
        let outcome = match AssertUnwindSafe(self.dispatch(&delivery)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                error!(
                    tag = %delivery.tag,
                    panic = %panic_message(panic.as_ref()),
                    "Handler panicked"
                );
                self.metrics
                    .job_failed(ErrorCategory::Unexpected, started.elapsed());
                MessageOutcome::Failed
            }
        };

        self.settle(&delivery, &outcome).await;
        outcome
    }

    /// Decode, handle and decide. Never acks; `settle` does that.
    async fn dispatch(&self, delivery: &Delivery) -> MessageOutcome {
        let started = Instant::now();

        let job = match self.handler.decode(&delivery.payload) {
            Ok(job) => job,
            Err(HandlerError::Unexpected(message)) => {
                error!(tag = %delivery.tag, error = %message, "Unexpected error while decoding");
                self.metrics
                    .job_failed(ErrorCategory::Unexpected, started.elapsed());
                return MessageOutcome::Failed;
            }
            Err(e) => {
                warn!(
                    tag = %delivery.tag,
                    error = %e,
                    redelivered = delivery.redelivered,
                    "Invalid job payload, rejecting without retry"
                );
                self.metrics.job_rejected(started.elapsed());
                self.dead_letter(DeadLetter::for_payload(
                    &delivery.payload,
                    DeadLetterReason::InvalidPayload,
                    e.to_string(),
                    &self.config.queue_name,
                ))
                .await;
                return MessageOutcome::Rejected;
            }
        };

        debug!(
            job_id = %job.job_id(),
            retry_count = job.retry_count(),
            "Processing job"
        );

        let result = self.handler.handle(&job).await;
        let elapsed = started.elapsed();

        let error = match result {
            Ok(()) => {
                info!(
                    job_id = %job.job_id(),
                    retry_count = job.retry_count(),
                    processing_time_ms = elapsed.as_millis() as u64,
                    "Job processed successfully"
                );
                self.metrics.job_succeeded(elapsed);
                return MessageOutcome::Delivered;
            }
            Err(e) => e,
        };

        let category = error.category();
        self.metrics.job_failed(category, elapsed);

        match category {
            ErrorCategory::Transient => {
                warn!(
                    job_id = %job.job_id(),
                    retry_count = job.retry_count(),
                    processing_time_ms = elapsed.as_millis() as u64,
                    error = %error,
                    "Job processing failed"
                );
                match self.scheduler.schedule(&job, &error).await {
                    RetryDecision::Scheduled {
                        next_retry_count,
                        delay,
                    } => MessageOutcome::RetryScheduled {
                        next_retry_count,
                        delay,
                    },
                    RetryDecision::Exhausted { .. } => MessageOutcome::RetriesExhausted,
                }
            }
            ErrorCategory::Permanent => {
                warn!(
                    job_id = %job.job_id(),
                    error = %error,
                    "Permanent failure, rejecting without retry"
                );
                match DeadLetter::for_job(
                    &job,
                    DeadLetterReason::PermanentFailure,
                    error.to_string(),
                    &self.config.queue_name,
                ) {
                    Ok(entry) => self.dead_letter(entry).await,
                    Err(e) => error!(job_id = %job.job_id(), error = %e, "Failed to build DLQ entry"),
                }
                MessageOutcome::Rejected
            }
            ErrorCategory::Unexpected => {
                error!(
                    job_id = %job.job_id(),
                    error = %error,
                    "Unexpected processing error"
                );
                MessageOutcome::Failed
            }
        }
    }

    async fn dead_letter(&self, entry: DeadLetter) {
        if let Some(dead_letters) = &self.dead_letters {
            dead_letters.record(entry).await;
        }
    }

    async fn settle(&self, delivery: &Delivery, outcome: &MessageOutcome) {
        let result = match outcome {
            MessageOutcome::Skipped => return,
            MessageOutcome::Failed => {
                self.metrics.job_nacked();
                self.transport.nack(delivery, false).await
            }
            _ => self.transport.ack(delivery).await,
        };

        if let Err(e) = result {
            error!(
                tag = %delivery.tag,
                outcome = ?outcome,
                error = %e,
                "Failed to settle message, it may be redelivered"
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

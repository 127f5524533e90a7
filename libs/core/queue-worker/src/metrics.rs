//! Prometheus metrics for queue workers

use crate::dlq::DeadLetterReason;
use crate::error::{ErrorCategory, WorkerError};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder.
///
/// With `listen_port` set, an HTTP exporter serving `/metrics` is spawned on the
/// current tokio runtime. Subsequent calls are no-ops.
pub fn init_metrics(listen_port: Option<u16>) -> Result<(), WorkerError> {
    if PROMETHEUS_HANDLE.get().is_some() {
        return Ok(());
    }

    let builder = PrometheusBuilder::new();
    let handle = match listen_port {
        Some(port) => {
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            let (recorder, exporter) = builder
                .with_http_listener(addr)
                .build()
                .map_err(|e| WorkerError::Config(format!("Prometheus exporter: {}", e)))?;
            let handle = recorder.handle();
            metrics::set_global_recorder(recorder)
                .map_err(|e| WorkerError::Config(format!("Metrics recorder: {}", e)))?;
            tokio::spawn(async move {
                if let Err(e) = exporter.await {
                    warn!(error = ?e, "Prometheus exporter stopped");
                }
            });
            info!(port, "Prometheus metrics listener started");
            handle
        }
        None => builder
            .install_recorder()
            .map_err(|e| WorkerError::Config(format!("Metrics recorder: {}", e)))?,
    };

    let _ = PROMETHEUS_HANDLE.set(handle);
    Ok(())
}

/// Queue worker metrics helper
#[derive(Clone, Debug)]
pub struct WorkerMetrics {
    queue: String,
    handler: String,
}

impl WorkerMetrics {
    pub fn new(queue: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            handler: handler.into(),
        }
    }

    pub fn job_received(&self) {
        counter!(
            "queue_worker_jobs_received_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .increment(1);
    }

    fn job_finished(&self, status: &'static str, duration: Duration) {
        counter!(
            "queue_worker_jobs_processed_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone(),
            "status" => status
        )
        .increment(1);

        histogram!(
            "queue_worker_job_duration_seconds",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone(),
            "status" => status
        )
        .record(duration.as_secs_f64());
    }

    pub fn job_succeeded(&self, duration: Duration) {
        self.job_finished("success", duration);
    }

    /// Validation failure or permanent error, acked without retry
    pub fn job_rejected(&self, duration: Duration) {
        self.job_finished("rejected", duration);
    }

    pub fn job_failed(&self, category: ErrorCategory, duration: Duration) {
        self.job_finished("failed", duration);

        counter!(
            "queue_worker_job_errors_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone(),
            "category" => category.as_str()
        )
        .increment(1);
    }

    pub fn job_nacked(&self) {
        counter!(
            "queue_worker_jobs_nacked_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .increment(1);
    }

    pub fn retry_scheduled(&self, retry_count: u32) {
        counter!(
            "queue_worker_retries_scheduled_total",
            "queue" => self.queue.clone(),
            "retry_count" => retry_count.to_string()
        )
        .increment(1);
    }

    pub fn retry_published(&self) {
        counter!("queue_worker_retries_published_total", "queue" => self.queue.clone()).increment(1);
    }

    pub fn retry_exhausted(&self) {
        counter!("queue_worker_retries_exhausted_total", "queue" => self.queue.clone()).increment(1);
    }

    pub fn retry_abandoned(&self) {
        counter!("queue_worker_retries_abandoned_total", "queue" => self.queue.clone()).increment(1);
    }

    pub fn requeue_failed(&self) {
        counter!("queue_worker_requeue_failures_total", "queue" => self.queue.clone()).increment(1);
    }

    pub fn dead_lettered(&self, reason: DeadLetterReason) {
        counter!(
            "queue_worker_jobs_dlq_total",
            "queue" => self.queue.clone(),
            "reason" => reason.to_string()
        )
        .increment(1);
    }

    pub fn in_flight(&self, count: usize) {
        gauge!(
            "queue_worker_in_flight_jobs",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .set(count as f64);
    }

    pub fn pending_retries(&self, count: usize) {
        gauge!("queue_worker_pending_retries", "queue" => self.queue.clone()).set(count as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = WorkerMetrics::new("notifications", "otp");
        assert_eq!(metrics.queue, "notifications");
        assert_eq!(metrics.handler, "otp");
    }

    #[test]
    fn test_recording_without_recorder_is_a_noop() {
        let metrics = WorkerMetrics::new("notifications", "otp");
        metrics.job_received();
        metrics.job_failed(ErrorCategory::Transient, Duration::from_millis(5));
        metrics.dead_lettered(DeadLetterReason::RetriesExhausted);
        metrics.in_flight(1);
    }
}

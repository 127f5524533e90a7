//! OTP Worker Service
//!
//! A background worker that delivers one-time-password emails from a Redis stream.
//!
//! ## Architecture
//!
//! ```text
//! Redis Stream (notifications)
//!   ↓ (Consumer Group: otp_workers, prefetch 1)
//! QueueWorker<OtpJob, OtpProcessor>
//!   ↓ (validate, render, send)
//! SmtpProvider
//!   ↓ on failure
//! Redis Stream (notifications) after backoff, or notifications:dlq
//! ```
//!
//! ## Features
//!
//! - Payload validation before any delivery attempt
//! - Bounded retries with exponential backoff and jitter
//! - Dead letter queue for invalid and exhausted jobs
//! - Graceful shutdown on SIGINT/SIGTERM
//! - Prometheus metrics when `METRICS_PORT` is set

use core_config::{Environment, FromEnv, env_optional, redis::RedisConfig};
use domain_otp::{DeliveryConfig, JobValidator, OtpProcessor, OtpQueue, SmtpConfig, SmtpProvider};
use eyre::{Result, WrapErr};
use queue_worker::{
    Lifecycle, QueueWorker, RedisTransport, RedisTransportOptions, ShutdownHandle, WorkerConfig,
    init_metrics,
};
use std::sync::Arc;
use tracing::info;

/// Worker configuration from the OTP queue definition plus environment overrides.
pub fn worker_config() -> Result<WorkerConfig> {
    WorkerConfig::from_queue_def::<OtpQueue>()
        .with_env_overrides()
        .wrap_err("Invalid worker configuration")
}

/// Port for the Prometheus listener, if one was requested.
pub fn metrics_port() -> Result<Option<u16>> {
    env_optional("METRICS_PORT")
        .map(|raw| {
            raw.parse::<u16>()
                .wrap_err_with(|| format!("METRICS_PORT is not a valid port: {}", raw))
        })
        .transpose()
}

/// Run the OTP worker
///
/// This is the main entry point for the worker. It:
/// 1. Sets up error reporting and structured logging
/// 2. Loads queue, SMTP and sender configuration
/// 3. Connects to Redis
/// 4. Consumes OTP jobs until a shutdown signal arrives
///
/// # Errors
///
/// Returns an error if configuration is invalid, Redis is unreachable, startup
/// (declare/prefetch) fails, or shutdown does not complete cleanly.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();

    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting OTP worker service"
    );

    let config = worker_config()?;
    info!(
        queue = %config.queue_name,
        consumer_group = %config.consumer_group,
        consumer_id = %config.consumer_id,
        dead_letter_queue = ?config.dead_letter_queue,
        max_retries = config.max_retries,
        base_delay_ms = config.base_delay_ms,
        prefetch_count = config.prefetch_count,
        claim_idle_ms = config.claim_idle_ms,
        retry_shutdown_policy = %config.retry_shutdown_policy,
        "Worker configuration loaded"
    );

    init_metrics(metrics_port()?).wrap_err("Failed to initialize metrics")?;

    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;

    info!("Connecting to Redis...");
    let transport = RedisTransport::connect(
        &redis_config.connection_url(),
        RedisTransportOptions::from_config(&config),
    )
    .await
    .wrap_err("Failed to connect to Redis")?;
    info!("Connected to Redis successfully");

    let smtp_config = SmtpConfig::from_env().wrap_err("Failed to load SMTP configuration")?;
    let provider = SmtpProvider::new(smtp_config).wrap_err("Failed to create SMTP provider")?;
    let delivery_config =
        DeliveryConfig::from_env().wrap_err("Failed to load sender configuration")?;

    // Producers may not claim more attempts than this worker would grant
    let processor = OtpProcessor::new(provider, delivery_config)
        .wrap_err("Failed to create OTP processor")?
        .with_validator(JobValidator::new().with_retry_ceiling(config.max_retries));
    info!("OTP processor initialized");

    let worker = QueueWorker::new(
        Arc::new(transport),
        processor,
        config,
        ShutdownHandle::new(),
    );

    Lifecycle::new(worker)
        .run_until_signal()
        .await
        .wrap_err("OTP worker stopped with an error")?;

    info!("OTP worker service stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_defaults() {
        temp_env::with_vars_unset(
            [
                "QUEUE_NAME",
                "DEAD_LETTER_QUEUE",
                "CONSUMER_GROUP",
                "MAX_RETRIES",
                "BASE_DELAY_MS",
                "PREFETCH_COUNT",
                "BLOCK_TIMEOUT_MS",
                "CLAIM_IDLE_MS",
                "RETRY_SHUTDOWN_POLICY",
            ],
            || {
                let config = worker_config().unwrap();
                assert_eq!(config.queue_name, "notifications");
                assert_eq!(config.dead_letter_queue.as_deref(), Some("notifications:dlq"));
                assert_eq!(config.max_retries, 3);
                assert_eq!(config.base_delay_ms, 1000);
                assert_eq!(config.prefetch_count, 1);
            },
        );
    }

    #[test]
    fn test_worker_config_rejects_zero_prefetch() {
        temp_env::with_var("PREFETCH_COUNT", Some("0"), || {
            assert!(worker_config().is_err());
        });
    }

    #[test]
    fn test_metrics_port() {
        temp_env::with_var_unset("METRICS_PORT", || {
            assert_eq!(metrics_port().unwrap(), None);
        });
        temp_env::with_var("METRICS_PORT", Some("9464"), || {
            assert_eq!(metrics_port().unwrap(), Some(9464));
        });
        temp_env::with_var("METRICS_PORT", Some("not-a-port"), || {
            assert!(metrics_port().is_err());
        });
    }
}

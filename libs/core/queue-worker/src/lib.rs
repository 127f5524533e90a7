//! Queue Worker Framework
//!
//! A generic queue consumer for background jobs with at-least-once delivery attempts.
//!
//! ## Features
//!
//! - **Generic worker**: `QueueWorker<J, H, T>` runs any `JobHandler` over any `QueueTransport`
//! - **Prefetch-bounded concurrency**: at most `prefetch_count` deliveries in flight
//! - **Bounded retries**: exponential backoff with jitter, re-enqueued as new messages
//! - **Dead Letter Queue**: invalid, exhausted and un-requeueable jobs are recorded
//! - **Graceful shutdown**: pending retries are flushed or abandoned explicitly
//! - **Prometheus metrics**: built-in observability
//!
//! ## Example
//!
//! ```ignore
//! use queue_worker::{Lifecycle, QueueDef, QueueWorker, RedisTransport, ShutdownHandle, WorkerConfig};
//!
//! struct MyQueue;
//! impl QueueDef for MyQueue {
//!     const QUEUE_NAME: &'static str = "my:jobs";
//!     const CONSUMER_GROUP: &'static str = "my_workers";
//!     const DEAD_LETTER_QUEUE: &'static str = "my:dlq";
//! }
//!
//! let config = WorkerConfig::from_queue_def::<MyQueue>().with_env_overrides()?;
//! let transport = Arc::new(RedisTransport::connect(&url, RedisTransportOptions::from_config(&config)).await?);
//! let worker = QueueWorker::new(transport, handler, config, ShutdownHandle::new());
//! Lifecycle::new(worker).run_until_signal().await?;
//! ```

pub mod backoff;
mod config;
mod dlq;
mod error;
mod lifecycle;
pub mod metrics;
mod producer;
mod registry;
mod scheduler;
pub mod transport;
mod worker;

pub use backoff::Backoff;
pub use config::{RetryShutdownPolicy, WorkerConfig};
pub use dlq::{DeadLetter, DeadLetterQueue, DeadLetterReason, REDACTED};
pub use error::{ErrorCategory, HandlerError, WorkerError};
pub use lifecycle::{shutdown_signal, Lifecycle, ShutdownHandle};
pub use metrics::{init_metrics, WorkerMetrics};
pub use producer::JobProducer;
pub use registry::{JobHandler, QueueDef, QueueJob};
pub use scheduler::{RetryDecision, RetryScheduler};
pub use transport::{
    ConnectionState, Delivery, InMemoryTransport, PublishOptions, PublishedMessage, QueueTransport,
    RedisTransport, RedisTransportOptions,
};
pub use worker::{MessageOutcome, QueueWorker};

//! Worker configuration
//!
//! `WorkerConfig` is read once at startup and shared immutably afterwards.

use crate::backoff::Backoff;
use crate::registry::QueueDef;
use core_config::{env_optional, env_or_default, env_parse, ConfigError, FromEnv};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// What happens to retries still waiting on their backoff timer at shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryShutdownPolicy {
    /// Publish pending retries immediately, ignoring the remaining delay
    #[default]
    Flush,
    /// Drop pending retries and log each one
    Abandon,
}

impl FromStr for RetryShutdownPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flush" => Ok(RetryShutdownPolicy::Flush),
            "abandon" => Ok(RetryShutdownPolicy::Abandon),
            other => Err(format!("expected 'flush' or 'abandon', got '{}'", other)),
        }
    }
}

impl fmt::Display for RetryShutdownPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryShutdownPolicy::Flush => write!(f, "flush"),
            RetryShutdownPolicy::Abandon => write!(f, "abandon"),
        }
    }
}

/// Configuration for the queue worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queue to consume from and re-enqueue retries to
    pub queue_name: String,

    /// Consumer group name
    pub consumer_group: String,

    /// Unique consumer ID (auto-generated)
    pub consumer_id: String,

    /// Dead letter queue, `None` disables dead-lettering
    pub dead_letter_queue: Option<String>,

    /// Retries allowed after the first delivery attempt
    pub max_retries: u32,

    /// Backoff base in milliseconds
    pub base_delay_ms: u64,

    /// Max unacknowledged messages in flight
    pub prefetch_count: usize,

    /// How long a receive call blocks waiting for messages
    pub block_timeout_ms: u64,

    /// Approximate queue length cap applied on publish
    pub max_length: i64,

    /// Disposition of pending retries at shutdown
    pub retry_shutdown_policy: RetryShutdownPolicy,

    /// Idle time after which another consumer's unacked message is claimed
    pub claim_idle_ms: u64,
}

fn default_dead_letter_queue(queue_name: &str) -> String {
    format!("{}:dlq", queue_name)
}

impl WorkerConfig {
    /// Create a WorkerConfig from a QueueDef
    pub fn from_queue_def<Q: QueueDef>() -> Self {
        Self {
            queue_name: Q::QUEUE_NAME.to_string(),
            consumer_group: Q::CONSUMER_GROUP.to_string(),
            consumer_id: format!("worker-{}", Uuid::new_v4()),
            dead_letter_queue: Some(Q::DEAD_LETTER_QUEUE.to_string()),
            max_retries: Q::MAX_RETRIES,
            base_delay_ms: Q::BASE_DELAY_MS,
            prefetch_count: Q::PREFETCH_COUNT.max(1),
            block_timeout_ms: 1000,
            max_length: Q::MAX_LENGTH,
            retry_shutdown_policy: RetryShutdownPolicy::default(),
            claim_idle_ms: Q::CLAIM_IDLE_MS,
        }
    }

    /// Create a WorkerConfig with defaults for the given queue
    pub fn new(queue_name: impl Into<String>) -> Self {
        let queue_name = queue_name.into();
        Self {
            dead_letter_queue: Some(default_dead_letter_queue(&queue_name)),
            queue_name,
            consumer_group: "workers".to_string(),
            consumer_id: format!("worker-{}", Uuid::new_v4()),
            max_retries: 3,
            base_delay_ms: 1000,
            prefetch_count: 1,
            block_timeout_ms: 1000,
            max_length: 100_000,
            retry_shutdown_policy: RetryShutdownPolicy::default(),
            claim_idle_ms: 30_000,
        }
    }

    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = group.into();
        self
    }

    pub fn with_consumer_id(mut self, id: impl Into<String>) -> Self {
        self.consumer_id = id.into();
        self
    }

    pub fn with_dead_letter_queue(mut self, queue: Option<String>) -> Self {
        self.dead_letter_queue = queue;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Set the prefetch count (clamped to at least 1)
    pub fn with_prefetch_count(mut self, count: usize) -> Self {
        self.prefetch_count = count.max(1);
        self
    }

    pub fn with_block_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.block_timeout_ms = timeout_ms;
        self
    }

    pub fn with_retry_shutdown_policy(mut self, policy: RetryShutdownPolicy) -> Self {
        self.retry_shutdown_policy = policy;
        self
    }

    pub fn with_claim_idle_ms(mut self, idle_ms: u64) -> Self {
        self.claim_idle_ms = idle_ms;
        self
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.base_delay_ms)
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    /// Apply environment overrides on top of the current values.
    ///
    /// Reads `QUEUE_NAME`, `CONSUMER_GROUP`, `DEAD_LETTER_QUEUE` (empty disables it),
    /// `MAX_RETRIES`, `BASE_DELAY_MS`, `PREFETCH_COUNT`, `BLOCK_TIMEOUT_MS`,
    /// `CLAIM_IDLE_MS` and `RETRY_SHUTDOWN_POLICY`.
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Some(queue_name) = env_optional("QUEUE_NAME") {
            // A derived DLQ follows the queue it belongs to
            if self.dead_letter_queue.as_deref()
                == Some(default_dead_letter_queue(&self.queue_name).as_str())
            {
                self.dead_letter_queue = Some(default_dead_letter_queue(&queue_name));
            }
            self.queue_name = queue_name;
        }

        if let Ok(dlq) = std::env::var("DEAD_LETTER_QUEUE") {
            let dlq = dlq.trim();
            self.dead_letter_queue = (!dlq.is_empty()).then(|| dlq.to_string());
        }

        self.consumer_group = env_or_default("CONSUMER_GROUP", &self.consumer_group);
        self.max_retries = env_parse("MAX_RETRIES", self.max_retries)?;
        self.base_delay_ms = env_parse("BASE_DELAY_MS", self.base_delay_ms)?;
        self.prefetch_count = env_parse("PREFETCH_COUNT", self.prefetch_count)?;
        self.block_timeout_ms = env_parse("BLOCK_TIMEOUT_MS", self.block_timeout_ms)?;
        self.claim_idle_ms = env_parse("CLAIM_IDLE_MS", self.claim_idle_ms)?;
        self.retry_shutdown_policy =
            env_parse("RETRY_SHUTDOWN_POLICY", self.retry_shutdown_policy)?;

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_name.trim().is_empty() {
            return Err(ConfigError::parse("QUEUE_NAME", "must not be empty"));
        }
        if self.prefetch_count == 0 {
            return Err(ConfigError::parse("PREFETCH_COUNT", "must be at least 1"));
        }
        if self.claim_idle_ms == 0 {
            return Err(ConfigError::parse("CLAIM_IDLE_MS", "must be at least 1"));
        }
        if self.dead_letter_queue.as_deref() == Some(self.queue_name.as_str()) {
            return Err(ConfigError::parse(
                "DEAD_LETTER_QUEUE",
                "must differ from the work queue",
            ));
        }
        Ok(())
    }
}

impl FromEnv for WorkerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Self::new("notifications").with_env_overrides()
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new("notifications")
    }
}

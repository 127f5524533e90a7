//! Queue transport abstraction.
//!
//! The worker only talks to a queue through `QueueTransport`. `RedisTransport`
//! backs production deployments; `InMemoryTransport` backs tests.

mod memory;
mod redis_streams;

pub use self::memory::{InMemoryTransport, PublishedMessage};
pub use self::redis_streams::{RedisTransport, RedisTransportOptions};

use crate::error::WorkerError;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Connection lifecycle as observed by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// A message handed to the consumer, awaiting ack or nack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Transport-specific delivery tag (stream entry id for Redis)
    pub tag: String,
    /// Queue the message was received from
    pub queue: String,
    /// Raw message body
    pub payload: Vec<u8>,
    /// True when the message was delivered before without being acked
    pub redelivered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    /// Message must survive a transport restart
    pub persistent: bool,
}

impl PublishOptions {
    pub fn persistent() -> Self {
        Self { persistent: true }
    }
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self::persistent()
    }
}

#[async_trait]
pub trait QueueTransport: Send + Sync + 'static {
    /// Declare a durable queue. Idempotent.
    async fn declare_queue(&self, queue: &str) -> Result<(), WorkerError>;

    /// Bound the number of unacknowledged messages held by this consumer.
    async fn set_prefetch(&self, count: usize) -> Result<(), WorkerError>;

    /// Receive up to `max` messages, waiting at most `wait` when none are ready.
    async fn receive(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, WorkerError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), WorkerError>;

    /// Reject a delivery. With `requeue = false` the message is dropped for good.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), WorkerError>;

    /// Publish a payload, returning the transport's message id.
    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<String, WorkerError>;

    /// Close the connection. Later operations fail with `WorkerError::Closed`.
    async fn close(&self) -> Result<(), WorkerError>;

    fn state(&self) -> ConnectionState;

    fn name(&self) -> &'static str;
}

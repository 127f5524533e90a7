//! In-process transport with queue semantics close to a broker's: durable
//! declaration, prefetch-bounded delivery, ack/nack bookkeeping.
//!
//! Every operation is recorded so tests can assert on what the worker did.

use super::{ConnectionState, Delivery, PublishOptions, QueueTransport};
use crate::error::WorkerError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// A message the worker published, in publish order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub queue: String,
    pub payload: Vec<u8>,
    pub persistent: bool,
}

impl PublishedMessage {
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

#[derive(Debug)]
struct Queued {
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, VecDeque<Queued>>,
    declared: HashSet<String>,
    unacked: HashMap<String, Delivery>,
    acked: Vec<Delivery>,
    nacked: Vec<(Delivery, bool)>,
    published: Vec<PublishedMessage>,
    failing_queues: HashSet<String>,
    prefetch: usize,
    max_unacked: usize,
    next_tag: u64,
}

#[derive(Debug, Default)]
pub struct InMemoryTransport {
    state: Mutex<State>,
    available: Notify,
    closed: AtomicBool,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a raw message on a queue as an external producer would.
    pub async fn enqueue(&self, queue: &str, payload: impl Into<Vec<u8>>) {
        let mut state = self.state.lock().await;
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(Queued {
                payload: payload.into(),
                redelivered: false,
            });
        drop(state);
        self.available.notify_one();
    }

    pub async fn enqueue_json(&self, queue: &str, value: &serde_json::Value) {
        self.enqueue(queue, value.to_string()).await;
    }

    /// Make every publish to `queue` fail until cleared.
    pub async fn fail_publishes_to(&self, queue: &str) {
        self.state
            .lock()
            .await
            .failing_queues
            .insert(queue.to_string());
    }

    pub async fn clear_publish_failures(&self) {
        self.state.lock().await.failing_queues.clear();
    }

    pub async fn published(&self, queue: &str) -> Vec<PublishedMessage> {
        self.state
            .lock()
            .await
            .published
            .iter()
            .filter(|m| m.queue == queue)
            .cloned()
            .collect()
    }

    pub async fn acked(&self) -> Vec<Delivery> {
        self.state.lock().await.acked.clone()
    }

    pub async fn nacked(&self) -> Vec<(Delivery, bool)> {
        self.state.lock().await.nacked.clone()
    }

    pub async fn unacked_count(&self) -> usize {
        self.state.lock().await.unacked.len()
    }

    /// Highest number of simultaneously unacknowledged deliveries seen so far
    pub async fn max_unacked(&self) -> usize {
        self.state.lock().await.max_unacked
    }

    /// Messages waiting to be received
    pub async fn queue_len(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    pub async fn is_declared(&self, queue: &str) -> bool {
        self.state.lock().await.declared.contains(queue)
    }

    pub async fn prefetch(&self) -> usize {
        self.state.lock().await.prefetch
    }

    fn ensure_open(&self) -> Result<(), WorkerError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(WorkerError::Closed)
        } else {
            Ok(())
        }
    }

    fn take_ready(state: &mut State, queue: &str, max: usize) -> Vec<Delivery> {
        let allowed = if state.prefetch == 0 {
            max
        } else {
            state.prefetch.saturating_sub(state.unacked.len()).min(max)
        };

        let mut deliveries = Vec::new();
        while deliveries.len() < allowed {
            let Some(queued) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) else {
                break;
            };
            state.next_tag += 1;
            let delivery = Delivery {
                tag: state.next_tag.to_string(),
                queue: queue.to_string(),
                payload: queued.payload,
                redelivered: queued.redelivered,
            };
            state.unacked.insert(delivery.tag.clone(), delivery.clone());
            deliveries.push(delivery);
        }

        state.max_unacked = state.max_unacked.max(state.unacked.len());
        deliveries
    }

    async fn settle(&self, delivery: &Delivery) -> Result<Delivery, WorkerError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let settled = state.unacked.remove(&delivery.tag).ok_or_else(|| {
            WorkerError::transport(format!("unknown delivery tag {}", delivery.tag))
        })?;
        drop(state);
        // A freed prefetch slot may unblock a waiting receive
        self.available.notify_one();
        Ok(settled)
    }
}

#[async_trait]
impl QueueTransport for InMemoryTransport {
    async fn declare_queue(&self, queue: &str) -> Result<(), WorkerError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        state.declared.insert(queue.to_string());
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn set_prefetch(&self, count: usize) -> Result<(), WorkerError> {
        self.ensure_open()?;
        self.state.lock().await.prefetch = count;
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, WorkerError> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            self.ensure_open()?;
            {
                let mut state = self.state.lock().await;
                if !state.declared.contains(queue) {
                    return Err(WorkerError::transport(format!(
                        "queue '{}' has not been declared",
                        queue
                    )));
                }
                let deliveries = Self::take_ready(&mut state, queue, max);
                if !deliveries.is_empty() {
                    return Ok(deliveries);
                }
            }

            if tokio::time::timeout_at(deadline, self.available.notified())
                .await
                .is_err()
            {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), WorkerError> {
        let settled = self.settle(delivery).await?;
        self.state.lock().await.acked.push(settled);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), WorkerError> {
        let settled = self.settle(delivery).await?;
        let mut state = self.state.lock().await;
        if requeue {
            state
                .queues
                .entry(settled.queue.clone())
                .or_default()
                .push_front(Queued {
                    payload: settled.payload.clone(),
                    redelivered: true,
                });
        }
        state.nacked.push((settled, requeue));
        drop(state);
        if requeue {
            self.available.notify_one();
        }
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<String, WorkerError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        if state.failing_queues.contains(queue) {
            return Err(WorkerError::transport(format!(
                "publish to '{}' rejected",
                queue
            )));
        }

        state.next_tag += 1;
        let id = format!("msg-{}", state.next_tag);
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(Queued {
                payload: payload.to_vec(),
                redelivered: false,
            });
        state.published.push(PublishedMessage {
            queue: queue.to_string(),
            payload: payload.to_vec(),
            persistent: options.persistent,
        });
        drop(state);
        self.available.notify_one();
        Ok(id)
    }

    async fn close(&self) -> Result<(), WorkerError> {
        self.closed.store(true, Ordering::SeqCst);
        self.available.notify_waiters();
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        if self.closed.load(Ordering::SeqCst) {
            ConnectionState::Closed
        } else {
            ConnectionState::Connected
        }
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}

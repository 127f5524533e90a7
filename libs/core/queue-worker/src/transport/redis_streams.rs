//! Redis Streams transport.
//!
//! Mapping onto stream commands:
//! - declare: `XGROUP CREATE <queue> <group> 0 MKSTREAM` (BUSYGROUP tolerated)
//! - receive: `XREADGROUP`, replaying this consumer's pending entries once per
//!   queue before switching to `>` with `BLOCK`
//! - recovery: `XPENDING` + `XCLAIM` of other consumers' entries idle for longer
//!   than `claim_idle_ms`, at startup and then once per `claim_idle_ms`
//! - ack, nack without requeue: `XACK` + `XDEL`
//! - nack with requeue: `XADD` the payload again, then `XACK` + `XDEL`
//! - publish: `XADD <queue> MAXLEN ~ <n> * job <payload>`
//!
//! Blocking reads run on their own connection so acks and publishes are not queued
//! behind a `BLOCK`.

use super::{ConnectionState, Delivery, PublishOptions, QueueTransport};
use crate::config::WorkerConfig;
use crate::error::WorkerError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::RedisResult;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Field holding the message body in every stream entry
pub const PAYLOAD_FIELD: &str = "job";

/// How many pending entries one claim pass inspects
const PENDING_SCAN_COUNT: usize = 100;

// Values stay raw bytes; a body that is not UTF-8 is the handler's to reject.
type StreamEntries = Vec<(String, Vec<(String, Vec<u8>)>)>;
type StreamReadReply = Vec<(String, StreamEntries)>;

/// `XPENDING` extended form: id, owner, idle ms, delivery count
type PendingReply = Vec<(String, String, i64, i64)>;

#[derive(Debug, Clone)]
pub struct RedisTransportOptions {
    pub consumer_group: String,
    pub consumer_id: String,
    pub max_length: i64,
    pub claim_idle_ms: u64,
}

impl RedisTransportOptions {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            consumer_group: config.consumer_group.clone(),
            consumer_id: config.consumer_id.clone(),
            max_length: config.max_length,
            claim_idle_ms: config.claim_idle_ms,
        }
    }
}

#[derive(Debug, Clone)]
enum Recovery {
    /// Replaying pending entries after this stream id
    Pending(String),
    Done,
}

pub struct RedisTransport {
    reader: ConnectionManager,
    writer: ConnectionManager,
    options: RedisTransportOptions,
    prefetch: AtomicUsize,
    in_flight: AtomicUsize,
    recovery: Mutex<HashMap<String, Recovery>>,
    last_claim: Mutex<HashMap<String, Instant>>,
    state: watch::Sender<ConnectionState>,
}

impl RedisTransport {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(url: &str, options: RedisTransportOptions) -> Result<Self, WorkerError> {
        let (state, _) = watch::channel(ConnectionState::Connecting);

        info!(
            consumer_group = %options.consumer_group,
            consumer_id = %options.consumer_id,
            "Connecting to Redis"
        );

        let client = redis::Client::open(url)?;
        let reader = ConnectionManager::new(client.clone()).await?;
        let mut writer = ConnectionManager::new(client).await?;

        let _: String = redis::cmd("PING").query_async(&mut writer).await?;

        state.send_replace(ConnectionState::Connected);
        info!("Connected to Redis");

        Ok(Self {
            reader,
            writer,
            options,
            prefetch: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            recovery: Mutex::new(HashMap::new()),
            last_claim: Mutex::new(HashMap::new()),
            state,
        })
    }

    /// Watch connection state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn ensure_open(&self) -> Result<(), WorkerError> {
        if *self.state.borrow() == ConnectionState::Closed {
            return Err(WorkerError::Closed);
        }
        Ok(())
    }

    fn transition(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next || *current == ConnectionState::Closed {
                return false;
            }
            match next {
                ConnectionState::Disconnected => warn!(from = %current, "Redis connection lost"),
                ConnectionState::Connected => info!(from = %current, "Redis connection recovered"),
                _ => debug!(from = %current, to = %next, "Redis connection state changed"),
            }
            *current = next;
            true
        });
    }

    /// Map a command result, tracking connection health along the way.
    fn observe<T>(&self, result: RedisResult<T>) -> Result<T, WorkerError> {
        match result {
            Ok(value) => {
                self.transition(ConnectionState::Connected);
                Ok(value)
            }
            Err(e) => {
                let err = WorkerError::Redis(e);
                if err.is_connection_error() {
                    self.transition(ConnectionState::Disconnected);
                }
                Err(err)
            }
        }
    }

    fn available_slots(&self, max: usize) -> usize {
        let prefetch = self.prefetch.load(Ordering::SeqCst);
        if prefetch == 0 {
            return max;
        }
        prefetch
            .saturating_sub(self.in_flight.load(Ordering::SeqCst))
            .min(max)
    }

    fn release_slot(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    fn into_deliveries(queue: &str, reply: StreamReadReply, redelivered: bool) -> Vec<Delivery> {
        reply
            .into_iter()
            .flat_map(|(_, entries)| Self::entries_into_deliveries(queue, entries, redelivered))
            .collect()
    }

    fn entries_into_deliveries(
        queue: &str,
        entries: StreamEntries,
        redelivered: bool,
    ) -> Vec<Delivery> {
        entries
            .into_iter()
            .map(|(id, fields)| {
                let payload = fields
                    .into_iter()
                    .find(|(field, _)| field == PAYLOAD_FIELD)
                    .map(|(_, value)| value)
                    .unwrap_or_else(|| {
                        warn!(stream_id = %id, "Stream entry has no payload field");
                        Vec::new()
                    });
                Delivery {
                    tag: id,
                    queue: queue.to_string(),
                    payload,
                    redelivered,
                }
            })
            .collect()
    }

    async fn read_pending(
        &self,
        queue: &str,
        after: &str,
        count: usize,
    ) -> Result<Vec<Delivery>, WorkerError> {
        let mut conn = self.writer.clone();
        let result: RedisResult<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.options.consumer_group)
            .arg(&self.options.consumer_id)
            .arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(queue)
            .arg(after)
            .query_async(&mut conn)
            .await;

        Ok(Self::into_deliveries(queue, self.observe(result)?, true))
    }

    async fn read_new(
        &self,
        queue: &str,
        count: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, WorkerError> {
        let mut conn = self.reader.clone();
        let result: RedisResult<Option<StreamReadReply>> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.options.consumer_group)
            .arg(&self.options.consumer_id)
            .arg("BLOCK")
            .arg(wait.as_millis().max(1) as u64)
            .arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(queue)
            .arg(">")
            .query_async(&mut conn)
            .await;

        Ok(self
            .observe(result)?
            .map(|reply| Self::into_deliveries(queue, reply, false))
            .unwrap_or_default())
    }

    /// Pending entries owned by other consumers that have been idle long enough.
    fn claimable_ids(
        pending: PendingReply,
        own_consumer: &str,
        min_idle_ms: u64,
        limit: usize,
    ) -> Vec<String> {
        pending
            .into_iter()
            .filter(|(_, owner, idle_ms, _)| {
                owner != own_consumer
                    && u64::try_from(*idle_ms).is_ok_and(|idle| idle >= min_idle_ms)
            })
            .map(|(id, _, _, _)| id)
            .take(limit)
            .collect()
    }

    async fn claim_due(&self, queue: &str) -> bool {
        let interval = Duration::from_millis(self.options.claim_idle_ms);
        let mut last_claim = self.last_claim.lock().await;
        match last_claim.get(queue) {
            Some(at) if at.elapsed() < interval => false,
            _ => {
                last_claim.insert(queue.to_string(), Instant::now());
                true
            }
        }
    }

    /// Take over entries left unacked by consumers that crashed or stopped.
    async fn claim_abandoned(
        &self,
        queue: &str,
        count: usize,
    ) -> Result<Vec<Delivery>, WorkerError> {
        let mut conn = self.writer.clone();

        let pending: RedisResult<PendingReply> = redis::cmd("XPENDING")
            .arg(queue)
            .arg(&self.options.consumer_group)
            .arg("-")
            .arg("+")
            .arg(PENDING_SCAN_COUNT)
            .query_async(&mut conn)
            .await;
        let pending = self.observe(pending)?;

        let ids = Self::claimable_ids(
            pending,
            &self.options.consumer_id,
            self.options.claim_idle_ms,
            count,
        );
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        // MIN-IDLE-TIME again so two consumers racing for the same entry cannot both win
        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(queue)
            .arg(&self.options.consumer_group)
            .arg(&self.options.consumer_id)
            .arg(self.options.claim_idle_ms);
        for id in &ids {
            cmd.arg(id);
        }

        let claimed: RedisResult<StreamEntries> = cmd.query_async(&mut conn).await;
        let deliveries = Self::entries_into_deliveries(queue, self.observe(claimed)?, true);
        if !deliveries.is_empty() {
            warn!(queue = %queue, count = deliveries.len(), "Claimed abandoned messages");
        }
        Ok(deliveries)
    }

    async fn remove(&self, delivery: &Delivery) -> Result<(), WorkerError> {
        let mut conn = self.writer.clone();
        let result: RedisResult<()> = redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&delivery.queue)
            .arg(&self.options.consumer_group)
            .arg(&delivery.tag)
            .ignore()
            .cmd("XDEL")
            .arg(&delivery.queue)
            .arg(&delivery.tag)
            .ignore()
            .query_async(&mut conn)
            .await;

        // The delivery is settled from the consumer's side either way. An entry
        // whose XACK failed stays pending and is claimed later by another consumer.
        self.release_slot();
        self.observe(result)?;
        Ok(())
    }
}

#[async_trait]
impl QueueTransport for RedisTransport {
    async fn declare_queue(&self, queue: &str) -> Result<(), WorkerError> {
        self.ensure_open()?;
        let mut conn = self.writer.clone();

        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(queue)
            .arg(&self.options.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => {
                info!(queue = %queue, group = %self.options.consumer_group, "Created consumer group");
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(queue = %queue, group = %self.options.consumer_group, "Consumer group already exists");
            }
            Err(e) => return self.observe(Err(e)),
        }

        self.recovery
            .lock()
            .await
            .entry(queue.to_string())
            .or_insert_with(|| Recovery::Pending("0".to_string()));

        Ok(())
    }

    async fn set_prefetch(&self, count: usize) -> Result<(), WorkerError> {
        self.ensure_open()?;
        self.prefetch.store(count, Ordering::SeqCst);
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, WorkerError> {
        self.ensure_open()?;

        let budget = self.available_slots(max);
        if budget == 0 {
            tokio::time::sleep(wait).await;
            return Ok(Vec::new());
        }

        // Entries delivered to this consumer before a restart come back first
        let recovery = self.recovery.lock().await.get(queue).cloned();
        if let Some(Recovery::Pending(after)) = recovery {
            let pending = self.read_pending(queue, &after, budget).await?;
            let mut cursors = self.recovery.lock().await;
            match pending.last() {
                Some(last) => {
                    info!(queue = %queue, count = pending.len(), "Recovered pending messages");
                    cursors.insert(queue.to_string(), Recovery::Pending(last.tag.clone()));
                    self.in_flight.fetch_add(pending.len(), Ordering::SeqCst);
                    return Ok(pending);
                }
                None => {
                    cursors.insert(queue.to_string(), Recovery::Done);
                }
            }
        }

        if self.claim_due(queue).await {
            let claimed = self.claim_abandoned(queue, budget).await?;
            if !claimed.is_empty() {
                self.in_flight.fetch_add(claimed.len(), Ordering::SeqCst);
                return Ok(claimed);
            }
        }

        let deliveries = self.read_new(queue, budget, wait).await?;
        self.in_flight.fetch_add(deliveries.len(), Ordering::SeqCst);
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), WorkerError> {
        self.ensure_open()?;
        self.remove(delivery).await?;
        debug!(stream_id = %delivery.tag, "Acknowledged message");
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), WorkerError> {
        self.ensure_open()?;
        if requeue {
            if let Err(e) = self
                .publish(&delivery.queue, &delivery.payload, PublishOptions::persistent())
                .await
            {
                // Still pending on the server, so another consumer will claim it
                self.release_slot();
                return Err(e);
            }
        }
        self.remove(delivery).await?;
        debug!(stream_id = %delivery.tag, requeue, "Rejected message");
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<String, WorkerError> {
        self.ensure_open()?;
        let mut conn = self.writer.clone();

        // Stream entries are durable under the server's persistence settings;
        // there is no per-message flag to set.
        let result: RedisResult<String> = redis::cmd("XADD")
            .arg(queue)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.options.max_length)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async(&mut conn)
            .await;

        let id = self.observe(result)?;
        debug!(queue = %queue, stream_id = %id, persistent = options.persistent, "Published message");
        Ok(id)
    }

    async fn close(&self) -> Result<(), WorkerError> {
        let previous = self.state.send_replace(ConnectionState::Closed);
        if previous != ConnectionState::Closed {
            info!(in_flight = self.in_flight.load(Ordering::SeqCst), "Redis transport closed");
        }
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn name(&self) -> &'static str {
        "redis-streams"
    }
}

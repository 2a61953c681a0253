//! # Queue
//!
//! An at-least-once delivery queue over Redis Streams with consumer groups.
//!
//! Entries are appended with XADD and fan out to a consumer group where each
//! entry is delivered to exactly one consumer at a time. A delivered entry
//! stays in the group's pending list until it is acknowledged with XACK;
//! entries idle beyond a threshold can be reassigned to another consumer via
//! XAUTOCLAIM, which is the sole crash-recovery mechanism between receipt
//! and ack.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamPendingReply, StreamReadOptions,
    StreamReadReply,
};
use redis::AsyncCommands;
use thiserror::Error;
use tracing::warn;

/// Stream field under which the serialized event rides.
const PAYLOAD_FIELD: &str = "data";

/// Enumeration of errors for queue operations. All variants wrap transport
/// failures and are treated as transient by callers.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("connection failed with: {0}")]
    ConnectionError(redis::RedisError),
    #[error("{command} failed with: {error}")]
    CommandError {
        command: &'static str,
        error: redis::RedisError,
    },
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// A single delivered entry. `payload` is `None` when the stream entry does
/// not carry the expected field; such entries can never become valid and are
/// acknowledged without processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub entry_id: String,
    pub payload: Option<String>,
}

/// Uniform consumer-group queue interface shared by the ingestion service
/// (publish, stats, health) and the worker pool (consume, reclaim, ack).
#[async_trait]
pub trait Queue: Send + Sync {
    /// Append a payload, returning the queue-assigned entry id.
    async fn publish(&self, payload: &str) -> QueueResult<String>;

    /// Create the consumer group if absent, positioned at the stream tail.
    /// Losing the creation race to another process is not an error.
    async fn ensure_group(&self) -> QueueResult<()>;

    /// Read entries newly delivered to this consumer, blocking up to
    /// `block` when the stream is drained. Returns an empty batch on block
    /// timeout.
    async fn consume(
        &self,
        consumer: &str,
        max_batch: usize,
        block: Duration,
    ) -> QueueResult<Vec<Delivery>>;

    /// Take over entries pending on any consumer in the group that have
    /// been idle for at least `idle_threshold`. Ordering of the returned
    /// entries is unspecified.
    async fn reclaim_stale(
        &self,
        consumer: &str,
        idle_threshold: Duration,
        max_batch: usize,
    ) -> QueueResult<Vec<Delivery>>;

    /// Remove an entry from the group's pending set. Idempotent.
    async fn ack(&self, entry_id: &str) -> QueueResult<()>;

    /// Number of delivered-but-unacknowledged entries in the group.
    async fn pending_count(&self) -> QueueResult<u64>;

    /// Total number of entries in the stream.
    async fn length(&self) -> QueueResult<u64>;

    /// Round-trip connectivity probe.
    async fn ping(&self) -> QueueResult<()>;
}

/// [`Queue`] implementation over a Redis stream.
#[derive(Clone)]
pub struct RedisQueue {
    connection: MultiplexedConnection,
    stream: String,
    group: String,
}

impl RedisQueue {
    pub async fn connect(url: &str, stream: &str, group: &str) -> QueueResult<Self> {
        let client = redis::Client::open(url).map_err(QueueError::ConnectionError)?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::ConnectionError)?;

        Ok(Self {
            connection,
            stream: stream.to_owned(),
            group: group.to_owned(),
        })
    }

    fn delivery(entry: StreamId) -> Delivery {
        let payload: Option<String> = entry.get(PAYLOAD_FIELD);
        if payload.is_none() {
            warn!(entry_id = %entry.id, "stream entry is missing its payload field");
        }
        Delivery {
            entry_id: entry.id,
            payload,
        }
    }
}

#[async_trait]
impl Queue for RedisQueue {
    async fn publish(&self, payload: &str) -> QueueResult<String> {
        let mut conn = self.connection.clone();
        conn.xadd(&self.stream, "*", &[(PAYLOAD_FIELD, payload)])
            .await
            .map_err(|error| QueueError::CommandError {
                command: "XADD",
                error,
            })
    }

    async fn ensure_group(&self) -> QueueResult<()> {
        let mut conn = self.connection.clone();
        match conn
            .xgroup_create_mkstream::<_, _, _, ()>(&self.stream, &self.group, "$")
            .await
        {
            Ok(()) => Ok(()),
            // Another process won the creation race; the group is there.
            Err(error) if error.code() == Some("BUSYGROUP") => Ok(()),
            Err(error) => Err(QueueError::CommandError {
                command: "XGROUP CREATE",
                error,
            }),
        }
    }

    async fn consume(
        &self,
        consumer: &str,
        max_batch: usize,
        block: Duration,
    ) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.connection.clone();
        let options = StreamReadOptions::default()
            .group(&self.group, consumer)
            .count(max_batch)
            .block(block.as_millis() as usize);

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream], &[">"], &options)
            .await
            .map_err(|error| QueueError::CommandError {
                command: "XREADGROUP",
                error,
            })?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        Ok(reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .map(Self::delivery)
            .collect())
    }

    async fn reclaim_stale(
        &self,
        consumer: &str,
        idle_threshold: Duration,
        max_batch: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.connection.clone();
        let options = StreamAutoClaimOptions::default().count(max_batch);

        let reply: StreamAutoClaimReply = conn
            .xautoclaim_options(
                &self.stream,
                &self.group,
                consumer,
                idle_threshold.as_millis() as u64,
                "0-0",
                options,
            )
            .await
            .map_err(|error| QueueError::CommandError {
                command: "XAUTOCLAIM",
                error,
            })?;

        Ok(reply.claimed.into_iter().map(Self::delivery).collect())
    }

    async fn ack(&self, entry_id: &str) -> QueueResult<()> {
        let mut conn = self.connection.clone();
        let _acked: u64 = conn
            .xack(&self.stream, &self.group, &[entry_id])
            .await
            .map_err(|error| QueueError::CommandError {
                command: "XACK",
                error,
            })?;
        Ok(())
    }

    async fn pending_count(&self) -> QueueResult<u64> {
        let mut conn = self.connection.clone();
        let reply: StreamPendingReply =
            conn.xpending(&self.stream, &self.group)
                .await
                .map_err(|error| QueueError::CommandError {
                    command: "XPENDING",
                    error,
                })?;
        Ok(reply.count() as u64)
    }

    async fn length(&self) -> QueueResult<u64> {
        let mut conn = self.connection.clone();
        conn.xlen(&self.stream)
            .await
            .map_err(|error| QueueError::CommandError {
                command: "XLEN",
                error,
            })
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.connection.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|error| QueueError::CommandError {
                command: "PING",
                error,
            })?;
        Ok(())
    }
}

#[derive(Debug)]
struct PendingEntry {
    payload: Option<String>,
    consumer: String,
    idle: Duration,
}

#[derive(Default)]
struct MockQueueInner {
    next_id: u64,
    ready: Vec<(String, Option<String>)>,
    pending: HashMap<String, PendingEntry>,
    acked: Vec<String>,
    fail_publish: bool,
    fail_consume: bool,
    fail_ack: bool,
    fail_ping: bool,
}

/// In-memory [`Queue`] for tests. Idle time is advanced explicitly with
/// [`MockQueue::advance_idle`] so reclaim behavior is deterministic.
#[derive(Clone, Default)]
pub struct MockQueue {
    inner: Arc<Mutex<MockQueueInner>>,
}

impl MockQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject an entry that carries no payload field.
    pub fn publish_empty_entry(&self) -> String {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let entry_id = format!("0-{}", inner.next_id);
        inner.ready.push((entry_id.clone(), None));
        entry_id
    }

    /// Age every pending entry by `duration`.
    pub fn advance_idle(&self, duration: Duration) {
        let mut inner = self.inner.lock().unwrap();
        for entry in inner.pending.values_mut() {
            entry.idle += duration;
        }
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.inner.lock().unwrap().fail_publish = fail;
    }

    pub fn set_fail_consume(&self, fail: bool) {
        self.inner.lock().unwrap().fail_consume = fail;
    }

    pub fn set_fail_ack(&self, fail: bool) {
        self.inner.lock().unwrap().fail_ack = fail;
    }

    pub fn set_fail_ping(&self, fail: bool) {
        self.inner.lock().unwrap().fail_ping = fail;
    }

    pub fn acked_entries(&self) -> Vec<String> {
        self.inner.lock().unwrap().acked.clone()
    }

    /// Consumer currently assigned to a pending entry, if any.
    pub fn pending_consumer(&self, entry_id: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .pending
            .get(entry_id)
            .map(|entry| entry.consumer.clone())
    }

    fn injected_error(command: &'static str) -> QueueError {
        QueueError::CommandError {
            command,
            error: redis::RedisError::from(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "injected failure",
            )),
        }
    }
}

#[async_trait]
impl Queue for MockQueue {
    async fn publish(&self, payload: &str) -> QueueResult<String> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_publish {
            return Err(Self::injected_error("XADD"));
        }
        inner.next_id += 1;
        let entry_id = format!("0-{}", inner.next_id);
        inner.ready.push((entry_id.clone(), Some(payload.to_owned())));
        Ok(entry_id)
    }

    async fn ensure_group(&self) -> QueueResult<()> {
        Ok(())
    }

    async fn consume(
        &self,
        consumer: &str,
        max_batch: usize,
        block: Duration,
    ) -> QueueResult<Vec<Delivery>> {
        let deliveries = {
            let mut inner = self.inner.lock().unwrap();
            if inner.fail_consume {
                return Err(Self::injected_error("XREADGROUP"));
            }
            let take = max_batch.min(inner.ready.len());
            let batch: Vec<(String, Option<String>)> = inner.ready.drain(..take).collect();
            batch
                .into_iter()
                .map(|(entry_id, payload)| {
                    inner.pending.insert(
                        entry_id.clone(),
                        PendingEntry {
                            payload: payload.clone(),
                            consumer: consumer.to_owned(),
                            idle: Duration::ZERO,
                        },
                    );
                    Delivery { entry_id, payload }
                })
                .collect::<Vec<_>>()
        };

        if deliveries.is_empty() {
            tokio::time::sleep(block).await;
        }
        Ok(deliveries)
    }

    async fn reclaim_stale(
        &self,
        consumer: &str,
        idle_threshold: Duration,
        max_batch: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let mut inner = self.inner.lock().unwrap();
        let mut claimed = Vec::new();
        for (entry_id, entry) in inner.pending.iter_mut() {
            if claimed.len() >= max_batch {
                break;
            }
            if entry.idle >= idle_threshold {
                entry.consumer = consumer.to_owned();
                entry.idle = Duration::ZERO;
                claimed.push(Delivery {
                    entry_id: entry_id.clone(),
                    payload: entry.payload.clone(),
                });
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, entry_id: &str) -> QueueResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_ack {
            return Err(Self::injected_error("XACK"));
        }
        inner.pending.remove(entry_id);
        inner.acked.push(entry_id.to_owned());
        Ok(())
    }

    async fn pending_count(&self) -> QueueResult<u64> {
        Ok(self.inner.lock().unwrap().pending.len() as u64)
    }

    async fn length(&self) -> QueueResult<u64> {
        let inner = self.inner.lock().unwrap();
        Ok((inner.ready.len() + inner.pending.len()) as u64)
    }

    async fn ping(&self) -> QueueResult<()> {
        if self.inner.lock().unwrap().fail_ping {
            return Err(Self::injected_error("PING"));
        }
        Ok(())
    }
}

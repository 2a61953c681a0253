//! The consume-process-ack loop.
//!
//! Each worker is a single logical thread of control sharing a consumer
//! group with its peers. A cycle first reclaims entries stranded on crashed
//! consumers, then blocks for fresh deliveries; every delivery is driven to
//! a terminal outcome before the next one starts. Acknowledgment is
//! best-effort: a failed ack only costs one redundant redelivery, which the
//! dedup lookup absorbs.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use eventflow_common::metrics::{sample_queue_gauges, worker_started, worker_stopped};
use eventflow_common::queue::{Delivery, Queue, QueueError};
use eventflow_common::shutdown::ShutdownSignal;

use crate::processor::{Outcome, Processor};

/// Pause after a consume-loop error before trying again.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

pub struct Worker {
    consumer: String,
    queue: Arc<dyn Queue>,
    processor: Processor,
    batch_size: usize,
    block_timeout: Duration,
    idle_reclaim: Duration,
    shutdown: ShutdownSignal,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        consumer: &str,
        queue: Arc<dyn Queue>,
        processor: Processor,
        batch_size: usize,
        block_timeout: Duration,
        idle_reclaim: Duration,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            consumer: consumer.to_owned(),
            queue,
            processor,
            batch_size,
            block_timeout,
            idle_reclaim,
            shutdown,
        }
    }

    /// Run until shutdown is signaled. The in-flight entry is always
    /// finished; entries not yet started are left pending for reclaim.
    pub async fn run(self) {
        info!(worker_id = %self.consumer, "worker ready to process events");
        worker_started();

        while !self.shutdown.is_triggered() {
            if let Err(err) = self.cycle().await {
                error!(worker_id = %self.consumer, error = %err, "error in processing loop");
                tokio::select! {
                    _ = self.shutdown.cancelled() => {},
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {},
                }
            }
        }

        worker_stopped();
        info!(worker_id = %self.consumer, "worker shutdown complete");
    }

    async fn cycle(&self) -> Result<(), QueueError> {
        // Recover entries stranded between receipt and ack on a crashed
        // peer. Reclaimed entries are processed exactly like fresh ones.
        let reclaimed = self
            .queue
            .reclaim_stale(&self.consumer, self.idle_reclaim, self.batch_size)
            .await?;
        if !reclaimed.is_empty() {
            info!(
                worker_id = %self.consumer,
                count = reclaimed.len(),
                "reclaimed stale entries"
            );
        }
        self.process_batch(reclaimed).await;

        if self.shutdown.is_triggered() {
            return Ok(());
        }

        match (self.queue.length().await, self.queue.pending_count().await) {
            (Ok(depth), Ok(pending)) => sample_queue_gauges(depth, pending),
            (Err(err), _) | (_, Err(err)) => {
                debug!(error = %err, "failed to sample queue gauges")
            }
        }

        let deliveries = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            result = self.queue.consume(&self.consumer, self.batch_size, self.block_timeout) => {
                result?
            }
        };
        self.process_batch(deliveries).await;

        Ok(())
    }

    async fn process_batch(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            let outcome = match &delivery.payload {
                Some(payload) => self.processor.process(payload).await,
                None => {
                    warn!(entry_id = %delivery.entry_id, "entry carries no payload, discarding");
                    Outcome::Discarded
                }
            };

            if outcome.should_ack() {
                if let Err(err) = self.queue.ack(&delivery.entry_id).await {
                    // Redelivery after a lost ack is harmless: the
                    // now-present terminal row turns it into a duplicate.
                    warn!(
                        entry_id = %delivery.entry_id,
                        error = %err,
                        "failed to acknowledge entry"
                    );
                }
            }

            // Entries not yet started stay pending for reclaim.
            if self.shutdown.is_triggered() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::time::Instant;

    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    use eventflow_common::event::{Event, EventKind};
    use eventflow_common::queue::MockQueue;
    use eventflow_common::retry::Backoff;
    use eventflow_common::store::MockStore;

    fn test_event(kind: EventKind) -> Event {
        Event {
            fingerprint: Uuid::new_v4(),
            kind,
            subject_id: Some("u1".to_string()),
            occurred_at: Utc::now(),
            properties: HashMap::from([(String::from("amount"), json!(42.0))]),
        }
    }

    fn spawn_worker(
        queue: &MockQueue,
        store: &MockStore,
        shutdown: &ShutdownSignal,
    ) -> tokio::task::JoinHandle<()> {
        let processor = Processor::new(
            Arc::new(store.clone()),
            "worker-1",
            3,
            Backoff::new(Duration::from_millis(1), Duration::from_millis(4)),
            1000.0,
        );
        let worker = Worker::new(
            "worker-1",
            Arc::new(queue.clone()),
            processor,
            10,
            Duration::from_millis(5),
            Duration::from_millis(50),
            shutdown.clone(),
        );
        tokio::spawn(worker.run())
    }

    async fn wait_until<F: Fn() -> bool>(deadline: Duration, check: F) {
        let started = Instant::now();
        while !check() {
            assert!(
                started.elapsed() < deadline,
                "condition not reached within {:?}",
                deadline
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn worker_drains_published_events_and_acks_them() {
        let queue = MockQueue::new();
        let store = MockStore::new();
        let shutdown = ShutdownSignal::new();

        let first = test_event(EventKind::Purchase);
        let second = test_event(EventKind::PageView);
        queue
            .publish(&serde_json::to_string(&first).unwrap())
            .await
            .unwrap();
        queue
            .publish(&serde_json::to_string(&second).unwrap())
            .await
            .unwrap();

        let handle = spawn_worker(&queue, &store, &shutdown);

        let store_probe = store.clone();
        wait_until(Duration::from_secs(5), || {
            store_probe.processed_count() == 2
        })
        .await;

        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.pending_count().await.unwrap() != 0 {
            assert!(Instant::now() < deadline, "entries were not acknowledged");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        shutdown.trigger();
        handle.await.unwrap();

        assert!(store.processed(first.fingerprint).is_some());
        assert!(store.processed(second.fingerprint).is_some());
        assert_eq!(queue.acked_entries().len(), 2);
    }

    #[tokio::test]
    async fn worker_reclaims_entries_stranded_on_a_dead_consumer() {
        let queue = MockQueue::new();
        let store = MockStore::new();
        let shutdown = ShutdownSignal::new();

        let event = test_event(EventKind::Purchase);
        let entry_id = queue
            .publish(&serde_json::to_string(&event).unwrap())
            .await
            .unwrap();

        // A peer consumed the entry and died before acknowledging.
        let delivered = queue
            .consume("worker-dead", 10, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(delivered.len(), 1);
        queue.advance_idle(Duration::from_millis(100));

        let handle = spawn_worker(&queue, &store, &shutdown);

        let store_probe = store.clone();
        wait_until(Duration::from_secs(5), || {
            store_probe.processed_count() == 1
        })
        .await;

        shutdown.trigger();
        handle.await.unwrap();

        assert!(queue.acked_entries().contains(&entry_id));
        assert_eq!(store.processed(event.fingerprint).unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn reclaimed_entry_whose_row_exists_is_acked_as_duplicate() {
        let queue = MockQueue::new();
        let store = MockStore::new();
        let shutdown = ShutdownSignal::new();

        let event = test_event(EventKind::Purchase);
        let entry_id = queue
            .publish(&serde_json::to_string(&event).unwrap())
            .await
            .unwrap();

        // The peer committed its processed row but crashed before ack.
        let processor = Processor::new(
            Arc::new(store.clone()),
            "worker-dead",
            3,
            Backoff::default(),
            1000.0,
        );
        queue
            .consume("worker-dead", 10, Duration::from_millis(1))
            .await
            .unwrap();
        let outcome = processor
            .process(&serde_json::to_string(&event).unwrap())
            .await;
        assert_eq!(outcome, Outcome::Processed);
        queue.advance_idle(Duration::from_millis(100));

        let handle = spawn_worker(&queue, &store, &shutdown);

        let queue_probe = queue.clone();
        wait_until(Duration::from_secs(5), || {
            queue_probe.acked_entries().contains(&entry_id)
        })
        .await;

        shutdown.trigger();
        handle.await.unwrap();

        // No second processed row was written.
        assert_eq!(store.processed_count(), 1);
        assert!(store.failed_rows().is_empty());
    }

    #[tokio::test]
    async fn payloadless_entries_are_acked_and_dropped() {
        let queue = MockQueue::new();
        let store = MockStore::new();
        let shutdown = ShutdownSignal::new();

        let entry_id = queue.publish_empty_entry();

        let handle = spawn_worker(&queue, &store, &shutdown);

        let queue_probe = queue.clone();
        wait_until(Duration::from_secs(5), || {
            queue_probe.acked_entries().contains(&entry_id)
        })
        .await;

        shutdown.trigger();
        handle.await.unwrap();

        assert_eq!(store.processed_count(), 0);
        assert!(store.failed_rows().is_empty());
    }

    #[tokio::test]
    async fn failed_ack_does_not_stall_the_loop() {
        let queue = MockQueue::new();
        let store = MockStore::new();
        let shutdown = ShutdownSignal::new();

        let event = test_event(EventKind::Purchase);
        queue
            .publish(&serde_json::to_string(&event).unwrap())
            .await
            .unwrap();
        queue.set_fail_ack(true);

        let handle = spawn_worker(&queue, &store, &shutdown);

        let store_probe = store.clone();
        wait_until(Duration::from_secs(5), || {
            store_probe.processed_count() == 1
        })
        .await;

        shutdown.trigger();
        handle.await.unwrap();

        // The entry is still pending; redelivery will find the processed
        // row and resolve as a duplicate.
        assert!(queue.acked_entries().is_empty());
    }

    #[tokio::test]
    async fn shutdown_stops_the_worker_promptly() {
        let queue = MockQueue::new();
        let store = MockStore::new();
        let shutdown = ShutdownSignal::new();

        let handle = spawn_worker(&queue, &store, &shutdown);
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.trigger();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker should exit after shutdown")
            .unwrap();
    }
}

//! Bounded hand-off between the upstream reader and the worker pool (§4.6).
//!
//! Backed by `tokio::sync::mpsc`, whose bounded channel already gives us
//! FIFO ordering and a fixed capacity; the only behavior we add on top is
//! the drop-newest-on-full policy (the channel's own `try_send` already
//! refuses to block, so the producer side just has to treat `Full` as
//! "count it and move on" rather than awaiting a permit).
//!
//! The queue is sharded by a hash of the stream name rather than backed
//! by one channel shared behind a lock: routing every frame for a given
//! stream to the same shard, and giving each shard exactly one consumer,
//! is what makes §5's "per stream: FIFO" guarantee hold for the worker
//! pool — two workers racing to dequeue and publish the same stream's
//! frames out of order becomes structurally impossible rather than
//! something to serialize after the fact.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::metrics::Metrics;

/// One item handed from the Upstream Session to a worker: the derived
/// stream name and the raw payload to wrap in an envelope.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub stream: String,
    pub data: serde_json::Value,
}

struct DropThrottle {
    window: Duration,
    last_logged: Mutex<Option<Instant>>,
}

impl DropThrottle {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last_logged: Mutex::new(None),
        }
    }

    /// Returns true if a drop-warning should be logged now, i.e. the
    /// throttle window since the last log has elapsed.
    fn should_log(&self) -> bool {
        let mut last = self.last_logged.lock().unwrap();
        let now = Instant::now();
        match *last {
            Some(prev) if now.duration_since(prev) < self.window => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

fn shard_for(stream: &str, shard_count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    stream.hash(&mut hasher);
    (hasher.finish() as usize) % shard_count
}

/// The producer half, held by the Upstream Session. `try_push` never
/// blocks: on a full shard the frame is dropped and `dropped_total` is
/// incremented. Frames for the same stream always hash to the same
/// shard, so per-stream order is exactly the order they arrived in.
pub struct QueueProducer {
    senders: Vec<mpsc::Sender<QueueItem>>,
    capacity: usize,
    metrics: Arc<Metrics>,
    throttle: DropThrottle,
}

impl QueueProducer {
    pub fn try_push(&self, item: QueueItem) {
        let shard = shard_for(&item.stream, self.senders.len());
        match self.senders[shard].try_send(item) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.record_dropped();
                if self.throttle.should_log() {
                    tracing::warn!(
                        queue_capacity = self.capacity,
                        shard,
                        "bounded queue shard full, dropping incoming frame"
                    );
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(shard, "queue shard closed, dropping frame");
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// A cheap, cloneable read-only handle for reporting queue depth in a
    /// metrics snapshot, independent of the lifetime of this producer.
    pub fn handle(&self) -> QueueHandle {
        QueueHandle {
            senders: self.senders.clone(),
            capacity: self.capacity,
        }
    }
}

/// The consumer half. Each shard has exactly one, owned by exactly one
/// worker — never shared or wrapped in a lock.
pub type QueueConsumer = mpsc::Receiver<QueueItem>;

/// Read-only view of how full the queue currently is, for metrics
/// snapshots. Cloning a sender doesn't consume capacity, so holding one
/// here alongside the real producer is free.
#[derive(Clone)]
pub struct QueueHandle {
    senders: Vec<mpsc::Sender<QueueItem>>,
    capacity: usize,
}

impl QueueHandle {
    pub fn queue_size(&self) -> usize {
        let remaining: usize = self.senders.iter().map(mpsc::Sender::capacity).sum();
        self.capacity.saturating_sub(remaining)
    }
}

/// Builds a sharded bounded queue: `shard_count` independent channels,
/// each holding up to `capacity_per_shard` items, dispatched to by a hash
/// of each item's stream name.
pub fn bounded_queue(
    shard_count: usize,
    capacity_per_shard: usize,
    metrics: Arc<Metrics>,
    drop_log_throttle: Duration,
) -> (QueueProducer, Vec<QueueConsumer>) {
    assert!(shard_count > 0, "shard_count must be greater than zero");
    let mut senders = Vec::with_capacity(shard_count);
    let mut receivers = Vec::with_capacity(shard_count);
    for _ in 0..shard_count {
        let (tx, rx) = mpsc::channel(capacity_per_shard);
        senders.push(tx);
        receivers.push(rx);
    }

    (
        QueueProducer {
            senders,
            capacity: capacity_per_shard * shard_count,
            metrics,
            throttle: DropThrottle::new(drop_log_throttle),
        },
        receivers,
    )
}

/// Convenience for callers that only need a single consumer — driving an
/// `UpstreamSession` directly in a test, without a worker pool behind it.
pub fn single_consumer_queue(
    capacity: usize,
    metrics: Arc<Metrics>,
    drop_log_throttle: Duration,
) -> (QueueProducer, QueueConsumer) {
    let (producer, mut consumers) = bounded_queue(1, capacity, metrics, drop_log_throttle);
    (producer, consumers.remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(stream: &str, n: usize) -> QueueItem {
        QueueItem {
            stream: stream.to_string(),
            data: json!({"n": n}),
        }
    }

    #[tokio::test]
    async fn pushes_below_capacity_are_not_dropped() {
        let metrics = Metrics::new(4);
        let (producer, mut consumer) = single_consumer_queue(4, metrics.clone(), Duration::from_secs(1));

        for n in 0..4 {
            producer.try_push(item("stream-a", n));
        }
        assert_eq!(metrics.dropped_total(), 0);

        for n in 0..4 {
            let received = consumer.recv().await.unwrap();
            assert_eq!(received.data, json!({"n": n}), "FIFO order preserved");
        }
    }

    #[tokio::test]
    async fn push_at_capacity_drops_newest_and_counts_it() {
        let metrics = Metrics::new(2);
        let (producer, mut consumer) = single_consumer_queue(2, metrics.clone(), Duration::from_secs(1));

        producer.try_push(item("stream-a", 0));
        producer.try_push(item("stream-a", 1));
        producer.try_push(item("stream-a", 2));

        assert_eq!(metrics.dropped_total(), 1);

        let first = consumer.recv().await.unwrap();
        let second = consumer.recv().await.unwrap();
        assert_eq!(first.data, json!({"n": 0}));
        assert_eq!(second.data, json!({"n": 1}));
    }

    #[tokio::test]
    async fn drop_log_is_throttled_within_window() {
        let metrics = Metrics::new(1);
        let (producer, _consumer) = single_consumer_queue(1, metrics.clone(), Duration::from_secs(60));

        producer.try_push(item("stream-a", 0));
        for n in 1..=5 {
            producer.try_push(item("stream-a", n));
        }

        assert_eq!(metrics.dropped_total(), 5);
        assert!(producer.throttle.last_logged.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn same_stream_always_routes_to_the_same_shard() {
        let metrics = Metrics::new(40);
        let (producer, mut consumers) = bounded_queue(4, 10, metrics.clone(), Duration::from_secs(1));

        for n in 0..5 {
            producer.try_push(item("btcusdt@trade", n));
        }

        let shard = shard_for("btcusdt@trade", 4);
        let mut received = Vec::new();
        while let Ok(item) = consumers[shard].try_recv() {
            received.push(item.data);
        }
        assert_eq!(
            received,
            (0..5).map(|n| json!({"n": n})).collect::<Vec<_>>(),
            "every frame for one stream lands in the same shard, in order"
        );

        for (idx, consumer) in consumers.iter_mut().enumerate() {
            if idx != shard {
                assert!(consumer.try_recv().is_err(), "other shards stay empty");
            }
        }
    }

    #[tokio::test]
    async fn queue_handle_reports_current_depth() {
        let metrics = Metrics::new(10);
        let (producer, _consumers) = bounded_queue(2, 5, metrics.clone(), Duration::from_secs(1));
        let handle = producer.handle();
        assert_eq!(handle.queue_size(), 0);

        producer.try_push(item("a", 0));
        producer.try_push(item("b", 0));
        assert_eq!(handle.queue_size(), 2);
    }
}

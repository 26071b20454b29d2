//! Worker Pool (§4.5): N cooperative workers that drain the bounded queue,
//! build envelopes, and publish them to the bus.
//!
//! Each worker owns exactly one queue shard (see `queue.rs`) rather than
//! sharing one receiver behind a lock: since every frame for a given
//! stream is routed to the same shard, and a worker processes its shard
//! strictly one item at a time (awaiting `bus.publish` before dequeuing
//! the next), per-stream publish order on the bus always matches arrival
//! order, matching §5's "per stream: FIFO" guarantee.

use std::sync::Arc;
use std::time::Duration;

use crate::bus::BusPublisher;
use crate::circuit_breaker::CircuitBreaker;
use crate::clock::{Clock, IdGenerator, MonotonicGuard};
use crate::config::BusConfig;
use crate::envelope::{Envelope, TraceContextSource};
use crate::error::CircuitBreakerError;
use crate::metrics::Metrics;
use crate::queue::QueueConsumer;

/// Handles shared by every worker in the pool. Built once by the
/// Supervisor; each worker additionally gets its own queue shard, which
/// is not shared and therefore not part of this `Clone`-able bundle.
#[derive(Clone)]
pub struct WorkerShared {
    pub bus: Arc<dyn BusPublisher>,
    pub bus_breaker: CircuitBreaker,
    pub bus_config: Arc<BusConfig>,
    pub metrics: Arc<Metrics>,
    pub clock: Arc<dyn Clock>,
    pub trace_context_source: Arc<dyn TraceContextSource>,
}

/// Runs one worker's loop against its own queue shard until that shard is
/// closed and drained.
///
/// Each worker owns one [`MonotonicGuard`] so the §3 invariant
/// ("non-decreasing per worker") only has to hold within one worker, not
/// across the pool.
pub async fn run_worker(mut consumer: QueueConsumer, ctx: WorkerShared, worker_id: usize) {
    let ids = IdGenerator;
    let monotonic = MonotonicGuard::new();

    while let Some(item) = consumer.recv().await {
        let timestamp = monotonic.observe(ctx.clock.as_ref());
        let trace_context = ctx.trace_context_source.trace_context();
        let envelope = Envelope::new(item.stream, item.data, timestamp, ids.next(), trace_context);

        let bytes = match envelope.to_json_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(worker_id, error = %e, "failed to serialize envelope, dropping");
                continue;
            }
        };

        let subject = ctx.bus_config.subject.clone();
        let bus = ctx.bus.clone();
        let result = ctx
            .bus_breaker
            .execute(|| async move { bus.publish(&subject, bytes).await })
            .await;

        match result {
            Ok(()) => {
                ctx.metrics
                    .record_processed(envelope.timestamp.timestamp_millis());
            }
            Err(CircuitBreakerError::Open { .. }) => {
                tracing::warn!(worker_id, "bus breaker open, dropping envelope");
                ctx.metrics.record_dropped();
            }
            Err(CircuitBreakerError::Inner(e)) => {
                tracing::warn!(worker_id, error = %e, "bus publish failed, dropping envelope");
                ctx.metrics.record_dropped();
            }
        }
    }
    tracing::debug!(worker_id, "queue shard closed and drained, worker exiting");
}

/// Spawns one worker task per queue shard and returns their join handles.
/// `consumers.len()` is the effective worker count.
pub fn spawn_workers(
    consumers: Vec<QueueConsumer>,
    shared: WorkerShared,
) -> Vec<tokio::task::JoinHandle<()>> {
    consumers
        .into_iter()
        .enumerate()
        .map(|(id, consumer)| {
            let shared = shared.clone();
            tokio::spawn(async move { run_worker(consumer, shared, id).await })
        })
        .collect()
}

/// Waits for all workers to drain, up to `deadline`; any still running
/// after that are left to finish in the background (the queue sender has
/// already been dropped by the Supervisor, so they will exit soon after).
pub async fn join_with_deadline(handles: Vec<tokio::task::JoinHandle<()>>, deadline: Duration) {
    let joined = tokio::time::timeout(deadline, futures_util::future::join_all(handles)).await;
    if joined.is_err() {
        tracing::warn!("worker drain deadline elapsed before all workers finished");
    }
}

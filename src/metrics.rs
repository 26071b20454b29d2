//! Live operational counters (§3 "Metrics snapshot", §6 `Metrics` read
//! interface).
//!
//! Every field is an atomic updated in place by the component that owns it;
//! `snapshot()` reads each field once. Exact cross-field consistency is not
//! required (§5), so no lock is taken across the read.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::circuit_breaker::CircuitState;
use crate::upstream::session::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub processed_total: u64,
    pub dropped_total: u64,
    pub parse_skipped_total: u64,
    pub queue_size: usize,
    pub queue_capacity: usize,
    pub reconnect_attempts: u64,
    pub last_message_at_millis: Option<i64>,
    pub last_ping_at_millis: Option<i64>,
    pub uptime_secs: u64,
    pub upstream_state: SessionState,
    pub bus_state: BusState,
    pub upstream_breaker_state: CircuitState,
    pub bus_breaker_state: CircuitState,
}

/// Core-owned metrics store, shared by reference between the components
/// that mutate individual fields and the collaborators that only read
/// snapshots (§9: no global mutable singleton).
pub struct Metrics {
    processed_total: AtomicU64,
    dropped_total: AtomicU64,
    parse_skipped_total: AtomicU64,
    reconnect_attempts: AtomicU64,
    last_message_at_millis: AtomicI64,
    last_ping_at_millis: AtomicI64,
    started_at: Instant,
    queue_capacity: usize,
}

const UNSET: i64 = i64::MIN;

impl Metrics {
    pub fn new(queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            processed_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            parse_skipped_total: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            last_message_at_millis: AtomicI64::new(UNSET),
            last_ping_at_millis: AtomicI64::new(UNSET),
            started_at: Instant::now(),
            queue_capacity,
        })
    }

    pub fn record_processed(&self, at_millis: i64) {
        self.processed_total.fetch_add(1, Ordering::Relaxed);
        self.last_message_at_millis.store(at_millis, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse_skipped(&self) {
        self.parse_skipped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ping(&self, at_millis: i64) {
        self.last_ping_at_millis.store(at_millis, Ordering::Relaxed);
    }

    pub fn processed_total(&self) -> u64 {
        self.processed_total.load(Ordering::Relaxed)
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    pub fn parse_skipped_total(&self) -> u64 {
        self.parse_skipped_total.load(Ordering::Relaxed)
    }

    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    pub fn snapshot(
        &self,
        queue_size: usize,
        upstream_state: SessionState,
        bus_state: BusState,
        upstream_breaker_state: CircuitState,
        bus_breaker_state: CircuitState,
    ) -> MetricsSnapshot {
        let last_message_at_millis = match self.last_message_at_millis.load(Ordering::Relaxed) {
            UNSET => None,
            millis => Some(millis),
        };
        let last_ping_at_millis = match self.last_ping_at_millis.load(Ordering::Relaxed) {
            UNSET => None,
            millis => Some(millis),
        };

        MetricsSnapshot {
            processed_total: self.processed_total(),
            dropped_total: self.dropped_total(),
            parse_skipped_total: self.parse_skipped_total(),
            queue_size,
            queue_capacity: self.queue_capacity,
            reconnect_attempts: self.reconnect_attempts(),
            last_message_at_millis,
            last_ping_at_millis,
            uptime_secs: self.started_at.elapsed().as_secs(),
            upstream_state,
            bus_state,
            upstream_breaker_state,
            bus_breaker_state,
        }
    }
}

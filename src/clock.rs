//! Clock abstraction and envelope id generation.
//!
//! Every envelope is stamped using a single injected [`Clock`] so that tests
//! can substitute a deterministic clock instead of wall time, and so the
//! circuit breaker and supervisor share one notion of "now".

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A source of wall-clock time, abstracted so it can be faked in tests.
pub trait Clock: Send + Sync + 'static {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Milliseconds since an arbitrary epoch, used for circuit breaker and
    /// backoff timing (monotonic is not required, only non-decreasing under
    /// normal operation).
    fn now_millis(&self) -> u64 {
        self.now().timestamp_millis().max(0) as u64
    }
}

/// The default clock, backed by [`SystemTime::now`] / [`Utc::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Generates fresh, globally-unique envelope ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdGenerator;

impl IdGenerator {
    pub fn next(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Per-worker monotonic timestamp guard.
///
/// The spec requires envelope timestamps produced by a single worker to be
/// non-decreasing even though the underlying clock is wall-clock (which can,
/// in principle, step backwards under NTP correction). Each worker owns one
/// of these and feeds every reading through it before stamping an envelope.
#[derive(Debug, Clone)]
pub struct MonotonicGuard {
    last_millis: Arc<AtomicI64>,
}

impl MonotonicGuard {
    pub fn new() -> Self {
        Self {
            last_millis: Arc::new(AtomicI64::new(i64::MIN)),
        }
    }

    /// Returns a timestamp that is never earlier than the previous one this
    /// guard returned.
    pub fn observe(&self, clock: &dyn Clock) -> DateTime<Utc> {
        let now = clock.now();
        let now_millis = now.timestamp_millis();
        let prev = self.last_millis.fetch_max(now_millis, Ordering::AcqRel);
        if now_millis >= prev {
            now
        } else {
            DateTime::from_timestamp_millis(prev).unwrap_or(now)
        }
    }
}

impl Default for MonotonicGuard {
    fn default() -> Self {
        Self::new()
    }
}

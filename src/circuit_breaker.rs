//! Circuit breaker: fault isolation for the upstream dialer and the bus
//! publisher (§4.2).
//!
//! State lives in a handful of atomics rather than behind a mutex so that
//! `execute` never blocks a caller on breaker bookkeeping; the half-open
//! "exactly one trial call" rule is enforced with a single
//! compare-exchange, matching how a reusable resilience primitive would be
//! written for a hot path.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::error::CircuitBreakerError;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

struct State {
    state: AtomicU8,
    failure_count: AtomicUsize,
    opened_at_millis: AtomicU64,
    half_open_in_flight: AtomicU8,
}

/// A reusable fault-isolation wrapper around a fallible async operation.
///
/// One instance guards the upstream dial/handshake path; a second,
/// independent instance guards the bus publish path (§4.2).
#[derive(Clone)]
pub struct CircuitBreaker {
    state: Arc<State>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(State {
                state: AtomicU8::new(STATE_CLOSED),
                failure_count: AtomicUsize::new(0),
                opened_at_millis: AtomicU64::new(0),
                half_open_in_flight: AtomicU8::new(0),
            }),
            config,
            clock,
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.state.state.load(Ordering::Acquire) {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    /// Run `operation`, enforcing the breaker's current state.
    ///
    /// Fails fast with [`CircuitBreakerError::Open`] without invoking
    /// `operation` while the breaker is open and the recovery timeout has
    /// not elapsed, or when another caller already owns the single
    /// half-open trial.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, CircuitBreakerError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
    {
        let is_trial = loop {
            match self.state.state.load(Ordering::Acquire) {
                STATE_CLOSED => break false,
                STATE_OPEN => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let now = self.clock.now_millis();
                    let elapsed = now.saturating_sub(opened_at);
                    if elapsed < self.config.recovery_timeout.as_millis() as u64 {
                        return Err(CircuitBreakerError::Open {
                            failure_count: self.state.failure_count.load(Ordering::Acquire),
                            open_duration_ms: elapsed,
                        });
                    }
                    match self.state.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            tracing::info!("circuit breaker: open -> half-open");
                            break true;
                        }
                        Err(_) => continue,
                    }
                }
                STATE_HALF_OPEN => {
                    if self
                        .state
                        .half_open_in_flight
                        .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        return Err(CircuitBreakerError::Open {
                            failure_count: self.state.failure_count.load(Ordering::Acquire),
                            open_duration_ms: 0,
                        });
                    }
                    break true;
                }
                other => unreachable!("invalid circuit breaker state byte {other}"),
            }
        };

        let result = operation().await;

        if is_trial {
            self.state.half_open_in_flight.store(0, Ordering::Release);
        }

        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }

        result.map_err(CircuitBreakerError::Inner)
    }

    fn on_success(&self) {
        let current = self.state.state.load(Ordering::Acquire);
        match current {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_CLOSED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.state.failure_count.store(0, Ordering::Release);
                    tracing::info!("circuit breaker: half-open -> closed");
                }
            }
            STATE_CLOSED => {
                self.state.failure_count.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    fn on_failure(&self) {
        let current = self.state.state.load(Ordering::Acquire);
        let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1;

        match current {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.state
                        .opened_at_millis
                        .store(self.clock.now_millis(), Ordering::Release);
                    tracing::warn!("circuit breaker: half-open trial failed -> open");
                }
            }
            STATE_CLOSED if failures >= self.config.failure_threshold => {
                if self
                    .state
                    .state
                    .compare_exchange(
                        STATE_CLOSED,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.state
                        .opened_at_millis
                        .store(self.clock.now_millis(), Ordering::Release);
                    tracing::error!(failures, "circuit breaker: closed -> open");
                }
            }
            _ => {}
        }
    }
}

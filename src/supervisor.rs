//! Supervisor (§4.1): lifecycle controller. Starts every other component in
//! dependency order, drives upstream reconnection with exponential
//! backoff, runs the keepalive and heartbeat loops, and performs orderly
//! shutdown.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{watch, Mutex, RwLock};

use crate::bus::{BusConnectionState, BusPublisher, NatsPublisher};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::clock::{Clock, SystemClock};
use crate::config::BridgeConfig;
use crate::envelope::{NoopTraceContextSource, TraceContextSource};
use crate::error::{BridgeError, CircuitBreakerError, SupervisorError};
use crate::metrics::{BusState, Metrics, MetricsSnapshot};
use crate::queue::{bounded_queue, QueueHandle};
use crate::readiness::{Healthy, Lifecycle, MetricsSource, Ready};
use crate::upstream::session::{RunExit, SessionState};
use crate::upstream::{ping_loop, UpstreamSession};
use crate::worker::{join_with_deadline, spawn_workers, WorkerShared};

const DROP_LOG_THROTTLE: Duration = Duration::from_secs(1);

struct RunningTasks {
    upstream: tokio::task::JoinHandle<()>,
    heartbeat: tokio::task::JoinHandle<()>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

/// Owns the Upstream Session, Bus Publisher, Bounded Queue, and Worker
/// Pool exclusively (§3 "Ownership").
pub struct Supervisor {
    config: BridgeConfig,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
    trace_context_source: Arc<dyn TraceContextSource>,
    upstream_breaker: CircuitBreaker,
    bus_breaker: CircuitBreaker,
    preset_bus: Option<Arc<dyn BusPublisher>>,
    bus: RwLock<Option<Arc<dyn BusPublisher>>>,
    queue: RwLock<Option<QueueHandle>>,
    session_state: RwLock<SessionState>,
    cancel_tx: watch::Sender<bool>,
    fatal: AtomicBool,
    reconnect_attempt: AtomicU64,
    tasks: Mutex<Option<RunningTasks>>,
}

impl Supervisor {
    pub fn new(config: BridgeConfig) -> Arc<Self> {
        Self::build(config, Arc::new(SystemClock), Arc::new(NoopTraceContextSource), None)
    }

    pub fn with_clock(config: BridgeConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        Self::build(config, clock, Arc::new(NoopTraceContextSource), None)
    }

    /// Constructs a Supervisor that publishes through a pre-built
    /// `BusPublisher` instead of dialing NATS itself. Intended for tests
    /// that substitute a non-NATS bus (e.g. `ChannelBusPublisher`) so the
    /// rest of the lifecycle — reconnect loop, heartbeat, worker pool —
    /// can be exercised without a live broker.
    pub fn with_injected_bus(
        config: BridgeConfig,
        clock: Arc<dyn Clock>,
        bus: Arc<dyn BusPublisher>,
    ) -> Arc<Self> {
        Self::build(config, clock, Arc::new(NoopTraceContextSource), Some(bus))
    }

    fn build(
        config: BridgeConfig,
        clock: Arc<dyn Clock>,
        trace_context_source: Arc<dyn TraceContextSource>,
        preset_bus: Option<Arc<dyn BusPublisher>>,
    ) -> Arc<Self> {
        let (cancel_tx, _) = watch::channel(false);
        Arc::new(Self {
            upstream_breaker: CircuitBreaker::with_clock(
                CircuitBreakerConfig {
                    failure_threshold: config.upstream_breaker.failure_threshold,
                    recovery_timeout: config.upstream_breaker.recovery_timeout,
                },
                clock.clone(),
            ),
            bus_breaker: CircuitBreaker::with_clock(
                CircuitBreakerConfig {
                    failure_threshold: config.bus_breaker.failure_threshold,
                    recovery_timeout: config.bus_breaker.recovery_timeout,
                },
                clock.clone(),
            ),
            metrics: Metrics::new(config.queue.capacity),
            trace_context_source,
            preset_bus,
            bus: RwLock::new(None),
            queue: RwLock::new(None),
            session_state: RwLock::new(SessionState::Disconnected),
            cancel_tx,
            fatal: AtomicBool::new(false),
            reconnect_attempt: AtomicU64::new(0),
            tasks: Mutex::new(None),
            clock,
            config,
        })
    }

    async fn connect_bus(&self) -> Result<Arc<dyn BusPublisher>, SupervisorError> {
        if let Some(bus) = &self.preset_bus {
            return Ok(bus.clone());
        }

        loop {
            let mut cancel = self.cancel_tx.subscribe();
            if *cancel.borrow() {
                return Err(SupervisorError::ShutdownDuringStart);
            }

            let url = self.config.bus.url.clone();
            let attempt = self
                .bus_breaker
                .execute(|| async move { NatsPublisher::connect(&url).await })
                .await;

            match attempt {
                Ok(publisher) => return Ok(Arc::new(publisher)),
                Err(CircuitBreakerError::Open { .. }) => {
                    tracing::warn!("bus breaker open while connecting, waiting to retry");
                }
                Err(CircuitBreakerError::Inner(e)) => {
                    tracing::warn!(error = %e, "bus connect failed, retrying");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        return Err(SupervisorError::ShutdownDuringStart);
                    }
                }
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.upstream.reconnect_base_delay;
        let exponent = attempt.saturating_sub(1);
        let multiplier = 2u64.saturating_pow(exponent);
        let exp_delay = base
            .checked_mul(multiplier as u32)
            .unwrap_or(self.config.upstream.reconnect_max_delay);
        let jitter_ms = rand::rng().random_range(0..=1000);
        (exp_delay + Duration::from_millis(jitter_ms)).min(self.config.upstream.reconnect_max_delay)
    }

    async fn reconnect_loop(
        self: Arc<Self>,
        producer: crate::queue::QueueProducer,
        mut cancel: watch::Receiver<bool>,
    ) {
        loop {
            if *cancel.borrow() {
                return;
            }

            *self.session_state.write().await = SessionState::Connecting;
            let cfg = self.config.upstream.clone();
            let connect_result = self
                .upstream_breaker
                .execute(|| async move { UpstreamSession::connect(&cfg).await })
                .await;

            let mut session = match connect_result {
                Ok(session) => {
                    self.reconnect_attempt.store(0, Ordering::Relaxed);
                    *self.session_state.write().await = SessionState::Connected;
                    session
                }
                Err(err) => {
                    tracing::warn!(error = ?err, "upstream connect failed");
                    *self.session_state.write().await = SessionState::Disconnected;
                    if !self.record_failed_attempt_and_check_budget().await {
                        return;
                    }
                    continue;
                }
            };

            let (ping_fail_tx, ping_fail_rx) = watch::channel(false);
            let ping_task = tokio::spawn(ping_loop(
                session.ping_sender(),
                self.config.upstream.ping_interval,
                self.metrics.clone(),
                self.clock.clone(),
                ping_fail_tx,
                cancel.clone(),
            ));

            let exit = session
                .run(&producer, &self.metrics, cancel.clone(), ping_fail_rx)
                .await;
            ping_task.abort();
            *self.session_state.write().await = SessionState::Disconnected;

            match exit {
                RunExit::Cancelled => return,
                RunExit::Closed => {
                    tracing::info!("upstream closed, reconnecting");
                    if !self.record_failed_attempt_and_check_budget().await {
                        return;
                    }
                }
                RunExit::Error(e) => {
                    tracing::warn!(error = %e, "upstream session errored, reconnecting");
                    if !self.record_failed_attempt_and_check_budget().await {
                        return;
                    }
                }
            }
        }
    }

    /// Records one reconnect attempt and sleeps for the backoff delay.
    /// Returns false (and marks the process fatally unhealthy) once
    /// `reconnect_max_attempts` consecutive failures have occurred.
    async fn record_failed_attempt_and_check_budget(&self) -> bool {
        let attempt = self.reconnect_attempt.fetch_add(1, Ordering::Relaxed) + 1;
        self.metrics.record_reconnect_attempt();

        if let Some(max) = self.config.upstream.reconnect_max_attempts {
            if attempt as u32 >= max {
                tracing::error!(attempts = attempt, "reconnection budget exhausted");
                self.fatal.store(true, Ordering::Release);
                return false;
            }
        }

        let delay = self.backoff_delay(attempt as u32);
        tokio::time::sleep(delay).await;
        true
    }

    async fn heartbeat_loop(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        let mut last_processed = self.metrics.processed_total();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.build_snapshot().await;
                    let processed_now = snapshot.processed_total;
                    let delta = processed_now.saturating_sub(last_processed);
                    let secs = self.config.heartbeat_interval.as_secs_f64().max(1.0);
                    last_processed = processed_now;
                    tracing::info!(
                        processed_total = snapshot.processed_total,
                        dropped_total = snapshot.dropped_total,
                        parse_skipped_total = snapshot.parse_skipped_total,
                        queue_size = snapshot.queue_size,
                        throughput_per_sec = delta as f64 / secs,
                        "heartbeat"
                    );
                }
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn build_snapshot(&self) -> MetricsSnapshot {
        let bus_state = match self.bus.read().await.as_ref() {
            Some(bus) => match bus.state() {
                BusConnectionState::Connected => BusState::Connected,
                BusConnectionState::Connecting => BusState::Connecting,
                BusConnectionState::Disconnected => BusState::Disconnected,
            },
            None => BusState::Disconnected,
        };
        let queue_size = self
            .queue
            .read()
            .await
            .as_ref()
            .map(QueueHandle::queue_size)
            .unwrap_or(0);
        self.metrics.snapshot(
            queue_size,
            *self.session_state.read().await,
            bus_state,
            self.upstream_breaker.state(),
            self.bus_breaker.state(),
        )
    }
}

/// `Lifecycle` is implemented on `Arc<Supervisor>` rather than on
/// `Supervisor` directly because `start` spawns tasks that need to hold
/// their own `Arc<Supervisor>` past the call's return.
#[async_trait]
impl Lifecycle for Arc<Supervisor> {
    async fn start(&self) -> Result<(), BridgeError> {
        if *self.cancel_tx.subscribe().borrow() {
            return Err(SupervisorError::ShutdownDuringStart.into());
        }

        let bus = self.connect_bus().await?;
        *self.bus.write().await = Some(bus.clone());

        let worker_count = self.config.queue.worker_count;
        let capacity_per_shard = (self.config.queue.capacity / worker_count).max(1);
        let (producer, consumers) = bounded_queue(
            worker_count,
            capacity_per_shard,
            self.metrics.clone(),
            DROP_LOG_THROTTLE,
        );
        *self.queue.write().await = Some(producer.handle());

        let shared = WorkerShared {
            bus,
            bus_breaker: self.bus_breaker.clone(),
            bus_config: Arc::new(self.config.bus.clone()),
            metrics: self.metrics.clone(),
            clock: self.clock.clone(),
            trace_context_source: self.trace_context_source.clone(),
        };
        let workers = spawn_workers(consumers, shared);

        let cancel_rx = self.cancel_tx.subscribe();
        let this: Arc<Supervisor> = Arc::clone(self);
        let upstream = tokio::spawn(this.clone().reconnect_loop(producer, cancel_rx.clone()));
        let heartbeat = tokio::spawn(this.heartbeat_loop(cancel_rx));

        *self.tasks.lock().await = Some(RunningTasks {
            upstream,
            heartbeat,
            workers,
        });

        Ok(())
    }

    async fn stop(&self, deadline: Duration) {
        *self.session_state.write().await = SessionState::Draining;
        let _ = self.cancel_tx.send(true);

        if let Some(tasks) = self.tasks.lock().await.take() {
            let _ = tokio::time::timeout(deadline, tasks.upstream).await;
            tasks.heartbeat.abort();
            join_with_deadline(tasks.workers, deadline).await;
        }

        if let Some(bus) = self.bus.write().await.take() {
            bus.close(deadline).await;
        }

        *self.session_state.write().await = SessionState::Stopped;
    }
}

impl MetricsSource for Supervisor {
    fn snapshot(&self) -> MetricsSnapshot {
        // Synchronous collaborators (e.g. an HTTP handler) read a
        // best-effort snapshot without awaiting the async lock chain;
        // queue_size and bus_state are only updated when the lock is free.
        let bus_state = self
            .bus
            .try_read()
            .ok()
            .and_then(|g| {
                g.as_ref().map(|b| match b.state() {
                    BusConnectionState::Connected => BusState::Connected,
                    BusConnectionState::Connecting => BusState::Connecting,
                    BusConnectionState::Disconnected => BusState::Disconnected,
                })
            })
            .unwrap_or(BusState::Disconnected);
        let queue_size = self
            .queue
            .try_read()
            .ok()
            .and_then(|g| g.as_ref().map(QueueHandle::queue_size))
            .unwrap_or(0);
        self.metrics.snapshot(
            queue_size,
            self.session_state.try_read().map(|g| *g).unwrap_or(SessionState::Disconnected),
            bus_state,
            self.upstream_breaker.state(),
            self.bus_breaker.state(),
        )
    }
}

impl Ready for Supervisor {
    fn is_ready(&self) -> bool {
        let upstream_connected = self
            .session_state
            .try_read()
            .map(|g| *g == SessionState::Connected)
            .unwrap_or(false);
        let bus_connected = self
            .bus
            .try_read()
            .map(|g| {
                g.as_ref()
                    .map(|b| b.state() == BusConnectionState::Connected)
                    .unwrap_or(false)
            })
            .unwrap_or(false);
        upstream_connected && bus_connected
    }
}

impl Healthy for Supervisor {
    fn is_healthy(&self) -> bool {
        !self.fatal.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_matches_spec_boundary_formula() {
        let supervisor = Supervisor::new(BridgeConfig::default());
        // attempt 1: base * 2^0 = base, up to +1s, capped at max_delay.
        let delay = supervisor.backoff_delay(1);
        let base = supervisor.config.upstream.reconnect_base_delay;
        assert!(delay >= base);
        assert!(delay <= base + Duration::from_secs(1));
    }

    #[test]
    fn backoff_delay_is_capped_at_max_delay() {
        let supervisor = Supervisor::new(BridgeConfig::default());
        let delay = supervisor.backoff_delay(20);
        assert!(delay <= supervisor.config.upstream.reconnect_max_delay);
    }

    #[tokio::test]
    async fn freshly_constructed_supervisor_is_not_ready_and_is_healthy() {
        let supervisor = Supervisor::new(BridgeConfig::default());
        assert!(!supervisor.is_ready());
        assert!(supervisor.is_healthy());
    }

    #[tokio::test]
    async fn fresh_snapshot_reports_zero_queue_size() {
        let supervisor = Supervisor::new(BridgeConfig::default());
        let snapshot = MetricsSource::snapshot(supervisor.as_ref());
        assert_eq!(snapshot.queue_size, 0);
    }
}

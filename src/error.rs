//! Crate-wide error types.
//!
//! Each component gets its own error enum; `BridgeError` aggregates the
//! causes that are fatal to the supervisor (and therefore to the process).

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit breaker open ({failure_count} failures, open for {open_duration_ms}ms)")]
    Open {
        failure_count: usize,
        open_duration_ms: u64,
    },
    #[error(transparent)]
    Inner(#[from] E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_breaker_open(&self) -> bool {
        matches!(self, CircuitBreakerError::Open { .. })
    }
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("websocket error: {0}")]
    Ws(String),
    #[error("subscribe handshake failed: {0}")]
    Handshake(String),
    #[error("upstream closed the connection")]
    Closed,
    #[error("ping failed: {0}")]
    Ping(String),
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus disconnected")]
    Disconnected,
    #[error("publish timed out")]
    Timeout,
    #[error("bus error: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("shutdown requested during start")]
    ShutdownDuringStart,
    #[error("reconnection budget exhausted after {attempts} attempts")]
    ReconnectBudgetExhausted { attempts: u32 },
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

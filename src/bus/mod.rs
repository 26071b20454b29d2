//! The Bus Publisher component (§4.4).

pub mod nats;

use async_trait::async_trait;

use crate::error::BusError;

/// Connection state surfaced to the readiness check and metrics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Owns the single bus connection. Unlike the telemetry sink this module
/// is grounded on, publish failures here are classified and returned
/// rather than swallowed — the worker pool decides whether to count them
/// against the circuit breaker (§4.4, §7).
#[async_trait]
pub trait BusPublisher: Send + Sync {
    async fn publish(&self, subject: &str, bytes: Vec<u8>) -> Result<(), BusError>;

    async fn close(&self, deadline: std::time::Duration);

    fn state(&self) -> BusConnectionState;
}

pub use nats::NatsPublisher;

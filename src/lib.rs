//! Binance-to-NATS streaming bridge.
//!
//! One upstream WebSocket connection drains into a bounded queue, a worker
//! pool turns each frame into a canonical envelope and republishes it to a
//! NATS subject. See [`supervisor::Supervisor`] for the lifecycle entry
//! point.

pub mod bus;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod readiness;
pub mod supervisor;
pub mod upstream;
pub mod worker;

pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult};
pub use readiness::{Healthy, Lifecycle, MetricsSource, Ready};
pub use supervisor::Supervisor;

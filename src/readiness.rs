//! Collaborator-facing traits (§6, §9): thin, read-only interfaces the
//! out-of-scope CLI/HTTP/telemetry layers consume. The core publishes
//! immutable snapshots; it never hands out a live reference to internal
//! state.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::BridgeError;
use crate::metrics::MetricsSnapshot;

#[async_trait]
pub trait Lifecycle {
    async fn start(&self) -> Result<(), BridgeError>;
    async fn stop(&self, deadline: Duration);
}

pub trait MetricsSource {
    fn snapshot(&self) -> MetricsSnapshot;
}

/// True iff upstream state = CONNECTED and bus state = CONNECTED (§6).
pub trait Ready {
    fn is_ready(&self) -> bool;
}

/// True iff the process has not exceeded the reconnection budget (§6).
pub trait Healthy {
    fn is_healthy(&self) -> bool;
}

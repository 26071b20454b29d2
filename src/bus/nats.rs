//! NATS-backed [`BusPublisher`] (§4.4), grounded on the companion crate's
//! `NatsSink`: connect once with `async_nats::connect`, clone the client
//! per publish. Unlike that sink, failures are classified and surfaced
//! rather than logged-and-swallowed, because the worker pool needs them
//! to drive the bus circuit breaker.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::bus::{BusConnectionState, BusPublisher};
use crate::error::BusError;

const STATE_DISCONNECTED: u8 = 0;
const STATE_CONNECTING: u8 = 1;
const STATE_CONNECTED: u8 = 2;

pub struct NatsPublisher {
    client: async_nats::Client,
    state: Arc<AtomicU8>,
}

impl NatsPublisher {
    /// Open a persistent connection to the bus. Callers wrap this in the
    /// bus circuit breaker.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let state = Arc::new(AtomicU8::new(STATE_CONNECTING));
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BusError::Other(e.to_string()))?;
        state.store(STATE_CONNECTED, Ordering::Release);
        Ok(Self { client, state })
    }
}

#[async_trait]
impl BusPublisher for NatsPublisher {
    async fn publish(&self, subject: &str, bytes: Vec<u8>) -> Result<(), BusError> {
        if self.state.load(Ordering::Acquire) != STATE_CONNECTED {
            return Err(BusError::Disconnected);
        }

        match tokio::time::timeout(
            Duration::from_secs(5),
            self.client.publish(subject.to_string(), bytes.into()),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "bus publish failed");
                Err(BusError::Other(e.to_string()))
            }
            Err(_) => Err(BusError::Timeout),
        }
    }

    async fn close(&self, deadline: Duration) {
        self.state.store(STATE_DISCONNECTED, Ordering::Release);
        let _ = tokio::time::timeout(deadline, self.client.flush()).await;
    }

    fn state(&self) -> BusConnectionState {
        match self.state.load(Ordering::Acquire) {
            STATE_CONNECTED => BusConnectionState::Connected,
            STATE_CONNECTING => BusConnectionState::Connecting,
            _ => BusConnectionState::Disconnected,
        }
    }
}

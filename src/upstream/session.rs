//! Upstream Session (§4.3): the single upstream WebSocket connection.
//!
//! Connect/subscribe follows the same shape as the uplink client this
//! crate is descended from — dial, send a handshake frame, wait for the
//! matching ack — adapted to Binance's `SUBSCRIBE`/`{"result":null}`
//! protocol instead of a hello/heartbeat pair.
//!
//! The socket is split into its write and read halves once the handshake
//! completes (§5: "only the reader task reads, only the ping task
//! writes"): [`UpstreamSession::run`] owns the read half outright, while
//! the write half is shared, behind a lock, between the reader (which
//! needs it only to answer a server `Ping` with a `Pong`) and the
//! dedicated ping task the Supervisor spawns alongside it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::UpstreamConfig;
use crate::envelope::{derive_stream, Derived};
use crate::error::UpstreamError;
use crate::metrics::Metrics;
use crate::queue::{QueueItem, QueueProducer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Draining,
    Stopped,
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

static CORRELATION_ID: AtomicU64 = AtomicU64::new(1);

/// Why [`UpstreamSession::run`] returned; the Supervisor inspects this to
/// decide whether to reconnect.
#[derive(Debug)]
pub enum RunExit {
    Closed,
    Error(UpstreamError),
    Cancelled,
}

/// A cloneable handle to the write half of an [`UpstreamSession`]'s
/// socket, held by the dedicated ping task so it can write concurrently
/// with the reader without owning the connection.
#[derive(Clone)]
pub struct PingSender {
    write: Arc<Mutex<WsSink>>,
}

impl PingSender {
    pub async fn send_ping(&self) -> Result<(), UpstreamError> {
        self.write
            .lock()
            .await
            .send(Message::Ping(Vec::new().into()))
            .await
            .map_err(|e| UpstreamError::Ping(e.to_string()))
    }
}

/// Ticks every `interval`, sending one ping through `ping` and recording
/// it in `metrics` on success. A failed ping is reported once on
/// `fail_tx` and the loop exits — the Supervisor's reconnect loop treats
/// that exactly like a read error (§4.3: "failure is treated as a read
/// error").
pub async fn ping_loop(
    ping: PingSender,
    interval: Duration,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
    fail_tx: watch::Sender<bool>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately; we just connected.

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match ping.send_ping().await {
                    Ok(()) => metrics.record_ping(clock.now_millis() as i64),
                    Err(e) => {
                        warn!(error = %e, "ping failed, signaling reconnect");
                        let _ = fail_tx.send(true);
                        return;
                    }
                }
            }
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    return;
                }
            }
        }
    }
}

/// An active upstream connection, owning its socket exclusively (§5: only
/// the reader task reads, only the ping task writes, both under one
/// session).
pub struct UpstreamSession {
    write: Arc<Mutex<WsSink>>,
    read: WsRead,
    active_symbol: Option<String>,
}

impl UpstreamSession {
    /// Dial the configured endpoint and perform the subscribe handshake.
    /// Callers wrap this in the upstream circuit breaker.
    pub async fn connect(cfg: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let (mut ws, _response) = tokio_tungstenite::connect_async(&cfg.url)
            .await
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;

        let id = CORRELATION_ID.fetch_add(1, Ordering::Relaxed);
        let request = super::wire::SubscribeRequest::new(&cfg.subscriptions, id);
        let json = serde_json::to_string(&request)
            .expect("SubscribeRequest serialization cannot fail");
        ws.send(Message::Text(json.into()))
            .await
            .map_err(|e| UpstreamError::Ws(e.to_string()))?;

        loop {
            match ws.next().await {
                None => return Err(UpstreamError::Closed),
                Some(Err(e)) => return Err(UpstreamError::Ws(e.to_string())),
                Some(Ok(Message::Text(text))) => {
                    let ack: super::wire::SubscribeAck = serde_json::from_str(&text)
                        .map_err(|e| UpstreamError::Handshake(e.to_string()))?;
                    if ack.id != id {
                        continue;
                    }
                    info!(subscriptions = ?cfg.subscriptions, "upstream subscribed");
                    break;
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws.send(Message::Pong(data)).await;
                }
                Some(Ok(_)) => continue,
            }
        }

        let active_symbol = cfg
            .subscriptions
            .first()
            .and_then(|s| s.split('@').next())
            .map(str::to_string);

        let (write, read) = ws.split();
        Ok(Self {
            write: Arc::new(Mutex::new(write)),
            read,
            active_symbol,
        })
    }

    /// A cloneable handle for the dedicated ping task to send through.
    pub fn ping_sender(&self) -> PingSender {
        PingSender {
            write: self.write.clone(),
        }
    }

    /// Read frames until cancellation, a ping failure, an error, or a
    /// close frame; derive a stream for each and hand it to the bounded
    /// queue.
    pub async fn run(
        &mut self,
        producer: &QueueProducer,
        metrics: &Metrics,
        mut cancel: watch::Receiver<bool>,
        mut ping_failed: watch::Receiver<bool>,
    ) -> RunExit {
        loop {
            tokio::select! {
                biased;
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        return RunExit::Cancelled;
                    }
                }
                _ = ping_failed.changed() => {
                    if *ping_failed.borrow() {
                        return RunExit::Error(UpstreamError::Ping("keepalive ping failed".to_string()));
                    }
                }
                frame = self.read.next() => {
                    match frame {
                        None => return RunExit::Closed,
                        Some(Err(e)) => return RunExit::Error(UpstreamError::Ws(e.to_string())),
                        Some(Ok(Message::Close(_))) => return RunExit::Closed,
                        Some(Ok(Message::Ping(data))) => {
                            if self.write.lock().await.send(Message::Pong(data)).await.is_err() {
                                return RunExit::Error(UpstreamError::Ws("pong failed".to_string()));
                            }
                        }
                        Some(Ok(Message::Text(text))) => {
                            self.handle_text_frame(&text, producer, metrics);
                        }
                        Some(Ok(_)) => continue,
                    }
                }
            }
        }
    }

    fn handle_text_frame(&self, text: &str, producer: &QueueProducer, metrics: &Metrics) {
        let parsed: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "malformed upstream frame, skipping");
                metrics.record_parse_skipped();
                return;
            }
        };

        match derive_stream(&parsed, self.active_symbol.as_deref()) {
            Derived::Stream { stream, data } => {
                producer.try_push(QueueItem { stream, data });
            }
            Derived::Skip => {
                debug!("frame matched no stream-derivation rule, skipping");
                metrics.record_parse_skipped();
            }
        }
    }

    /// Initiate a graceful close and wait briefly for the server to
    /// acknowledge it.
    pub async fn close(self, deadline: Duration) {
        let mut write = self.write.lock().await;
        let _ = write.send(Message::Close(None)).await;
        let _ = tokio::time::timeout(deadline, write.close()).await;
    }
}

//! Test doubles shared across the bridge's integration tests.
//!
//! `MockWsServer` speaks just enough of the Binance combined-stream
//! protocol (§6) to exercise `UpstreamSession`: it acks a `SUBSCRIBE`
//! frame and then lets the test push arbitrary JSON frames to the
//! connected client. `ChannelBusPublisher` stands in for a NATS
//! connection so worker-pool tests don't need a live broker.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::Message;

use bridge::bus::{BusConnectionState, BusPublisher};
use bridge::error::BusError;

enum ServerEvent {
    Frame(Value),
    Close,
}

/// A mock upstream WebSocket server for integration testing.
///
/// Binds to port 0 (random) and exposes the actual bound port. One
/// connection is handled at a time; frames queued with [`Self::push_frame`]
/// are delivered to whichever client is currently connected.
pub struct MockWsServer {
    addr: SocketAddr,
    outbound: mpsc::UnboundedSender<ServerEvent>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockWsServer {
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let outbound_rx = Arc::new(Mutex::new(outbound_rx));

        let task = tokio::spawn(async move {
            Self::accept_loop(listener, outbound_rx).await;
        });

        Ok(Self {
            addr,
            outbound: outbound_tx,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Queue a frame to be written to the currently-connected client, in
    /// order, after the subscribe ack.
    pub fn push_frame(&self, frame: Value) {
        let _ = self.outbound.send(ServerEvent::Frame(frame));
    }

    /// Closes whichever connection is currently active, simulating an
    /// upstream disconnect. The next `connect_async` against this server
    /// is handled by a fresh connection once the listener accepts it.
    pub fn disconnect_current(&self) {
        let _ = self.outbound.send(ServerEvent::Close);
    }

    async fn accept_loop(
        listener: TcpListener,
        outbound_rx: Arc<Mutex<mpsc::UnboundedReceiver<ServerEvent>>>,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    let outbound_rx = outbound_rx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, outbound_rx).await {
                            let _ = e;
                        }
                    });
                }
                Err(_) => break,
            }
        }
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        outbound_rx: Arc<Mutex<mpsc::UnboundedReceiver<ServerEvent>>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut write, mut read) = ws_stream.split();

        let subscribe_msg = match read.next().await {
            Some(Ok(Message::Text(t))) => t,
            _ => return Ok(()),
        };
        let request: Value = serde_json::from_str(&subscribe_msg)?;
        let id = request.get("id").and_then(Value::as_u64).unwrap_or(1);
        let ack = serde_json::json!({"result": null, "id": id});
        write.send(Message::Text(ack.to_string().into())).await?;

        loop {
            let mut rx = outbound_rx.lock().await;
            tokio::select! {
                event = rx.recv() => {
                    drop(rx);
                    match event {
                        Some(ServerEvent::Frame(frame)) => {
                            write.send(Message::Text(frame.to_string().into())).await?;
                        }
                        Some(ServerEvent::Close) | None => return Ok(()),
                    }
                }
                incoming = read.next() => {
                    drop(rx);
                    match incoming {
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Err(e)) => return Err(Box::new(e)),
                        _ => {}
                    }
                }
            }
        }
    }
}

/// An in-process [`BusPublisher`] that records every published message on
/// a channel instead of talking to a real NATS broker.
pub struct ChannelBusPublisher {
    sender: mpsc::UnboundedSender<(String, Vec<u8>)>,
    fail_next: Arc<std::sync::atomic::AtomicUsize>,
}

impl ChannelBusPublisher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, Vec<u8>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                sender: tx,
                fail_next: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            },
            rx,
        )
    }

    /// The next `n` publish calls will return `BusError::Other` instead of
    /// succeeding, so tests can exercise breaker-opening behavior.
    pub fn fail_next_n(&self, n: usize) {
        self.fail_next.store(n, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl BusPublisher for ChannelBusPublisher {
    async fn publish(&self, subject: &str, bytes: Vec<u8>) -> Result<(), BusError> {
        use std::sync::atomic::Ordering;
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.fetch_sub(1, Ordering::SeqCst);
            return Err(BusError::Other("injected test failure".to_string()));
        }
        self.sender
            .send((subject.to_string(), bytes))
            .map_err(|_| BusError::Disconnected)
    }

    async fn close(&self, _deadline: Duration) {}

    fn state(&self) -> BusConnectionState {
        BusConnectionState::Connected
    }
}

impl Default for ChannelBusPublisher {
    fn default() -> Self {
        Self::new().0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_bus_publisher_records_published_messages() {
        let (publisher, mut rx) = ChannelBusPublisher::new();
        publisher
            .publish("binance.websocket.data", b"{}".to_vec())
            .await
            .unwrap();

        let (subject, bytes) = rx.recv().await.unwrap();
        assert_eq!(subject, "binance.websocket.data");
        assert_eq!(bytes, b"{}".to_vec());
    }

    #[tokio::test]
    async fn channel_bus_publisher_injects_failures_on_demand() {
        let (publisher, _rx) = ChannelBusPublisher::new();
        publisher.fail_next_n(2);

        assert!(publisher.publish("s", vec![]).await.is_err());
        assert!(publisher.publish("s", vec![]).await.is_err());
        assert!(publisher.publish("s", vec![]).await.is_ok());
    }
}

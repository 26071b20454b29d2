//! End-to-end scenario 1 (spec §8): a trade frame arrives over the
//! upstream WebSocket and is delivered to the bounded queue with the
//! derived stream name and untouched payload.

use std::time::Duration;

use bridge::config::UpstreamConfig;
use bridge::metrics::Metrics;
use bridge::queue::single_consumer_queue;
use bridge::upstream::UpstreamSession;
use bridge_test_utils::MockWsServer;
use serde_json::json;
use tokio::sync::watch;

#[tokio::test]
async fn trade_frame_is_queued_with_derived_stream_and_untouched_payload() {
    let server = MockWsServer::start().await.expect("mock server starts");
    let cfg = UpstreamConfig {
        url: server.url(),
        subscriptions: vec!["btcusdt@trade".to_string()],
        ping_interval: Duration::from_secs(30),
        reconnect_base_delay: Duration::from_secs(5),
        reconnect_max_delay: Duration::from_secs(60),
        reconnect_max_attempts: Some(10),
    };

    let mut session = UpstreamSession::connect(&cfg)
        .await
        .expect("handshake succeeds");

    let trade = json!({
        "e":"trade","E":1_700_000_000_000i64,"s":"BTCUSDT","t":42,
        "p":"50000.00","q":"0.001","m":true
    });
    server.push_frame(trade.clone());

    let metrics = Metrics::new(10);
    let (producer, mut consumer) = single_consumer_queue(10, metrics.clone(), Duration::from_secs(1));
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (_ping_fail_tx, ping_fail_rx) = watch::channel(false);
    let metrics_for_run = metrics.clone();

    let run_task = tokio::spawn(async move {
        session.run(&producer, &metrics_for_run, cancel_rx, ping_fail_rx).await
    });

    let item = tokio::time::timeout(Duration::from_secs(5), consumer.recv())
        .await
        .expect("frame arrives within timeout")
        .expect("frame delivered");

    let _ = cancel_tx.send(true);
    let _ = run_task.await;

    assert_eq!(item.stream, "btcusdt@trade");
    assert_eq!(item.data, trade);
    assert_eq!(metrics.parse_skipped_total(), 0);
}

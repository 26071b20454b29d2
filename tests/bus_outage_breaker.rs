//! End-to-end scenario 6 (spec §8): sustained bus publish failures open
//! the breaker; subsequent callers fail fast instead of retrying against
//! a dead connection, and a single probe is allowed once the recovery
//! timeout elapses.

use std::sync::Arc;
use std::time::Duration;

use bridge::bus::BusPublisher;
use bridge::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use bridge_test_utils::ChannelBusPublisher;

#[tokio::test]
async fn repeated_publish_failures_open_the_breaker_and_fail_fast() {
    let (publisher, mut rx) = ChannelBusPublisher::new();
    publisher.fail_next_n(3);
    let publisher: Arc<dyn BusPublisher> = Arc::new(publisher);

    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 3,
        recovery_timeout: Duration::from_millis(50),
    });

    for _ in 0..3 {
        let publisher = publisher.clone();
        let result = breaker
            .execute(|| async move { publisher.publish("binance.websocket.data", vec![]).await })
            .await;
        assert!(result.is_err());
    }

    let publisher_for_probe = publisher.clone();
    let fast_fail = breaker
        .execute(|| async move {
            publisher_for_probe
                .publish("binance.websocket.data", vec![])
                .await
        })
        .await;
    assert!(
        fast_fail.unwrap_err().is_breaker_open(),
        "caller should fail fast once the breaker is open"
    );

    tokio::time::sleep(Duration::from_millis(100)).await;

    let publisher_for_recovery = publisher.clone();
    let recovered = breaker
        .execute(|| async move {
            publisher_for_recovery
                .publish("binance.websocket.data", b"{}".to_vec())
                .await
        })
        .await;
    assert!(recovered.is_ok(), "single probe after recovery_timeout should succeed");

    let (subject, bytes) = rx.recv().await.expect("probe publish recorded");
    assert_eq!(subject, "binance.websocket.data");
    assert_eq!(bytes, b"{}".to_vec());
}

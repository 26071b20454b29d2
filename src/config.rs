//! Configuration loading.
//!
//! Mirrors the forwarder's approach: a `Raw*Config` layer deserializes
//! straight off TOML with every field optional, then `BridgeConfig::from_raw`
//! applies defaults and validates. Keeping the two layers separate means a
//! partial or empty config file is valid input, not a parse error.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

const DEFAULT_UPSTREAM_URL: &str = "wss://stream.binance.com:9443";
const DEFAULT_BUS_URL: &str = "nats://localhost:4222";
const DEFAULT_BUS_SUBJECT: &str = "binance.websocket.data";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub url: String,
    pub subscriptions: Vec<String>,
    pub ping_interval: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub reconnect_max_attempts: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub url: String,
    pub subject: String,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub capacity: usize,
    pub worker_count: usize,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: usize,
    pub recovery_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub upstream: UpstreamConfig,
    pub bus: BusConfig,
    pub queue: QueueConfig,
    pub heartbeat_interval: Duration,
    pub upstream_breaker: CircuitBreakerSettings,
    pub bus_breaker: CircuitBreakerSettings,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from_raw(RawBridgeConfig::default()).expect("defaults are always valid")
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RawBridgeConfig {
    pub upstream: RawUpstreamConfig,
    pub bus: RawBusConfig,
    pub queue: RawQueueConfig,
    pub heartbeat_interval_secs: Option<u64>,
    pub upstream_breaker: RawBreakerConfig,
    pub bus_breaker: RawBreakerConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RawUpstreamConfig {
    pub url: Option<String>,
    pub subscriptions: Option<Vec<String>>,
    pub ping_interval_secs: Option<u64>,
    pub reconnect_base_delay_secs: Option<u64>,
    pub reconnect_max_delay_secs: Option<u64>,
    pub reconnect_max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RawBusConfig {
    pub url: Option<String>,
    pub subject: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RawQueueConfig {
    pub capacity: Option<usize>,
    pub worker_count: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RawBreakerConfig {
    pub failure_threshold: Option<usize>,
    pub recovery_timeout_secs: Option<u64>,
}

/// Collapses duplicate entries while keeping the first occurrence's
/// position (§3 "Subscription Set: duplicates are collapsed on entry").
fn dedup_preserve_order(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items.into_iter().filter(|s| seen.insert(s.clone())).collect()
}

impl BridgeConfig {
    pub fn from_raw(raw: RawBridgeConfig) -> Result<Self, ConfigError> {
        let subscriptions = dedup_preserve_order(raw.upstream.subscriptions.unwrap_or_else(|| {
            vec![
                "btcusdt@trade".to_string(),
                "btcusdt@ticker".to_string(),
                "btcusdt@depth20@100ms".to_string(),
            ]
        }));
        if subscriptions.is_empty() {
            return Err(ConfigError::Invalid(
                "upstream.subscriptions must not be empty".to_string(),
            ));
        }

        let queue_capacity = raw.queue.capacity.unwrap_or(5000);
        if queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue.capacity must be greater than zero".to_string(),
            ));
        }

        let worker_count = raw.queue.worker_count.unwrap_or(5);
        if worker_count == 0 {
            return Err(ConfigError::Invalid(
                "queue.worker_count must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            upstream: UpstreamConfig {
                url: raw
                    .upstream
                    .url
                    .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string()),
                subscriptions,
                ping_interval: Duration::from_secs(raw.upstream.ping_interval_secs.unwrap_or(30)),
                reconnect_base_delay: Duration::from_secs(
                    raw.upstream.reconnect_base_delay_secs.unwrap_or(5),
                ),
                reconnect_max_delay: Duration::from_secs(
                    raw.upstream.reconnect_max_delay_secs.unwrap_or(60),
                ),
                reconnect_max_attempts: raw.upstream.reconnect_max_attempts.or(Some(10)),
            },
            bus: BusConfig {
                url: raw.bus.url.unwrap_or_else(|| DEFAULT_BUS_URL.to_string()),
                subject: raw
                    .bus
                    .subject
                    .unwrap_or_else(|| DEFAULT_BUS_SUBJECT.to_string()),
            },
            queue: QueueConfig {
                capacity: queue_capacity,
                worker_count,
            },
            heartbeat_interval: Duration::from_secs(raw.heartbeat_interval_secs.unwrap_or(60)),
            upstream_breaker: CircuitBreakerSettings {
                failure_threshold: raw.upstream_breaker.failure_threshold.unwrap_or(5),
                recovery_timeout: Duration::from_secs(
                    raw.upstream_breaker.recovery_timeout_secs.unwrap_or(60),
                ),
            },
            bus_breaker: CircuitBreakerSettings {
                failure_threshold: raw.bus_breaker.failure_threshold.unwrap_or(5),
                recovery_timeout: Duration::from_secs(
                    raw.bus_breaker.recovery_timeout_secs.unwrap_or(60),
                ),
            },
        })
    }

    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let raw: RawBridgeConfig = toml::from_str(contents)?;
        Self::from_raw(raw)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_str(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.upstream.url, DEFAULT_UPSTREAM_URL);
        assert_eq!(
            cfg.upstream.subscriptions,
            vec!["btcusdt@trade", "btcusdt@ticker", "btcusdt@depth20@100ms"]
        );
        assert_eq!(cfg.bus.url, DEFAULT_BUS_URL);
        assert_eq!(cfg.bus.subject, DEFAULT_BUS_SUBJECT);
        assert_eq!(cfg.queue.capacity, 5000);
        assert_eq!(cfg.queue.worker_count, 5);
        assert_eq!(cfg.upstream.reconnect_base_delay, Duration::from_secs(5));
        assert_eq!(cfg.upstream.reconnect_max_attempts, Some(10));
        assert_eq!(cfg.upstream.ping_interval, Duration::from_secs(30));
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(60));
        assert_eq!(cfg.upstream_breaker.failure_threshold, 5);
        assert_eq!(
            cfg.upstream_breaker.recovery_timeout,
            Duration::from_secs(60)
        );
    }

    #[test]
    fn empty_toml_document_is_valid() {
        let cfg = BridgeConfig::from_str("").unwrap();
        assert_eq!(cfg.bus.subject, DEFAULT_BUS_SUBJECT);
    }

    #[test]
    fn partial_overrides_apply_on_top_of_defaults() {
        let toml = r#"
            [upstream]
            url = "wss://stream.binance.com:9443"
            subscriptions = ["ethusdt@trade"]

            [queue]
            worker_count = 2
        "#;
        let cfg = BridgeConfig::from_str(toml).unwrap();
        assert_eq!(cfg.upstream.subscriptions, vec!["ethusdt@trade"]);
        assert_eq!(cfg.queue.worker_count, 2);
        assert_eq!(cfg.queue.capacity, 5000, "untouched field keeps default");
    }

    #[test]
    fn empty_subscriptions_is_rejected() {
        let toml = r#"
            [upstream]
            subscriptions = []
        "#;
        let err = BridgeConfig::from_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_worker_count_is_rejected() {
        let toml = r#"
            [queue]
            worker_count = 0
        "#;
        let err = BridgeConfig::from_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_toml_is_reported_as_parse_error() {
        let err = BridgeConfig::from_str("this is not toml =").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn duplicate_subscriptions_are_collapsed_preserving_order() {
        let toml = r#"
            [upstream]
            subscriptions = ["btcusdt@trade", "ethusdt@trade", "btcusdt@trade"]
        "#;
        let cfg = BridgeConfig::from_str(toml).unwrap();
        assert_eq!(
            cfg.upstream.subscriptions,
            vec!["btcusdt@trade".to_string(), "ethusdt@trade".to_string()]
        );
    }

    #[test]
    fn from_path_reads_and_parses_a_real_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().expect("create temp config file");
        write!(
            file,
            r#"
            [upstream]
            url = "wss://stream.binance.com:9443"
            subscriptions = ["ethusdt@trade"]
            "#
        )
        .expect("write temp config file");

        let cfg = BridgeConfig::from_path(file.path()).expect("load config from path");
        assert_eq!(cfg.upstream.subscriptions, vec!["ethusdt@trade"]);
    }

    #[test]
    fn from_path_reports_read_error_for_missing_file() {
        let err = BridgeConfig::from_path("/nonexistent/path/to/bridge.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}

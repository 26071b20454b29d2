//! The canonical publishable envelope and the stream-name derivation rules
//! of §4.3.
//!
//! Derivation is a small tagged-variant parser applied in a fixed order
//! rather than dynamic attribute dispatch: depth snapshot shape first,
//! then the `"e"` event-type tag, then a combined-stream envelope, and
//! finally "give up" (rule 4).

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

pub const SOURCE: &str = "binance-websocket";
pub const SCHEMA_VERSION: &str = "1.0";

/// The canonical record a worker builds from a dequeued frame and hands to
/// the bus publisher.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub stream: String,
    pub data: Value,
    #[serde(with = "timestamp_millis")]
    pub timestamp: DateTime<Utc>,
    pub message_id: String,
    pub source: &'static str,
    pub version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_context: Option<HashMap<String, String>>,
}

/// Injects optional distributed-tracing metadata into envelopes as the
/// Worker Pool builds them. Collaborators that run a tracer implement
/// this; [`NoopTraceContextSource`] is the default when none is wired in.
pub trait TraceContextSource: Send + Sync {
    fn trace_context(&self) -> Option<HashMap<String, String>>;
}

/// The default [`TraceContextSource`]: no tracer configured, so every
/// envelope's `trace_context` is `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTraceContextSource;

impl TraceContextSource for NoopTraceContextSource {
    fn trace_context(&self) -> Option<HashMap<String, String>> {
        None
    }
}

impl Envelope {
    pub fn new(
        stream: String,
        data: Value,
        timestamp: DateTime<Utc>,
        message_id: String,
        trace_context: Option<HashMap<String, String>>,
    ) -> Self {
        debug_assert!(!stream.is_empty(), "stream must never be empty");
        Self {
            stream,
            data,
            timestamp,
            message_id,
            source: SOURCE,
            version: SCHEMA_VERSION,
            trace_context,
        }
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

mod timestamp_millis {
    use chrono::{DateTime, Utc};
    use serde::Serializer;

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
    }
}

/// Outcome of applying the §4.3 derivation rules to one parsed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Derived {
    /// A stream identifier and the payload to publish under it.
    Stream { stream: String, data: Value },
    /// None of the four rules matched; the frame is dropped silently
    /// (caller increments `parse_skipped`).
    Skip,
}

/// Applies the ordered stream-name derivation rules of §4.3.
///
/// `active_subscription_symbol` is consulted by rule 1 when the frame
/// itself carries no symbol field (bare depth-snapshot payloads on a
/// single-stream connection identify their symbol only by which
/// subscription they arrived on).
pub fn derive_stream(frame: &Value, active_subscription_symbol: Option<&str>) -> Derived {
    if let Some(stream) = derive_depth_snapshot(frame, active_subscription_symbol) {
        return Derived::Stream {
            stream,
            data: frame.clone(),
        };
    }

    if let Some(stream) = derive_from_event_type(frame) {
        return Derived::Stream {
            stream,
            data: frame.clone(),
        };
    }

    if let Some((stream, data)) = derive_combined_stream(frame) {
        return Derived::Stream { stream, data };
    }

    Derived::Skip
}

fn derive_depth_snapshot(frame: &Value, active_subscription_symbol: Option<&str>) -> Option<String> {
    let obj = frame.as_object()?;
    if !obj.contains_key("lastUpdateId") || !obj.contains_key("bids") {
        return None;
    }
    let symbol = symbol_from_frame(frame).or_else(|| active_subscription_symbol.map(str::to_string))?;
    Some(format!("{}@depth20@100ms", symbol.to_lowercase()))
}

fn derive_from_event_type(frame: &Value) -> Option<String> {
    let event_type = frame.get("e")?.as_str()?;
    let symbol = symbol_from_frame(frame)?.to_lowercase();

    match event_type {
        "trade" => Some(format!("{symbol}@trade")),
        "24hrTicker" => Some(format!("{symbol}@ticker")),
        "depthUpdate" => Some(format!("{symbol}@depth20@100ms")),
        "kline" => {
            let interval = frame.get("k")?.get("i")?.as_str()?;
            Some(format!("{symbol}@kline_{interval}"))
        }
        _ => None,
    }
}

fn derive_combined_stream(frame: &Value) -> Option<(String, Value)> {
    let stream = frame.get("stream")?.as_str()?.to_string();
    let data = frame.get("data")?.clone();
    Some((stream, data))
}

fn symbol_from_frame(frame: &Value) -> Option<String> {
    frame
        .get("s")
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn trade_frame_derives_trade_stream() {
        let frame = json!({
            "e":"trade","E":1_700_000_000_000i64,"s":"BTCUSDT","t":42,
            "p":"50000.00","q":"0.001","m":true
        });
        let derived = derive_stream(&frame, None);
        assert_eq!(
            derived,
            Derived::Stream {
                stream: "btcusdt@trade".to_string(),
                data: frame.clone(),
            }
        );
    }

    #[test]
    fn ticker_frame_derives_ticker_stream() {
        let frame = json!({"e":"24hrTicker","s":"ETHUSDT"});
        let derived = derive_stream(&frame, None);
        assert_eq!(
            derived,
            Derived::Stream {
                stream: "ethusdt@ticker".to_string(),
                data: frame.clone(),
            }
        );
    }

    #[test]
    fn depth_update_event_derives_depth_stream() {
        let frame = json!({"e":"depthUpdate","s":"BTCUSDT","U":1,"u":2});
        let derived = derive_stream(&frame, None);
        assert_eq!(
            derived,
            Derived::Stream {
                stream: "btcusdt@depth20@100ms".to_string(),
                data: frame.clone(),
            }
        );
    }

    #[test]
    fn kline_frame_derives_interval_stream() {
        let frame = json!({"e":"kline","s":"BTCUSDT","k":{"i":"1m","t":0}});
        let derived = derive_stream(&frame, None);
        assert_eq!(
            derived,
            Derived::Stream {
                stream: "btcusdt@kline_1m".to_string(),
                data: frame.clone(),
            }
        );
    }

    #[test]
    fn depth_snapshot_without_symbol_uses_active_subscription() {
        let frame = json!({
            "lastUpdateId":160,
            "bids":[["50000.00","0.1"]],
            "asks":[["50001.00","0.1"]]
        });
        let derived = derive_stream(&frame, Some("btcusdt"));
        assert_eq!(
            derived,
            Derived::Stream {
                stream: "btcusdt@depth20@100ms".to_string(),
                data: frame.clone(),
            }
        );
    }

    #[test]
    fn depth_snapshot_without_symbol_or_subscription_is_skipped() {
        let frame = json!({
            "lastUpdateId":160,
            "bids":[["50000.00","0.1"]],
            "asks":[]
        });
        assert_eq!(derive_stream(&frame, None), Derived::Skip);
    }

    #[test]
    fn combined_stream_envelope_unwraps_inner_data() {
        let inner = json!({"e":"trade","s":"BTCUSDT"});
        let frame = json!({"stream":"btcusdt@trade","data": inner.clone()});
        let derived = derive_stream(&frame, None);
        assert_eq!(
            derived,
            Derived::Stream {
                stream: "btcusdt@trade".to_string(),
                data: inner,
            }
        );
    }

    #[test]
    fn unknown_event_type_is_skipped() {
        let frame = json!({"e":"bookTicker","s":"BTCUSDT"});
        assert_eq!(derive_stream(&frame, None), Derived::Skip);
    }

    #[test]
    fn envelope_serializes_with_millisecond_iso8601_timestamp() {
        let ts = DateTime::parse_from_rfc3339("2026-07-30T12:00:00.123Z")
            .unwrap()
            .with_timezone(&Utc);
        let envelope = Envelope::new(
            "btcusdt@trade".to_string(),
            json!({"e":"trade"}),
            ts,
            "11111111-1111-1111-1111-111111111111".to_string(),
            None,
        );
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["timestamp"], "2026-07-30T12:00:00.123Z");
        assert_eq!(json["source"], "binance-websocket");
        assert_eq!(json["version"], "1.0");
        assert!(json.get("trace_context").is_none());
    }

    #[test]
    fn noop_trace_context_source_yields_none() {
        let source = NoopTraceContextSource;
        assert_eq!(source.trace_context(), None);
    }

    #[test]
    fn serialization_is_deterministic_for_equal_inputs() {
        let ts = Utc::now();
        let build = || {
            Envelope::new(
                "btcusdt@trade".to_string(),
                json!({"e":"trade"}),
                ts,
                "fixed-id".to_string(),
                None,
            )
        };
        assert_eq!(
            build().to_json_bytes().unwrap(),
            build().to_json_bytes().unwrap()
        );
    }
}

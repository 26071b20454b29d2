//! Upstream wire shapes (§6): the subscribe request and its acknowledgment.
//!
//! Frame payloads themselves are left as [`serde_json::Value`] and handed
//! to [`crate::envelope::derive_stream`] — the bridge never builds a typed
//! model of trade/ticker/depth bodies, only of the handshake envelope.

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct SubscribeRequest {
    pub method: &'static str,
    pub params: Vec<String>,
    pub id: u64,
}

impl SubscribeRequest {
    pub fn new(streams: &[String], id: u64) -> Self {
        Self {
            method: "SUBSCRIBE",
            params: streams.to_vec(),
            id,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SubscribeAck {
    #[allow(dead_code)]
    pub result: Option<serde_json::Value>,
    pub id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_request_serializes_to_wire_shape() {
        let req = SubscribeRequest::new(&["btcusdt@trade".to_string()], 1);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["method"], "SUBSCRIBE");
        assert_eq!(json["params"][0], "btcusdt@trade");
        assert_eq!(json["id"], 1);
    }

    #[test]
    fn subscribe_ack_parses_null_result() {
        let ack: SubscribeAck = serde_json::from_str(r#"{"result":null,"id":1}"#).unwrap();
        assert_eq!(ack.id, 1);
    }
}

//! Wire types for both transport surfaces.
//!
//! The stream protocol carries small text envelopes: subscription requests
//! outbound, `<topic>_update` push frames and ping/pong heartbeats inbound.
//! The request/response protocol is JSON-RPC 2.0, single or batched.
//!
//! Frames dispatch on a `"type"` string; that string is folded into a
//! tagged union here, with an explicit [`StreamFrame::Unknown`] variant so
//! unrecognized kinds are logged by the caller rather than silently dropped.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

// ── Stream frames ────────────────────────────────────────────────────

/// A parsed inbound frame from the metrics stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    /// Liveness probe. The peer expects a matching pong.
    Ping { timestamp: u64 },

    /// Answer to a previously sent ping.
    Pong { timestamp: u64 },

    /// Unsolicited data push for a subscribed topic, from a
    /// `{"type":"<topic>_update","data":{...}}` envelope.
    Update { topic: String, data: Value },

    /// A frame whose `type` tag is not recognized. Kept explicit so the
    /// connection loop can log it instead of dropping it on the floor.
    Unknown { kind: String, raw: Value },
}

impl StreamFrame {
    /// Parse a text frame into a [`StreamFrame`].
    ///
    /// Returns `Err` only for frames that are not valid JSON objects or
    /// lack a string `type` tag -- those are protocol errors. A
    /// well-formed frame with an unrecognized tag parses as `Unknown`.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let raw: Value = serde_json::from_str(text)
            .map_err(|e| Error::Protocol(format!("frame is not valid JSON: {e}")))?;

        let kind = raw
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("frame has no string `type` tag".into()))?
            .to_owned();

        match kind.as_str() {
            "ping" | "pong" => {
                let timestamp = raw
                    .get("timestamp")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| {
                        Error::Protocol(format!("{kind} frame has no numeric timestamp"))
                    })?;
                if kind == "ping" {
                    Ok(Self::Ping { timestamp })
                } else {
                    Ok(Self::Pong { timestamp })
                }
            }
            _ => match kind.strip_suffix("_update") {
                Some(topic) if !topic.is_empty() => Ok(Self::Update {
                    topic: topic.to_owned(),
                    data: raw.get("data").cloned().unwrap_or(Value::Null),
                }),
                _ => Ok(Self::Unknown { kind, raw }),
            },
        }
    }

    /// Serialize an outbound ping frame.
    pub fn ping(timestamp: u64) -> String {
        serde_json::json!({ "type": "ping", "timestamp": timestamp }).to_string()
    }

    /// Serialize an outbound pong frame answering `timestamp`.
    pub fn pong(timestamp: u64) -> String {
        serde_json::json!({ "type": "pong", "timestamp": timestamp }).to_string()
    }
}

// ── Subscription envelope ────────────────────────────────────────────

/// Outbound subscription request sent over the stream connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub method: String,
    pub params: Vec<Value>,
    pub id: u64,
}

impl SubscribeRequest {
    /// Build a subscription envelope for one topic.
    pub fn new(method: impl Into<String>, topic: &str, id: u64) -> Self {
        Self {
            method: method.into(),
            params: vec![Value::String(topic.to_owned())],
            id,
        }
    }

    /// Serialize to the wire text form.
    pub fn to_text(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}

// ── JSON-RPC 2.0 envelopes ───────────────────────────────────────────

/// A single JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: Value,
    pub id: u64,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Value, id: u64) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
            id,
        }
    }
}

/// A single JSON-RPC 2.0 response, success or error.
///
/// `id` is optional: the server may omit it for parse-level failures, and
/// the client treats responses without a matchable id as lost.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorObject>,
    #[serde(default)]
    pub id: Option<u64>,
}

/// The `error` member of a JSON-RPC error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl From<RpcErrorObject> for Error {
    fn from(e: RpcErrorObject) -> Self {
        Error::Rpc {
            code: e.code,
            message: e.message,
            data: e.data,
        }
    }
}

/// Parse a response body that may be a single response or a batch array.
///
/// Single responses come back as a one-element vec so the caller has one
/// code path. Responses arriving in any order is fine -- matching is by id.
pub fn parse_rpc_body(body: Value) -> Result<Vec<RpcResponse>, Error> {
    let parsed = match body {
        Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value::<RpcResponse>)
            .collect::<Result<Vec<_>, _>>(),
        other => serde_json::from_value::<RpcResponse>(other).map(|r| vec![r]),
    };
    parsed.map_err(|e| Error::Protocol(format!("malformed RPC response: {e}")))
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn parse_ping_and_pong() {
        let ping = StreamFrame::parse(r#"{"type":"ping","timestamp":1700000000000}"#).unwrap();
        assert_eq!(
            ping,
            StreamFrame::Ping {
                timestamp: 1_700_000_000_000
            }
        );

        let pong = StreamFrame::parse(&StreamFrame::pong(42)).unwrap();
        assert_eq!(pong, StreamFrame::Pong { timestamp: 42 });
    }

    #[test]
    fn parse_update_frame() {
        let frame =
            StreamFrame::parse(r#"{"type":"height_update","data":{"height":100}}"#).unwrap();
        match frame {
            StreamFrame::Update { topic, data } => {
                assert_eq!(topic, "height");
                assert_eq!(data["height"], 100);
            }
            other => panic!("expected Update, got {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_is_explicit_not_an_error() {
        let frame = StreamFrame::parse(r#"{"type":"server_notice","text":"hi"}"#).unwrap();
        match frame {
            StreamFrame::Unknown { kind, .. } => assert_eq!(kind, "server_notice"),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn bare_update_suffix_is_unknown() {
        // "_update" with an empty topic is nonsense, not a push frame.
        let frame = StreamFrame::parse(r#"{"type":"_update","data":{}}"#).unwrap();
        assert!(matches!(frame, StreamFrame::Unknown { .. }));
    }

    #[test]
    fn malformed_frames_are_protocol_errors() {
        assert!(StreamFrame::parse("not json").is_err());
        assert!(StreamFrame::parse(r#"{"data":1}"#).is_err());
        assert!(StreamFrame::parse(r#"{"type":"ping"}"#).is_err());
    }

    #[test]
    fn subscribe_envelope_shape() {
        let req = SubscribeRequest::new("metrics.subscribe", "height", 7);
        let text = req.to_text().unwrap();
        let raw: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(raw["method"], "metrics.subscribe");
        assert_eq!(raw["params"], json!(["height"]));
        assert_eq!(raw["id"], 7);
    }

    #[test]
    fn rpc_request_carries_version_tag() {
        let req = RpcRequest::new("chain.getHeight", json!([]), 1);
        let raw = serde_json::to_value(&req).unwrap();
        assert_eq!(raw["jsonrpc"], "2.0");
        assert_eq!(raw["method"], "chain.getHeight");
        assert_eq!(raw["id"], 1);
    }

    #[test]
    fn parse_single_and_batch_bodies() {
        let single = parse_rpc_body(json!({"jsonrpc":"2.0","result":{"height":9},"id":3}))
            .unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].id, Some(3));

        let batch = parse_rpc_body(json!([
            {"jsonrpc":"2.0","result":1,"id":1},
            {"jsonrpc":"2.0","error":{"code":-32000,"message":"nope"},"id":2},
        ]))
        .unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch[0].error.is_none());
        assert_eq!(batch[1].error.as_ref().unwrap().code, -32000);
    }

    #[test]
    fn parse_body_without_id() {
        let parsed = parse_rpc_body(json!({"jsonrpc":"2.0","error":{"code":-32700,"message":"parse error"}}))
            .unwrap();
        assert_eq!(parsed[0].id, None);
    }
}

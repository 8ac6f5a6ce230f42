//! JSON-RPC Frame Codec
//!
//! Turns outgoing calls into websocket text frames and classifies incoming frames.
//! Decoding never fails: anything that is not a well-formed JSON-RPC 2.0 message comes
//! back as [`Frame::Malformed`] so a single bad frame cannot take the session down.
//!
//! # Notification routing
//!
//! Notifications are routed by their `method` as topic. TrueNAS wraps subscribed
//! events in a `collection_update` envelope whose `params.collection` names the event,
//! e.g. `alert.list`; those are routed by the collection name instead.

use crate::truenas::types::{JsonRpcRequest, RequestId, RpcError, JSONRPC_VERSION};
use serde_json::{Map, Value};

/// Method name of TrueNAS event envelopes
pub const COLLECTION_UPDATE: &str = "collection_update";

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Response {
        id: RequestId,
        outcome: Result<Value, RpcError>,
    },
    Notification {
        topic: String,
        payload: Value,
    },
    /// Request initiated by the peer. Sessions never serve these.
    Request {
        id: RequestId,
        method: String,
        params: Value,
    },
    Malformed {
        reason: String,
    },
}

/// Encode a method call as a JSON-RPC 2.0 text frame
pub fn encode(method: &str, params: &Value, id: &RequestId) -> serde_json::Result<String> {
    serde_json::to_string(&JsonRpcRequest {
        jsonrpc: JSONRPC_VERSION,
        id,
        method,
        params,
    })
}

/// Encode a result response. Used by peers and test doubles.
pub fn encode_result(id: &RequestId, result: &Value) -> serde_json::Result<String> {
    serde_json::to_string(&serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    }))
}

/// Encode an error response. Used by peers and test doubles.
pub fn encode_error(id: &RequestId, error: &RpcError) -> serde_json::Result<String> {
    serde_json::to_string(&serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": error,
    }))
}

/// Encode a notification. Used by peers and test doubles.
pub fn encode_notification(method: &str, params: &Value) -> serde_json::Result<String> {
    serde_json::to_string(&serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
        "params": params,
    }))
}

/// Classify one inbound text frame
pub fn decode(text: &str) -> Frame {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => return malformed(format!("invalid JSON: {}", e)),
    };

    let Value::Object(mut obj) = value else {
        return malformed("frame is not a JSON object");
    };

    let id = match obj.remove("id") {
        None | Some(Value::Null) => None,
        Some(raw) => match serde_json::from_value::<RequestId>(raw) {
            Ok(id) => Some(id),
            Err(_) => return malformed("id must be a non-negative integer or a string"),
        },
    };

    let method = match obj.remove("method") {
        None => None,
        Some(Value::String(method)) => Some(method),
        Some(_) => return malformed("method must be a string"),
    };

    match (id, method) {
        (Some(id), None) => decode_response(id, obj),
        (None, Some(method)) => {
            let payload = obj.remove("params").unwrap_or(Value::Null);
            Frame::Notification {
                topic: notification_topic(method, &payload),
                payload,
            }
        }
        (Some(id), Some(method)) => Frame::Request {
            id,
            method,
            params: obj.remove("params").unwrap_or(Value::Null),
        },
        (None, None) => malformed("frame has neither id nor method"),
    }
}

fn decode_response(id: RequestId, mut obj: Map<String, Value>) -> Frame {
    match (obj.remove("result"), obj.remove("error")) {
        (Some(result), None) => Frame::Response {
            id,
            outcome: Ok(result),
        },
        (None, Some(error)) | (Some(Value::Null), Some(error)) => {
            match serde_json::from_value::<RpcError>(error) {
                Ok(error) => Frame::Response {
                    id,
                    outcome: Err(error),
                },
                Err(e) => malformed(format!("invalid error object for id {}: {}", id, e)),
            }
        }
        (Some(_), Some(_)) => malformed(format!("response {} carries both result and error", id)),
        (None, None) => malformed(format!("response {} carries neither result nor error", id)),
    }
}

fn notification_topic(method: String, payload: &Value) -> String {
    if method == COLLECTION_UPDATE {
        if let Some(collection) = payload.get("collection").and_then(Value::as_str) {
            return collection.to_string();
        }
    }
    method
}

fn malformed(reason: impl Into<String>) -> Frame {
    Frame::Malformed {
        reason: reason.into(),
    }
}

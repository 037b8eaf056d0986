//! JSON-RPC 2.0 envelopes exchanged with the agent.
//!
//! Outbound messages are built as [`serde_json::Value`]s; inbound lines are
//! classified by [`parse_inbound_line`] into responses and notifications.
//!
//! | Shape                              | Classified as                   |
//! |------------------------------------|---------------------------------|
//! | has non-empty `method`             | [`Inbound::Notification`]       |
//! | has `id` and `result`              | [`ResponseOutcome::Result`]     |
//! | has `id` and `{code, message}` error | [`ResponseOutcome::Error`]    |
//! | has `id` and any other `error`     | [`ResponseOutcome::MalformedError`] |
//! | anything else                      | skipped                         |

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::{AppError, Result};

/// Protocol version string carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Build a request envelope.
#[must_use]
pub fn request(id: u64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "method": method,
        "params": params,
    })
}

/// Build a notification envelope (no `id`).
#[must_use]
pub fn notification(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
        "params": params,
    })
}

/// A request id as echoed back by the agent.
///
/// Some agents return the numeric id we sent as a string; both forms are
/// accepted as long as they denote a non-negative integer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// `"id": 7`
    Number(serde_json::Number),
    /// `"id": "7"`
    Text(String),
}

impl RequestId {
    /// Numeric value of the id, if it has one.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Number(n) => n.as_u64().or_else(|| {
                n.as_f64()
                    .filter(|f| *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64)
                    .map(|f| f as u64)
            }),
            Self::Text(s) => parse_numeric_id(s),
        }
    }

    /// Extract an id from an arbitrary JSON value.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => Some(Self::Number(n.clone())),
            Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }
}

/// Parse a decimal id string; anything other than ASCII digits is rejected.
#[must_use]
pub fn parse_numeric_id(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// A well-formed JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcError {
    /// Error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(default)]
    pub data: Option<Value>,
}

/// What a response carried.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    /// `result` member (may be `null`).
    Result(Value),
    /// `error` member with the standard shape.
    Error(RpcError),
    /// `error` member of any other shape.
    MalformedError(Value),
}

/// A classified inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Reply to one of our requests.
    Response {
        /// Echoed request id.
        id: RequestId,
        /// Result or error.
        outcome: ResponseOutcome,
    },
    /// Agent-initiated message without correlation.
    Notification {
        /// Method name, e.g. `codex/event`.
        method: String,
        /// Method parameters (`null` when absent).
        params: Value,
    },
}

/// Parse one line from the agent's stdout.
///
/// # Return value
///
/// - `Ok(Some(msg))`: a response or notification.
/// - `Ok(None)`: blank line, non-object JSON, or an object that is neither
///   a response nor a notification.
///
/// # Errors
///
/// [`AppError::Codec`]`("malformed json: …")` when the line is not JSON.
pub fn parse_inbound_line(line: &str) -> Result<Option<Inbound>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(trimmed)
        .map_err(|e| AppError::Codec(format!("malformed json: {e}")))?;
    let Value::Object(mut obj) = value else {
        return Ok(None);
    };

    if let Some(method) = method_name(&obj) {
        let params = obj.remove("params").unwrap_or(Value::Null);
        return Ok(Some(Inbound::Notification { method, params }));
    }

    let Some(id) = obj.get("id").and_then(RequestId::from_value) else {
        return Ok(None);
    };

    if let Some(result) = obj.remove("result") {
        return Ok(Some(Inbound::Response {
            id,
            outcome: ResponseOutcome::Result(result),
        }));
    }

    if let Some(error) = obj.remove("error") {
        let outcome = match serde_json::from_value::<RpcError>(error.clone()) {
            Ok(err) => ResponseOutcome::Error(err),
            Err(_) => ResponseOutcome::MalformedError(error),
        };
        return Ok(Some(Inbound::Response { id, outcome }));
    }

    Ok(None)
}

fn method_name(obj: &Map<String, Value>) -> Option<String> {
    match obj.get("method") {
        Some(Value::String(m)) if !m.is_empty() => Some(m.clone()),
        _ => None,
    }
}

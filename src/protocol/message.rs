//! JSON-RPC envelope types for the control protocol.
//!
//! Outbound requests carry a `protocolVersion` field where standard JSON-RPC
//! uses `jsonrpc`. Inbound messages are decoded once at the frame boundary
//! into [`Incoming`]; nothing downstream inspects raw JSON shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version string sent with every request.
pub const PROTOCOL_VERSION: &str = "2.0";

/// Message used when an error object carries no `message` field.
pub const GENERIC_REMOTE_ERROR: &str = "Unknown error from control server";

/// An outbound request envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Request<'a> {
    pub protocol_version: &'static str,
    pub method: &'a str,
    pub params: Value,
    pub id: u64,
}

impl<'a> Request<'a> {
    pub fn new(method: &'a str, params: Value, id: u64) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            params,
            id,
        }
    }
}

/// Error object returned by the control server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteFault {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default = "generic_message")]
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

fn generic_message() -> String {
    GENERIC_REMOTE_ERROR.to_string()
}

impl RemoteFault {
    /// Build a fault from an arbitrary `error` value.
    ///
    /// Servers occasionally send a bare string instead of an object; that
    /// string becomes the message.
    fn from_value(value: Value) -> Self {
        match value {
            Value::String(message) => Self {
                code: None,
                message,
                data: None,
            },
            other => serde_json::from_value(other).unwrap_or_else(|_| Self {
                code: None,
                message: generic_message(),
                data: None,
            }),
        }
    }
}

/// One decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Reply to a request that is still pending.
    Response {
        id: u64,
        outcome: Result<Value, RemoteFault>,
    },
    /// Unsolicited push from the server.
    Notification { method: String, params: Value },
    /// Valid JSON that is neither of the above, including replies to ids
    /// that are not pending.
    Unrecognized(Value),
}

impl Incoming {
    /// Classify one JSON value.
    ///
    /// A numeric `id` that `is_pending` accepts makes a response. Otherwise a
    /// string `method` makes a notification, and anything else is
    /// unrecognized. A reply to an id nobody is waiting for therefore never
    /// reaches a caller.
    pub fn decode(value: Value, is_pending: impl FnOnce(u64) -> bool) -> Self {
        let Value::Object(mut object) = value else {
            return Incoming::Unrecognized(value);
        };

        if let Some(id) = object.get("id").and_then(Value::as_u64) {
            if is_pending(id) {
                let outcome = match object.remove("error") {
                    Some(error) if !error.is_null() => Err(RemoteFault::from_value(error)),
                    _ => Ok(object.remove("result").unwrap_or(Value::Null)),
                };
                return Incoming::Response { id, outcome };
            }
        }

        if let Some(Value::String(method)) = object.get("method") {
            let method = method.clone();
            return Incoming::Notification {
                method,
                params: object.remove("params").unwrap_or(Value::Null),
            };
        }

        Incoming::Unrecognized(Value::Object(object))
    }
}

/// Split a parsed frame into the messages it carries.
///
/// Objects yield themselves; arrays are treated as batches. Anything else
/// is returned as `Err` so the caller can log it.
pub fn unbatch(value: Value) -> Result<Vec<Value>, Value> {
    match value {
        Value::Object(_) => Ok(vec![value]),
        Value::Array(items) => Ok(items),
        other => Err(other),
    }
}

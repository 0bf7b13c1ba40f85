//! Error types for the control protocol client.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::protocol::message::RemoteFault;

/// Control protocol error types.
///
/// Transport-class errors (see [`ControlError::is_transport`]) end the call
/// that hit them but leave the client usable; it can be connected again.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Failed to open the TCP connection (refused, unreachable, DNS).
    #[error("Connection to {addr} failed: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The TCP connect did not finish in time.
    #[error("Connection to {addr} timed out after {}s", timeout.as_secs())]
    ConnectTimeout { addr: String, timeout: Duration },

    /// `connect` was called while a connection is already open.
    #[error("Already connected to {0}")]
    AlreadyConnected(String),

    /// A request was issued with no open connection.
    #[error("Not connected")]
    NotConnected,

    /// I/O error while writing to the socket.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    /// The connection ended before the response arrived.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Request could not be encoded, or a reply had an unusable shape.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The control server answered with an error object.
    #[error("Remote error: {message}")]
    Remote {
        code: Option<i64>,
        message: String,
        data: Option<Value>,
    },

    /// Logon was rejected.
    #[error("Authentication failed: {0}")]
    Authentication(#[source] Box<ControlError>),
}

impl ControlError {
    /// True for connect failures, socket errors, and calls made or left
    /// pending without a live connection.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ControlError::ConnectionFailed { .. }
                | ControlError::ConnectTimeout { .. }
                | ControlError::AlreadyConnected(_)
                | ControlError::NotConnected
                | ControlError::Io(_)
                | ControlError::ConnectionClosed
        )
    }
}

impl From<RemoteFault> for ControlError {
    fn from(fault: RemoteFault) -> Self {
        ControlError::Remote {
            code: fault.code,
            message: fault.message,
            data: fault.data,
        }
    }
}

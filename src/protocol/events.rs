//! Observer events emitted by [`ControlClient`](super::ControlClient).
//!
//! The client pushes human-readable trace lines and unsolicited server
//! messages onto a bounded channel with `try_send`. An observer that falls
//! behind loses events instead of growing the queue; the client never
//! waits on it.

use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;
use tracing::{debug, warn};

/// Suggested capacity for the observer channel.
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// Events from the control client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Diagnostic line: connection events, bytes received, frames found,
    /// commands sent and answered.
    Trace(String),
    /// Unsolicited message pushed by the server.
    Notification { method: String, params: Value },
    /// The connection ended; `reason` says why.
    Disconnected { reason: String },
}

/// Cloneable handle used by the client and its reader task.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventSink {
    tx: Option<Sender<ClientEvent>>,
}

impl EventSink {
    pub(crate) fn new(tx: Option<Sender<ClientEvent>>) -> Self {
        Self { tx }
    }

    /// Formats `line` only when an observer is registered.
    pub(crate) fn trace(&self, line: impl FnOnce() -> String) {
        if self.tx.is_some() {
            self.emit(ClientEvent::Trace(line()));
        }
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        let Some(tx) = &self.tx else {
            return;
        };

        match tx.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(ClientEvent::Trace(_))) => {
                debug!("Observer channel full, dropping trace line");
            }
            Err(TrySendError::Full(event)) => {
                warn!("Observer channel full, dropping event: {:?}", event);
            }
        }
    }
}

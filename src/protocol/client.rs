//! TCP client for the control protocol.
//!
//! `ControlClient` owns at most one connection. Each connection runs a
//! background reader task that frames the inbound stream, resolves pending
//! calls by id, and forwards unsolicited notifications to the observer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::protocol::error::ControlError;
use crate::protocol::events::{ClientEvent, EventSink};
use crate::protocol::framing::{write_frame, FrameBuffer, DEFAULT_MAX_BUFFERED_BYTES};
use crate::protocol::message::{unbatch, Incoming, Request};

/// Default control protocol port.
pub const DEFAULT_PORT: u16 = 1710;

/// Default connect timeout in seconds.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Size of each socket read.
const DEFAULT_READ_CHUNK_SIZE: usize = 8 * 1024;

/// Tunables for a [`ControlClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long `connect` waits for the TCP handshake.
    pub connect_timeout: Duration,
    /// Cap on unterminated inbound bytes before the connection is dropped.
    pub max_buffered_bytes: usize,
    /// Buffer size for each socket read.
    pub read_chunk_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            max_buffered_bytes: DEFAULT_MAX_BUFFERED_BYTES,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

type Completion = oneshot::Sender<Result<Value, ControlError>>;

/// Calls waiting for a response on one connection.
///
/// `open` flips to false exactly once, at which point every waiter is
/// failed and no new waiter can be registered.
struct PendingCalls {
    calls: HashMap<u64, Completion>,
    open: bool,
}

impl PendingCalls {
    fn fail_all(&mut self) -> usize {
        self.open = false;
        let count = self.calls.len();
        for (_, completion) in self.calls.drain() {
            let _ = completion.send(Err(ControlError::ConnectionClosed));
        }
        count
    }
}

type SharedPending = Arc<Mutex<PendingCalls>>;

fn lock(pending: &SharedPending) -> MutexGuard<'_, PendingCalls> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a pending entry if the waiting call is dropped before its
/// response arrives.
struct PendingGuard {
    pending: SharedPending,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        lock(&self.pending).calls.remove(&self.id);
    }
}

type SharedWriter = tokio::sync::Mutex<OwnedWriteHalf>;

/// One TCP session, shared by the client slot and in-flight calls.
///
/// The write half has its own lock so a stalled write never blocks
/// `disconnect`, `is_connected` or `peer`.
struct Connection {
    peer: String,
    writer: SharedWriter,
    pending: SharedPending,
    reader: AbortHandle,
}

impl Connection {
    fn is_open(&self) -> bool {
        lock(&self.pending).open
    }

    /// Register a waiter. Fails if the session was already torn down.
    fn register(&self, id: u64, completion: Completion) -> bool {
        let mut pending = lock(&self.pending);
        if !pending.open {
            return false;
        }
        pending.calls.insert(id, completion);
        true
    }

    /// Stop the reader and fail everything still waiting.
    ///
    /// Failing a waiter also cancels its write, if one is in progress.
    fn close(&self) -> usize {
        self.reader.abort();
        lock(&self.pending).fail_all()
    }
}

/// The client's handle on its current connection. Closes it when dropped.
struct Session(Arc<Connection>);

impl Drop for Session {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Client for one control server endpoint.
///
/// Methods take `&self`, so one client can be shared (e.g. behind an `Arc`)
/// and have several calls in flight at once. Responses are matched by id,
/// not by issue order.
///
/// # Connection Lifecycle
///
/// - `connect()` - Open the TCP session and start the reader task
/// - `call()` - Send a request and wait for its response
/// - `disconnect()` - Close the session; pending calls fail with
///   [`ControlError::ConnectionClosed`]
///
/// There is no automatic reconnect. Request ids keep increasing across
/// reconnects and are never reused.
///
/// # Example
///
/// ```ignore
/// use controlrpc::protocol::ControlClient;
/// use serde_json::json;
///
/// let client = ControlClient::new();
/// client.connect("10.0.0.5", 1710).await?;
/// let status = client.call("StatusGet", json!({})).await?;
/// client.disconnect().await;
/// ```
pub struct ControlClient {
    config: ClientConfig,
    events: EventSink,
    /// Next request id. Starts at 1.
    request_id: AtomicU64,
    /// Held only for slot bookkeeping, never across socket I/O.
    session: tokio::sync::Mutex<Option<Session>>,
}

impl Default for ControlClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlClient {
    /// Create a disconnected client with default settings.
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    /// Create a disconnected client with explicit settings.
    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            config,
            events: EventSink::default(),
            request_id: AtomicU64::new(1),
            session: tokio::sync::Mutex::new(None),
        }
    }

    /// Send trace lines, notifications and disconnect events to `tx`.
    pub fn with_events(mut self, tx: Sender<ClientEvent>) -> Self {
        self.events = EventSink::new(Some(tx));
        self
    }

    /// Open a TCP connection to `host:port`.
    ///
    /// Only one connect can be in progress at a time; concurrent calls to
    /// `connect` or `call` wait for it to finish.
    ///
    /// # Errors
    ///
    /// - `ControlError::AlreadyConnected` if a live connection exists
    /// - `ControlError::ConnectionFailed` on refusal, DNS failure, or any
    ///   other socket error
    /// - `ControlError::ConnectTimeout` if the handshake takes longer than
    ///   `ClientConfig::connect_timeout`
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), ControlError> {
        let mut slot = self.session.lock().await;

        if let Some(Session(existing)) = slot.as_ref() {
            if existing.is_open() {
                return Err(ControlError::AlreadyConnected(existing.peer.clone()));
            }
        }
        // A session the server already closed is just dropped.
        *slot = None;

        let addr = format!("{}:{}", host, port);
        info!("Connecting to control server at {}", addr);
        self.events.trace(|| format!("Connecting to {}", addr));

        let stream = match timeout(self.config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                warn!("Connection to {} failed: {}", addr, source);
                self.events
                    .trace(|| format!("Connection to {} failed: {}", addr, source));
                return Err(ControlError::ConnectionFailed { addr, source });
            }
            Err(_) => {
                warn!("Connection to {} timed out", addr);
                self.events.trace(|| format!("Connection to {} timed out", addr));
                return Err(ControlError::ConnectTimeout {
                    addr,
                    timeout: self.config.connect_timeout,
                });
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }

        let (read_half, write_half) = stream.into_split();
        let pending: SharedPending = Arc::new(Mutex::new(PendingCalls {
            calls: HashMap::new(),
            open: true,
        }));

        let reader = tokio::spawn(reader_loop(
            read_half,
            Arc::clone(&pending),
            self.events.clone(),
            FrameBuffer::new(self.config.max_buffered_bytes),
            self.config.read_chunk_size,
            addr.clone(),
        ));

        info!("Connected to {}", addr);
        self.events.trace(|| format!("Connected to {}", addr));

        *slot = Some(Session(Arc::new(Connection {
            peer: addr,
            writer: tokio::sync::Mutex::new(write_half),
            pending,
            reader: reader.abort_handle(),
        })));
        Ok(())
    }

    /// Close the connection if one is open.
    ///
    /// Idempotent. Every call still waiting for a response settles with
    /// `ControlError::ConnectionClosed`, including one stuck writing to a
    /// peer that stopped reading.
    pub async fn disconnect(&self) {
        let Some(session) = self.session.lock().await.take() else {
            return;
        };
        let connection = Arc::clone(&session.0);

        let failed = connection.close();
        // A write that is still unwinding keeps the lock; the socket closes
        // once that call lets go of the connection.
        match connection.writer.try_lock() {
            Ok(mut writer) => {
                if let Err(e) = writer.shutdown().await {
                    debug!("Socket shutdown failed: {}", e);
                }
            }
            Err(_) => debug!("Write in progress, skipping socket shutdown"),
        }

        info!(
            "Disconnected from {} ({} pending call(s) failed)",
            connection.peer, failed
        );
        self.events.trace(|| format!("Disconnected from {}", connection.peer));
        self.events.emit(ClientEvent::Disconnected {
            reason: "Disconnected by client".to_string(),
        });
    }

    /// Whether a live connection exists.
    pub async fn is_connected(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|session| session.0.is_open())
    }

    /// Address of the connected server, if any.
    pub async fn peer(&self) -> Option<String> {
        self.session
            .lock()
            .await
            .as_ref()
            .filter(|session| session.0.is_open())
            .map(|session| session.0.peer.clone())
    }

    /// Send a request and wait for its response.
    ///
    /// The request is written as one NUL-terminated JSON object carrying a
    /// fresh id. There is no timeout here; wrap the future in
    /// `tokio::time::timeout` if one is needed. Dropping the future
    /// forgets the pending entry.
    ///
    /// # Errors
    ///
    /// - `ControlError::NotConnected` immediately, with nothing written, if
    ///   no connection is open
    /// - `ControlError::Io` if the write fails (the connection is closed)
    /// - `ControlError::ConnectionClosed` if the connection ends first,
    ///   even while the request is still being written
    /// - `ControlError::Remote` if the server answers with an error object
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, ControlError> {
        let (connection, id, mut response, _guard) = {
            let slot = self.session.lock().await;
            let connection = match slot.as_ref() {
                Some(Session(connection)) if connection.is_open() => Arc::clone(connection),
                _ => {
                    debug!("Rejecting {}: not connected", method);
                    return Err(ControlError::NotConnected);
                }
            };

            let id = self.next_id();
            let (completion, response) = oneshot::channel();
            if !connection.register(id, completion) {
                return Err(ControlError::NotConnected);
            }
            let guard = PendingGuard {
                pending: Arc::clone(&connection.pending),
                id,
            };
            (connection, id, response, guard)
        };

        let body = serde_json::to_vec(&Request::new(method, params, id))
            .map_err(|e| ControlError::Protocol(format!("Failed to serialize request: {}", e)))?;

        debug!("Sending {} (id={})", method, id);
        self.events
            .trace(|| format!("Sending command {} (id={})", method, id));

        let write = async {
            let mut writer = connection.writer.lock().await;
            write_frame(&mut *writer, &body).await
        };

        tokio::select! {
            written = write => {
                if let Err(e) = written {
                    warn!("Write to {} failed: {}", connection.peer, e);
                    let failed = connection.close();
                    debug!("{} other pending call(s) failed", failed.saturating_sub(1));
                    return Err(ControlError::Io(e));
                }
            }
            // Settled before the write finished: the connection was torn
            // down underneath us.
            settled = &mut response => {
                return settled.unwrap_or(Err(ControlError::ConnectionClosed));
            }
        }

        match response.await {
            Ok(result) => result,
            Err(_) => Err(ControlError::ConnectionClosed),
        }
    }

    /// Generate the next request ID.
    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Reader task: frame the inbound stream and dispatch each message.
///
/// Runs until EOF, a socket error, or a framing overflow, then fails every
/// pending call. Aborted by `disconnect`.
async fn reader_loop(
    mut reader: OwnedReadHalf,
    pending: SharedPending,
    events: EventSink,
    mut frames: FrameBuffer,
    chunk_size: usize,
    peer: String,
) {
    let mut chunk = vec![0u8; chunk_size.max(1)];

    let reason = loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break "Connection closed by server".to_string(),
            Ok(n) => n,
            Err(e) => break format!("Socket error: {}", e),
        };

        let received = &chunk[..n];
        events.trace(|| {
            format!(
                "Received {} bytes: {}",
                n,
                String::from_utf8_lossy(received).escape_debug()
            )
        });

        match frames.push(received) {
            Ok(found) => {
                for frame in found {
                    dispatch_frame(&frame, &pending, &events);
                }
            }
            Err(e) => {
                warn!("Dropping connection to {}: {}", peer, e);
                break e.to_string();
            }
        }
    };

    let failed = lock(&pending).fail_all();
    info!(
        "Connection to {} ended: {} ({} pending call(s) failed)",
        peer, reason, failed
    );
    events.trace(|| format!("Connection to {} ended: {}", peer, reason));
    events.emit(ClientEvent::Disconnected { reason });
}

/// Parse one frame and route the message(s) it carries.
///
/// Malformed frames are logged and dropped; they never end the connection.
fn dispatch_frame(frame: &[u8], pending: &SharedPending, events: &EventSink) {
    events.trace(|| format!("Found frame: {}", String::from_utf8_lossy(frame)));

    let value: Value = match serde_json::from_slice(frame) {
        Ok(value) => value,
        Err(e) => {
            warn!("Discarding unparseable frame ({} bytes): {}", frame.len(), e);
            events.trace(|| format!("Discarding unparseable frame: {}", e));
            return;
        }
    };

    let messages = match unbatch(value) {
        Ok(messages) => messages,
        Err(other) => {
            warn!("Discarding non-object frame: {}", other);
            return;
        }
    };

    for message in messages {
        dispatch_message(message, pending, events);
    }
}

fn dispatch_message(message: Value, pending: &SharedPending, events: &EventSink) {
    let mut calls = lock(pending);

    match Incoming::decode(message, |id| calls.calls.contains_key(&id)) {
        Incoming::Response { id, outcome } => {
            let Some(completion) = calls.calls.remove(&id) else {
                return;
            };
            drop(calls);

            match &outcome {
                Ok(_) => debug!("Received response for id={}", id),
                Err(fault) => debug!("Received error for id={}: {}", id, fault.message),
            }
            events.trace(|| format!("Received response (id={})", id));

            let _ = completion.send(outcome.map_err(ControlError::from));
        }
        Incoming::Notification { method, params } => {
            drop(calls);
            debug!("Received notification {}", method);
            events.emit(ClientEvent::Notification { method, params });
        }
        Incoming::Unrecognized(value) => {
            drop(calls);
            debug!("Discarding unrecognized message: {}", value);
        }
    }
}

//! Integration tests for the control protocol client.
//!
//! These tests run the real client against an in-process mock control
//! server on a loopback TCP socket. The mock reads NUL/LF-terminated
//! requests with the library's own `FrameBuffer` and writes hand-crafted
//! responses, so wire shapes are checked byte for byte.
//!
//! # Running
//!
//! ```bash
//! cargo test --test control_client -- --nocapture
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{channel, Receiver};
use tokio::time::timeout;

use controlrpc::deploy::{deploy_value, DeployError};
use controlrpc::protocol::{
    ClientConfig, ClientEvent, ControlClient, ControlError, FrameBuffer, DEFAULT_EVENT_BUFFER,
};

/// Test timeout to prevent hanging tests.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Server side of one client connection.
struct MockServer {
    stream: TcpStream,
    frames: FrameBuffer,
    queued: VecDeque<Vec<u8>>,
    raw: Vec<u8>,
}

impl MockServer {
    /// Read the next complete request from the client.
    async fn next_request(&mut self) -> Value {
        loop {
            if let Some(frame) = self.queued.pop_front() {
                return serde_json::from_slice(&frame).expect("client sent invalid JSON");
            }

            let mut buf = [0u8; 4096];
            let n = timeout(TEST_TIMEOUT, self.stream.read(&mut buf))
                .await
                .expect("Test timed out waiting for request")
                .expect("Read failed");
            assert!(n > 0, "client closed the connection");

            self.raw.extend_from_slice(&buf[..n]);
            self.queued
                .extend(self.frames.push(&buf[..n]).expect("framing failed"));
        }
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("Write failed");
        self.stream.flush().await.expect("Flush failed");
    }

    async fn reply(&mut self, message: Value) {
        let mut bytes = serde_json::to_vec(&message).unwrap();
        bytes.push(0);
        self.send_raw(&bytes).await;
    }

    /// Read one request, check its method, and answer with `result`.
    async fn answer(&mut self, method: &str, result: Value) -> Value {
        let request = self.next_request().await;
        assert_eq!(request["method"], json!(method));
        self.reply(json!({"id": request["id"], "result": result}))
            .await;
        request
    }
}

/// Connect `client` to a fresh mock server.
async fn connect(client: &ControlClient) -> MockServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (connected, accepted) = tokio::join!(client.connect("127.0.0.1", port), listener.accept());
    connected.expect("client should connect");
    let (stream, _) = accepted.expect("server should accept");

    MockServer {
        stream,
        frames: FrameBuffer::default(),
        queued: VecDeque::new(),
        raw: Vec::new(),
    }
}

async fn settle<T>(handle: tokio::task::JoinHandle<T>) -> T {
    timeout(TEST_TIMEOUT, handle)
        .await
        .expect("Test timed out waiting for call")
        .expect("call task panicked")
}

/// Drain events until one matches, ignoring trace lines.
async fn next_non_trace(rx: &mut Receiver<ClientEvent>) -> ClientEvent {
    loop {
        let event = timeout(TEST_TIMEOUT, rx.recv())
            .await
            .expect("Test timed out waiting for event")
            .expect("event channel closed");
        if !matches!(event, ClientEvent::Trace(_)) {
            return event;
        }
    }
}

#[tokio::test]
async fn test_request_envelope_and_increasing_ids() {
    let client = Arc::new(ControlClient::new());
    let mut server = connect(&client).await;

    for expected_id in 1..=3u64 {
        let call = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.call("StatusGet", json!({})).await }
        });

        let request = server.answer("StatusGet", json!({"ok": expected_id})).await;
        assert_eq!(
            request,
            json!({
                "protocolVersion": "2.0",
                "method": "StatusGet",
                "params": {},
                "id": expected_id
            })
        );
        assert_eq!(settle(call).await.unwrap(), json!({"ok": expected_id}));
    }

    // NUL terminated, never LF
    assert_eq!(server.raw.iter().filter(|&&b| b == 0).count(), 3);
    assert!(!server.raw.contains(&b'\n'));
    assert_eq!(server.raw.last(), Some(&0));
}

#[tokio::test]
async fn test_concurrent_calls_match_by_id_not_order() {
    let client = Arc::new(ControlClient::new());
    let mut server = connect(&client).await;

    let first = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.call("First", json!([])).await }
    });
    let second = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.call("Second", json!([])).await }
    });

    let a = server.next_request().await;
    let b = server.next_request().await;
    assert_ne!(a["id"], b["id"], "concurrent calls must not share an id");

    // Answer in reverse order, tagging each result with its method
    server
        .reply(json!({"id": b["id"], "result": b["method"]}))
        .await;
    server
        .reply(json!({"id": a["id"], "result": a["method"]}))
        .await;

    assert_eq!(settle(first).await.unwrap(), json!("First"));
    assert_eq!(settle(second).await.unwrap(), json!("Second"));
}

#[tokio::test]
async fn test_unmatched_and_malformed_frames_are_skipped() {
    let client = Arc::new(ControlClient::new());
    let mut server = connect(&client).await;

    let call = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.call("StatusGet", json!({})).await }
    });
    let request = server.next_request().await;

    // Stale id, garbage, a bare number, keepalives, then the real answer
    // split across two writes with an LF terminator.
    server
        .send_raw(b"{\"id\":999,\"result\":\"stale\"}\0not json\n42\0\0\0")
        .await;
    let answer = format!("{{\"id\":{},\"result\":\"fresh\"", request["id"]);
    server.send_raw(answer.as_bytes()).await;
    server.send_raw(b"}\n").await;

    assert_eq!(settle(call).await.unwrap(), json!("fresh"));
    assert!(client.is_connected().await);
}

#[tokio::test]
async fn test_notifications_reach_observer() {
    let (tx, mut rx) = channel(DEFAULT_EVENT_BUFFER);
    let client = ControlClient::new().with_events(tx);
    let mut server = connect(&client).await;

    server
        .reply(json!({"method": "EngineStatus", "params": {"State": "Active"}}))
        .await;

    assert_eq!(
        next_non_trace(&mut rx).await,
        ClientEvent::Notification {
            method: "EngineStatus".to_string(),
            params: json!({"State": "Active"}),
        }
    );
}

#[tokio::test]
async fn test_trace_lines_are_emitted() {
    let (tx, mut rx) = channel(DEFAULT_EVENT_BUFFER);
    let client = Arc::new(ControlClient::new().with_events(tx));
    let mut server = connect(&client).await;

    let call = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.call("StatusGet", json!({})).await }
    });
    server.answer("StatusGet", json!(true)).await;
    settle(call).await.unwrap();

    let mut traces = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ClientEvent::Trace(line) = event {
            traces.push(line);
        }
    }

    assert!(traces.iter().any(|l| l.starts_with("Connected to 127.0.0.1:")));
    assert!(traces.iter().any(|l| l.contains("Sending command StatusGet (id=1)")));
    assert!(traces.iter().any(|l| l.starts_with("Received ")));
    assert!(traces.iter().any(|l| l.starts_with("Found frame: ")));
}

#[tokio::test]
async fn test_disconnect_fails_pending_calls() {
    let (tx, mut rx) = channel(DEFAULT_EVENT_BUFFER);
    let client = Arc::new(ControlClient::new().with_events(tx));
    let mut server = connect(&client).await;

    let call = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.call("Component.Get", json!({})).await }
    });
    server.next_request().await;

    client.disconnect().await;

    assert!(matches!(
        settle(call).await,
        Err(ControlError::ConnectionClosed)
    ));
    assert!(!client.is_connected().await);
    assert!(matches!(
        next_non_trace(&mut rx).await,
        ClientEvent::Disconnected { .. }
    ));

    // Idempotent
    client.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_is_not_blocked_by_stalled_write() {
    let client = Arc::new(ControlClient::new());
    // The server side stays open but is never read from.
    let _server = connect(&client).await;

    let small = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.call("Small", json!({})).await }
    });
    // Far more than the socket buffers hold, so this write stalls.
    let script = "x".repeat(64 * 1024 * 1024);
    let large = tokio::spawn({
        let client = Arc::clone(&client);
        async move {
            client
                .write_control_value("Main", "code", json!(script))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let connected = timeout(TEST_TIMEOUT, client.is_connected())
        .await
        .expect("is_connected blocked behind an in-flight write");
    assert!(connected);

    timeout(TEST_TIMEOUT, client.disconnect())
        .await
        .expect("disconnect blocked behind an in-flight write");

    assert!(matches!(
        settle(small).await,
        Err(ControlError::ConnectionClosed)
    ));
    assert!(matches!(
        settle(large).await,
        Err(ControlError::ConnectionClosed)
    ));
    assert!(!client.is_connected().await);
}

#[tokio::test]
async fn test_server_close_fails_pending_calls() {
    let client = Arc::new(ControlClient::new());
    let mut server = connect(&client).await;

    let call = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.call("StatusGet", json!({})).await }
    });
    server.next_request().await;
    drop(server);

    assert!(matches!(
        settle(call).await,
        Err(ControlError::ConnectionClosed)
    ));
    assert!(!client.is_connected().await);
    assert!(matches!(
        client.call("StatusGet", json!({})).await,
        Err(ControlError::NotConnected)
    ));
}

#[tokio::test]
async fn test_call_before_connect_fails_fast_and_consumes_no_id() {
    let client = Arc::new(ControlClient::new());

    let err = client.call("StatusGet", json!({})).await.unwrap_err();
    assert!(matches!(err, ControlError::NotConnected));

    let mut server = connect(&client).await;
    let call = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.call("StatusGet", json!({})).await }
    });
    let request = server.answer("StatusGet", json!(null)).await;
    settle(call).await.unwrap();

    assert_eq!(request["id"], json!(1));
}

#[tokio::test]
async fn test_reconnect_after_disconnect_keeps_id_sequence() {
    let client = Arc::new(ControlClient::new());
    let mut server = connect(&client).await;

    let err = client.connect("127.0.0.1", 1).await.unwrap_err();
    assert!(matches!(err, ControlError::AlreadyConnected(_)));

    let call = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.call("StatusGet", json!({})).await }
    });
    server.answer("StatusGet", json!(1)).await;
    settle(call).await.unwrap();

    client.disconnect().await;
    let mut server = connect(&client).await;

    let call = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.call("StatusGet", json!({})).await }
    });
    let request = server.answer("StatusGet", json!(2)).await;
    settle(call).await.unwrap();

    assert_eq!(request["id"], json!(2));
}

#[tokio::test]
async fn test_buffer_overflow_drops_connection() {
    let (tx, mut rx) = channel(DEFAULT_EVENT_BUFFER);
    let config = ClientConfig {
        max_buffered_bytes: 64,
        ..ClientConfig::default()
    };
    let client = Arc::new(ControlClient::with_config(config).with_events(tx));
    let mut server = connect(&client).await;

    let call = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.call("StatusGet", json!({})).await }
    });
    server.next_request().await;
    server.send_raw(&[b'x'; 100]).await;

    assert!(matches!(
        settle(call).await,
        Err(ControlError::ConnectionClosed)
    ));
    match next_non_trace(&mut rx).await {
        ClientEvent::Disconnected { reason } => {
            assert!(reason.contains("exceeds maximum"), "reason: {}", reason);
        }
        other => panic!("Expected Disconnected, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_authenticate() {
    let client = Arc::new(ControlClient::new());
    let mut server = connect(&client).await;

    let ok = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.authenticate("admin", "secret").await }
    });
    let request = server.answer("Logon", json!(true)).await;
    assert_eq!(request["params"], json!({"User": "admin", "Password": "secret"}));
    settle(ok).await.unwrap();

    let rejected = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.authenticate("admin", "wrong").await }
    });
    let request = server.next_request().await;
    server
        .reply(json!({"id": request["id"], "error": {"code": 10, "message": "Logon required"}}))
        .await;

    match settle(rejected).await {
        Err(ControlError::Authentication(inner)) => {
            assert!(matches!(
                *inner,
                ControlError::Remote { ref message, .. } if message == "Logon required"
            ));
        }
        other => panic!("Expected Authentication error, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_list_components_shapes() {
    let client = Arc::new(ControlClient::new());
    let mut server = connect(&client).await;
    let components = json!([
        {"Name": "Main", "ID": "1", "Type": "device_controller_script"},
        {"Name": "Gain", "ID": "2", "Type": "gain"}
    ]);

    let mut results = Vec::new();
    for result in [
        components.clone(),
        json!({"Components": components.clone()}),
        json!({"Unexpected": true}),
    ] {
        let call = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.list_components().await }
        });
        server.answer("Component.GetComponents", result).await;
        results.push(settle(call).await.unwrap());
    }

    assert_eq!(results[0].len(), 2);
    assert_eq!(results[0], results[1]);
    assert_eq!(results[0][0].name, "Main");
    assert!(results[2].is_empty());
}

#[tokio::test]
async fn test_read_control_value() {
    let client = Arc::new(ControlClient::new());
    let mut server = connect(&client).await;

    let found = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.read_control_value("Main", "code").await }
    });
    let request = server
        .answer(
            "Component.Get",
            json!({"Name": "Main", "Controls": [{"Name": "code", "String": "print(1)"}]}),
        )
        .await;
    assert_eq!(request["params"], json!({"Name": "Main", "Controls": ["code"]}));
    assert_eq!(settle(found).await.unwrap(), Some(json!("print(1)")));

    let missing = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.read_control_value("Main", "absent").await }
    });
    server
        .answer("Component.Get", json!({"Name": "Main", "Controls": []}))
        .await;
    assert_eq!(settle(missing).await.unwrap(), None);
}

#[tokio::test]
async fn test_write_control_value_remote_error() {
    let client = Arc::new(ControlClient::new());
    let mut server = connect(&client).await;

    let write = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.write_control_value("Main", "gain", json!(-6)).await }
    });
    let request = server.next_request().await;
    assert_eq!(
        request["params"],
        json!({"Name": "Main", "Controls": [{"Name": "gain", "Value": -6}]})
    );
    server
        .reply(json!({"id": request["id"], "error": {"message": "Control is read-only"}}))
        .await;

    match settle(write).await {
        Err(ControlError::Remote { message, .. }) => assert_eq!(message, "Control is read-only"),
        other => panic!("Expected Remote error, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_deploy_to_wrong_type_issues_no_set() {
    let client = Arc::new(ControlClient::new());
    let mut server = connect(&client).await;

    let deploy = tokio::spawn({
        let client = Arc::clone(&client);
        async move { deploy_value(client.as_ref(), "X", "code", json!("print(1)")).await }
    });
    server
        .answer(
            "Component.GetComponents",
            json!([{"Name": "X", "ID": "9", "Type": "other_type"}]),
        )
        .await;

    let err = settle(deploy).await.unwrap_err();
    assert!(matches!(err, DeployError::UnsupportedComponentType { .. }));

    // The next thing on the wire is our probe, not a Component.Set.
    let probe = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.call("StatusGet", json!({})).await }
    });
    server.answer("StatusGet", json!(null)).await;
    settle(probe).await.unwrap();
}

#[tokio::test]
async fn test_deploy_to_script_component() {
    let client = Arc::new(ControlClient::new());
    let mut server = connect(&client).await;

    let deploy = tokio::spawn({
        let client = Arc::clone(&client);
        async move { deploy_value(client.as_ref(), "X", "code", json!("print(1)")).await }
    });
    server
        .answer(
            "Component.GetComponents",
            json!({"Components": [{"Name": "X", "ID": "9", "Type": "device_controller_script"}]}),
        )
        .await;
    let set = server.answer("Component.Set", json!(true)).await;

    assert_eq!(
        set,
        json!({
            "protocolVersion": "2.0",
            "method": "Component.Set",
            "params": {"Name": "X", "Controls": [{"Name": "code", "Value": "print(1)"}]},
            "id": 2
        })
    );
    assert_eq!(settle(deploy).await.unwrap().component, "X");
}

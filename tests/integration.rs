//! Integration tests: health, round history, upgrade validation, and an
//! end-to-end submission flow over a real socket. None of these need a
//! running NATS server; the repository degrades to its disabled mode.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use roundcast::models::Envelope;
use roundcast::{create_app, AppState, Hub, JetStreamRepository};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tower::util::ServiceExt;

fn test_state() -> AppState {
    let stream = JetStreamRepository::disabled();
    let hub = Hub::new(stream.clone());
    AppState { hub, stream }
}

/// Bind an ephemeral port and serve the app; optionally run the hub loop
/// (rounds start immediately once it runs).
async fn spawn_server(run_hub: bool) -> SocketAddr {
    let state = test_state();
    if run_hub {
        tokio::spawn(state.hub.clone().run());
    }
    let app = create_app(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_disconnected_without_stream() {
    let app = create_app(test_state());
    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["nats"], "disconnected");
    assert!(json.get("jetstream").is_none());
    assert!(json.get("version").and_then(|v| v.as_str()).is_some());
    assert_eq!(json["connections"], 0);
}

#[tokio::test]
async fn round_history_unavailable_without_stream() {
    let app = create_app(test_state());
    let request = Request::builder()
        .uri("/api/rounds/1700000000")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn round_history_requires_round_id() {
    let app = create_app(test_state());
    let request = Request::builder()
        .uri("/api/rounds")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn round_history_rejects_non_numeric_id() {
    let app = create_app(test_state());
    let request = Request::builder()
        .uri("/api/rounds/not-a-round")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// --- WebSocket tests against a real socket ---

const HANDSHAKE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Perform the upgrade handshake and return the HTTP status code.
async fn handshake_status(addr: SocketAddr, path_and_query: &str) -> u16 {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: {}\r\n\r\n",
        path_and_query, addr, HANDSHAKE_KEY
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buffer = [0u8; 1024];
    let read = timeout(IO_TIMEOUT, stream.read(&mut buffer))
        .await
        .expect("handshake read timed out")
        .unwrap();
    let head = String::from_utf8_lossy(&buffer[..read]);
    let status_line = head.lines().next().unwrap_or_default();
    status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}

#[tokio::test]
async fn ws_rejects_missing_username() {
    let addr = spawn_server(false).await;
    assert_eq!(handshake_status(addr, "/ws").await, 400);
}

#[tokio::test]
async fn ws_rejects_invalid_usernames() {
    let addr = spawn_server(false).await;
    assert_eq!(handshake_status(addr, "/ws?username=ab").await, 400);
    assert_eq!(
        handshake_status(addr, &format!("/ws?username={}", "a".repeat(21))).await,
        400
    );
    assert_eq!(handshake_status(addr, "/ws?username=bad-name").await, 400);
}

#[tokio::test]
async fn ws_accepts_boundary_usernames() {
    let addr = spawn_server(false).await;
    assert_eq!(handshake_status(addr, "/ws?username=abc").await, 101);
    assert_eq!(
        handshake_status(addr, &format!("/ws?username={}", "a".repeat(20))).await,
        101
    );
}

/// Minimal WebSocket client: zero mask key, no fragmentation, frames small
/// enough for the 16-bit length form.
struct WsClient {
    stream: TcpStream,
    buffer: Vec<u8>,
    pending: VecDeque<Envelope>,
}

impl WsClient {
    async fn connect(addr: SocketAddr, username: &str) -> Self {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET /ws?username={} HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: {}\r\n\r\n",
            username, addr, HANDSHAKE_KEY
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut buffer = Vec::new();
        let head_end = loop {
            let mut chunk = [0u8; 1024];
            let read = timeout(IO_TIMEOUT, stream.read(&mut chunk))
                .await
                .expect("handshake read timed out")
                .unwrap();
            assert!(read > 0, "connection closed during handshake");
            buffer.extend_from_slice(&chunk[..read]);
            if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos;
            }
        };
        let head = String::from_utf8_lossy(&buffer[..head_end]).to_string();
        assert!(
            head.starts_with("HTTP/1.1 101"),
            "upgrade refused: {}",
            head
        );
        let leftover = buffer[head_end + 4..].to_vec();

        Self {
            stream,
            buffer: leftover,
            pending: VecDeque::new(),
        }
    }

    async fn fill(&mut self, wanted: usize) {
        while self.buffer.len() < wanted {
            let mut chunk = [0u8; 1024];
            let read = timeout(IO_TIMEOUT, self.stream.read(&mut chunk))
                .await
                .expect("frame read timed out")
                .unwrap();
            assert!(read > 0, "connection closed");
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    /// Read one server frame (never masked) and return (opcode, payload).
    async fn read_frame(&mut self) -> (u8, Vec<u8>) {
        self.fill(2).await;
        let opcode = self.buffer[0] & 0x0F;
        let mut length = (self.buffer[1] & 0x7F) as usize;
        let mut offset = 2;
        if length == 126 {
            self.fill(4).await;
            length = u16::from_be_bytes([self.buffer[2], self.buffer[3]]) as usize;
            offset = 4;
        }
        self.fill(offset + length).await;
        let payload = self.buffer[offset..offset + length].to_vec();
        self.buffer.drain(..offset + length);
        (opcode, payload)
    }

    /// Return the next envelope of the given kind, buffering everything else.
    async fn expect_kind(&mut self, kind: &str) -> Envelope {
        for _ in 0..64 {
            if let Some(pos) = self.pending.iter().position(|e| e.kind == kind) {
                return self.pending.remove(pos).unwrap();
            }
            let (opcode, payload) = self.read_frame().await;
            if opcode != 0x1 {
                continue; // pings and closes are not envelopes
            }
            let text = String::from_utf8(payload).unwrap();
            // The write pump may fold several envelopes into one frame.
            for part in text.split('\n') {
                self.pending.push_back(serde_json::from_str(part).unwrap());
            }
        }
        panic!("no '{}' envelope received", kind);
    }

    async fn send_text(&mut self, payload: &str) {
        let bytes = payload.as_bytes();
        let mut frame = Vec::with_capacity(bytes.len() + 8);
        frame.push(0x81);
        if bytes.len() < 126 {
            frame.push(0x80 | bytes.len() as u8);
        } else {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        }
        // Zero mask key: the masked payload equals the plain payload.
        frame.extend_from_slice(&[0, 0, 0, 0]);
        frame.extend_from_slice(bytes);
        self.stream.write_all(&frame).await.unwrap();
    }

    async fn submit(&mut self, username: &str, data: &str) {
        let envelope = serde_json::json!({
            "version": "1.0",
            "type": "client_message",
            "username": username,
            "data": data,
        });
        self.send_text(&envelope.to_string()).await;
    }
}

#[tokio::test]
async fn ws_round_flow_ack_and_duplicate() {
    let addr = spawn_server(true).await;
    let mut alice = WsClient::connect(addr, "alice").await;

    let round_start = alice.expect_kind("round_start").await;
    assert!(round_start.data.parse::<i64>().is_ok());

    alice.submit("alice", "hello").await;
    let ack = alice.expect_kind("ack").await;
    assert_eq!(ack.data, "Message received successfully");

    alice.submit("alice", "hello again").await;
    let error = alice.expect_kind("error").await;
    assert_eq!(error.error_code.as_deref(), Some("ALREADY_SENT"));
}

#[tokio::test]
async fn ws_protocol_violations_keep_connection_open() {
    let addr = spawn_server(true).await;
    let mut alice = WsClient::connect(addr, "alice").await;
    alice.expect_kind("round_start").await;

    let bad_version = serde_json::json!({
        "version": "2.0",
        "type": "client_message",
        "username": "alice",
        "data": "hello",
    });
    alice.send_text(&bad_version.to_string()).await;
    let error = alice.expect_kind("error").await;
    assert_eq!(error.error_code.as_deref(), Some("INVALID_VERSION"));

    alice.send_text("not json").await;
    let error = alice.expect_kind("error").await;
    assert_eq!(error.error_code.as_deref(), Some("INVALID_JSON"));

    // The connection survived both violations.
    alice.submit("alice", "still here").await;
    alice.expect_kind("ack").await;
}

#[tokio::test]
async fn ws_late_joiner_receives_current_round() {
    let addr = spawn_server(true).await;
    let mut alice = WsClient::connect(addr, "alice").await;
    let first = alice.expect_kind("round_start").await;

    let mut bob = WsClient::connect(addr, "bob_2024").await;
    let second = bob.expect_kind("round_start").await;
    assert_eq!(first.data, second.data);
}

#![allow(clippy::unwrap_used)]
// Integration tests for `WebSocketClient` against an in-process server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use url::Url;

use guidelight_api::{
    ConnectionStatus, InboundMessage, MessageKind, ReconnectConfig, WebSocketClient, ZoneStatus,
};

// ── Helpers ─────────────────────────────────────────────────────────

type ServerSocket = WebSocketStream<TcpStream>;

/// Accepts WebSocket upgrades and hands each socket to the test.
async fn spawn_server() -> (Url, mpsc::UnboundedReceiver<ServerSocket>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                if tx.send(ws).is_err() {
                    break;
                }
            }
        }
    });

    let url = Url::parse(&format!("ws://{addr}/ws")).unwrap();
    (url, rx)
}

fn fast_config() -> ReconnectConfig {
    ReconnectConfig {
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        heartbeat_interval: Duration::from_secs(60),
        ..ReconnectConfig::default()
    }
}

async fn next_socket(rx: &mut mpsc::UnboundedReceiver<ServerSocket>) -> ServerSocket {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("server did not accept a connection in time")
        .unwrap()
}

async fn wait_status(
    rx: &mut watch::Receiver<ConnectionStatus>,
    pred: impl FnMut(&ConnectionStatus) -> bool,
) {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
        .await
        .expect("status condition not reached in time")
        .unwrap();
}

async fn close_with(socket: &mut ServerSocket, code: CloseCode) {
    socket
        .close(Some(CloseFrame {
            code,
            reason: "test".into(),
        }))
        .await
        .unwrap();
}

// ── Reconnect ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_abnormal_close_reconnects_to_same_url() {
    let (url, mut sockets) = spawn_server().await;
    let client = WebSocketClient::new(fast_config());
    let mut status = client.status();

    client.connect(url.clone()).unwrap();
    let mut first = next_socket(&mut sockets).await;
    wait_status(&mut status, |s| s.is_connected).await;

    close_with(&mut first, CloseCode::Error).await;
    wait_status(&mut status, |s| !s.is_connected).await;

    let _second = next_socket(&mut sockets).await;
    wait_status(&mut status, |s| s.is_connected && s.reconnect_attempts == 0).await;

    assert_eq!(client.url(), Some(url));
    client.disconnect();
}

#[tokio::test]
async fn test_normal_close_does_not_reconnect() {
    let (url, mut sockets) = spawn_server().await;
    let client = WebSocketClient::new(fast_config());
    let mut status = client.status();

    client.connect(url).unwrap();
    let mut socket = next_socket(&mut sockets).await;
    wait_status(&mut status, |s| s.is_connected).await;

    close_with(&mut socket, CloseCode::Normal).await;
    wait_status(&mut status, |s| !s.is_connected).await;

    let again = tokio::time::timeout(Duration::from_millis(300), sockets.recv()).await;
    assert!(again.is_err(), "client reconnected after a normal close");
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_disconnect_stops_reconnect_loop() {
    let (url, mut sockets) = spawn_server().await;
    let client = WebSocketClient::new(fast_config());
    let mut status = client.status();

    client.connect(url).unwrap();
    let mut socket = next_socket(&mut sockets).await;
    wait_status(&mut status, |s| s.is_connected).await;

    client.disconnect();

    // The server sees a normal close from the client.
    let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .unwrap();
    assert!(matches!(frame, Some(Ok(Message::Close(_))) | None | Some(Err(_))));

    let again = tokio::time::timeout(Duration::from_millis(300), sockets.recv()).await;
    assert!(again.is_err(), "client reconnected after disconnect()");
    assert!(client.url().is_none());
}

// ── Heartbeat ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_unanswered_pings_force_reconnect() {
    let (url, mut sockets) = spawn_server().await;
    let client = WebSocketClient::new(ReconnectConfig {
        heartbeat_interval: Duration::from_millis(30),
        max_missed_pongs: 2,
        ..fast_config()
    });

    client.connect(url).unwrap();
    let mut silent = next_socket(&mut sockets).await;

    // Drain pings without answering.
    let drained = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&drained);
    tokio::spawn(async move {
        while let Some(Ok(frame)) = silent.next().await {
            if let Message::Text(text) = frame {
                sink.lock().unwrap().push(text.to_string());
            }
        }
    });

    let _replacement = next_socket(&mut sockets).await;

    let pings = drained.lock().unwrap().clone();
    assert!(!pings.is_empty(), "expected pings before the reconnect");
    assert!(pings.iter().all(|p| p.contains(r#""type":"ping""#)));
    client.disconnect();
}

#[tokio::test]
async fn test_answered_pings_keep_connection() {
    let (url, mut sockets) = spawn_server().await;
    let client = WebSocketClient::new(ReconnectConfig {
        heartbeat_interval: Duration::from_millis(30),
        max_missed_pongs: 2,
        ..fast_config()
    });

    client.connect(url).unwrap();
    let mut socket = next_socket(&mut sockets).await;

    tokio::spawn(async move {
        while let Some(Ok(frame)) = socket.next().await {
            if matches!(frame, Message::Text(_)) {
                let pong = r#"{"type":"pong","ts":1700000000000}"#;
                if socket.send(Message::Text(pong.into())).await.is_err() {
                    break;
                }
            }
        }
    });

    let again = tokio::time::timeout(Duration::from_millis(400), sockets.recv()).await;
    assert!(again.is_err(), "answered heartbeat should not reconnect");
    assert!(client.is_connected());
    assert!(client.status().borrow().last_ping.is_some());
    client.disconnect();
}

// ── Dispatch over the wire ──────────────────────────────────────────

#[tokio::test]
async fn test_server_push_reaches_handler_and_subscribers() {
    let (url, mut sockets) = spawn_server().await;
    let client = WebSocketClient::new(fast_config());
    let mut status = client.status();
    let mut events = client.subscribe();

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    client.on_message(MessageKind::ZoneState, move |msg| {
        seen_tx.send(msg.clone()).unwrap();
    });

    client.connect(url).unwrap();
    let mut socket = next_socket(&mut sockets).await;
    wait_status(&mut status, |s| s.is_connected).await;

    let frame = r#"{"type":"zone_state","data":{"status":"activated","zone":"Zone A","windDirection":"N"}}"#;
    socket.send(Message::Text(frame.into())).await.unwrap();

    let via_handler = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let InboundMessage::ZoneState(zone) = via_handler else {
        panic!("expected zone_state, got {via_handler:?}");
    };
    assert_eq!(zone.status, ZoneStatus::Activated);
    assert_eq!(zone.zone.as_deref(), Some("Zone A"));

    let via_broadcast = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(via_broadcast.kind(), MessageKind::ZoneState);
    client.disconnect();
}

#[tokio::test]
async fn test_send_reaches_server_while_connected() {
    let (url, mut sockets) = spawn_server().await;
    let client = WebSocketClient::new(fast_config());
    let mut status = client.status();

    client.connect(url).unwrap();
    let mut socket = next_socket(&mut sockets).await;
    wait_status(&mut status, |s| s.is_connected).await;

    client
        .send(&serde_json::json!({ "type": "subscribe", "topic": "lamps" }))
        .unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Message::Text(text) = frame else {
        panic!("expected text frame, got {frame:?}");
    };
    assert!(text.as_str().contains("subscribe"));
    client.disconnect();
}

// ── Transport settings ──────────────────────────────────────────────

#[tokio::test]
async fn test_upgrade_request_carries_bearer_token() {
    use secrecy::SecretString;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    use guidelight_api::TransportConfig;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (header_tx, mut header_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = move |request: &Request, response: Response| {
            let authorization = request
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            header_tx.send(authorization).unwrap();
            Ok::<_, ErrorResponse>(response)
        };
        let _socket = tokio_tungstenite::accept_hdr_async(stream, callback).await.unwrap();
        std::future::pending::<()>().await;
    });

    let transport = TransportConfig::default().with_api_token(SecretString::from("lab-token".to_string()));
    let client = WebSocketClient::with_transport(fast_config(), &transport).unwrap();
    let mut status = client.status();
    client
        .connect(Url::parse(&format!("ws://{addr}/ws")).unwrap())
        .unwrap();

    let authorization = tokio::time::timeout(Duration::from_secs(5), header_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(authorization.as_deref(), Some("Bearer lab-token"));
    wait_status(&mut status, |s| s.is_connected).await;
    client.disconnect();
}

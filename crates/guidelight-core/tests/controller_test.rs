#![allow(clippy::unwrap_used)]
// End-to-end tests for `SyncController`: an in-process WebSocket server
// for push traffic and wiremock for the REST side.

use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use url::Url;
use wiremock::http::Method;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use guidelight_core::alarm::{
    AudioEngine, LocalCoordinator, MemorySuppressionStore, SampleEngine, SuppressionStore,
};
use guidelight_core::{
    AlarmCoordinator, AlarmSettings, ConnectionState, CoreError, IssueOutcome, LampState,
    Notification, ReconnectConfig, SyncConfig, SyncController,
};

// ── Helpers ─────────────────────────────────────────────────────────

type ServerSocket = WebSocketStream<TcpStream>;

async fn spawn_ws_server() -> (Url, mpsc::UnboundedReceiver<ServerSocket>) {
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

    (Url::parse(&format!("ws://{addr}/ws")).unwrap(), rx)
}

async fn next_socket(rx: &mut mpsc::UnboundedReceiver<ServerSocket>) -> ServerSocket {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("controller did not connect in time")
        .unwrap()
}

async fn push(socket: &mut ServerSocket, value: serde_json::Value) {
    socket.send(Message::Text(value.to_string().into())).await.unwrap();
}

async fn wait_for<T>(rx: &mut watch::Receiver<T>, pred: impl FnMut(&T) -> bool) {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
        .await
        .expect("condition not reached in time")
        .unwrap();
}

/// HTTP mock that reports no emergency.
async fn backend() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/emergency/state"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "isActivated": false })))
        .mount(&server)
        .await;
    server
}

struct Harness {
    controller: SyncController,
    store: Arc<MemorySuppressionStore>,
    engine: Arc<SampleEngine>,
}

fn harness(http: &MockServer, ws_url: Url) -> Harness {
    harness_with(http, ws_url, |_| {})
}

fn harness_with(http: &MockServer, ws_url: Url, tweak: impl FnOnce(&mut SyncConfig)) -> Harness {
    let mut config = SyncConfig::new(Url::parse(&http.uri()).unwrap());
    config.ws_url = Some(ws_url);
    config.reconnect = ReconnectConfig {
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        heartbeat_interval: Duration::from_secs(60),
        ..ReconnectConfig::default()
    };
    config.poll_interval = Duration::from_secs(60);
    tweak(&mut config);

    let store = Arc::new(MemorySuppressionStore::new());
    let engine = Arc::new(SampleEngine::siren(8_000, Duration::from_millis(250)));
    let alarm = AlarmCoordinator::new(
        AlarmSettings::default(),
        Arc::new(LocalCoordinator::new()),
        Arc::clone(&engine) as Arc<dyn AudioEngine>,
        Arc::clone(&store) as Arc<dyn SuppressionStore>,
    );
    let controller = SyncController::new(config, alarm).unwrap();
    Harness {
        controller,
        store,
        engine,
    }
}

// ── Zone + alarm ────────────────────────────────────────────────────

#[tokio::test]
async fn test_push_activation_sounds_alarm_and_clear_resets_suppression() {
    let http = backend().await;

    let (ws_url, mut sockets) = spawn_ws_server().await;
    let Harness {
        controller,
        store,
        engine,
    } = harness(&http, ws_url);
    controller.start().unwrap();
    let mut socket = next_socket(&mut sockets).await;

    push(
        &mut socket,
        json!({
            "type": "state_sync",
            "isActivated": true,
            "zoneName": "Zone A",
            "windDirection": "N-S",
            "seq": 1
        }),
    )
    .await;

    let mut zone = controller.zone();
    wait_for(&mut zone, |z| z.is_emergency_active).await;
    let snapshot = controller.zone_snapshot();
    assert_eq!(snapshot.active_zone.as_deref(), Some("Zone A"));
    assert_eq!(snapshot.wind_direction, "N-S");

    let mut alarm = controller.alarm().subscribe();
    wait_for(&mut alarm, |a| a.is_playing).await;
    assert!(engine.is_playing());

    controller.acknowledge_alarm().unwrap();
    assert!(!engine.is_playing());
    assert!(store.suppressed_until().unwrap().is_some());

    // A newer sequence clears immediately, race window or not.
    push(
        &mut socket,
        json!({ "type": "zone_state", "status": "cleared", "zone": "Zone A", "seq": 2 }),
    )
    .await;

    wait_for(&mut zone, |z| !z.is_emergency_active).await;
    wait_for(&mut alarm, |a| !a.is_active && !a.suppressed).await;
    assert_eq!(store.suppressed_until().unwrap(), None);

    // Display-only: zone pushes never issue a command of any kind.
    let posts: Vec<String> = http
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|request| request.method == Method::POST)
        .map(|request| request.url.path().to_owned())
        .collect();
    assert!(posts.is_empty(), "zone pushes issued commands: {posts:?}");

    controller.shutdown();
}

#[tokio::test]
async fn test_start_after_shutdown_is_rejected() {
    let http = backend().await;
    let (ws_url, mut sockets) = spawn_ws_server().await;
    let Harness { controller, .. } = harness(&http, ws_url);

    controller.start().unwrap();
    let _socket = next_socket(&mut sockets).await;
    controller.shutdown();
    assert!(controller.is_shut_down());

    assert!(matches!(controller.start(), Err(CoreError::SessionClosed)));
    assert_eq!(*controller.connection_state().borrow(), ConnectionState::Disconnected);
    let again = tokio::time::timeout(Duration::from_millis(200), sockets.recv()).await;
    assert!(again.is_err(), "a shut-down controller reconnected");
}

#[tokio::test]
async fn test_deactivating_survives_inactive_poll_until_cleared() {
    let http = backend().await;
    let (ws_url, mut sockets) = spawn_ws_server().await;
    let Harness { controller, .. } = harness_with(&http, ws_url, |config| {
        config.poll_interval = Duration::from_millis(25);
        // Stay disconnected long enough for a few polls.
        config.reconnect.initial_delay = Duration::from_millis(400);
        config.reconnect.max_delay = Duration::from_millis(400);
    });
    controller.start().unwrap();
    let mut socket = next_socket(&mut sockets).await;

    push(
        &mut socket,
        json!({
            "type": "zone_state",
            "status": "activated",
            "zone": "Zone B",
            "windDirection": "E-W",
            "seq": 1
        }),
    )
    .await;
    let mut zone = controller.zone();
    wait_for(&mut zone, |z| z.is_emergency_active).await;

    push(&mut socket, json!({ "type": "zone_state", "status": "deactivating", "zone": "Zone B" })).await;
    wait_for(&mut zone, |z| z.deactivation_in_progress).await;

    // The socket drops; the fallback poll reads "inactive" but must not end it.
    drop(socket);
    let mut state = controller.connection_state();
    wait_for(&mut state, |s| *s != ConnectionState::Connected).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(http.received_requests().await.unwrap().len() > 1);
    let snapshot = controller.zone_snapshot();
    assert!(snapshot.is_emergency_active);
    assert!(snapshot.deactivation_in_progress);

    // Reconnected: the terminal signal ends it.
    let mut socket = next_socket(&mut sockets).await;
    push(
        &mut socket,
        json!({ "type": "state_sync", "isActivated": false, "deactivationInProgress": false, "seq": 3 }),
    )
    .await;
    wait_for(&mut zone, |z| !z.is_emergency_active && !z.deactivation_in_progress).await;

    controller.shutdown();
}

// ── Commands ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_pushed_failure_rolls_back_acked_lamp() {
    let http = backend().await;
    Mock::given(method("POST"))
        .and(path("/api/lamps/4/control"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .expect(1)
        .mount(&http)
        .await;

    let (ws_url, mut sockets) = spawn_ws_server().await;
    let Harness { controller, .. } = harness(&http, ws_url);
    controller.start().unwrap();
    let mut socket = next_socket(&mut sockets).await;
    let mut notifications = controller.notifications();

    let outcome = controller.issue_command(4, LampState::On).await.unwrap();
    assert!(matches!(outcome, IssueOutcome::Accepted(_)));
    assert_eq!(controller.lamp_state(4), Some(LampState::On));

    push(
        &mut socket,
        json!({
            "type": "command_status",
            "scope": "default",
            "device_id": 4,
            "cmd": "on",
            "state": "failed"
        }),
    )
    .await;

    let notification = tokio::time::timeout(Duration::from_secs(5), notifications.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(notification, Notification::CommandFailed { target_id: 4, .. }));
    assert_eq!(controller.lamp_state(4), None);

    controller.shutdown();
}

// ── Side channels ───────────────────────────────────────────────────

#[tokio::test]
async fn test_gateway_weather_and_lamp_updates_are_exposed() {
    let http = backend().await;
    let (ws_url, mut sockets) = spawn_ws_server().await;
    let Harness { controller, .. } = harness(&http, ws_url);
    controller.start().unwrap();
    let mut socket = next_socket(&mut sockets).await;
    let mut invalidations = controller.invalidations();

    push(&mut socket, json!({ "type": "gateway_status", "online": true, "lamps": 12 })).await;
    push(&mut socket, json!({ "type": "weather_update", "data": { "windSpeed": 7.5 } })).await;
    push(&mut socket, json!({ "type": "lamp_update", "lampId": 9, "state": "off" })).await;

    let mut gateway = controller.gateway_status();
    wait_for(&mut gateway, |g| g.as_ref().is_some_and(|g| g.online)).await;

    let mut weather = controller.latest_weather();
    wait_for(&mut weather, Option::is_some).await;
    let wind_speed = weather
        .borrow()
        .as_ref()
        .and_then(|w| w.get("windSpeed"))
        .and_then(serde_json::Value::as_f64);
    assert_eq!(wind_speed, Some(7.5));

    let invalidation = tokio::time::timeout(Duration::from_secs(5), invalidations.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(invalidation, guidelight_core::Invalidation::Lamps);

    controller.shutdown();
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_fallback_refused_while_connected_and_shutdown_disconnects() {
    let http = backend().await;
    let (ws_url, mut sockets) = spawn_ws_server().await;
    let Harness { controller, .. } = harness(&http, ws_url);
    controller.start().unwrap();
    let _socket = next_socket(&mut sockets).await;

    let mut state = controller.connection_state();
    wait_for(&mut state, |s| *s == ConnectionState::Connected).await;

    let err = controller.activate_emergency("Zone A", "N-S").await.unwrap_err();
    assert!(matches!(err, CoreError::PushChannelHealthy { .. }));

    controller.shutdown();
    assert_eq!(*controller.connection_state().borrow(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_fallback_activation_applies_locally_when_disconnected() {
    let http = backend().await;
    Mock::given(method("POST"))
        .and(path("/api/emergency/activate"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&http)
        .await;

    // Nothing listens here, so the socket never connects.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = Url::parse(&format!("ws://{}/ws", listener.local_addr().unwrap())).unwrap();
    drop(listener);

    let Harness { controller, .. } = harness(&http, dead);
    controller.start().unwrap();

    controller.activate_emergency("Zone C", "S-N").await.unwrap();
    let snapshot = controller.zone_snapshot();
    assert!(snapshot.is_emergency_active);
    assert_eq!(snapshot.active_zone.as_deref(), Some("Zone C"));

    controller.shutdown();
}

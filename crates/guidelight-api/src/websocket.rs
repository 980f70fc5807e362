//! WebSocket transport with auto-reconnect and heartbeat.
//!
//! Maintains one logical connection to the backend, parses every text
//! frame into a typed [`InboundMessage`], and hands it to the handler
//! registered for its [`MessageKind`]. Reconnects with capped exponential
//! backoff for as long as the client is not explicitly disconnected.
//!
//! # Example
//!
//! ```rust,ignore
//! use guidelight_api::websocket::{ReconnectConfig, WebSocketClient};
//! use guidelight_api::messages::{InboundMessage, MessageKind};
//! use url::Url;
//!
//! let client = WebSocketClient::new(ReconnectConfig::default());
//! client.on_message(MessageKind::ZoneState, |msg| {
//!     if let InboundMessage::ZoneState(zone) = msg {
//!         println!("zone {:?} -> {}", zone.zone, zone.status);
//!     }
//! });
//! client.connect(Url::parse("wss://guidance.example/ws")?)?;
//! // ...
//! client.disconnect();
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::Connector;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::http::uri::InvalidUri;
use tokio_tungstenite::tungstenite::{ClientRequestBuilder, Message};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Error;
use crate::messages::{self, Decoded, InboundMessage, MessageKind, OutboundMessage};
use crate::transport::TransportConfig;

// ── Broadcast channel capacity ───────────────────────────────────────

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Close code for an intentional, orderly shutdown.
const NORMAL_CLOSE: u16 = 1000;

// ── ReconnectConfig ──────────────────────────────────────────────────

/// Backoff and heartbeat tuning for the WebSocket connection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Growth factor between consecutive delays. Default: 1.5.
    pub multiplier: f64,

    /// Interval between `ping` frames. Default: 25s.
    pub heartbeat_interval: Duration,

    /// Unanswered pings tolerated before the connection is declared dead.
    /// Default: 3.
    pub max_missed_pongs: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 1.5,
            heartbeat_interval: Duration::from_secs(25),
            max_missed_pongs: 3,
        }
    }
}

// ── Backoff ──────────────────────────────────────────────────────────

/// Multiplicative backoff, capped, with no retry limit.
///
/// `next_delay()` yields `initial, initial*m, initial*m^2, ...` clamped to
/// `max_delay`. `reset()` returns to the floor.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        let initial = config.initial_delay.min(config.max_delay);
        Self {
            initial,
            max: config.max_delay,
            multiplier: config.multiplier.max(1.0),
            current: initial,
            attempts: 0,
        }
    }

    /// Delay to wait before the next attempt; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.mul_f64(self.multiplier).min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    /// Reconnect attempts scheduled since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

// ── ConnectionStatus ─────────────────────────────────────────────────

/// Observable state of the logical connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub is_connected: bool,
    pub reconnect_attempts: u32,
    /// When the last heartbeat ping was written.
    pub last_ping: Option<DateTime<Utc>>,
}

pub type MessageHandler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;
pub type StatusCallback = Arc<dyn Fn(&ConnectionStatus) + Send + Sync>;

// ── WebSocketClient ──────────────────────────────────────────────────

/// Handle to the backend WebSocket.
///
/// Cheaply cloneable; all clones drive the same connection. The
/// background task keeps running until [`disconnect`](Self::disconnect).
#[derive(Clone)]
pub struct WebSocketClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ReconnectConfig,
    handshake: Handshake,
    /// One handler per kind; the last registration wins.
    handlers: DashMap<MessageKind, MessageHandler>,
    status_callback: Mutex<Option<StatusCallback>>,
    status: watch::Sender<ConnectionStatus>,
    event_tx: broadcast::Sender<Arc<InboundMessage>>,
    /// Writer queue of the live connection, `None` between connections.
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    session: Mutex<Option<Session>>,
}

struct Session {
    url: Url,
    cancel: CancellationToken,
}

/// Upgrade-request settings taken from the shared [`TransportConfig`].
#[derive(Default)]
struct Handshake {
    authorization: Option<SecretString>,
    /// `None` keeps tungstenite's default TLS setup.
    connector: Option<Connector>,
}

impl WebSocketClient {
    /// Client with no bearer token and default TLS.
    pub fn new(config: ReconnectConfig) -> Self {
        Self::build(config, Handshake::default())
    }

    /// Client whose upgrade request carries the transport's bearer token
    /// and TLS mode.
    pub fn with_transport(config: ReconnectConfig, transport: &TransportConfig) -> Result<Self, Error> {
        let handshake = Handshake {
            authorization: transport.authorization()?,
            connector: transport.websocket_connector()?,
        };
        Ok(Self::build(config, handshake))
    }

    fn build(config: ReconnectConfig, handshake: Handshake) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::default());
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(ClientInner {
                config,
                handshake,
                handlers: DashMap::new(),
                status_callback: Mutex::new(None),
                status,
                event_tx,
                outbound: Mutex::new(None),
                session: Mutex::new(None),
            }),
        }
    }

    /// Start the connection loop against `url`.
    ///
    /// Returns once the background task is spawned. Every reconnect reuses
    /// this exact URL. Calling `connect` again replaces the previous session.
    pub fn connect(&self, url: Url) -> Result<(), Error> {
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(Error::UnsupportedScheme {
                    scheme: other.to_owned(),
                    expected: "ws or wss",
                });
            }
        }

        let cancel = CancellationToken::new();
        let previous = lock(&self.inner.session).replace(Session {
            url: url.clone(),
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            tracing::debug!(url = %previous.url, "replacing existing WebSocket session");
            previous.cancel.cancel();
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            ws_loop(inner, url, cancel).await;
        });
        Ok(())
    }

    /// Serialize `message` as JSON and queue it on the live connection.
    pub fn send<T: Serialize>(&self, message: &T) -> Result<(), Error> {
        let text = serde_json::to_string(message).map_err(|e| Error::WebSocketSend(e.to_string()))?;
        let guard = lock(&self.inner.outbound);
        let Some(tx) = guard.as_ref() else {
            return Err(Error::NotConnected);
        };
        tx.send(Message::Text(text.into()))
            .map_err(|e| Error::WebSocketSend(e.to_string()))
    }

    /// Register the handler for `kind`, replacing any previous one.
    ///
    /// `pong` handlers are never invoked; pongs are consumed internally.
    pub fn on_message<F>(&self, kind: MessageKind, handler: F)
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        if self.inner.handlers.insert(kind, Arc::new(handler)).is_some() {
            tracing::debug!(msg_type = %kind, "replaced message handler");
        }
    }

    /// Register the connection status callback, replacing any previous one.
    pub fn on_connection_status_change<F>(&self, callback: F)
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        *lock(&self.inner.status_callback) = Some(Arc::new(callback));
    }

    /// Every dispatched message, for in-crate fan-out.
    ///
    /// If a consumer falls behind, it receives
    /// [`broadcast::error::RecvError::Lagged`].
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<InboundMessage>> {
        self.inner.event_tx.subscribe()
    }

    /// Watch the connection status.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.status.borrow().is_connected
    }

    /// URL of the current session, if any.
    pub fn url(&self) -> Option<Url> {
        lock(&self.inner.session).as_ref().map(|s| s.url.clone())
    }

    /// Close the connection. No reconnect follows.
    pub fn disconnect(&self) {
        if let Some(session) = lock(&self.inner.session).take() {
            tracing::info!(url = %session.url, "disconnecting WebSocket");
            session.cancel.cancel();
        }
        self.inner.install_outbound(None);
        self.inner.update_status(|s| {
            s.is_connected = false;
            s.reconnect_attempts = 0;
        });
    }

    /// Feed one raw text frame through the dispatch path.
    ///
    /// Returns the kind that was recognised, including `pong`.
    #[doc(hidden)]
    pub fn dispatch_text(&self, text: &str) -> Option<MessageKind> {
        self.inner.dispatch(text)
    }
}

impl ClientInner {
    fn dispatch(&self, text: &str) -> Option<MessageKind> {
        let message = match messages::decode(text) {
            Ok(Decoded::Message(m)) => m,
            Ok(Decoded::Unknown(msg_type)) => {
                tracing::warn!(msg_type, "dropping message of unknown type");
                return None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable WebSocket frame");
                return None;
            }
        };

        let kind = message.kind();
        if kind == MessageKind::Pong {
            tracing::trace!("pong received");
            return Some(kind);
        }

        let message = Arc::new(message);
        // Clone the handler out so it can re-register without deadlocking the map.
        let handler = self.handlers.get(&kind).map(|h| Arc::clone(h.value()));
        match handler {
            Some(handler) => {
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handler(message.as_ref())));
                if outcome.is_err() {
                    tracing::error!(msg_type = %kind, "message handler panicked");
                }
            }
            None => tracing::trace!(msg_type = %kind, "no handler registered"),
        }

        // No receivers is fine.
        let _ = self.event_tx.send(message);
        Some(kind)
    }

    fn update_status(&self, f: impl FnOnce(&mut ConnectionStatus)) {
        let mut snapshot = None;
        self.status.send_if_modified(|status| {
            let before = status.clone();
            f(status);
            let changed = before.is_connected != status.is_connected
                || before.reconnect_attempts != status.reconnect_attempts;
            if changed {
                snapshot = Some(status.clone());
            }
            changed
        });

        if let Some(status) = snapshot {
            let callback = lock(&self.status_callback).clone();
            if let Some(callback) = callback {
                callback(&status);
            }
        }
    }

    fn record_ping(&self) {
        // Heartbeat bookkeeping does not wake watchers.
        self.status.send_if_modified(|s| {
            s.last_ping = Some(Utc::now());
            false
        });
    }

    fn install_outbound(&self, tx: Option<mpsc::UnboundedSender<Message>>) {
        *lock(&self.outbound) = tx;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Background reconnection loop ─────────────────────────────────────

/// Why a single connection ended.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    /// `disconnect()` was called.
    Cancelled,
    /// Peer closed with code 1000.
    NormalClose,
    /// Peer closed with any other code, or the stream ended.
    Dropped { code: Option<u16> },
}

/// Main loop: connect → read → on drop, backoff → reconnect.
async fn ws_loop(inner: Arc<ClientInner>, url: Url, cancel: CancellationToken) {
    let mut backoff = Backoff::new(&inner.config);

    loop {
        let result = connect_and_read(&inner, &url, &cancel, &mut backoff).await;
        if cancel.is_cancelled() {
            // Status now belongs to `disconnect()` or the replacing session.
            break;
        }
        inner.install_outbound(None);
        inner.update_status(|s| s.is_connected = false);

        match result {
            Ok(SessionEnd::Cancelled) => break,
            Ok(SessionEnd::NormalClose) => {
                tracing::info!(url = %url, "WebSocket closed normally, not reconnecting");
                break;
            }
            Ok(SessionEnd::Dropped { code }) => {
                tracing::warn!(url = %url, ?code, "WebSocket dropped");
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, attempt = backoff.attempts(), "WebSocket error");
            }
        }

        let delay = backoff.next_delay();
        let attempt = backoff.attempts();
        inner.update_status(|s| s.reconnect_attempts = attempt);
        tracing::info!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            attempt,
            "Waiting before reconnect"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    tracing::debug!(url = %url, "WebSocket loop exiting");
}

// ── Single connection lifecycle ──────────────────────────────────────

/// Establish a single WebSocket connection and pump it until it ends.
async fn connect_and_read(
    inner: &ClientInner,
    url: &Url,
    cancel: &CancellationToken,
    backoff: &mut Backoff,
) -> Result<SessionEnd, Error> {
    tracing::info!(url = %url, "Connecting to WebSocket");

    let uri: Uri = url
        .as_str()
        .parse()
        .map_err(|e: InvalidUri| Error::WebSocketConnect(e.to_string()))?;
    let mut request = ClientRequestBuilder::new(uri);
    if let Some(ref authorization) = inner.handshake.authorization {
        request = request.with_header("Authorization", authorization.expose_secret());
    }

    let connected = tokio::select! {
        biased;
        () = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
        r = tokio_tungstenite::connect_async_tls_with_config(
            request,
            None,
            false,
            inner.handshake.connector.clone(),
        ) => r,
    };
    let (ws_stream, _response) = connected.map_err(|e| Error::WebSocketConnect(e.to_string()))?;

    backoff.reset();
    tracing::info!(url = %url, "WebSocket connected");

    let (mut write, mut read) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    inner.install_outbound(Some(out_tx));
    inner.update_status(|s| {
        s.is_connected = true;
        s.reconnect_attempts = 0;
    });

    let period = inner.config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut missed: u32 = 0;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client disconnect".into(),
                };
                if let Err(e) = write.send(Message::Close(Some(frame))).await {
                    tracing::debug!(error = %e, "close frame not delivered");
                }
                return Ok(SessionEnd::Cancelled);
            }
            _ = heartbeat.tick() => {
                if missed >= inner.config.max_missed_pongs {
                    return Err(Error::HeartbeatLost { missed });
                }
                let ping = serde_json::to_string(&OutboundMessage::ping())
                    .map_err(|e| Error::WebSocketSend(e.to_string()))?;
                write
                    .send(Message::Text(ping.into()))
                    .await
                    .map_err(|e| Error::WebSocketSend(e.to_string()))?;
                missed += 1;
                inner.record_ping();
            }
            Some(outgoing) = out_rx.recv() => {
                write
                    .send(outgoing)
                    .await
                    .map_err(|e| Error::WebSocketSend(e.to_string()))?;
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if inner.dispatch(text.as_str()) == Some(MessageKind::Pong) {
                            missed = 0;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        missed = 0;
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // tungstenite queues the pong reply itself
                        tracing::trace!("WebSocket ping");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.as_ref().map(|cf| u16::from(cf.code));
                        if let Some(ref cf) = frame {
                            tracing::info!(
                                code = %cf.code,
                                reason = %cf.reason,
                                "WebSocket close frame received"
                            );
                        } else {
                            tracing::info!("WebSocket close frame received (no payload)");
                        }
                        return Ok(if code == Some(NORMAL_CLOSE) {
                            SessionEnd::NormalClose
                        } else {
                            SessionEnd::Dropped { code }
                        });
                    }
                    Some(Err(e)) => {
                        return Err(Error::WebSocketConnect(e.to_string()));
                    }
                    None => {
                        tracing::info!("WebSocket stream ended");
                        return Ok(SessionEnd::Dropped { code: None });
                    }
                    Some(Ok(_)) => {
                        // Binary, raw Frame -- ignore
                    }
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn ms(d: Duration) -> u128 {
        d.as_millis()
    }

    #[test]
    fn default_reconnect_config() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(25));
        assert_eq!(config.max_missed_pongs, 3);
    }

    #[test]
    fn backoff_grows_by_half_each_step() {
        let mut backoff = Backoff::new(&ReconnectConfig::default());
        let delays: Vec<u128> = (0..5).map(|_| ms(backoff.next_delay())).collect();
        assert_eq!(delays, vec![1000, 1500, 2250, 3375, 5062]);
        assert_eq!(backoff.attempts(), 5);
    }

    #[test]
    fn backoff_caps_at_max_delay_forever() {
        let mut backoff = Backoff::new(&ReconnectConfig::default());
        let delays: Vec<Duration> = (0..200).map(|_| backoff.next_delay()).collect();
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(30)));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(30));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn backoff_reset_returns_to_floor() {
        let mut backoff = Backoff::new(&ReconnectConfig::default());
        for _ in 0..10 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn last_registered_handler_wins() {
        let client = WebSocketClient::new(ReconnectConfig::default());
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&first);
        client.on_message(MessageKind::ZoneState, move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let s = Arc::clone(&second);
        client.on_message(MessageKind::ZoneState, move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        let kind = client.dispatch_text(r#"{"type":"zone_state","status":"cleared"}"#);
        assert_eq!(kind, Some(MessageKind::ZoneState));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pong_is_never_forwarded() {
        let client = WebSocketClient::new(ReconnectConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        client.on_message(MessageKind::Pong, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let mut rx = client.subscribe();

        assert_eq!(client.dispatch_text(r#"{"type":"pong"}"#), Some(MessageKind::Pong));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unknown_and_malformed_frames_are_dropped() {
        let client = WebSocketClient::new(ReconnectConfig::default());
        let mut rx = client.subscribe();

        assert_eq!(client.dispatch_text(r#"{"type":"mystery"}"#), None);
        assert_eq!(client.dispatch_text("{{{"), None);
        assert!(rx.try_recv().is_err());

        // The dispatch path still works afterwards.
        assert_eq!(
            client.dispatch_text(r#"{"type":"gateway_status","online":true}"#),
            Some(MessageKind::GatewayStatus)
        );
        assert_eq!(rx.try_recv().unwrap().kind(), MessageKind::GatewayStatus);
    }

    #[test]
    fn panicking_handler_does_not_break_dispatch() {
        let client = WebSocketClient::new(ReconnectConfig::default());
        client.on_message(MessageKind::LampUpdate, |_| panic!("handler bug"));
        let mut rx = client.subscribe();

        assert_eq!(
            client.dispatch_text(r#"{"type":"lamp_update","lamp_id":4}"#),
            Some(MessageKind::LampUpdate)
        );
        assert_eq!(rx.try_recv().unwrap().kind(), MessageKind::LampUpdate);
    }

    #[test]
    fn send_without_connection_fails() {
        let client = WebSocketClient::new(ReconnectConfig::default());
        assert!(matches!(
            client.send(&OutboundMessage::ping()),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn connect_rejects_http_urls() {
        let client = WebSocketClient::new(ReconnectConfig::default());
        let result = client.connect(Url::parse("http://example.test/ws").unwrap());
        assert!(matches!(result, Err(Error::UnsupportedScheme { .. })));
        assert!(client.url().is_none());
    }

    #[test]
    fn status_callback_fires_on_transitions_only() {
        let client = WebSocketClient::new(ReconnectConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        client.on_connection_status_change(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        client.inner.update_status(|s| s.is_connected = true);
        client.inner.record_ping();
        client.inner.update_status(|s| s.is_connected = true);
        client.inner.update_status(|s| s.reconnect_attempts = 2);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(client.status().borrow().last_ping.is_some());
    }
}

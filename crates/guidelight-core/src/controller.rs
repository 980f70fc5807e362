// ── Sync controller ──
//
// Wires one backend session together: WebSocket transport feeding zone
// state and the command tracker, fallback polling while the socket is
// down, and the alarm coordinator driven by zone transitions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use guidelight_api::{
    ConnectionStatus, GatewayStatus, HttpClient, InboundMessage, LampState, MessageKind, WebSocketClient,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alarm::{AlarmCoordinator, PlayOutcome};
use crate::command::{CommandRecord, CommandTracker, IssueOutcome};
use crate::config::SyncConfig;
use crate::error::CoreError;
use crate::event::{Invalidation, Notification};
use crate::fallback::FallbackSync;
use crate::zone::{ZoneActivation, ZoneActivationState, ZoneTransition};

const INVALIDATION_CHANNEL_SIZE: usize = 64;

// ── ConnectionState ──────────────────────────────────────────────────

/// Push channel state as seen by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

impl ConnectionState {
    fn from_status(status: &ConnectionStatus) -> Self {
        if status.is_connected {
            Self::Connected
        } else if status.reconnect_attempts == 0 {
            Self::Connecting
        } else {
            Self::Reconnecting {
                attempt: status.reconnect_attempts,
            }
        }
    }
}

// ── SyncController ───────────────────────────────────────────────────

/// Entry point for consumers.
///
/// Cheaply cloneable via `Arc<ControllerInner>`. Construct with
/// [`new`](Self::new), then [`start`](Self::start) to connect and spawn
/// background tasks.
#[derive(Clone)]
pub struct SyncController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    config: SyncConfig,
    ws: WebSocketClient,
    zone: Arc<ZoneActivation>,
    tracker: CommandTracker<HttpClient>,
    alarm: AlarmCoordinator,
    fallback: FallbackSync,
    connection_state: watch::Sender<ConnectionState>,
    gateway_status: watch::Sender<Option<GatewayStatus>>,
    weather: watch::Sender<Option<serde_json::Value>>,
    invalidations: broadcast::Sender<Invalidation>,
    /// Cancelled on shutdown, replaced on the next start.
    cancel: Mutex<CancellationToken>,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
    /// Set by `shutdown`; the tracker and alarm cannot be revived.
    shut_down: AtomicBool,
}

impl SyncController {
    /// Build every component. Does NOT connect.
    pub fn new(config: SyncConfig, alarm: AlarmCoordinator) -> Result<Self, CoreError> {
        let http = HttpClient::new(config.http_url.clone(), &config.transport)?;
        let ws = WebSocketClient::with_transport(config.reconnect.clone(), &config.transport)?;
        let zone = Arc::new(ZoneActivation::new(config.zone.clone()));
        let tracker = CommandTracker::new(
            http.clone(),
            config.commands.clone(),
            zone.subscribe(),
            config.scope.clone(),
        );
        let fallback = FallbackSync::new(http, config.poll_interval, ws.status());

        let (connection_state, _) = watch::channel(ConnectionState::Disconnected);
        let (gateway_status, _) = watch::channel(None);
        let (weather, _) = watch::channel(None);
        let (invalidations, _) = broadcast::channel(INVALIDATION_CHANNEL_SIZE);

        Ok(Self {
            inner: Arc::new(ControllerInner {
                config,
                ws,
                zone,
                tracker,
                alarm,
                fallback,
                connection_state,
                gateway_status,
                weather,
                invalidations,
                cancel: Mutex::new(CancellationToken::new()),
                task_handles: Mutex::new(Vec::new()),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Connect the push channel and spawn polling and the alarm bridge.
    ///
    /// Returns once everything is spawned; the socket connects in the
    /// background. Calling `start` again restarts the session;
    /// [`shutdown`](Self::shutdown) is final and a later `start` fails with
    /// [`CoreError::SessionClosed`].
    pub fn start(&self) -> Result<(), CoreError> {
        if self.is_shut_down() {
            return Err(CoreError::SessionClosed);
        }
        let url = self.inner.config.websocket_url()?;
        self.stop_tasks();

        let cancel = CancellationToken::new();
        *lock(&self.inner.cancel) = cancel.clone();

        self.register_handlers();
        let state_tx = self.inner.connection_state.clone();
        self.inner.ws.on_connection_status_change(move |status| {
            state_tx.send_replace(ConnectionState::from_status(status));
        });
        self.inner.connection_state.send_replace(ConnectionState::Connecting);

        self.inner.ws.connect(url.clone())?;

        let zone = Arc::clone(&self.inner.zone);
        self.inner.fallback.start_polling(move |read| {
            let transition = zone.apply_poll_read(read);
            debug!(?transition, "applied fallback read");
        });

        let mut handles = lock(&self.inner.task_handles);
        handles.push(tokio::spawn(alarm_bridge(
            self.inner.zone.subscribe(),
            self.inner.alarm.clone(),
            cancel.clone(),
        )));
        handles.push(tokio::spawn(forward_invalidations(
            self.inner.zone.invalidations(),
            self.inner.invalidations.clone(),
            cancel,
        )));

        info!(url = %url, scope = %self.inner.tracker.scope(), "sync session started");
        Ok(())
    }

    /// Tear down the session: socket, polling, timers and local audio.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        self.stop_tasks();
        self.inner.fallback.stop_polling();
        self.inner.ws.disconnect();
        self.inner.tracker.shutdown();
        self.inner.alarm.shutdown();
        self.inner.connection_state.send_replace(ConnectionState::Disconnected);
        info!("sync session shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    fn stop_tasks(&self) {
        lock(&self.inner.cancel).cancel();
        for handle in lock(&self.inner.task_handles).drain(..) {
            handle.abort();
        }
    }

    fn register_handlers(&self) {
        let ws = &self.inner.ws;

        let zone = Arc::clone(&self.inner.zone);
        ws.on_message(MessageKind::StateSync, move |msg| {
            if let InboundMessage::StateSync(sync) = msg {
                log_transition("state_sync", zone.apply_state_sync(sync));
            }
        });

        let zone = Arc::clone(&self.inner.zone);
        ws.on_message(MessageKind::ZoneState, move |msg| {
            if let InboundMessage::ZoneState(update) = msg {
                log_transition("zone_state", zone.apply_zone_state(update));
            }
        });

        let tracker = self.inner.tracker.clone();
        ws.on_message(MessageKind::CommandStatus, move |msg| {
            if let InboundMessage::CommandStatus(status) = msg {
                tracker.apply_command_status(status);
            }
        });

        let gateway = self.inner.gateway_status.clone();
        ws.on_message(MessageKind::GatewayStatus, move |msg| {
            if let InboundMessage::GatewayStatus(status) = msg {
                gateway.send_replace(Some(status.clone()));
            }
        });

        let weather = self.inner.weather.clone();
        ws.on_message(MessageKind::WeatherUpdate, move |msg| {
            if let InboundMessage::WeatherUpdate(update) = msg {
                weather.send_replace(Some(update.clone()));
            }
        });

        let invalidations = self.inner.invalidations.clone();
        ws.on_message(MessageKind::LampUpdate, move |msg| {
            if let InboundMessage::LampUpdate(update) = msg {
                debug!(lamp_id = ?update.lamp_id, "lamp update, invalidating lamp view");
                let _ = invalidations.send(Invalidation::Lamps);
            }
        });
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Switch a lamp. See [`CommandTracker::issue`].
    pub async fn issue_command(&self, target_id: u32, desired_state: LampState) -> Result<IssueOutcome, CoreError> {
        self.inner.tracker.issue(target_id, desired_state).await
    }

    pub fn acknowledge_command_failure(&self, target_id: u32) -> bool {
        self.inner.tracker.acknowledge_failure(target_id)
    }

    pub fn set_scope(&self, scope: impl Into<String>) {
        self.inner.tracker.set_scope(scope);
    }

    /// Activate over HTTP while the push channel is down, then reflect
    /// the activation locally until the backend confirms it.
    pub async fn activate_emergency(&self, zone_name: &str, wind_direction: &str) -> Result<(), CoreError> {
        self.inner
            .fallback
            .activate_emergency(zone_name, wind_direction)
            .await?;
        self.inner.zone.apply_local_activation(zone_name, wind_direction);
        Ok(())
    }

    /// Request deactivation over HTTP while the push channel is down.
    pub async fn deactivate_emergency(&self) -> Result<(), CoreError> {
        self.inner.fallback.deactivate_emergency().await
    }

    /// Silence the alarm in every context for the configured duration.
    pub fn acknowledge_alarm(&self) -> Result<DateTime<Utc>, CoreError> {
        let duration = self.inner.alarm.settings().ack_duration;
        self.acknowledge_alarm_for(duration)
    }

    pub fn acknowledge_alarm_for(&self, duration: Duration) -> Result<DateTime<Utc>, CoreError> {
        self.inner.alarm.acknowledge(duration)
    }

    // ── Observation ──────────────────────────────────────────────────

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection_state.subscribe()
    }

    pub fn zone(&self) -> watch::Receiver<ZoneActivationState> {
        self.inner.zone.subscribe()
    }

    pub fn zone_snapshot(&self) -> ZoneActivationState {
        self.inner.zone.snapshot()
    }

    pub fn alarm(&self) -> &AlarmCoordinator {
        &self.inner.alarm
    }

    pub fn commands(&self) -> Vec<CommandRecord> {
        self.inner.tracker.records()
    }

    pub fn command_changes(&self) -> watch::Receiver<u64> {
        self.inner.tracker.changes()
    }

    pub fn lamp_state(&self, target_id: u32) -> Option<LampState> {
        self.inner.tracker.lamp_state(target_id)
    }

    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.tracker.notifications()
    }

    pub fn invalidations(&self) -> broadcast::Receiver<Invalidation> {
        self.inner.invalidations.subscribe()
    }

    pub fn gateway_status(&self) -> watch::Receiver<Option<GatewayStatus>> {
        self.inner.gateway_status.subscribe()
    }

    pub fn latest_weather(&self) -> watch::Receiver<Option<serde_json::Value>> {
        self.inner.weather.subscribe()
    }

    /// Raw transport status, including heartbeat timestamps.
    pub fn transport_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.ws.status()
    }
}

fn log_transition(source: &str, transition: ZoneTransition) {
    match transition {
        ZoneTransition::Unchanged => {}
        ZoneTransition::Discarded(reason) => {
            debug!(source, %reason, "discarded stale zone signal");
        }
        other => debug!(source, transition = ?other, "zone state changed"),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Background tasks ─────────────────────────────────────────────────

/// Drive the alarm from zone edges: sound on activation (or a switch to
/// another zone), silence and lift suppression once cleared.
async fn alarm_bridge(
    mut zone_rx: watch::Receiver<ZoneActivationState>,
    alarm: AlarmCoordinator,
    cancel: CancellationToken,
) {
    let mut sounding_for: Option<String> = None;

    loop {
        let (active, zone) = {
            let state = zone_rx.borrow_and_update();
            (state.is_emergency_active, state.active_zone.clone())
        };

        if active && sounding_for != zone {
            match alarm.play() {
                Ok(PlayOutcome::Suppressed) => info!(zone = ?zone, "emergency active, alarm suppressed"),
                Ok(outcome) => debug!(zone = ?zone, ?outcome, "alarm triggered by activation"),
                Err(e) => warn!(zone = ?zone, error = %e, "alarm could not start"),
            }
            sounding_for = zone;
        } else if !active && sounding_for.is_some() {
            alarm.stop();
            if let Err(e) = alarm.reset_suppression() {
                warn!(error = %e, "could not reset alarm suppression");
            }
            sounding_for = None;
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            changed = zone_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

async fn forward_invalidations(
    mut rx: broadcast::Receiver<Invalidation>,
    tx: broadcast::Sender<Invalidation>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = rx.recv() => match result {
                Ok(invalidation) => {
                    let _ = tx.send(invalidation);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "invalidation forwarder lagged, invalidating everything");
                    let _ = tx.send(Invalidation::Lamps);
                    let _ = tx.send(Invalidation::EventHistory);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_state_follows_transport_status() {
        let mut status = ConnectionStatus::default();
        assert_eq!(ConnectionState::from_status(&status), ConnectionState::Connecting);

        status.reconnect_attempts = 3;
        assert_eq!(
            ConnectionState::from_status(&status),
            ConnectionState::Reconnecting { attempt: 3 }
        );

        status.is_connected = true;
        assert_eq!(ConnectionState::from_status(&status), ConnectionState::Connected);
    }
}

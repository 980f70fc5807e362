// ── Alarm coordinator ──
//
// One instance per context. Audible effects need the named lock; the
// leader keeps its lease for as long as it plays. Every state change is
// broadcast so all contexts agree on the logical state, even though only
// the leader makes sound.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::audio::{AudioEngine, clamp_volume};
use super::bus::{AlarmBroadcast, AlarmCommand, Lease, SingletonResourceCoordinator};
use super::suppression::SuppressionStore;
use crate::config::AlarmSettings;
use crate::error::CoreError;

/// Per-context alarm state.
///
/// `is_playing` is true in at most one context, unless the lock backend
/// failed and contexts fell back to local playback.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmState {
    pub is_active: bool,
    pub is_playing: bool,
    pub is_ready: bool,
    pub volume: f32,
    pub suppressed: bool,
    pub suppressed_until: Option<DateTime<Utc>>,
}

/// What [`AlarmCoordinator::play`] did locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    /// This context took the lock and started the engine.
    Leader,
    /// Another context holds the lock; logical state only.
    Follower,
    /// The lock backend failed; playing without it.
    LocalFallback,
    AlreadyPlaying,
    /// Inside an acknowledged suppression window; nothing happened.
    Suppressed,
}

/// Cross-context alarm coordinator.
///
/// Cheaply cloneable. [`new`](Self::new) spawns a listener task and must
/// be called inside a Tokio runtime; [`shutdown`](Self::shutdown) stops it.
#[derive(Clone)]
pub struct AlarmCoordinator {
    inner: Arc<AlarmInner>,
}

struct AlarmInner {
    id: Uuid,
    settings: AlarmSettings,
    bus: Arc<dyn SingletonResourceCoordinator>,
    engine: Arc<dyn AudioEngine>,
    store: Arc<dyn SuppressionStore>,
    state: watch::Sender<AlarmState>,
    /// Held only while this context is the audio leader.
    lease: Mutex<Option<Lease>>,
    cancel: CancellationToken,
}

impl AlarmCoordinator {
    pub fn new(
        settings: AlarmSettings,
        bus: Arc<dyn SingletonResourceCoordinator>,
        engine: Arc<dyn AudioEngine>,
        store: Arc<dyn SuppressionStore>,
    ) -> Self {
        let volume = clamp_volume(settings.volume);
        engine.set_gain(volume);

        let suppressed_until = store.suppressed_until().unwrap_or_else(|e| {
            warn!(error = %e, "could not read suppression deadline");
            None
        });
        let (state, _) = watch::channel(AlarmState {
            is_active: false,
            is_playing: false,
            is_ready: engine.is_ready(),
            volume,
            suppressed: suppressed_until.is_some_and(|until| Utc::now() < until),
            suppressed_until,
        });

        let inner = Arc::new(AlarmInner {
            id: Uuid::new_v4(),
            settings,
            bus,
            engine,
            store,
            state,
            lease: Mutex::new(None),
            cancel: CancellationToken::new(),
        });

        let bus_rx = inner.bus.subscribe();
        let store_rx = inner.store.subscribe();
        tokio::spawn(listen(Arc::clone(&inner), bus_rx, store_rx));

        Self { inner }
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Start the alarm unless suppressed.
    pub fn play(&self) -> Result<PlayOutcome, CoreError> {
        self.inner.play()
    }

    /// Stop the alarm everywhere.
    pub fn stop(&self) {
        let inner = &self.inner;
        inner.stop_local();
        inner.update(|s| s.is_active = false);
        inner.publish(AlarmCommand::Stop);
        info!(context = %inner.id, "alarm stopped");
    }

    /// Silence the alarm everywhere until `now + duration`.
    pub fn acknowledge(&self, duration: Duration) -> Result<DateTime<Utc>, CoreError> {
        let inner = &self.inner;
        let until = TimeDelta::from_std(duration)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .ok_or_else(|| CoreError::ValidationFailed {
                message: format!("suppression window of {duration:?} is out of range"),
            })?;

        inner.store.set_suppressed_until(until)?;
        inner.stop_local();
        inner.update(|s| {
            s.suppressed = true;
            s.suppressed_until = Some(until);
        });
        inner.publish(AlarmCommand::Ack { until });
        info!(context = %inner.id, %until, "alarm acknowledged");
        Ok(until)
    }

    /// Clear the suppression deadline everywhere.
    pub fn reset_suppression(&self) -> Result<(), CoreError> {
        let inner = &self.inner;
        inner.store.clear()?;
        inner.update(|s| {
            s.suppressed = false;
            s.suppressed_until = None;
        });
        inner.publish(AlarmCommand::ResetSuppression);
        debug!(context = %inner.id, "alarm suppression reset");
        Ok(())
    }

    /// Set the local output volume, clamped to `[0, 1]`.
    pub fn set_volume(&self, volume: f32) {
        let volume = clamp_volume(volume);
        self.inner.engine.set_gain(volume);
        self.inner.update(|s| s.volume = volume);
    }

    // ── Observation ──────────────────────────────────────────────────

    pub fn state(&self) -> AlarmState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AlarmState> {
        self.inner.state.subscribe()
    }

    /// Whether this context currently holds the audio lock.
    pub fn is_leader(&self) -> bool {
        self.inner.lease().is_some()
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn settings(&self) -> &AlarmSettings {
        &self.inner.settings
    }

    /// Stop local sound, release the lock and end the listener.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.stop_local();
    }
}

impl AlarmInner {
    fn play(&self) -> Result<PlayOutcome, CoreError> {
        let now = Utc::now();
        // An unreadable deadline must not silence an emergency.
        let until = self.store.suppressed_until().unwrap_or_else(|e| {
            warn!(context = %self.id, error = %e, "suppression store unreadable, playing anyway");
            None
        });
        if let Some(until) = until.filter(|until| now < *until) {
            self.update(|s| {
                s.suppressed = true;
                s.suppressed_until = Some(until);
            });
            debug!(context = %self.id, %until, "play suppressed");
            return Ok(PlayOutcome::Suppressed);
        }

        self.update(|s| {
            s.is_active = true;
            s.suppressed = false;
        });
        self.publish(AlarmCommand::Play);

        if self.engine.is_playing() {
            return Ok(PlayOutcome::AlreadyPlaying);
        }

        let (lease, outcome) = match self.bus.try_acquire(&self.settings.lock_name) {
            Ok(Some(lease)) => (Some(lease), PlayOutcome::Leader),
            Ok(None) => {
                debug!(context = %self.id, "another context leads audio");
                return Ok(PlayOutcome::Follower);
            }
            Err(e) => {
                warn!(context = %self.id, error = %e, "audio lock unavailable, playing locally");
                (None, PlayOutcome::LocalFallback)
            }
        };

        self.engine.set_gain(self.state.borrow().volume);
        // On failure the lease drops here and leadership is free again.
        self.engine.start()?;
        *self.lease() = lease;
        self.update(|s| s.is_playing = true);
        info!(context = %self.id, ?outcome, "alarm sounding");
        Ok(outcome)
    }

    /// Stop the engine and give up leadership. Logical state is untouched.
    fn stop_local(&self) {
        self.engine.stop();
        if let Some(lease) = self.lease().take() {
            trace!(context = %self.id, lock = lease.name(), "released audio lock");
        }
        self.update(|s| s.is_playing = false);
    }

    fn publish(&self, command: AlarmCommand) {
        self.bus.broadcast(AlarmBroadcast {
            command,
            ts: Utc::now(),
            origin: self.id,
        });
    }

    /// Logical transition for a command sent by another context.
    fn apply_remote(&self, message: &AlarmBroadcast) {
        trace!(context = %self.id, from = %message.origin, command = ?message.command, "alarm bus message");
        match message.command {
            AlarmCommand::Play => self.update(|s| s.is_active = true),
            AlarmCommand::Stop => {
                self.stop_local();
                self.update(|s| s.is_active = false);
            }
            AlarmCommand::Ack { until } => {
                self.stop_local();
                self.update(|s| {
                    s.suppressed = true;
                    s.suppressed_until = Some(until);
                });
            }
            AlarmCommand::ResetSuppression => self.update(|s| {
                s.suppressed = false;
                s.suppressed_until = None;
            }),
        }
    }

    /// Reflect a suppression store change made by any context.
    fn apply_suppression(&self, until: Option<DateTime<Utc>>) {
        let suppressed = until.is_some_and(|until| Utc::now() < until);
        if suppressed {
            self.stop_local();
        }
        self.update(|s| {
            s.suppressed = suppressed;
            s.suppressed_until = until;
        });
    }

    fn update(&self, f: impl FnOnce(&mut AlarmState)) {
        self.state.send_if_modified(|state| {
            let before = state.clone();
            f(state);
            *state != before
        });
    }

    fn lease(&self) -> MutexGuard<'_, Option<Lease>> {
        self.lease.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Time left in the current suppression window.
    fn suppression_remaining(&self) -> Option<Duration> {
        let state = self.state.borrow();
        if !state.suppressed {
            return None;
        }
        let until = state.suppressed_until?;
        Some((until - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }
}

// ── Listener ─────────────────────────────────────────────────────────

async fn listen(
    inner: Arc<AlarmInner>,
    mut bus_rx: broadcast::Receiver<AlarmBroadcast>,
    mut store_rx: watch::Receiver<Option<DateTime<Utc>>>,
) {
    loop {
        let remaining = inner.suppression_remaining();

        tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            message = bus_rx.recv() => match message {
                Ok(message) if message.origin == inner.id => {}
                Ok(message) => inner.apply_remote(&message),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(context = %inner.id, skipped, "alarm bus lagged, resyncing suppression");
                    let until = inner.store.suppressed_until().unwrap_or(None);
                    inner.apply_suppression(until);
                }
                Err(RecvError::Closed) => break,
            },
            changed = store_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let until = *store_rx.borrow_and_update();
                inner.apply_suppression(until);
            }
            () = tokio::time::sleep(remaining.unwrap_or_default()), if remaining.is_some() => {
                inner.update(|s| s.suppressed = false);
                let still_active = inner.state.borrow().is_active;
                if still_active {
                    info!(context = %inner.id, "suppression window over, alarm resumes");
                    if let Err(e) = inner.play() {
                        warn!(context = %inner.id, error = %e, "could not resume alarm");
                    }
                }
            }
        }
    }
    trace!(context = %inner.id, "alarm listener exiting");
}

// ── Tests ────────────────────────────────────────────────────────────

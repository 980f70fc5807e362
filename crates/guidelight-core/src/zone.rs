// ── Zone activation state ──
//
// The single local belief about whether an emergency is active. Mutated
// only by inbound messages (state_sync, zone_state, fallback poll reads)
// and by a local optimistic activation; observed through a `watch`.
//
// A std mutex serializes every mutation so the race guard and the
// published state can never disagree. It is never held across `.await`.

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use guidelight_api::{EmergencyState, ZoneStateMessage, ZoneStatus};
use serde::Serialize;
use strum::{Display, EnumString};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::ZoneSettings;
use crate::event::Invalidation;

const INVALIDATION_CHANNEL_SIZE: usize = 64;

/// Zone name used when the backend reports an activation without one.
pub const UNNAMED_ZONE: &str = "unknown";

// ── Features ─────────────────────────────────────────────────────────

/// Dashboard capabilities gated by the emergency state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Feature {
    Dashboard,
    LampControl,
    EmergencyControl,
    WeatherMonitoring,
    RoutePlanning,
    ZoneManagement,
    DeviceManagement,
    Reports,
}

impl Feature {
    pub const ALL: [Feature; 8] = [
        Feature::Dashboard,
        Feature::LampControl,
        Feature::EmergencyControl,
        Feature::WeatherMonitoring,
        Feature::RoutePlanning,
        Feature::ZoneManagement,
        Feature::DeviceManagement,
        Feature::Reports,
    ];

    /// Features that stay usable while an emergency is active.
    pub const EMERGENCY_SAFE: [Feature; 4] = [
        Feature::Dashboard,
        Feature::LampControl,
        Feature::EmergencyControl,
        Feature::WeatherMonitoring,
    ];

    pub fn is_emergency_safe(self) -> bool {
        Self::EMERGENCY_SAFE.contains(&self)
    }
}

// ── State ────────────────────────────────────────────────────────────

/// Observable zone activation state.
///
/// `active_zone.is_some()` holds exactly when `is_emergency_active`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ZoneActivationState {
    pub is_emergency_active: bool,
    pub active_zone: Option<String>,
    pub wind_direction: String,
    pub activation_time: Option<DateTime<Utc>>,
    pub deactivation_in_progress: bool,
    pub allowed_features: BTreeSet<Feature>,
}

impl Default for ZoneActivationState {
    fn default() -> Self {
        Self {
            is_emergency_active: false,
            active_zone: None,
            wind_direction: String::new(),
            activation_time: None,
            deactivation_in_progress: false,
            allowed_features: Feature::ALL.into_iter().collect(),
        }
    }
}

impl ZoneActivationState {
    pub fn allows(&self, feature: Feature) -> bool {
        self.allowed_features.contains(&feature)
    }
}

/// What an inbound signal did to the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneTransition {
    /// Inactive → active, or a switch to a different zone.
    Activated,
    /// Active fields refreshed (wind, time, in-progress flag) without an edge.
    Updated,
    DeactivationStarted,
    Cleared,
    /// Nothing changed.
    Unchanged,
    Discarded(DiscardReason),
}

/// Why a cleared-equivalent signal was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum DiscardReason {
    /// Arrived inside the race window after a local activation.
    WithinRaceWindow,
    /// Carries an older sequence number than the activation.
    StaleSequence,
    /// Transient inactive read while deactivation is in flight.
    AwaitingTerminalSignal,
}

// ── ZoneActivation ───────────────────────────────────────────────────

/// Owner of [`ZoneActivationState`].
pub struct ZoneActivation {
    settings: ZoneSettings,
    state: watch::Sender<ZoneActivationState>,
    invalidations: broadcast::Sender<Invalidation>,
    guard: Mutex<RaceGuard>,
}

/// When and at which sequence the current activation was observed.
#[derive(Debug, Default)]
struct RaceGuard {
    activated_at: Option<Instant>,
    activation_seq: Option<u64>,
}

/// Where a signal came from; only affects guards and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
enum Source {
    StateSync,
    ZoneState,
    Poll,
    Local,
}

struct Activation<'a> {
    zone: Option<&'a str>,
    wind_direction: Option<&'a str>,
    activation_time: Option<DateTime<Utc>>,
    deactivation_in_progress: bool,
    seq: Option<u64>,
}

impl ZoneActivation {
    pub fn new(settings: ZoneSettings) -> Self {
        let (state, _) = watch::channel(ZoneActivationState::default());
        let (invalidations, _) = broadcast::channel(INVALIDATION_CHANNEL_SIZE);
        Self {
            settings,
            state,
            invalidations,
            guard: Mutex::new(RaceGuard::default()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ZoneActivationState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> ZoneActivationState {
        self.state.borrow().clone()
    }

    pub fn is_deactivation_in_progress(&self) -> bool {
        self.state.borrow().deactivation_in_progress
    }

    pub fn invalidations(&self) -> broadcast::Receiver<Invalidation> {
        self.invalidations.subscribe()
    }

    // ── Inbound signals ──────────────────────────────────────────────

    /// Apply a `state_sync` snapshot. Display-only: never issues commands.
    pub fn apply_state_sync(&self, sync: &EmergencyState) -> ZoneTransition {
        self.apply_state_sync_at(sync, Instant::now())
    }

    pub fn apply_state_sync_at(&self, sync: &EmergencyState, now: Instant) -> ZoneTransition {
        if sync.is_activated {
            self.activate(Source::StateSync, &activation_from(sync), now)
        } else {
            self.clear(Source::StateSync, sync.seq, now)
        }
    }

    /// Apply a `zone_state` message.
    pub fn apply_zone_state(&self, msg: &ZoneStateMessage) -> ZoneTransition {
        self.apply_zone_state_at(msg, Instant::now())
    }

    pub fn apply_zone_state_at(&self, msg: &ZoneStateMessage, now: Instant) -> ZoneTransition {
        match msg.status {
            ZoneStatus::Activated => self.activate(
                Source::ZoneState,
                &Activation {
                    zone: msg.zone.as_deref(),
                    wind_direction: msg.wind_direction.as_deref(),
                    activation_time: msg.ts,
                    deactivation_in_progress: false,
                    seq: msg.seq,
                },
                now,
            ),
            ZoneStatus::Deactivating => self.begin_deactivation(),
            ZoneStatus::Cleared => self.clear(Source::ZoneState, msg.seq, now),
        }
    }

    /// Apply a fallback poll read.
    ///
    /// An inactive read never ends an in-flight deactivation; only
    /// `state_sync` or a `cleared` zone_state does.
    pub fn apply_poll_read(&self, read: &EmergencyState) -> ZoneTransition {
        self.apply_poll_read_at(read, Instant::now())
    }

    pub fn apply_poll_read_at(&self, read: &EmergencyState, now: Instant) -> ZoneTransition {
        if read.is_activated {
            self.activate(Source::Poll, &activation_from(read), now)
        } else {
            self.clear(Source::Poll, read.seq, now)
        }
    }

    /// Optimistically mark `zone` active after a successful local request.
    pub fn apply_local_activation(&self, zone: &str, wind_direction: &str) -> ZoneTransition {
        self.activate(
            Source::Local,
            &Activation {
                zone: Some(zone),
                wind_direction: Some(wind_direction),
                activation_time: Some(Utc::now()),
                deactivation_in_progress: false,
                seq: None,
            },
            Instant::now(),
        )
    }

    // ── Transitions ──────────────────────────────────────────────────

    fn activate(&self, source: Source, activation: &Activation<'_>, now: Instant) -> ZoneTransition {
        let mut guard = self.lock_guard();
        let zone = activation.zone.unwrap_or(UNNAMED_ZONE).to_owned();

        let mut transition = ZoneTransition::Unchanged;
        self.state.send_if_modified(|state| {
            let edge =
                !state.is_emergency_active || state.active_zone.as_deref() != Some(zone.as_str());
            let before = state.clone();

            state.is_emergency_active = true;
            state.active_zone = Some(zone.clone());
            if let Some(wind) = activation.wind_direction {
                wind.clone_into(&mut state.wind_direction);
            }
            if edge {
                state.activation_time = activation.activation_time.or_else(|| Some(Utc::now()));
            } else if activation.activation_time.is_some() {
                state.activation_time = activation.activation_time;
            }
            // A poll read is too coarse to cancel a pushed `deactivating`.
            state.deactivation_in_progress = if source == Source::Poll && !edge {
                state.deactivation_in_progress || activation.deactivation_in_progress
            } else {
                activation.deactivation_in_progress
            };
            state.allowed_features = Feature::EMERGENCY_SAFE.into_iter().collect();

            transition = if edge {
                ZoneTransition::Activated
            } else if *state == before {
                ZoneTransition::Unchanged
            } else {
                ZoneTransition::Updated
            };
            transition != ZoneTransition::Unchanged
        });

        if transition == ZoneTransition::Activated {
            guard.activated_at = Some(now);
            guard.activation_seq = activation.seq;
            info!(%source, zone = %zone, seq = ?activation.seq, "emergency activated");
            self.invalidate();
        } else if let Some(seq) = activation.seq {
            guard.activation_seq = Some(guard.activation_seq.map_or(seq, |s| s.max(seq)));
        }
        transition
    }

    fn begin_deactivation(&self) -> ZoneTransition {
        let _guard = self.lock_guard();
        let mut transition = ZoneTransition::Unchanged;
        self.state.send_if_modified(|state| {
            if !state.is_emergency_active || state.deactivation_in_progress {
                return false;
            }
            state.deactivation_in_progress = true;
            transition = ZoneTransition::DeactivationStarted;
            true
        });
        if transition == ZoneTransition::DeactivationStarted {
            info!(zone = ?self.state.borrow().active_zone, "emergency deactivation in progress");
        }
        transition
    }

    fn clear(&self, source: Source, seq: Option<u64>, now: Instant) -> ZoneTransition {
        let mut guard = self.lock_guard();

        let (active, deactivating) = {
            let state = self.state.borrow();
            (state.is_emergency_active, state.deactivation_in_progress)
        };
        if !active {
            // Idempotent; still drop a dangling in-progress flag.
            self.state.send_if_modified(|state| {
                std::mem::take(&mut state.deactivation_in_progress)
            });
            return ZoneTransition::Unchanged;
        }

        if source == Source::Poll && deactivating {
            debug!(%source, "inactive read during deactivation, waiting for terminal signal");
            return ZoneTransition::Discarded(DiscardReason::AwaitingTerminalSignal);
        }

        if let Some(reason) = self.stale_reason(&guard, seq, now) {
            debug!(
                %source,
                %reason,
                seq = ?seq,
                activation_seq = ?guard.activation_seq,
                "discarding stale cleared signal"
            );
            return ZoneTransition::Discarded(reason);
        }

        let zone = self.state.borrow().active_zone.clone();
        self.state.send_replace(ZoneActivationState::default());
        *guard = RaceGuard::default();
        info!(%source, zone = ?zone, "emergency cleared");
        self.invalidate();
        ZoneTransition::Cleared
    }

    /// Sequence numbers decide when both sides carry one; otherwise the
    /// race window does.
    fn stale_reason(&self, guard: &RaceGuard, seq: Option<u64>, now: Instant) -> Option<DiscardReason> {
        if let (Some(cleared), Some(activated)) = (seq, guard.activation_seq) {
            return (cleared <= activated).then_some(DiscardReason::StaleSequence);
        }
        let activated_at = guard.activated_at?;
        (now.saturating_duration_since(activated_at) < self.settings.race_window)
            .then_some(DiscardReason::WithinRaceWindow)
    }

    fn invalidate(&self) {
        for view in [Invalidation::Lamps, Invalidation::EventHistory] {
            // No receivers is fine.
            let _ = self.invalidations.send(view);
        }
    }

    fn lock_guard(&self) -> std::sync::MutexGuard<'_, RaceGuard> {
        self.guard.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn activation_from(state: &EmergencyState) -> Activation<'_> {
    Activation {
        zone: state.zone_name.as_deref(),
        wind_direction: state.wind_direction.as_deref(),
        activation_time: state.activation_time,
        deactivation_in_progress: state.deactivation_in_progress,
        seq: state.seq,
    }
}

// ── Tests ────────────────────────────────────────────────────────────

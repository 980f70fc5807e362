// ── Command status tracker ──
//
// Per-lamp finite state machine:
//
//   queued ─▶ sent ─▶ ack ──(grace)──▶ removed
//      │        │ ▲
//      │        ▼ │ retry
//      └──────▶ failed ──(user ack)──▶ removed
//
// Every non-terminal state arms a pending timeout, so a record can never
// stay pending forever. Timers carry the generation they were armed at
// and do nothing once the record has moved on.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use guidelight_api::{CommandState, CommandStatusMessage, LampControl, LampState};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{CommandRecord, IssueOutcome};
use crate::config::TrackerSettings;
use crate::error::CoreError;
use crate::event::Notification;
use crate::zone::ZoneActivationState;

const NOTIFICATION_CHANNEL_SIZE: usize = 64;

/// Tracks outstanding lamp commands for the current scope.
///
/// Cheaply cloneable; clones share all state.
pub struct CommandTracker<C> {
    inner: Arc<TrackerInner<C>>,
}

impl<C> Clone for CommandTracker<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct TrackerInner<C> {
    control: C,
    settings: TrackerSettings,
    zone: watch::Receiver<ZoneActivationState>,
    scope: ArcSwap<String>,
    records: DashMap<u32, Tracked>,
    /// Confirmed lamp state; only written on ack.
    lamps: DashMap<u32, LampState>,
    notifications: broadcast::Sender<Notification>,
    revision: watch::Sender<u64>,
    generations: AtomicU64,
    cancel: CancellationToken,
}

struct Tracked {
    record: CommandRecord,
    /// Identifies the `issue()` call that created this record.
    issue_id: u64,
    /// Bumped on every transition; timers compare against it.
    generation: u64,
    /// Lamp state shown before an ack overwrote it, restored on failure.
    displaced: Option<Option<LampState>>,
}

#[derive(Debug, Clone, Copy)]
enum Timer {
    AckGrace,
    Pending,
}

impl<C: LampControl> CommandTracker<C> {
    pub fn new(
        control: C,
        settings: TrackerSettings,
        zone: watch::Receiver<ZoneActivationState>,
        scope: impl Into<String>,
    ) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CHANNEL_SIZE);
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(TrackerInner {
                control,
                settings,
                zone,
                scope: ArcSwap::from_pointee(scope.into()),
                records: DashMap::new(),
                lamps: DashMap::new(),
                notifications,
                revision,
                generations: AtomicU64::new(1),
                cancel: CancellationToken::new(),
            }),
        }
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Issue `desired_state` to lamp `target_id`.
    ///
    /// Returns [`IssueOutcome::AlreadyPending`] without any network call
    /// if a record for the lamp is outstanding. `On` is refused while a
    /// deactivation is in progress.
    pub async fn issue(
        &self,
        target_id: u32,
        desired_state: LampState,
    ) -> Result<IssueOutcome, CoreError> {
        let inner = &self.inner;

        if desired_state == LampState::On && inner.zone.borrow().deactivation_in_progress {
            warn!(target_id, "refusing ON command during deactivation");
            return Err(CoreError::ValidationFailed {
                message: format!("lamp {target_id} cannot be switched on while deactivation is in progress"),
            });
        }

        let issue_id = inner.next_generation();
        let now = Utc::now();
        let record = CommandRecord {
            target_id,
            scope: inner.scope.load().as_ref().clone(),
            desired_state,
            lifecycle_state: CommandState::Queued,
            issued_at: now,
            updated_at: now,
        };

        match inner.records.entry(target_id) {
            MapEntry::Occupied(existing) if existing.get().record.lifecycle_state != CommandState::Failed => {
                debug!(target_id, state = %existing.get().record.lifecycle_state, "command already pending");
                return Ok(IssueOutcome::AlreadyPending(existing.get().record.clone()));
            }
            // A failed record is superseded by the retry.
            MapEntry::Occupied(mut failed) => {
                failed.insert(Tracked::new(record.clone(), issue_id));
            }
            MapEntry::Vacant(slot) => {
                slot.insert(Tracked::new(record.clone(), issue_id));
            }
        }
        inner.arm(target_id, issue_id, Timer::Pending);
        inner.bump();
        info!(target_id, %desired_state, scope = %record.scope, "issuing lamp command");

        match inner.control.set_lamp(target_id, desired_state).await {
            Ok(()) => {
                let current = inner.on_rest_success(target_id, issue_id);
                Ok(IssueOutcome::Accepted(current.unwrap_or(record)))
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(target_id, %desired_state, error = %reason, "lamp command rejected");
                let current = inner.fail_issue(target_id, issue_id, &reason);
                Ok(IssueOutcome::Failed {
                    record: current.unwrap_or(record),
                    reason,
                })
            }
        }
    }

    /// Apply a `command_status` message. Returns `true` if a record changed.
    pub fn apply_command_status(&self, msg: &CommandStatusMessage) -> bool {
        self.inner.apply_command_status(msg)
    }

    /// Dismiss a failed record so the lamp can be retried cleanly.
    pub fn acknowledge_failure(&self, target_id: u32) -> bool {
        let removed = self
            .inner
            .records
            .remove_if(&target_id, |_, t| t.record.lifecycle_state == CommandState::Failed)
            .is_some();
        if removed {
            debug!(target_id, "failed command acknowledged");
            self.inner.bump();
        }
        removed
    }

    // ── Scope ────────────────────────────────────────────────────────

    /// Switch the device group whose statuses are applied.
    pub fn set_scope(&self, scope: impl Into<String>) {
        let scope = scope.into();
        debug!(scope = %scope, "command scope changed");
        self.inner.scope.store(Arc::new(scope));
    }

    pub fn scope(&self) -> Arc<String> {
        self.inner.scope.load_full()
    }

    // ── Observation ──────────────────────────────────────────────────

    pub fn record(&self, target_id: u32) -> Option<CommandRecord> {
        self.inner.records.get(&target_id).map(|t| t.record.clone())
    }

    /// All records, ordered by lamp id.
    pub fn records(&self) -> Vec<CommandRecord> {
        let mut records: Vec<_> = self.inner.records.iter().map(|t| t.record.clone()).collect();
        records.sort_by_key(|r| r.target_id);
        records
    }

    pub fn is_pending(&self, target_id: u32) -> bool {
        self.inner
            .records
            .get(&target_id)
            .is_some_and(|t| t.record.is_pending())
    }

    /// Last confirmed state of a lamp.
    pub fn lamp_state(&self, target_id: u32) -> Option<LampState> {
        self.inner.lamps.get(&target_id).map(|s| *s)
    }

    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    /// Ticks whenever any record or lamp state changes.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    /// Cancel all outstanding timers.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }
}

impl Tracked {
    fn new(record: CommandRecord, issue_id: u64) -> Self {
        Self {
            record,
            issue_id,
            generation: issue_id,
            displaced: None,
        }
    }
}

impl<C: LampControl> TrackerInner<C> {
    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed)
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r = r.wrapping_add(1));
    }

    fn notify(&self, notification: Notification) {
        // No receivers is fine.
        let _ = self.notifications.send(notification);
    }

    /// Move a record to `state`, returning the new generation.
    fn transition(&self, tracked: &mut Tracked, state: CommandState) -> u64 {
        let generation = self.next_generation();
        tracked.record.lifecycle_state = state;
        tracked.record.updated_at = Utc::now();
        tracked.generation = generation;
        generation
    }

    /// Mark acked and publish the lamp state. `None` if already acked.
    fn acknowledge(&self, tracked: &mut Tracked) -> Option<u64> {
        if tracked.record.lifecycle_state == CommandState::Ack {
            return None;
        }
        let previous = self
            .lamps
            .insert(tracked.record.target_id, tracked.record.desired_state);
        tracked.displaced = Some(previous);
        Some(self.transition(tracked, CommandState::Ack))
    }

    /// Mark failed and roll back any lamp state published by an ack.
    fn fail(&self, tracked: &mut Tracked) -> bool {
        if tracked.record.lifecycle_state == CommandState::Failed {
            return false;
        }
        let target_id = tracked.record.target_id;
        match tracked.displaced.take() {
            Some(Some(previous)) => {
                self.lamps.insert(target_id, previous);
            }
            Some(None) => {
                self.lamps.remove(&target_id);
            }
            None => {}
        }
        self.transition(tracked, CommandState::Failed);
        true
    }

    fn on_rest_success(self: &Arc<Self>, target_id: u32, issue_id: u64) -> Option<CommandRecord> {
        let mut tracked = self.records.get_mut(&target_id)?;
        if tracked.issue_id != issue_id {
            return None;
        }
        if tracked.record.is_pending() {
            if let Some(generation) = self.acknowledge(&mut tracked) {
                debug!(target_id, "REST accepted, provisionally acked");
                self.arm(target_id, generation, Timer::AckGrace);
            }
        }
        let record = tracked.record.clone();
        drop(tracked);
        self.bump();
        Some(record)
    }

    fn fail_issue(&self, target_id: u32, issue_id: u64, reason: &str) -> Option<CommandRecord> {
        let mut tracked = self.records.get_mut(&target_id)?;
        if tracked.issue_id != issue_id {
            return None;
        }
        let desired_state = tracked.record.desired_state;
        let changed = self.fail(&mut tracked);
        let record = tracked.record.clone();
        drop(tracked);

        if changed {
            self.notify(Notification::CommandFailed {
                target_id,
                desired_state,
                reason: reason.to_owned(),
            });
            self.bump();
        }
        Some(record)
    }

    fn apply_command_status(self: &Arc<Self>, msg: &CommandStatusMessage) -> bool {
        let target_id = msg.device_id;
        let scope = self.scope.load();
        if msg.scope != **scope {
            trace!(target_id, scope = %msg.scope, "command_status for another scope");
            return false;
        }

        let Some(mut tracked) = self.records.get_mut(&target_id) else {
            trace!(target_id, "command_status for untracked lamp");
            return false;
        };
        if tracked.record.scope != msg.scope {
            return false;
        }
        if msg.cmd.is_some_and(|cmd| cmd != tracked.record.desired_state) {
            debug!(target_id, cmd = ?msg.cmd, "command_status for a different command");
            return false;
        }

        let current = tracked.record.lifecycle_state;
        let desired_state = tracked.record.desired_state;
        let mut failed = false;

        let changed = match msg.state {
            CommandState::Queued | CommandState::Sent | CommandState::Retry => {
                if tracked.record.is_pending() {
                    let generation = self.transition(&mut tracked, msg.state);
                    self.arm(target_id, generation, Timer::Pending);
                    true
                } else {
                    trace!(target_id, from = %current, to = %msg.state, "late non-terminal status ignored");
                    false
                }
            }
            CommandState::Ack => {
                if current == CommandState::Failed {
                    debug!(target_id, "ack after failure ignored");
                    false
                } else if let Some(generation) = self.acknowledge(&mut tracked) {
                    self.arm(target_id, generation, Timer::AckGrace);
                    true
                } else {
                    // Already acked; the running grace timer stands.
                    false
                }
            }
            CommandState::Failed => {
                failed = self.fail(&mut tracked);
                failed
            }
        };
        drop(tracked);

        if changed {
            debug!(target_id, from = %current, to = %msg.state, ts = ?msg.ts, "command status applied");
            self.bump();
        }
        if failed {
            warn!(target_id, %desired_state, "lamp command failed");
            self.notify(Notification::CommandFailed {
                target_id,
                desired_state,
                reason: "gateway reported failure".into(),
            });
        }
        changed
    }

    // ── Timers ───────────────────────────────────────────────────────

    fn arm(self: &Arc<Self>, target_id: u32, generation: u64, timer: Timer) {
        let delay = match timer {
            Timer::AckGrace => self.settings.ack_grace,
            Timer::Pending => self.settings.pending_timeout,
        };
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = inner.cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => inner.on_timer(target_id, generation, timer),
            }
        });
    }

    fn on_timer(&self, target_id: u32, generation: u64, timer: Timer) {
        match timer {
            Timer::AckGrace => {
                let removed = self
                    .records
                    .remove_if(&target_id, |_, t| {
                        t.generation == generation && t.record.lifecycle_state == CommandState::Ack
                    })
                    .is_some();
                if removed {
                    trace!(target_id, "acked command cleared");
                    self.bump();
                }
            }
            Timer::Pending => {
                let Some(mut tracked) = self.records.get_mut(&target_id) else {
                    return;
                };
                if tracked.generation != generation || !tracked.record.is_pending() {
                    return;
                }
                let desired_state = tracked.record.desired_state;
                let state = tracked.record.lifecycle_state;
                self.fail(&mut tracked);
                drop(tracked);

                warn!(target_id, %desired_state, last_state = %state, "lamp command timed out");
                self.notify(Notification::CommandTimedOut {
                    target_id,
                    desired_state,
                });
                self.bump();
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

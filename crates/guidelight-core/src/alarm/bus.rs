// ── Cross-context coordination ──
//
// A named exclusive lock plus a broadcast bus shared by every alarm
// context. `LocalCoordinator` serves contexts inside one process;
// `FileCoordinator` in `file_bus` spans processes.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use uuid::Uuid;

use crate::error::CoreError;

pub(super) const BUS_CHANNEL_SIZE: usize = 64;

/// Command relayed to every alarm context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmCommand {
    Play,
    Stop,
    Ack { until: DateTime<Utc> },
    ResetSuppression,
}

/// One message on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmBroadcast {
    #[serde(flatten)]
    pub command: AlarmCommand,
    pub ts: DateTime<Utc>,
    /// Context that sent it.
    pub origin: Uuid,
}

/// Holding a `Lease` means holding the named lock. Dropping releases it.
pub struct Lease {
    name: String,
    _guard: Box<dyn Send + Sync>,
}

impl Lease {
    pub fn new(name: impl Into<String>, guard: impl Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            _guard: Box::new(guard),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Leadership lock and fan-out bus for singleton side effects.
pub trait SingletonResourceCoordinator: Send + Sync + 'static {
    /// Take the lock `name` if nobody holds it.
    ///
    /// `Ok(None)` means another context is the leader. `Err` means the lock
    /// mechanism itself failed ([`CoreError::LockUnavailable`]).
    fn try_acquire(&self, name: &str) -> Result<Option<Lease>, CoreError>;

    /// Deliver `message` to every subscriber, the sender included.
    fn broadcast(&self, message: AlarmBroadcast);

    fn subscribe(&self) -> broadcast::Receiver<AlarmBroadcast>;
}

// ── LocalCoordinator ─────────────────────────────────────────────────

/// In-process coordinator; share it between contexts through an `Arc`.
pub struct LocalCoordinator {
    locks: DashMap<String, Arc<Mutex<()>>>,
    bus: broadcast::Sender<AlarmBroadcast>,
}

impl LocalCoordinator {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CHANNEL_SIZE);
        Self {
            locks: DashMap::new(),
            bus,
        }
    }
}

impl Default for LocalCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl SingletonResourceCoordinator for LocalCoordinator {
    fn try_acquire(&self, name: &str) -> Result<Option<Lease>, CoreError> {
        let lock = Arc::clone(
            self.locks
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        Ok(lock.try_lock_owned().ok().map(|guard| Lease::new(name, guard)))
    }

    fn broadcast(&self, message: AlarmBroadcast) {
        // No subscribers is fine.
        let _ = self.bus.send(message);
    }

    fn subscribe(&self) -> broadcast::Receiver<AlarmBroadcast> {
        self.bus.subscribe()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_exclusive_until_lease_drops() {
        let coordinator = LocalCoordinator::new();

        let lease = coordinator.try_acquire("guidelight-alarm-audio").unwrap();
        assert!(lease.is_some());
        assert!(coordinator.try_acquire("guidelight-alarm-audio").unwrap().is_none());
        // Different names do not contend.
        assert!(coordinator.try_acquire("other").unwrap().is_some());

        drop(lease);
        assert!(coordinator.try_acquire("guidelight-alarm-audio").unwrap().is_some());
    }

    #[test]
    fn broadcast_reaches_sender_too() {
        let coordinator = LocalCoordinator::new();
        let mut rx = coordinator.subscribe();
        let message = AlarmBroadcast {
            command: AlarmCommand::Play,
            ts: Utc::now(),
            origin: Uuid::new_v4(),
        };
        coordinator.broadcast(message.clone());
        assert_eq!(rx.try_recv().unwrap(), message);
    }

    #[test]
    fn wire_shape_is_stable() {
        let message = AlarmBroadcast {
            command: AlarmCommand::ResetSuppression,
            ts: DateTime::from_timestamp_millis(0).unwrap(),
            origin: Uuid::nil(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["command"], "RESET_SUPPRESSION");
    }
}

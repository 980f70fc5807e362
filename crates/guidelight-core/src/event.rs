// ── Outbound signals for consumers ──
//
// Notifications are user-facing (toast-style) and best-effort; a lagging
// receiver loses the oldest entries. Invalidations tell cached views
// (lamp list, event history) to re-fetch.

use guidelight_api::LampState;
use serde::Serialize;
use strum::Display;

/// A user-facing, non-blocking notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// The backend, gateway, or REST call reported a failure.
    CommandFailed {
        target_id: u32,
        desired_state: LampState,
        reason: String,
    },
    /// No terminal status arrived before the pending timeout.
    CommandTimedOut {
        target_id: u32,
        desired_state: LampState,
    },
}

/// A cached view that must be re-fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Invalidation {
    Lamps,
    EventHistory,
}

//! Real-time emergency state sync between `guidelight-api` and consumers.
//!
//! This crate owns the local belief about the emergency and everything
//! that reacts to it:
//!
//! - **[`SyncController`]**: Facade for one backend session.
//!   [`start()`](SyncController::start) connects the WebSocket, registers
//!   message handlers, starts fallback polling and the alarm bridge.
//!
//! - **[`ZoneActivation`]**: Owner of [`ZoneActivationState`]. Applies
//!   `state_sync`, `zone_state` and poll reads with a race guard against
//!   stale clears, and refuses to end a deactivation on a transient read.
//!
//! - **[`CommandTracker`]**: Per-lamp command lifecycle. Optimistic REST
//!   issue, WebSocket acknowledgement, timeouts and rollback.
//!
//! - **[`alarm`]**: Audio engine, durable suppression and the
//!   [`AlarmCoordinator`] that elects a single audible context through a
//!   [`SingletonResourceCoordinator`](alarm::SingletonResourceCoordinator).
//!
//! - **[`FallbackSync`]**: HTTP polling while the push channel is down.

pub mod alarm;
pub mod command;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod fallback;
pub mod zone;

// ── Primary re-exports ──────────────────────────────────────────────
pub use alarm::{AlarmCoordinator, AlarmState, PlayOutcome};
pub use command::{CommandRecord, CommandTracker, IssueOutcome};
pub use config::{AlarmSettings, SyncConfig, TrackerSettings, ZoneSettings};
pub use controller::{ConnectionState, SyncController};
pub use error::CoreError;
pub use event::{Invalidation, Notification};
pub use fallback::FallbackSync;
pub use zone::{DiscardReason, Feature, ZoneActivation, ZoneActivationState, ZoneTransition};

// Wire types consumers need alongside the core API.
pub use guidelight_api::{
    CommandState, ConnectionStatus, EmergencyState, GatewayStatus, HttpClient, LampState,
    ReconnectConfig, TlsMode, TransportConfig,
};

// ── Lamp commands ──
//
// A user toggle becomes a `CommandRecord` whose lifecycle is driven by
// the REST response (provisional) and `command_status` messages
// (authoritative). See `tracker` for the state machine.

pub mod tracker;

use chrono::{DateTime, Utc};
use guidelight_api::{CommandState, LampState};
use serde::Serialize;

pub use tracker::CommandTracker;

/// One outstanding lamp command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandRecord {
    pub target_id: u32,
    /// Device group the command was issued from.
    pub scope: String,
    pub desired_state: LampState,
    pub lifecycle_state: CommandState,
    pub issued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CommandRecord {
    /// Still waiting on the backend (queued, sent or retrying).
    pub fn is_pending(&self) -> bool {
        !matches!(
            self.lifecycle_state,
            CommandState::Ack | CommandState::Failed
        )
    }
}

/// Result of [`CommandTracker::issue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueOutcome {
    /// The REST call succeeded; the record is provisionally acked.
    Accepted(CommandRecord),
    /// A record for this lamp is already outstanding. Nothing was sent.
    AlreadyPending(CommandRecord),
    /// The REST call failed; the record is `Failed` until acknowledged.
    Failed { record: CommandRecord, reason: String },
}

impl IssueOutcome {
    pub fn record(&self) -> &CommandRecord {
        match self {
            Self::Accepted(record) | Self::AlreadyPending(record) | Self::Failed { record, .. } => {
                record
            }
        }
    }
}

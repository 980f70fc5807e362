//! Emergency alarm: audio output, durable suppression and the
//! cross-context coordinator that keeps exactly one context audible.

pub mod audio;
pub mod bus;
mod coordinator;
pub mod file_bus;
mod file_watch;
#[cfg(feature = "audio-output")]
pub mod output;
pub mod suppression;

pub use audio::{AudioEngine, SampleEngine, clamp_volume};
pub use bus::{AlarmBroadcast, AlarmCommand, Lease, LocalCoordinator, SingletonResourceCoordinator};
pub use coordinator::{AlarmCoordinator, AlarmState, PlayOutcome};
pub use file_bus::FileCoordinator;
#[cfg(feature = "audio-output")]
pub use output::DeviceOutput;
pub use suppression::{FileSuppressionStore, MemorySuppressionStore, SuppressionStore};

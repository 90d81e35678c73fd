//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`
//! so a settings file may name only the fields it changes.

mod coordination;
mod logging;
mod storage;
mod supervisor;

pub use coordination::*;
pub use logging::*;
pub use storage::*;
pub use supervisor::*;

use serde::{Deserialize, Serialize};

/// Root settings type for the coordinator.
///
/// Loaded from `~/.flotilla/settings.json` with defaults applied for
/// missing fields. Example:
///
/// ```json
/// {
///   "locks": { "sweepIntervalMs": 10000 },
///   "supervisor": { "maxRecoveryAttempts": 5 }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlotillaSettings {
    /// Database location and checkpoint backup directory.
    pub storage: StorageSettings,
    /// Event append retry policy.
    pub events: EventSettings,
    /// Lease defaults and sweep cadence.
    pub locks: LockSettings,
    /// Checkpoint retention and auto-trigger cadence.
    pub checkpoints: CheckpointSettings,
    /// Worker launch, heartbeat and recovery policy.
    pub supervisor: SupervisorSettings,
    /// Log level and format.
    pub logging: LoggingSettings,
}

//! Lock and checkpoint settings.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockSettings {
    /// Interval between expired-lease sweeps.
    pub sweep_interval_ms: u64,
    /// TTL applied when a caller omits one. `None` means no expiry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_ttl_ms: Option<u64>,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 30_000,
            default_ttl_ms: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckpointSettings {
    /// Auto-checkpoint cadence. Disabled when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_interval_ms: Option<u64>,
    /// Checkpoints kept per mission by the periodic prune.
    pub keep_last: usize,
    /// Whether a live resume also respawns the agents named in the plan.
    pub respawn_agents_on_resume: bool,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            auto_interval_ms: None,
            keep_last: 20,
            respawn_agents_on_resume: false,
        }
    }
}

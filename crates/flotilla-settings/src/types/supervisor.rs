//! Agent supervisor settings.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SupervisorSettings {
    /// Worker executable followed by fixed arguments. The coordinator appends
    /// `--agent-id`, `--mailbox-id`, `--task` and `--timeout-ms`.
    pub worker_command: Vec<String>,
    /// How often each agent's liveness is checked.
    pub heartbeat_interval_ms: u64,
    /// Silence longer than this marks an agent unhealthy.
    pub heartbeat_timeout_ms: u64,
    /// Respawns allowed before an agent is marked failed.
    pub max_recovery_attempts: u32,
    /// Minimum gap between two recovery attempts.
    pub cooldown_ms: u64,
    /// Overall budget for launching one worker.
    pub spawn_timeout_ms: u64,
    /// Grace period between SIGTERM and a forced kill.
    pub terminate_grace_ms: u64,
    /// Resource samples retained per agent.
    pub sample_capacity: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            worker_command: vec!["flotilla-worker".to_string()],
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 60_000,
            max_recovery_attempts: 3,
            cooldown_ms: 300_000,
            spawn_timeout_ms: 30_000,
            terminate_grace_ms: 5_000,
            sample_capacity: 100,
        }
    }
}

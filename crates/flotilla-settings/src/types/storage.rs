//! Storage and event-store settings.

use serde::{Deserialize, Serialize};

/// Where durable state lives.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// Preferred database path (relative paths resolve under `~/.flotilla`).
    pub database_path: String,
    /// Checkpoint backup directory (relative paths resolve under `~/.flotilla`).
    pub backup_dir: String,
    /// Busy timeout applied to every connection, in milliseconds.
    pub busy_timeout_ms: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: "database/flotilla.db".to_string(),
            backup_dir: "checkpoints".to_string(),
            busy_timeout_ms: 5_000,
        }
    }
}

/// Retry policy for event appends that hit a storage error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventSettings {
    /// Total attempts, including the first.
    pub append_max_attempts: u32,
    /// First backoff delay in milliseconds; doubles per attempt.
    pub append_base_delay_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub append_max_delay_ms: u64,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            append_max_attempts: 3,
            append_base_delay_ms: 25,
            append_max_delay_ms: 500,
        }
    }
}

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, MailboxId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Spawning,
    Running,
    Unhealthy,
    Recovering,
    Failed,
    Terminated,
}

impl AgentStatus {
    /// `failed` and `terminated` are never left.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Terminated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::Running => "running",
            Self::Unhealthy => "unhealthy",
            Self::Recovering => "recovering",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        }
    }

    pub const ALL: [AgentStatus; 6] = [
        Self::Spawning,
        Self::Running,
        Self::Unhealthy,
        Self::Recovering,
        Self::Failed,
        Self::Terminated,
    ];
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown agent status: {s}"))
    }
}

/// Launch parameters kept with the agent so a respawn reuses them verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnConfig {
    /// Passed to the worker as its overall task timeout.
    pub timeout_ms: u64,
    /// Extra environment for the worker process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory; inherits the coordinator's when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30 * 60 * 1000,
            env: BTreeMap::new(),
            working_directory: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub agent_type: String,
    pub status: AgentStatus,
    pub pid: Option<u32>,
    pub mailbox_id: MailboxId,
    pub task: String,
    pub config: SpawnConfig,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub recovery_attempts: u32,
    /// The agent this one was respawned from, if any.
    pub recovered_from: Option<AgentId>,
    /// The agent that replaced this one after a recovery.
    pub replaced_by: Option<AgentId>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One CPU/memory reading attached to a heartbeat.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub sampled_at: DateTime<Utc>,
}

/// Aggregate over an agent's retained samples.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceTrend {
    pub samples: usize,
    pub avg_cpu_percent: f64,
    pub peak_cpu_percent: f64,
    pub avg_memory_bytes: u64,
    pub peak_memory_bytes: u64,
}

impl ResourceTrend {
    pub fn from_samples(samples: &[ResourceSample]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let n = samples.len();
        let cpu_sum: f64 = samples.iter().map(|s| s.cpu_percent).sum();
        let mem_sum: u128 = samples.iter().map(|s| u128::from(s.memory_bytes)).sum();
        Self {
            samples: n,
            avg_cpu_percent: cpu_sum / n as f64,
            peak_cpu_percent: samples.iter().map(|s| s.cpu_percent).fold(0.0, f64::max),
            avg_memory_bytes: u64::try_from(mem_sum / n as u128).unwrap_or(u64::MAX),
            peak_memory_bytes: samples.iter().map(|s| s.memory_bytes).max().unwrap_or(0),
        }
    }
}

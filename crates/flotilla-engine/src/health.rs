//! System health snapshot.

use chrono::{DateTime, Utc};
use serde::Serialize;

use flotilla_core::agents::AgentStatus;
use flotilla_store::StorageTier;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    /// Running, but on a non-durable tier or with part of the store unreadable.
    Degraded,
    Unavailable,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AgentCount {
    pub status: AgentStatus,
    pub count: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub storage_tier: StorageTier,
    pub database_path: String,
    pub store_reachable: bool,
    pub active_locks: i64,
    pub agents: Vec<AgentCount>,
    /// Agents with a live supervising actor.
    pub supervised_agents: usize,
    pub checkpoint_backends: Vec<&'static str>,
    pub checked_at: DateTime<Utc>,
}

impl SystemHealth {
    pub fn agents_in(&self, status: AgentStatus) -> i64 {
        self.agents
            .iter()
            .find(|c| c.status == status)
            .map_or(0, |c| c.count)
    }
}

pub(crate) fn classify(tier: StorageTier, store_reachable: bool, counts_ok: bool) -> HealthStatus {
    if !store_reachable {
        HealthStatus::Unavailable
    } else if !tier.is_durable() || !counts_ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_tier_is_degraded() {
        assert_eq!(classify(StorageTier::Preferred, true, true), HealthStatus::Ok);
        assert_eq!(classify(StorageTier::InMemory, true, true), HealthStatus::Degraded);
        assert_eq!(classify(StorageTier::Preferred, true, false), HealthStatus::Degraded);
        assert_eq!(classify(StorageTier::Preferred, false, true), HealthStatus::Unavailable);
    }

    #[test]
    fn serializes_snake_case() {
        let health = SystemHealth {
            status: HealthStatus::Ok,
            storage_tier: StorageTier::Preferred,
            database_path: "/tmp/flotilla.db".into(),
            store_reachable: true,
            active_locks: 2,
            agents: vec![AgentCount {
                status: AgentStatus::Running,
                count: 3,
            }],
            supervised_agents: 3,
            checkpoint_backends: vec!["sqlite", "file"],
            checked_at: Utc::now(),
        };
        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["checkpoint_backends"][1], "file");
        assert_eq!(health.agents_in(AgentStatus::Running), 3);
        assert_eq!(health.agents_in(AgentStatus::Failed), 0);
    }
}

//! Checkpoint model and load-time validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agents::{AgentRecord, AgentStatus, SpawnConfig};
use crate::clock::parse_ts;
use crate::errors::{require_non_empty, ValidationError};
use crate::events::{validate_percent, EventType};
use crate::ids::{AgentId, CheckpointId, LockId, MailboxId, MissionId, SortieId};
use crate::locks::Lock;

/// Schema version written into every checkpoint.
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointTrigger {
    Manual,
    Auto,
    Error,
    Completion,
}

impl std::fmt::Display for CheckpointTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Auto => write!(f, "auto"),
            Self::Error => write!(f, "error"),
            Self::Completion => write!(f, "completion"),
        }
    }
}

impl std::str::FromStr for CheckpointTrigger {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "auto" => Ok(Self::Auto),
            "error" => Ok(Self::Error),
            "completion" => Ok(Self::Completion),
            other => Err(format!("unknown checkpoint trigger: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortieStatus {
    Pending,
    InProgress,
    Blocked,
    Completed,
    Failed,
    Cancelled,
}

impl SortieStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SortieSnapshot {
    pub id: SortieId,
    pub status: SortieStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_percent: Option<f64>,
}

impl SortieSnapshot {
    pub fn new(id: impl Into<String>, status: SortieStatus) -> Self {
        Self {
            id: SortieId::from_raw(id),
            status,
            assigned_to: None,
            description: None,
            progress_percent: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSnapshot {
    pub lock_id: LockId,
    pub resource_key: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&Lock> for LockSnapshot {
    fn from(lock: &Lock) -> Self {
        Self {
            lock_id: lock.id.clone(),
            resource_key: lock.resource_key.clone(),
            holder_id: lock.holder_id.clone(),
            acquired_at: lock.acquired_at,
            expires_at: lock.expires_at,
        }
    }
}

/// An event a consumer had not yet processed when the snapshot was taken.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMessage {
    pub stream_id: MailboxId,
    pub seq: i64,
    pub event_type: EventType,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub agent_id: AgentId,
    pub agent_type: String,
    pub status: AgentStatus,
    pub mailbox_id: MailboxId,
    pub task: String,
    #[serde(default)]
    pub config: SpawnConfig,
}

impl From<&AgentRecord> for AgentSnapshot {
    fn from(agent: &AgentRecord) -> Self {
        Self {
            agent_id: agent.id.clone(),
            agent_type: agent.agent_type.clone(),
            status: agent.status,
            mailbox_id: agent.mailbox_id.clone(),
            task: agent.task.clone(),
            config: agent.config.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryContext {
    pub last_action: String,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default)]
    pub blockers: Vec<String>,
    pub elapsed_time_ms: u64,
}

/// Caller-supplied mission state captured by a checkpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    pub progress_percent: f64,
    #[serde(default)]
    pub sorties: Vec<SortieSnapshot>,
    #[serde(default)]
    pub active_locks: Vec<LockSnapshot>,
    #[serde(default)]
    pub pending_messages: Vec<PendingMessage>,
    #[serde(default)]
    pub agents: Vec<AgentSnapshot>,
    #[serde(default)]
    pub recovery_context: RecoveryContext,
    pub created_by: String,
}

impl CheckpointSnapshot {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_percent("progress_percent", self.progress_percent)?;
        require_non_empty("created_by", &self.created_by)?;
        for sortie in &self.sorties {
            require_non_empty("sorties[].id", sortie.id.as_str())?;
            if let Some(p) = sortie.progress_percent {
                validate_percent("sorties[].progress_percent", p)?;
            }
        }
        for lock in &self.active_locks {
            require_non_empty("active_locks[].resource_key", &lock.resource_key)?;
            require_non_empty("active_locks[].holder_id", &lock.holder_id)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub mission_id: MissionId,
    pub trigger: CheckpointTrigger,
    pub progress_percent: f64,
    pub sorties: Vec<SortieSnapshot>,
    pub active_locks: Vec<LockSnapshot>,
    pub pending_messages: Vec<PendingMessage>,
    #[serde(default)]
    pub agents: Vec<AgentSnapshot>,
    pub recovery_context: RecoveryContext,
    pub created_by: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub consumed_at: Option<DateTime<Utc>>,
}

const REQUIRED_FIELDS: &[&str] = &[
    "id",
    "mission_id",
    "trigger",
    "progress_percent",
    "sorties",
    "active_locks",
    "pending_messages",
    "recovery_context",
    "created_by",
    "version",
    "created_at",
];

impl Checkpoint {
    pub fn from_snapshot(
        id: CheckpointId,
        mission_id: MissionId,
        trigger: CheckpointTrigger,
        snapshot: CheckpointSnapshot,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            mission_id,
            trigger,
            progress_percent: snapshot.progress_percent,
            sorties: snapshot.sorties,
            active_locks: snapshot.active_locks,
            pending_messages: snapshot.pending_messages,
            agents: snapshot.agents,
            recovery_context: snapshot.recovery_context,
            created_by: snapshot.created_by,
            version: CHECKPOINT_VERSION,
            created_at,
            consumed_at: None,
        }
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed_at.is_some()
    }

    /// Sorties that still need work.
    pub fn unfinished_sorties(&self) -> impl Iterator<Item = &SortieSnapshot> {
        self.sorties.iter().filter(|s| !s.status.is_terminal())
    }

    /// Parse and validate a stored record. Rejects missing required fields,
    /// progress outside `0..=100`, non-ISO-8601 timestamps and versions newer
    /// than this build understands.
    pub fn from_value(value: &Value) -> Result<Self, ValidationError> {
        let obj = value
            .as_object()
            .ok_or_else(|| ValidationError::new("checkpoint", "record is not an object"))?;

        for field in REQUIRED_FIELDS {
            match obj.get(*field) {
                None | Some(Value::Null) => {
                    return Err(ValidationError::new(*field, "required field missing"))
                }
                Some(_) => {}
            }
        }

        for field in ["created_at", "consumed_at"] {
            if let Some(raw) = obj.get(field).and_then(Value::as_str) {
                parse_ts(raw).map_err(|e| ValidationError::new(field, e.message))?;
            }
        }

        let progress = obj
            .get("progress_percent")
            .and_then(Value::as_f64)
            .ok_or_else(|| ValidationError::new("progress_percent", "not a number"))?;
        validate_percent("progress_percent", progress)?;

        let checkpoint: Checkpoint = serde_json::from_value(value.clone())
            .map_err(|e| ValidationError::new("checkpoint", e.to_string()))?;

        if checkpoint.version > CHECKPOINT_VERSION {
            return Err(ValidationError::new(
                "version",
                format!("unsupported checkpoint version {}", checkpoint.version),
            ));
        }
        require_non_empty("mission_id", checkpoint.mission_id.as_str())?;
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Checkpoint {
        Checkpoint::from_snapshot(
            CheckpointId::new(),
            MissionId::from_raw("msn-1"),
            CheckpointTrigger::Manual,
            CheckpointSnapshot {
                progress_percent: 50.0,
                sorties: vec![
                    SortieSnapshot::new("s-1", SortieStatus::Pending),
                    SortieSnapshot::new("s-2", SortieStatus::Completed),
                ],
                recovery_context: RecoveryContext {
                    last_action: "wrote parser".into(),
                    next_steps: vec!["add tests".into()],
                    blockers: vec![],
                    elapsed_time_ms: 1_200,
                },
                created_by: "coordinator".into(),
                ..Default::default()
            },
            Utc::now(),
        )
    }

    #[test]
    fn valid_record_roundtrips() {
        let cp = sample();
        let value = serde_json::to_value(&cp).unwrap();
        assert_eq!(Checkpoint::from_value(&value).unwrap(), cp);
    }

    #[test]
    fn missing_field_rejected() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value.as_object_mut().unwrap().remove("recovery_context");
        let err = Checkpoint::from_value(&value).unwrap_err();
        assert_eq!(err.field, "recovery_context");
    }

    #[test]
    fn progress_out_of_range_rejected() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["progress_percent"] = json!(101.5);
        let err = Checkpoint::from_value(&value).unwrap_err();
        assert_eq!(err.field, "progress_percent");
    }

    #[test]
    fn bad_timestamp_rejected() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["created_at"] = json!("last tuesday");
        let err = Checkpoint::from_value(&value).unwrap_err();
        assert_eq!(err.field, "created_at");
    }

    #[test]
    fn future_version_rejected() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["version"] = json!(CHECKPOINT_VERSION + 1);
        assert!(Checkpoint::from_value(&value).is_err());
    }

    #[test]
    fn unfinished_sorties_skip_terminal() {
        let cp = sample();
        let ids: Vec<_> = cp.unfinished_sorties().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s-1"]);
    }

    #[test]
    fn snapshot_validation() {
        let mut snap = CheckpointSnapshot {
            progress_percent: 10.0,
            created_by: "me".into(),
            ..Default::default()
        };
        assert!(snap.validate().is_ok());
        snap.progress_percent = -1.0;
        assert!(snap.validate().is_err());
        snap.progress_percent = 10.0;
        snap.created_by = String::new();
        assert!(snap.validate().is_err());
    }

    #[test]
    fn trigger_roundtrip() {
        for t in [
            CheckpointTrigger::Manual,
            CheckpointTrigger::Auto,
            CheckpointTrigger::Error,
            CheckpointTrigger::Completion,
        ] {
            assert_eq!(t.to_string().parse::<CheckpointTrigger>().unwrap(), t);
        }
    }
}

//! Mailbox events.
//!
//! Payloads are a closed tagged union so every event is checked against its
//! variant's shape when it crosses the store boundary. On disk the tag and the
//! variant body live in separate columns (`type`, `payload`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agents::AgentStatus;
use crate::checkpoints::{CheckpointTrigger, SortieStatus};
use crate::errors::{require_non_empty, ValidationError};
use crate::ids::{AgentId, CheckpointId, EventId, LockId, MailboxId, MissionId, SortieId};
use crate::locks::LockStatus;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Message,
    SortieAssigned,
    SortieProgress,
    SortieCompleted,
    SortieFailed,
    SortieRequeued,
    AgentLifecycle,
    LockChanged,
    CheckpointCreated,
    Custom,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::SortieAssigned => "sortie_assigned",
            Self::SortieProgress => "sortie_progress",
            Self::SortieCompleted => "sortie_completed",
            Self::SortieFailed => "sortie_failed",
            Self::SortieRequeued => "sortie_requeued",
            Self::AgentLifecycle => "agent_lifecycle",
            Self::LockChanged => "lock_changed",
            Self::CheckpointCreated => "checkpoint_created",
            Self::Custom => "custom",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown event type: {s}"))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Message {
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
        body: String,
    },
    SortieAssigned {
        sortie_id: SortieId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<AgentId>,
        description: String,
    },
    SortieProgress {
        sortie_id: SortieId,
        percent: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    SortieCompleted {
        sortie_id: SortieId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    SortieFailed {
        sortie_id: SortieId,
        reason: String,
    },
    /// Emitted by recovery for every unfinished sortie of a resumed checkpoint.
    SortieRequeued {
        sortie_id: SortieId,
        checkpoint_id: CheckpointId,
        previous_status: SortieStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assigned_to: Option<AgentId>,
    },
    AgentLifecycle {
        agent_id: AgentId,
        status: AgentStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    LockChanged {
        lock_id: LockId,
        resource_key: String,
        holder_id: String,
        status: LockStatus,
    },
    CheckpointCreated {
        checkpoint_id: CheckpointId,
        mission_id: MissionId,
        trigger: CheckpointTrigger,
        progress_percent: f64,
    },
    Custom {
        name: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Message { .. } => EventType::Message,
            Self::SortieAssigned { .. } => EventType::SortieAssigned,
            Self::SortieProgress { .. } => EventType::SortieProgress,
            Self::SortieCompleted { .. } => EventType::SortieCompleted,
            Self::SortieFailed { .. } => EventType::SortieFailed,
            Self::SortieRequeued { .. } => EventType::SortieRequeued,
            Self::AgentLifecycle { .. } => EventType::AgentLifecycle,
            Self::LockChanged { .. } => EventType::LockChanged,
            Self::CheckpointCreated { .. } => EventType::CheckpointCreated,
            Self::Custom { .. } => EventType::Custom,
        }
    }

    /// Field-level checks the type system cannot express.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Message { from, body, .. } => {
                require_non_empty("message.from", from)?;
                require_non_empty("message.body", body)
            }
            Self::SortieAssigned { sortie_id, description, .. } => {
                require_non_empty("sortie_id", sortie_id.as_str())?;
                require_non_empty("sortie_assigned.description", description)
            }
            Self::SortieProgress { sortie_id, percent, .. } => {
                require_non_empty("sortie_id", sortie_id.as_str())?;
                validate_percent("sortie_progress.percent", *percent)
            }
            Self::SortieCompleted { sortie_id, .. } | Self::SortieRequeued { sortie_id, .. } => {
                require_non_empty("sortie_id", sortie_id.as_str())
            }
            Self::SortieFailed { sortie_id, reason } => {
                require_non_empty("sortie_id", sortie_id.as_str())?;
                require_non_empty("sortie_failed.reason", reason)
            }
            Self::AgentLifecycle { agent_id, .. } => require_non_empty("agent_id", agent_id.as_str()),
            Self::LockChanged { resource_key, holder_id, .. } => {
                require_non_empty("resource_key", resource_key)?;
                require_non_empty("holder_id", holder_id)
            }
            Self::CheckpointCreated { mission_id, progress_percent, .. } => {
                require_non_empty("mission_id", mission_id.as_str())?;
                validate_percent("checkpoint_created.progress_percent", *progress_percent)
            }
            Self::Custom { name, .. } => require_non_empty("custom.name", name),
        }
    }

    /// Split into the `(type, payload)` column pair.
    pub fn to_parts(&self) -> Result<(EventType, serde_json::Value), serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        let data = value
            .get_mut("data")
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null);
        Ok((self.event_type(), data))
    }

    /// Rebuild from the `(type, payload)` column pair.
    pub fn from_parts(event_type: &str, data: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::json!({ "type": event_type, "data": data }))
    }
}

pub fn validate_percent(field: &str, value: f64) -> Result<(), ValidationError> {
    if value.is_finite() && (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::new(field, format!("{value} is outside 0..=100")))
    }
}

/// An event as submitted by a caller, before a sequence number is assigned.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub payload: EventPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl NewEvent {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            payload,
            causation_id: None,
            correlation_id: None,
        }
    }

    pub fn caused_by(mut self, event_id: EventId) -> Self {
        self.causation_id = Some(event_id);
        self
    }

    pub fn correlated(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

impl From<EventPayload> for NewEvent {
    fn from(payload: EventPayload) -> Self {
        Self::new(payload)
    }
}

/// An appended, immutable event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub stream_id: MailboxId,
    pub seq: i64,
    pub payload: EventPayload,
    pub causation_id: Option<EventId>,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}

use std::time::Duration;

use chrono::{DateTime, Utc};

use flotilla_core::ids::{AgentId, CheckpointId};
use flotilla_core::ValidationError;
use flotilla_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("checkpoint {checkpoint_id} was already consumed at {consumed_at}")]
    AlreadyConsumed {
        checkpoint_id: CheckpointId,
        consumed_at: DateTime<Utc>,
    },

    #[error("agent {agent_id} exhausted {attempts} recovery attempts")]
    RecoveryExhausted { agent_id: AgentId, attempts: u32 },

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Store(e) => e.error_kind(),
            Self::Validation(_) => "validation",
            Self::AlreadyConsumed { .. } => "already_consumed",
            Self::RecoveryExhausted { .. } => "recovery_exhausted",
            Self::Spawn(_) => "spawn",
            Self::Timeout { .. } => "timeout",
            Self::NotFound(_) => "not_found",
            Self::Internal(_) => "internal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            Self::Spawn(_) | Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Store lookups that miss surface as the engine's own not-found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Store(StoreError::NotFound(_)))
    }
}

use flotilla_core::ValidationError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("resource {resource_key} is held by {holder_id}")]
    LockHeld {
        resource_key: String,
        holder_id: String,
    },

    #[error("{holder_id} does not hold lock {lock_id}")]
    NotHolder { lock_id: String, holder_id: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// Some backends applied the change and some did not.
    #[error("partial failure: {succeeded} succeeded, failed: {}", failed.join("; "))]
    PartialFailure {
        succeeded: usize,
        failed: Vec<String>,
    },

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl StoreError {
    /// Stable snake_case classification for logs and API responses.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Conflict(_) => "conflict",
            Self::LockHeld { .. } => "lock_held",
            Self::NotHolder { .. } => "not_holder",
            Self::NotFound(_) => "not_found",
            Self::Storage(_) => "storage",
            Self::PartialFailure { .. } => "partial_failure",
            Self::CorruptRow { .. } => "corrupt_row",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
        }
    }

    /// Only transient storage faults are worth repeating.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation(ValidationError::new(field, message))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(e.to_string())
            }
            _ => StoreError::Storage(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Malformed input or schema violation, raised before anything touches storage.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a required string field that was empty.
    pub fn empty(field: impl Into<String>) -> Self {
        Self::new(field, "must not be empty")
    }
}

/// Reject blank identifiers and keys.
pub fn require_non_empty(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::empty(field))
    } else {
        Ok(())
    }
}

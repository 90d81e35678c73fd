//! Errors raised while loading `~/.flotilla/settings.json`.

use thiserror::Error;

/// Why the coordinator refused its settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("cannot read flotilla settings: {0}")]
    Io(#[from] std::io::Error),
    /// The file, or the file merged over the defaults, is not a settings
    /// document (bad JSON, wrong type for a known key).
    #[error("malformed flotilla settings: {0}")]
    Json(#[from] serde_json::Error),
    /// A merged value that [`crate::loader::validate`] refuses to run with:
    /// a zero heartbeat interval, sample capacity, sweep interval, append
    /// attempt count or auto-checkpoint interval, or a heartbeat timeout
    /// shorter than the heartbeat interval (every agent would be declared
    /// dead between two heartbeats).
    #[error("settings key {key} rejected: {reason}")]
    Rejected { key: &'static str, reason: String },
}

impl SettingsError {
    pub(crate) fn rejected(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Rejected {
            key,
            reason: reason.into(),
        }
    }

    /// The offending key for a rejected value.
    pub fn key(&self) -> Option<&'static str> {
        match self {
            Self::Rejected { key, .. } => Some(key),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SettingsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreadable_file_converts_from_io() {
        let err: SettingsError = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into();
        assert!(matches!(err, SettingsError::Io(_)));
        assert!(err.to_string().starts_with("cannot read flotilla settings"));
        assert_eq!(err.key(), None);
    }

    #[test]
    fn malformed_document_converts_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad}").unwrap_err();
        let err: SettingsError = json_err.into();
        assert!(matches!(err, SettingsError::Json(_)));
        assert!(err.to_string().starts_with("malformed flotilla settings"));
    }

    #[test]
    fn rejected_value_names_its_key() {
        let err = SettingsError::rejected("supervisor.sampleCapacity", "must be positive");
        assert_eq!(err.key(), Some("supervisor.sampleCapacity"));
        assert_eq!(
            err.to_string(),
            "settings key supervisor.sampleCapacity rejected: must be positive"
        );
    }
}

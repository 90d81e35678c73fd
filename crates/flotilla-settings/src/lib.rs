//! # flotilla-settings
//!
//! Layered configuration for the flotilla coordinator.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`FlotillaSettings::default()`]
//! 2. **User file**: `~/.flotilla/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `FLOTILLA_*` overrides (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use flotilla_settings::get_settings;
//!
//! let settings = get_settings();
//! println!("heartbeat timeout: {}ms", settings.supervisor.heartbeat_timeout_ms);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    deep_merge, flotilla_home, load_settings, load_settings_from_path, resolve_path,
    settings_path,
};
pub use types::*;

use std::sync::OnceLock;

/// Global settings singleton, populated by [`init_settings`] or lazily by
/// [`get_settings`].
static SETTINGS: OnceLock<FlotillaSettings> = OnceLock::new();

/// Get the global settings instance.
///
/// On first call, loads settings from `~/.flotilla/settings.json` with env
/// overrides. If loading fails, returns compiled defaults.
pub fn get_settings() -> &'static FlotillaSettings {
    SETTINGS.get_or_init(|| load_settings().unwrap_or_default())
}

/// Initialize the global settings with a specific value.
///
/// # Errors
///
/// Returns the provided settings back if the global was already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: FlotillaSettings) -> std::result::Result<(), FlotillaSettings> {
    SETTINGS.set(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        let settings = FlotillaSettings::default();
        assert!(loader::validate(&settings).is_ok());
        assert_eq!(settings.locks.sweep_interval_ms, 30_000);
        assert_eq!(settings.supervisor.heartbeat_interval_ms, 30_000);
        assert_eq!(settings.supervisor.heartbeat_timeout_ms, 60_000);
        assert_eq!(settings.supervisor.max_recovery_attempts, 3);
        assert_eq!(settings.supervisor.cooldown_ms, 300_000);
        assert_eq!(settings.supervisor.sample_capacity, 100);
        assert_eq!(settings.events.append_max_attempts, 3);
        assert!(settings.checkpoints.auto_interval_ms.is_none());
    }

    #[test]
    fn settings_serialize_camel_case() {
        let json = serde_json::to_value(FlotillaSettings::default()).unwrap();
        assert!(json["supervisor"]["heartbeatTimeoutMs"].is_u64());
        assert!(json["locks"].get("defaultTtlMs").is_none());
    }
}

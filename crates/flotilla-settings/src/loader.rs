//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`FlotillaSettings::default()`]
//! 2. If `~/.flotilla/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `FLOTILLA_*` environment overrides (highest priority)
//! 4. Reject combinations that cannot work (see [`validate`])
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::FlotillaSettings;

/// `~/.flotilla`, or `/tmp/.flotilla` when `HOME` is unset.
pub fn flotilla_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".flotilla")
}

/// Resolve the path to the settings file (`~/.flotilla/settings.json`).
pub fn settings_path() -> PathBuf {
    flotilla_home().join("settings.json")
}

/// Resolve a configured path: absolute paths pass through, relative ones
/// land under [`flotilla_home`].
pub fn resolve_path(configured: &str) -> PathBuf {
    let path = Path::new(configured);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        flotilla_home().join(path)
    }
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<FlotillaSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON or an unusable combination of values, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<FlotillaSettings> {
    let defaults = serde_json::to_value(FlotillaSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: FlotillaSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// - Integers must be valid and within the specified range
/// - Booleans accept: `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`
/// - Invalid values are ignored with a warning (fall back to file/default)
pub fn apply_env_overrides(settings: &mut FlotillaSettings) {
    // ── Storage ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("FLOTILLA_DB_PATH") {
        settings.storage.database_path = v;
    }
    if let Some(v) = read_env_string("FLOTILLA_BACKUP_DIR") {
        settings.storage.backup_dir = v;
    }

    // ── Locks / checkpoints ─────────────────────────────────────────
    if let Some(v) = read_env_u64("FLOTILLA_LOCK_SWEEP_INTERVAL_MS", 100, 86_400_000) {
        settings.locks.sweep_interval_ms = v;
    }
    if let Some(v) = read_env_u64("FLOTILLA_AUTO_CHECKPOINT_MS", 1000, 86_400_000) {
        settings.checkpoints.auto_interval_ms = Some(v);
    }
    if let Some(v) = read_env_usize("FLOTILLA_CHECKPOINT_KEEP_LAST", 1, 100_000) {
        settings.checkpoints.keep_last = v;
    }
    if let Some(v) = read_env_bool("FLOTILLA_RESPAWN_ON_RESUME") {
        settings.checkpoints.respawn_agents_on_resume = v;
    }

    // ── Supervisor ──────────────────────────────────────────────────
    if let Some(v) = read_env_string("FLOTILLA_WORKER_COMMAND") {
        settings.supervisor.worker_command = v.split_whitespace().map(str::to_string).collect();
    }
    if let Some(v) = read_env_u64("FLOTILLA_HEARTBEAT_INTERVAL_MS", 10, 3_600_000) {
        settings.supervisor.heartbeat_interval_ms = v;
    }
    if let Some(v) = read_env_u64("FLOTILLA_HEARTBEAT_TIMEOUT_MS", 10, 3_600_000) {
        settings.supervisor.heartbeat_timeout_ms = v;
    }
    if let Some(v) = read_env_u32("FLOTILLA_MAX_RECOVERY_ATTEMPTS", 0, 100) {
        settings.supervisor.max_recovery_attempts = v;
    }
    if let Some(v) = read_env_u64("FLOTILLA_RECOVERY_COOLDOWN_MS", 0, 86_400_000) {
        settings.supervisor.cooldown_ms = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("FLOTILLA_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("FLOTILLA_LOG_JSON") {
        settings.logging.json = v;
    }
}

/// Cross-field checks applied after all layers are merged.
pub fn validate(settings: &FlotillaSettings) -> Result<()> {
    let sup = &settings.supervisor;
    if sup.heartbeat_interval_ms == 0 {
        return Err(SettingsError::rejected("supervisor.heartbeatIntervalMs", "must be positive"));
    }
    if sup.heartbeat_timeout_ms < sup.heartbeat_interval_ms {
        return Err(SettingsError::rejected(
            "supervisor.heartbeatTimeoutMs",
            format!(
                "{} is shorter than heartbeatIntervalMs ({})",
                sup.heartbeat_timeout_ms, sup.heartbeat_interval_ms
            ),
        ));
    }
    if sup.sample_capacity == 0 {
        return Err(SettingsError::rejected("supervisor.sampleCapacity", "must be positive"));
    }
    if settings.locks.sweep_interval_ms == 0 {
        return Err(SettingsError::rejected("locks.sweepIntervalMs", "must be positive"));
    }
    if settings.events.append_max_attempts == 0 {
        return Err(SettingsError::rejected("events.appendMaxAttempts", "must be at least 1"));
    }
    if settings.checkpoints.auto_interval_ms == Some(0) {
        return Err(SettingsError::rejected("checkpoints.autoIntervalMs", "must be positive when set"));
    }
    Ok(())
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u32` within a range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u32(name: &str, min: u32, max: u32) -> Option<u32> {
    let val = std::env::var(name).ok()?;
    let result = parse_u32_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u32 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}

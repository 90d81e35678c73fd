//! Tracing subscriber setup for the coordinator process.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "flotilla_store" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines when true, compact human-readable output otherwise.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
        }
    }
}

impl TelemetryConfig {
    /// Build from loosely typed settings values. Unknown level names fall
    /// back to `info` and are dropped from the module list.
    pub fn from_names<'a>(
        level: &str,
        modules: impl IntoIterator<Item = (&'a str, &'a str)>,
        json: bool,
    ) -> Self {
        Self {
            log_level: parse_level(level).unwrap_or(Level::INFO),
            module_levels: modules
                .into_iter()
                .filter_map(|(module, lvl)| parse_level(lvl).map(|l| (module.to_string(), l)))
                .collect(),
            json,
        }
    }

    /// `EnvFilter` directive string, e.g. `info,flotilla_store=debug`.
    pub fn directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Case-insensitive level name.
pub fn parse_level(name: &str) -> Option<Level> {
    name.trim().parse().ok()
}

/// Install the global subscriber. Call once at startup.
///
/// # Errors
///
/// Fails when a global subscriber is already installed.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TryInitError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.directives()));

    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
    });
    let text_layer =
        (!config.json).then(|| tracing_subscriber::fmt::layer().compact().with_target(true));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_module_overrides() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("flotilla_store".into(), Level::DEBUG)],
            json: true,
        };
        assert_eq!(config.directives(), "warn,flotilla_store=debug");
    }

    #[test]
    fn from_names_skips_bad_levels() {
        let config = TelemetryConfig::from_names(
            "LOUD",
            [("flotilla_engine", "trace"), ("flotilla_store", "verbose")],
            false,
        );
        assert_eq!(config.log_level, Level::INFO);
        assert_eq!(config.module_levels, vec![("flotilla_engine".to_string(), Level::TRACE)]);
        assert!(!config.json);
    }

    #[test]
    fn parse_level_is_case_insensitive() {
        assert_eq!(parse_level("Debug"), Some(Level::DEBUG));
        assert_eq!(parse_level("nope"), None);
    }
}

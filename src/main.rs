//! # flotilla
//!
//! Coordinator daemon: opens the store, supervises agent workers and runs
//! the background maintenance loops until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use flotilla_core::SystemClock;
use flotilla_engine::{Coordinator, CoordinatorConfig, ProcessLauncher};
use flotilla_settings::{load_settings_from_path, resolve_path, settings_path, FlotillaSettings};
use flotilla_store::Database;
use flotilla_telemetry::{init_telemetry, TelemetryConfig};

/// Grace period for background tasks after cancellation.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Flotilla coordination daemon.
#[derive(Parser, Debug)]
#[command(name = "flotilla", about = "Multi-agent coordination core")]
struct Cli {
    /// Settings file (defaults to `~/.flotilla/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// SQLite database path (overrides settings).
    #[arg(long)]
    db: Option<PathBuf>,

    /// Print a health report as JSON and exit.
    #[arg(long)]
    health: bool,
}

fn load(cli: &Cli) -> Result<FlotillaSettings> {
    let path = cli.settings.clone().unwrap_or_else(settings_path);
    let mut settings =
        load_settings_from_path(&path).with_context(|| format!("Failed to load settings from {}", path.display()))?;
    if let Some(db) = &cli.db {
        settings.storage.database_path = db.display().to_string();
    }
    Ok(settings)
}

fn telemetry_config(settings: &FlotillaSettings) -> TelemetryConfig {
    let logging = &settings.logging;
    TelemetryConfig::from_names(
        &logging.level,
        logging.modules.iter().map(|(m, l)| (m.as_str(), l.as_str())),
        logging.json,
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;
    init_telemetry(&telemetry_config(&settings)).context("Failed to install tracing subscriber")?;

    let db_path = resolve_path(&settings.storage.database_path);
    let db = Database::open_with_fallback(&db_path, settings.storage.busy_timeout_ms)
        .context("No storage tier could be opened")?;
    info!(tier = %db.tier(), path = %db.path().display(), "database opened");

    let launcher = ProcessLauncher::new(settings.supervisor.worker_command.clone())
        .context("Invalid supervisor.workerCommand")?;
    let config = CoordinatorConfig::from_settings(&settings, &db);
    let coordinator = Arc::new(Coordinator::new(db, config, Arc::new(launcher), Arc::new(SystemClock)));

    if cli.health {
        let health = coordinator.get_system_health();
        println!("{}", serde_json::to_string_pretty(&health)?);
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let handles = coordinator.start_background(&cancel);
    info!("flotilla coordinator running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;
    info!("shutting down");

    coordinator.shutdown().await;
    cancel.cancel();
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, futures::future::join_all(handles))
        .await
        .is_err()
    {
        warn!("shutdown timed out after {SHUTDOWN_TIMEOUT:?}, some tasks may still be running");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_flag_overrides_settings() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::parse_from([
            "flotilla",
            "--settings",
            dir.path().join("missing.json").to_str().unwrap(),
            "--db",
            "/var/lib/flotilla/state.db",
        ]);
        let settings = load(&cli).unwrap();
        assert_eq!(settings.storage.database_path, "/var/lib/flotilla/state.db");
    }

    #[test]
    fn telemetry_follows_logging_settings() {
        let mut settings = FlotillaSettings::default();
        settings.logging.level = "debug".into();
        settings.logging.json = false;
        settings.logging.modules.insert("flotilla_store".into(), "trace".into());
        let config = telemetry_config(&settings);
        assert_eq!(config.directives(), "debug,flotilla_store=trace");
        assert!(!config.json);
    }
}

//! Shared fixtures for the end-to-end scenarios.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use flotilla_core::ManualClock;
use flotilla_engine::{
    Coordinator, CoordinatorConfig, EngineError, LaunchSpec, LaunchedWorker, WorkerExit, WorkerHandle, WorkerLauncher,
};
use flotilla_store::Database;

/// Records launches and hands out workers that only exit when told to.
#[derive(Default)]
pub struct RecordingLauncher {
    pub launched: Mutex<Vec<LaunchSpec>>,
}

struct IdleWorker {
    exit: watch::Sender<Option<WorkerExit>>,
}

#[async_trait]
impl WorkerHandle for IdleWorker {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn terminate(&self, _grace: Duration) -> Result<(), EngineError> {
        let _ = self.exit.send(Some(WorkerExit { code: None }));
        Ok(())
    }
}

#[async_trait]
impl WorkerLauncher for RecordingLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedWorker, EngineError> {
        self.launched.lock().push(spec.clone());
        let (tx, rx) = watch::channel(None);
        Ok(LaunchedWorker {
            handle: Arc::new(IdleWorker { exit: tx }),
            exit: rx,
        })
    }
}

pub struct Harness {
    pub coordinator: Coordinator,
    pub clock: ManualClock,
    pub launcher: Arc<RecordingLauncher>,
}

/// A coordinator over an on-disk database and file backups under `dir`,
/// so a second harness on the same `dir` sees the first one's state.
pub fn harness(dir: &Path, clock: ManualClock) -> Harness {
    let db = Database::open(&dir.join("flotilla.db")).unwrap();
    let launcher = Arc::new(RecordingLauncher::default());
    let config = CoordinatorConfig {
        backup_dir: Some(dir.join("checkpoints")),
        ..CoordinatorConfig::default()
    };
    Harness {
        coordinator: Coordinator::new(db, config, launcher.clone(), Arc::new(clock.clone())),
        clock,
        launcher,
    }
}

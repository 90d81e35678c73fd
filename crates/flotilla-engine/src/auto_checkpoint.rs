//! Periodic `auto` checkpoints for every active mission.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flotilla_core::checkpoints::{CheckpointSnapshot, CheckpointTrigger};
use flotilla_core::ids::MissionId;
use flotilla_store::PrunePolicy;

use crate::coordinator::Coordinator;
use crate::error::EngineError;

/// Supplies the live mission state that auto checkpoints capture.
pub trait SnapshotSource: Send + Sync {
    /// Missions that should be checkpointed on this tick.
    fn missions(&self) -> Vec<MissionId>;

    fn snapshot(&self, mission_id: &MissionId) -> Result<CheckpointSnapshot, EngineError>;
}

/// Checkpoint every mission once. Returns how many checkpoints were written.
pub fn checkpoint_all(coordinator: &Coordinator, source: &dyn SnapshotSource) -> usize {
    let keep_last = coordinator.config().keep_last;
    let mut written = 0;
    for mission_id in source.missions() {
        let result = source
            .snapshot(&mission_id)
            .and_then(|snapshot| coordinator.create_checkpoint(&mission_id, CheckpointTrigger::Auto, snapshot));
        match result {
            Ok(write) => {
                written += 1;
                if write.degraded {
                    warn!(mission_id = %mission_id, failed = ?write.failed_backends, "auto checkpoint degraded");
                }
            }
            Err(e) => {
                warn!(mission_id = %mission_id, error = %e, "auto checkpoint failed");
                continue;
            }
        }
        if keep_last > 0 {
            match coordinator.prune_checkpoints(PrunePolicy::KeepLast(keep_last), Some(&mission_id)) {
                Ok(0) => {}
                Ok(pruned) => debug!(mission_id = %mission_id, pruned, "old checkpoints pruned"),
                Err(e) => warn!(mission_id = %mission_id, error = %e, "checkpoint prune failed"),
            }
        }
    }
    written
}

pub async fn run_auto_checkpoints(
    coordinator: Arc<Coordinator>,
    source: Arc<dyn SnapshotSource>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let written = checkpoint_all(&coordinator, source.as_ref());
                if written > 0 {
                    info!(written, "auto checkpoints written");
                }
            }
        }
    }
    debug!("auto checkpoints stopped");
}

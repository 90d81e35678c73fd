//! Checkpoint persistence across prioritized backends.
//!
//! Every write goes to all backends. Reads prefer the first backend that
//! yields a valid record, so a corrupt or unreachable primary falls back to
//! the file copy. When the same checkpoint exists in several backends their
//! `consumed_at` values are merged (earliest claim wins).

mod file;
mod sqlite;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, instrument, warn};

use flotilla_core::checkpoints::{Checkpoint, CheckpointSnapshot, CheckpointTrigger};
use flotilla_core::errors::require_non_empty;
use flotilla_core::ids::{CheckpointId, MissionId};
use flotilla_core::Clock;

use crate::error::StoreError;

pub use file::FileCheckpointBackend;
pub use sqlite::SqliteCheckpointBackend;

/// One place checkpoints can be persisted.
pub trait CheckpointBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;

    /// `Ok(None)` when absent; `Err` when present but unreadable.
    fn load(&self, id: &CheckpointId) -> Result<Option<Checkpoint>, StoreError>;

    /// Most recent record for the mission that passes validation.
    fn latest(&self, mission_id: &MissionId) -> Result<Option<Checkpoint>, StoreError>;

    /// Valid records, newest first. Invalid ones are skipped.
    fn list(&self, mission_id: Option<&MissionId>) -> Result<Vec<Checkpoint>, StoreError>;

    fn delete(&self, id: &CheckpointId) -> Result<bool, StoreError>;

    /// Set `consumed_at` unless already set (or `force`).
    fn set_consumed(
        &self,
        id: &CheckpointId,
        at: DateTime<Utc>,
        force: bool,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Put `consumed_at` back to `previous` if it still reads `claimed_at`.
    /// Returns whether the record changed.
    fn revert_consumed(
        &self,
        id: &CheckpointId,
        claimed_at: DateTime<Utc>,
        previous: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    AlreadyConsumed(DateTime<Utc>),
    Missing,
}

/// Result of [`CheckpointManager::create`].
#[derive(Clone, Debug)]
pub struct CheckpointWrite {
    pub checkpoint: Checkpoint,
    /// At least one backend failed to persist the record.
    pub degraded: bool,
    pub failed_backends: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrunePolicy {
    /// Delete checkpoints created more than N days ago.
    OlderThanDays(u32),
    /// Keep the N newest checkpoints per mission.
    KeepLast(usize),
}

pub struct CheckpointManager {
    backends: Vec<Arc<dyn CheckpointBackend>>,
    clock: Arc<dyn Clock>,
}

impl CheckpointManager {
    /// `backends` in priority order; the first is the primary.
    pub fn new(backends: Vec<Arc<dyn CheckpointBackend>>, clock: Arc<dyn Clock>) -> Self {
        Self { backends, clock }
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    #[instrument(skip(self, snapshot), fields(mission_id = %mission_id, trigger = %trigger))]
    pub fn create(
        &self,
        mission_id: &MissionId,
        trigger: CheckpointTrigger,
        snapshot: CheckpointSnapshot,
    ) -> Result<CheckpointWrite, StoreError> {
        require_non_empty("mission_id", mission_id.as_str())?;
        snapshot.validate()?;
        if self.backends.is_empty() {
            return Err(StoreError::Storage("no checkpoint backends configured".into()));
        }

        let checkpoint = Checkpoint::from_snapshot(
            CheckpointId::new(),
            mission_id.clone(),
            trigger,
            snapshot,
            self.clock.now(),
        );

        let mut failed = Vec::new();
        for backend in &self.backends {
            if let Err(e) = backend.save(&checkpoint) {
                warn!(backend = backend.name(), error = %e, "checkpoint backend write failed");
                failed.push(format!("{}: {e}", backend.name()));
            }
        }

        if failed.len() == self.backends.len() {
            return Err(StoreError::Storage(format!(
                "checkpoint {} not persisted: {}",
                checkpoint.id,
                failed.join("; ")
            )));
        }
        let degraded = !failed.is_empty();
        if degraded {
            warn!(checkpoint_id = %checkpoint.id, "checkpoint written in degraded mode");
        } else {
            info!(checkpoint_id = %checkpoint.id, progress = checkpoint.progress_percent, "checkpoint created");
        }
        Ok(CheckpointWrite {
            checkpoint,
            degraded,
            failed_backends: failed,
        })
    }

    /// A checkpoint by id from the highest-priority backend holding a valid copy.
    pub fn get(&self, id: &CheckpointId) -> Result<Checkpoint, StoreError> {
        let mut found: Option<Checkpoint> = None;
        for backend in &self.backends {
            match backend.load(id) {
                Ok(Some(copy)) => match found.as_mut() {
                    Some(existing) => merge_consumed(existing, &copy),
                    None => found = Some(copy),
                },
                Ok(None) => {}
                Err(e) => warn!(backend = backend.name(), checkpoint_id = %id, error = %e, "checkpoint unreadable"),
            }
        }
        found.ok_or_else(|| StoreError::NotFound(format!("checkpoint {id}")))
    }

    /// The newest valid checkpoint for a mission across all backends.
    #[instrument(skip(self), fields(mission_id = %mission_id))]
    pub fn get_latest(&self, mission_id: &MissionId) -> Result<Checkpoint, StoreError> {
        let mut candidates = Vec::new();
        for backend in &self.backends {
            match backend.latest(mission_id) {
                Ok(Some(checkpoint)) => candidates.push(checkpoint),
                Ok(None) => {}
                Err(e) => warn!(backend = backend.name(), error = %e, "checkpoint backend unreadable"),
            }
        }

        let winner = candidates
            .iter()
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("no valid checkpoint for mission {mission_id}")))?;

        // Other backends may hold the same record with a different claim state.
        let mut merged = winner;
        for backend in &self.backends {
            if let Ok(Some(copy)) = backend.load(&merged.id) {
                merge_consumed(&mut merged, &copy);
            }
        }
        debug!(checkpoint_id = %merged.id, "latest checkpoint resolved");
        Ok(merged)
    }

    /// Union of all backends, newest first, one entry per id.
    pub fn list(&self, mission_id: Option<&MissionId>) -> Result<Vec<Checkpoint>, StoreError> {
        let mut by_id: HashMap<CheckpointId, Checkpoint> = HashMap::new();
        let mut readable = 0usize;
        let mut last_err = None;
        for backend in &self.backends {
            match backend.list(mission_id) {
                Ok(records) => {
                    readable += 1;
                    for record in records {
                        match by_id.get_mut(&record.id) {
                            Some(existing) => merge_consumed(existing, &record),
                            None => {
                                by_id.insert(record.id.clone(), record);
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(backend = backend.name(), error = %e, "checkpoint backend unreadable");
                    last_err = Some(e);
                }
            }
        }
        if readable == 0 {
            if let Some(e) = last_err {
                return Err(e);
            }
        }
        let mut all: Vec<_> = by_id.into_values().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(all)
    }

    /// Remove a checkpoint from every backend.
    #[instrument(skip(self), fields(checkpoint_id = %id))]
    pub fn delete(&self, id: &CheckpointId) -> Result<(), StoreError> {
        let mut deleted = 0usize;
        let mut failed = Vec::new();
        for backend in &self.backends {
            match backend.delete(id) {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(backend = backend.name(), error = %e, "checkpoint delete failed");
                    failed.push(format!("{}: {e}", backend.name()));
                }
            }
        }
        match (deleted, failed.is_empty()) {
            (_, true) if deleted > 0 => Ok(()),
            (0, true) => Err(StoreError::NotFound(format!("checkpoint {id}"))),
            (0, false) => Err(StoreError::Storage(failed.join("; "))),
            (succeeded, _) => Err(StoreError::PartialFailure { succeeded, failed }),
        }
    }

    /// Delete checkpoints matching `policy`, optionally for one mission.
    /// Returns the number of checkpoints removed.
    #[instrument(skip(self))]
    pub fn prune(&self, policy: PrunePolicy, mission_id: Option<&MissionId>) -> Result<usize, StoreError> {
        let all = self.list(mission_id)?;
        let doomed: Vec<CheckpointId> = match policy {
            PrunePolicy::OlderThanDays(days) => {
                let cutoff = self.clock.now() - Duration::days(i64::from(days));
                all.iter()
                    .filter(|c| c.created_at < cutoff)
                    .map(|c| c.id.clone())
                    .collect()
            }
            PrunePolicy::KeepLast(keep) => {
                // `all` is newest first, so per mission everything past `keep` goes.
                let mut seen: BTreeMap<&MissionId, usize> = BTreeMap::new();
                all.iter()
                    .filter(|c| {
                        let n = seen.entry(&c.mission_id).or_default();
                        *n += 1;
                        *n > keep
                    })
                    .map(|c| c.id.clone())
                    .collect()
            }
        };

        let mut removed = 0usize;
        let mut failed = Vec::new();
        for id in &doomed {
            match self.delete(id) {
                Ok(()) => removed += 1,
                Err(StoreError::NotFound(_)) => {}
                Err(StoreError::PartialFailure { failed: f, .. }) => {
                    removed += 1;
                    failed.extend(f);
                }
                Err(e) => failed.push(format!("{id}: {e}")),
            }
        }
        if !failed.is_empty() {
            warn!(removed, failures = failed.len(), "checkpoint prune incomplete");
            return Err(StoreError::PartialFailure {
                succeeded: removed,
                failed,
            });
        }
        info!(removed, "checkpoints pruned");
        Ok(removed)
    }

    /// Mark a checkpoint consumed. The first backend that holds the record
    /// decides the outcome; a successful claim is mirrored to the rest.
    #[instrument(skip(self), fields(checkpoint_id = %id))]
    pub fn claim(&self, id: &CheckpointId, at: DateTime<Utc>, force: bool) -> Result<ClaimOutcome, StoreError> {
        let mut errors = Vec::new();
        for (idx, backend) in self.backends.iter().enumerate() {
            match backend.set_consumed(id, at, force) {
                Ok(ClaimOutcome::Missing) => {}
                Ok(ClaimOutcome::Claimed) => {
                    for other in self.backends.iter().skip(idx + 1) {
                        if let Err(e) = other.set_consumed(id, at, true) {
                            warn!(backend = other.name(), error = %e, "claim not mirrored");
                        }
                    }
                    return Ok(ClaimOutcome::Claimed);
                }
                Ok(outcome @ ClaimOutcome::AlreadyConsumed(_)) => return Ok(outcome),
                Err(e) => {
                    warn!(backend = backend.name(), error = %e, "claim failed on backend");
                    errors.push(format!("{}: {e}", backend.name()));
                }
            }
        }
        if errors.is_empty() {
            Ok(ClaimOutcome::Missing)
        } else {
            Err(StoreError::Storage(errors.join("; ")))
        }
    }

    /// Undo a claim made at `claimed_at` on every backend that still shows
    /// it. A later claim by someone else is left alone.
    #[instrument(skip(self), fields(checkpoint_id = %id))]
    pub fn release_claim(
        &self,
        id: &CheckpointId,
        claimed_at: DateTime<Utc>,
        previous: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let mut reverted = false;
        let mut errors = Vec::new();
        for backend in &self.backends {
            match backend.revert_consumed(id, claimed_at, previous) {
                Ok(changed) => reverted |= changed,
                Err(e) => {
                    warn!(backend = backend.name(), error = %e, "claim not released on backend");
                    errors.push(format!("{}: {e}", backend.name()));
                }
            }
        }
        if errors.len() == self.backends.len() && !errors.is_empty() {
            return Err(StoreError::Storage(errors.join("; ")));
        }
        Ok(reverted)
    }
}

/// Earliest recorded claim wins.
fn merge_consumed(into: &mut Checkpoint, other: &Checkpoint) {
    into.consumed_at = match (into.consumed_at, other.consumed_at) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
}

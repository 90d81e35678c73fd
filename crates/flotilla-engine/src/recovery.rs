//! Resume a mission from a checkpoint.
//!
//! The whole plan is computed from reads only. A live resume then claims
//! the checkpoint before touching anything else, so of two concurrent
//! resumes exactly one proceeds. If the requeue batch cannot be appended
//! the claim is released again and no lock has been taken yet.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use flotilla_core::checkpoints::{
    AgentSnapshot, Checkpoint, LockSnapshot, PendingMessage, RecoveryContext, SortieSnapshot,
};
use flotilla_core::clock::elapsed_ms;
use flotilla_core::events::{EventPayload, NewEvent};
use flotilla_core::ids::{CheckpointId, MailboxId, MissionId};
use flotilla_core::locks::Lock;
use flotilla_core::Clock;
use flotilla_store::{CheckpointManager, ClaimOutcome, EventStore, LockRepo, StoreError};

use crate::error::EngineError;

/// What to resume from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ResumeTarget {
    Checkpoint(CheckpointId),
    /// The mission's latest valid checkpoint.
    Mission(MissionId),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeOptions {
    pub dry_run: bool,
    /// Resume even if the checkpoint was already consumed.
    pub force: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SkippedLock {
    pub lock: LockSnapshot,
    pub reason: String,
}

/// Context handed to whoever picks the mission back up.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecoveryEnvironment {
    pub progress_percent: f64,
    pub recovery_context: RecoveryContext,
    pub pending_messages: Vec<PendingMessage>,
    pub checkpoint_created_at: DateTime<Utc>,
    pub created_by: String,
    /// Wall time between the snapshot and this plan.
    pub since_checkpoint_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub checkpoint_id: CheckpointId,
    pub mission_id: MissionId,
    pub agents_to_restore: Vec<AgentSnapshot>,
    pub tasks_to_resume: Vec<SortieSnapshot>,
    pub locks_to_restore: Vec<LockSnapshot>,
    pub skipped_locks: Vec<SkippedLock>,
    pub environment: RecoveryEnvironment,
    /// Set when the checkpoint had been consumed before this plan was made.
    pub already_consumed: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LockConflict {
    pub resource_key: String,
    pub holder_id: String,
    pub error: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub plan: RecoveryPlan,
    pub dry_run: bool,
    pub restored_locks: Vec<Lock>,
    pub lock_conflicts: Vec<LockConflict>,
    /// `seq` of each `sortie_requeued` event appended to the mission mailbox.
    pub requeued_seqs: Vec<i64>,
    pub consumed_at: Option<DateTime<Utc>>,
    /// Agents started again for the plan, filled in by the coordinator.
    #[serde(default)]
    pub respawned_agents: Vec<flotilla_core::ids::AgentId>,
}

pub struct RecoveryEngine {
    checkpoints: Arc<CheckpointManager>,
    locks: Arc<LockRepo>,
    events: Arc<EventStore>,
    clock: Arc<dyn Clock>,
}

impl RecoveryEngine {
    pub fn new(
        checkpoints: Arc<CheckpointManager>,
        locks: Arc<LockRepo>,
        events: Arc<EventStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            checkpoints,
            locks,
            events,
            clock,
        }
    }

    #[instrument(skip(self))]
    pub fn resume(&self, target: &ResumeTarget, options: ResumeOptions) -> Result<RecoveryReport, EngineError> {
        let checkpoint = self.load(target)?;
        let plan = self.plan(&checkpoint)?;

        if options.dry_run {
            info!(
                checkpoint_id = %plan.checkpoint_id,
                tasks = plan.tasks_to_resume.len(),
                locks = plan.locks_to_restore.len(),
                "dry-run resume planned"
            );
            return Ok(RecoveryReport {
                plan,
                dry_run: true,
                restored_locks: Vec::new(),
                lock_conflicts: Vec::new(),
                requeued_seqs: Vec::new(),
                consumed_at: None,
                respawned_agents: Vec::new(),
            });
        }

        if let (Some(consumed_at), false) = (plan.already_consumed, options.force) {
            return Err(EngineError::AlreadyConsumed {
                checkpoint_id: plan.checkpoint_id.clone(),
                consumed_at,
            });
        }

        let now = self.clock.now();
        match self.checkpoints.claim(&plan.checkpoint_id, now, options.force)? {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::AlreadyConsumed(consumed_at) => {
                return Err(EngineError::AlreadyConsumed {
                    checkpoint_id: plan.checkpoint_id.clone(),
                    consumed_at,
                })
            }
            ClaimOutcome::Missing => {
                return Err(EngineError::NotFound(format!("checkpoint {}", plan.checkpoint_id)))
            }
        }

        let requeued_seqs = match self.requeue(&plan) {
            Ok(seqs) => seqs,
            Err(e) => {
                if let Err(release_err) = self
                    .checkpoints
                    .release_claim(&plan.checkpoint_id, now, plan.already_consumed)
                {
                    warn!(checkpoint_id = %plan.checkpoint_id, error = %release_err, "claim not released");
                }
                warn!(checkpoint_id = %plan.checkpoint_id, error = %e, "requeue failed, resume abandoned");
                return Err(e);
            }
        };
        let (restored_locks, lock_conflicts) = self.restore_locks(&plan.locks_to_restore);

        info!(
            checkpoint_id = %plan.checkpoint_id,
            mission_id = %plan.mission_id,
            requeued = requeued_seqs.len(),
            restored_locks = restored_locks.len(),
            conflicts = lock_conflicts.len(),
            "checkpoint resumed"
        );
        Ok(RecoveryReport {
            plan,
            dry_run: false,
            restored_locks,
            lock_conflicts,
            requeued_seqs,
            consumed_at: Some(now),
            respawned_agents: Vec::new(),
        })
    }

    fn load(&self, target: &ResumeTarget) -> Result<Checkpoint, EngineError> {
        let result = match target {
            ResumeTarget::Checkpoint(id) => self.checkpoints.get(id),
            ResumeTarget::Mission(mission_id) => self.checkpoints.get_latest(mission_id),
        };
        result.map_err(|e| match e {
            StoreError::NotFound(what) => EngineError::NotFound(what),
            other => other.into(),
        })
    }

    /// Read-only. Any failure here aborts the resume before a mutation.
    pub fn plan(&self, checkpoint: &Checkpoint) -> Result<RecoveryPlan, EngineError> {
        let now = self.clock.now();

        let mut locks_to_restore = Vec::new();
        let mut skipped_locks = Vec::new();
        for snapshot in &checkpoint.active_locks {
            match self.locks.active_for(&snapshot.resource_key)? {
                Some(current) if current.holder_id != snapshot.holder_id => skipped_locks.push(SkippedLock {
                    lock: snapshot.clone(),
                    reason: format!("held by {} until {}", current.holder_id, describe_expiry(&current)),
                }),
                _ => locks_to_restore.push(snapshot.clone()),
            }
        }

        Ok(RecoveryPlan {
            checkpoint_id: checkpoint.id.clone(),
            mission_id: checkpoint.mission_id.clone(),
            agents_to_restore: checkpoint
                .agents
                .iter()
                .filter(|a| !a.status.is_terminal())
                .cloned()
                .collect(),
            tasks_to_resume: checkpoint.unfinished_sorties().cloned().collect(),
            locks_to_restore,
            skipped_locks,
            environment: RecoveryEnvironment {
                progress_percent: checkpoint.progress_percent,
                recovery_context: checkpoint.recovery_context.clone(),
                pending_messages: checkpoint.pending_messages.clone(),
                checkpoint_created_at: checkpoint.created_at,
                created_by: checkpoint.created_by.clone(),
                since_checkpoint_ms: elapsed_ms(checkpoint.created_at, now),
            },
            already_consumed: checkpoint.consumed_at,
        })
    }

    /// Best effort: every failure is reported, none aborts the resume.
    /// A restored lease keeps only the time it had left, at least 1 ms.
    fn restore_locks(&self, wanted: &[LockSnapshot]) -> (Vec<Lock>, Vec<LockConflict>) {
        let now = self.clock.now();
        let mut restored = Vec::new();
        let mut conflicts = Vec::new();
        for snapshot in wanted {
            let ttl_ms = snapshot.expires_at.map(|exp| elapsed_ms(now, exp).max(1));
            match self.locks.acquire(&snapshot.resource_key, &snapshot.holder_id, ttl_ms) {
                Ok(lock) => restored.push(lock),
                Err(e) => {
                    warn!(resource_key = %snapshot.resource_key, error = %e, "lock not restored");
                    conflicts.push(LockConflict {
                        resource_key: snapshot.resource_key.clone(),
                        holder_id: snapshot.holder_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        (restored, conflicts)
    }

    fn requeue(&self, plan: &RecoveryPlan) -> Result<Vec<i64>, EngineError> {
        if plan.tasks_to_resume.is_empty() {
            return Ok(Vec::new());
        }
        let correlation = plan.checkpoint_id.to_string();
        let batch = plan
            .tasks_to_resume
            .iter()
            .map(|sortie| {
                NewEvent::new(EventPayload::SortieRequeued {
                    sortie_id: sortie.id.clone(),
                    checkpoint_id: plan.checkpoint_id.clone(),
                    previous_status: sortie.status,
                    assigned_to: sortie.assigned_to.clone(),
                })
                .correlated(correlation.clone())
            })
            .collect();
        let mailbox = MailboxId::for_mission(&plan.mission_id);
        let appended = self.events.append(&mailbox, batch)?;
        Ok(appended.into_iter().map(|e| e.seq).collect())
    }
}

fn describe_expiry(lock: &Lock) -> String {
    lock.expires_at
        .map_or_else(|| "released".to_string(), flotilla_core::clock::format_ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::checkpoints::{CheckpointSnapshot, CheckpointTrigger, SortieStatus};
    use flotilla_core::events::EventType;
    use flotilla_core::ManualClock;
    use flotilla_store::{Database, SqliteCheckpointBackend};

    struct Fixture {
        db: Database,
        engine: RecoveryEngine,
        checkpoints: Arc<CheckpointManager>,
        locks: Arc<LockRepo>,
        events: Arc<EventStore>,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let db = Database::in_memory().unwrap();
        let clock = ManualClock::default();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let checkpoints = Arc::new(CheckpointManager::new(
            vec![Arc::new(SqliteCheckpointBackend::new(db.clone()))],
            shared.clone(),
        ));
        let locks = Arc::new(LockRepo::new(db.clone(), shared.clone()));
        let events = Arc::new(EventStore::new(db.clone(), shared.clone()));
        Fixture {
            db,
            engine: RecoveryEngine::new(checkpoints.clone(), locks.clone(), events.clone(), shared),
            checkpoints,
            locks,
            events,
            clock,
        }
    }

    fn checkpoint(f: &Fixture, locks: Vec<LockSnapshot>) -> Checkpoint {
        f.checkpoints
            .create(
                &MissionId::from_raw("msn-1"),
                CheckpointTrigger::Error,
                CheckpointSnapshot {
                    progress_percent: 50.0,
                    sorties: vec![
                        SortieSnapshot::new("s-1", SortieStatus::Pending),
                        SortieSnapshot::new("s-2", SortieStatus::InProgress),
                        SortieSnapshot::new("s-3", SortieStatus::Completed),
                    ],
                    active_locks: locks,
                    created_by: "coordinator".into(),
                    ..Default::default()
                },
            )
            .unwrap()
            .checkpoint
    }

    fn snapshot_of(lock: &Lock) -> LockSnapshot {
        LockSnapshot::from(lock)
    }

    #[test]
    fn dry_run_never_mutates() {
        let f = fixture();
        let cp = checkpoint(&f, vec![]);
        let report = f
            .engine
            .resume(&ResumeTarget::Checkpoint(cp.id.clone()), ResumeOptions { dry_run: true, force: false })
            .unwrap();
        assert!(report.dry_run);
        assert_eq!(report.plan.tasks_to_resume.len(), 2);
        assert!(report.consumed_at.is_none());
        assert!(f.checkpoints.get(&cp.id).unwrap().consumed_at.is_none());
        assert_eq!(f.events.head(&MailboxId::for_mission(&cp.mission_id)).unwrap(), 0);
    }

    #[test]
    fn live_resume_requeues_and_claims() {
        let f = fixture();
        let cp = checkpoint(&f, vec![]);
        let report = f
            .engine
            .resume(&ResumeTarget::Mission(cp.mission_id.clone()), ResumeOptions::default())
            .unwrap();
        assert_eq!(report.requeued_seqs, vec![1, 2]);
        assert_eq!(f.checkpoints.get(&cp.id).unwrap().consumed_at, report.consumed_at);

        let events = f
            .events
            .get_by_stream(&MailboxId::for_mission(&cp.mission_id), None)
            .unwrap();
        assert!(events.iter().all(|e| e.event_type() == EventType::SortieRequeued));
        assert_eq!(events[0].correlation_id.as_deref(), Some(cp.id.as_str()));
    }

    #[test]
    fn second_resume_fails_unless_forced() {
        let f = fixture();
        let cp = checkpoint(&f, vec![]);
        let target = ResumeTarget::Checkpoint(cp.id.clone());
        f.engine.resume(&target, ResumeOptions::default()).unwrap();

        let err = f.engine.resume(&target, ResumeOptions::default()).unwrap_err();
        assert_eq!(err.error_kind(), "already_consumed");

        let dry = f
            .engine
            .resume(&target, ResumeOptions { dry_run: true, force: false })
            .unwrap();
        assert!(dry.plan.already_consumed.is_some());

        f.clock.advance_ms(10);
        let forced = f
            .engine
            .resume(&target, ResumeOptions { dry_run: false, force: true })
            .unwrap();
        assert_eq!(forced.consumed_at, Some(f.clock.now()));
    }

    #[test]
    fn locks_held_by_others_are_skipped() {
        let f = fixture();
        let mine = f.locks.acquire("src/a.rs", "agent-a", Some(60_000)).unwrap();
        let theirs = f.locks.acquire("src/b.rs", "agent-a", Some(1_000)).unwrap();
        let cp = checkpoint(&f, vec![snapshot_of(&mine), snapshot_of(&theirs)]);

        // agent-a's lease on b lapses and agent-b takes it.
        f.clock.advance_ms(2_000);
        f.locks.acquire("src/b.rs", "agent-b", Some(60_000)).unwrap();

        let report = f
            .engine
            .resume(&ResumeTarget::Checkpoint(cp.id), ResumeOptions::default())
            .unwrap();
        assert_eq!(report.plan.locks_to_restore.len(), 1);
        assert_eq!(report.plan.locks_to_restore[0].resource_key, "src/a.rs");
        assert_eq!(report.plan.skipped_locks.len(), 1);
        assert!(report.plan.skipped_locks[0].reason.contains("agent-b"));
        assert_eq!(report.restored_locks.len(), 1);
        assert!(report.lock_conflicts.is_empty());
    }

    #[test]
    fn free_resources_are_reacquired() {
        let f = fixture();
        let lock = f.locks.acquire("src/c.rs", "agent-a", Some(5_000)).unwrap();
        let cp = checkpoint(&f, vec![snapshot_of(&lock)]);
        f.locks.release(&lock.id, "agent-a").unwrap();

        let report = f
            .engine
            .resume(&ResumeTarget::Checkpoint(cp.id), ResumeOptions::default())
            .unwrap();
        assert_eq!(report.restored_locks.len(), 1);
        assert_eq!(report.restored_locks[0].holder_id, "agent-a");
        assert_eq!(report.restored_locks[0].ttl_ms(), Some(5_000));
    }

    #[test]
    fn restored_lease_keeps_only_its_remaining_time() {
        let f = fixture();
        let nearly_done = f.locks.acquire("src/d.rs", "agent-a", Some(5_000)).unwrap();
        let lapsed = f.locks.acquire("src/e.rs", "agent-a", Some(1_000)).unwrap();
        let cp = checkpoint(&f, vec![snapshot_of(&nearly_done), snapshot_of(&lapsed)]);
        f.locks.release(&nearly_done.id, "agent-a").unwrap();
        f.clock.advance_ms(4_000);

        let report = f
            .engine
            .resume(&ResumeTarget::Checkpoint(cp.id), ResumeOptions::default())
            .unwrap();
        let ttl = |key: &str| {
            report
                .restored_locks
                .iter()
                .find(|l| l.resource_key == key)
                .and_then(Lock::ttl_ms)
        };
        assert_eq!(ttl("src/d.rs"), Some(1_000));
        assert_eq!(ttl("src/e.rs"), Some(1));
    }

    #[test]
    fn failed_requeue_releases_the_claim_and_takes_no_locks() {
        let f = fixture();
        let lock = f.locks.acquire("src/c.rs", "agent-a", Some(5_000)).unwrap();
        let cp = checkpoint(&f, vec![snapshot_of(&lock)]);
        f.locks.release(&lock.id, "agent-a").unwrap();
        f.db.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER refuse_events BEFORE INSERT ON events
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )?;
            Ok(())
        })
        .unwrap();

        let target = ResumeTarget::Checkpoint(cp.id.clone());
        assert!(f.engine.resume(&target, ResumeOptions::default()).is_err());
        assert!(f.checkpoints.get(&cp.id).unwrap().consumed_at.is_none());
        assert!(f.locks.active_for("src/c.rs").unwrap().is_none());
        assert_eq!(f.events.count(&MailboxId::for_mission(&cp.mission_id)).unwrap(), 0);

        f.db.with_conn(|conn| {
            conn.execute_batch("DROP TRIGGER refuse_events")?;
            Ok(())
        })
        .unwrap();
        let report = f.engine.resume(&target, ResumeOptions::default()).unwrap();
        assert_eq!(report.requeued_seqs, vec![1, 2]);
        assert_eq!(report.restored_locks.len(), 1);
        assert_eq!(f.checkpoints.get(&cp.id).unwrap().consumed_at, report.consumed_at);
    }

    #[test]
    fn unknown_targets_are_not_found() {
        let f = fixture();
        let err = f
            .engine
            .resume(&ResumeTarget::Mission(MissionId::from_raw("msn-none")), ResumeOptions::default())
            .unwrap_err();
        assert!(err.is_not_found());
        let err = f
            .engine
            .resume(&ResumeTarget::Checkpoint(CheckpointId::from_raw("ckpt_none")), ResumeOptions::default())
            .unwrap_err();
        assert!(err.is_not_found());
    }
}

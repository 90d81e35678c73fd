//! Single entry point over the store, recovery engine and supervisor.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use flotilla_core::agents::{AgentRecord, AgentStatus, ResourceSample, ResourceTrend, SpawnConfig};
use flotilla_core::checkpoints::{Checkpoint, CheckpointSnapshot, CheckpointTrigger};
use flotilla_core::events::{Event, EventPayload, NewEvent};
use flotilla_core::ids::{AgentId, CheckpointId, LockId, MailboxId, MissionId};
use flotilla_core::locks::Lock;
use flotilla_core::Clock;
use flotilla_settings::{resolve_path, FlotillaSettings};
use flotilla_store::{
    AgentRepo, CheckpointBackend, CheckpointManager, CheckpointWrite, Cursor, CursorRepo, Database, EventStore,
    FileCheckpointBackend, LockRepo, Mailbox, MailboxRepo, PrunePolicy, RetryPolicy, SqliteCheckpointBackend,
};

use crate::auto_checkpoint::{run_auto_checkpoints, SnapshotSource};
use crate::error::EngineError;
use crate::health::{classify, AgentCount, SystemHealth};
use crate::recovery::{RecoveryEngine, RecoveryReport, ResumeOptions, ResumeTarget};
use crate::supervisor::{Supervisor, SupervisorConfig, WorkerLauncher};
use crate::sweeper::run_lock_sweeper;

/// Runtime knobs, resolved from [`FlotillaSettings`] once at startup.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Lease applied when a caller acquires without a ttl. `None` leases
    /// until release.
    pub default_lock_ttl_ms: Option<u64>,
    pub sweep_interval: Duration,
    pub append_retry: RetryPolicy,
    /// File checkpoint backup directory; `None` keeps checkpoints in SQLite only.
    pub backup_dir: Option<PathBuf>,
    pub auto_checkpoint_interval: Option<Duration>,
    pub keep_last: usize,
    pub respawn_agents_on_resume: bool,
    pub supervisor: SupervisorConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_lock_ttl_ms: None,
            sweep_interval: Duration::from_secs(30),
            append_retry: RetryPolicy::default(),
            backup_dir: None,
            auto_checkpoint_interval: None,
            keep_last: 20,
            respawn_agents_on_resume: false,
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// The backup directory follows the database's storage tier.
    pub fn from_settings(settings: &FlotillaSettings, db: &Database) -> Self {
        let configured = resolve_path(&settings.storage.backup_dir);
        Self {
            default_lock_ttl_ms: settings.locks.default_ttl_ms,
            sweep_interval: Duration::from_millis(settings.locks.sweep_interval_ms),
            append_retry: RetryPolicy {
                max_attempts: settings.events.append_max_attempts,
                base_delay_ms: settings.events.append_base_delay_ms,
                max_delay_ms: settings.events.append_max_delay_ms,
            },
            backup_dir: Some(db.backup_dir(&configured)),
            auto_checkpoint_interval: settings.checkpoints.auto_interval_ms.map(Duration::from_millis),
            keep_last: settings.checkpoints.keep_last,
            respawn_agents_on_resume: settings.checkpoints.respawn_agents_on_resume,
            supervisor: SupervisorConfig::from(&settings.supervisor),
        }
    }
}

pub struct Coordinator {
    db: Database,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
    events: Arc<EventStore>,
    mailboxes: MailboxRepo,
    cursors: CursorRepo,
    locks: Arc<LockRepo>,
    checkpoints: Arc<CheckpointManager>,
    recovery: RecoveryEngine,
    supervisor: Arc<Supervisor>,
    snapshots: Option<Arc<dyn SnapshotSource>>,
}

impl Coordinator {
    pub fn new(
        db: Database,
        config: CoordinatorConfig,
        launcher: Arc<dyn WorkerLauncher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let events = Arc::new(EventStore::new(db.clone(), clock.clone()).with_retry_policy(config.append_retry));
        let locks = Arc::new(LockRepo::new(db.clone(), clock.clone()));

        let mut backends: Vec<Arc<dyn CheckpointBackend>> = vec![Arc::new(SqliteCheckpointBackend::new(db.clone()))];
        if let Some(dir) = &config.backup_dir {
            backends.push(Arc::new(FileCheckpointBackend::new(dir.clone())));
        }
        let checkpoints = Arc::new(CheckpointManager::new(backends, clock.clone()));

        let recovery = RecoveryEngine::new(checkpoints.clone(), locks.clone(), events.clone(), clock.clone());
        let supervisor = Arc::new(Supervisor::new(
            AgentRepo::new(db.clone(), clock.clone()),
            locks.clone(),
            events.clone(),
            launcher,
            clock.clone(),
            config.supervisor.clone(),
        ));

        info!(
            tier = %db.tier(),
            path = %db.path().display(),
            backends = ?checkpoints.backend_names(),
            "coordinator ready"
        );
        Self {
            mailboxes: MailboxRepo::new(db.clone(), clock.clone()),
            cursors: CursorRepo::new(db.clone(), clock.clone()),
            db,
            clock,
            config,
            events,
            locks,
            checkpoints,
            recovery,
            supervisor,
            snapshots: None,
        }
    }

    /// Source of mission state for periodic checkpoints.
    pub fn with_snapshot_source(mut self, source: Arc<dyn SnapshotSource>) -> Self {
        self.snapshots = Some(source);
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    // ── Events ──────────────────────────────────────────────────────────

    pub fn create_mailbox(&self) -> Result<Mailbox, EngineError> {
        Ok(self.mailboxes.create(&MailboxId::new())?)
    }

    pub fn get_mailbox(&self, id: &MailboxId) -> Result<Mailbox, EngineError> {
        Ok(self.mailboxes.get(id)?)
    }

    pub fn append_events(&self, stream_id: &MailboxId, events: Vec<NewEvent>) -> Result<Vec<Event>, EngineError> {
        Ok(self.events.append(stream_id, events)?)
    }

    pub fn get_events(&self, stream_id: &MailboxId, from_seq: Option<i64>) -> Result<Vec<Event>, EngineError> {
        Ok(self.events.get_by_stream(stream_id, from_seq)?)
    }

    // ── Cursors ─────────────────────────────────────────────────────────

    pub fn get_cursor(&self, stream_id: &MailboxId, consumer_id: &str) -> Result<i64, EngineError> {
        Ok(self.cursors.get_position(stream_id, consumer_id)?)
    }

    pub fn advance_cursor(
        &self,
        stream_id: &MailboxId,
        consumer_id: &str,
        position: i64,
        force: bool,
    ) -> Result<Cursor, EngineError> {
        Ok(self.cursors.advance(stream_id, consumer_id, position, force)?)
    }

    /// Unprocessed events for a consumer, without moving its cursor.
    pub fn read_next(&self, stream_id: &MailboxId, consumer_id: &str, limit: u32) -> Result<Vec<Event>, EngineError> {
        Ok(self.cursors.read_next(stream_id, consumer_id, limit)?)
    }

    pub fn cursor_lag(&self, stream_id: &MailboxId, consumer_id: &str) -> Result<i64, EngineError> {
        Ok(self.cursors.lag(stream_id, consumer_id)?)
    }

    // ── Locks ───────────────────────────────────────────────────────────

    /// Take or refresh a lease. Without `ttl_ms` the configured default applies.
    pub fn acquire_lock(&self, resource_key: &str, holder_id: &str, ttl_ms: Option<u64>) -> Result<Lock, EngineError> {
        let lock = self
            .locks
            .acquire(resource_key, holder_id, ttl_ms.or(self.config.default_lock_ttl_ms))?;
        self.journal_lock(&lock);
        Ok(lock)
    }

    pub fn release_lock(&self, lock_id: &LockId, holder_id: &str) -> Result<Lock, EngineError> {
        let lock = self.locks.release(lock_id, holder_id)?;
        self.journal_lock(&lock);
        Ok(lock)
    }

    pub fn renew_lock(&self, lock_id: &LockId, holder_id: &str, ttl_ms: u64) -> Result<Lock, EngineError> {
        Ok(self.locks.renew(lock_id, holder_id, ttl_ms)?)
    }

    pub fn list_active_locks(&self) -> Result<Vec<Lock>, EngineError> {
        Ok(self.locks.list_active()?)
    }

    /// Lease changes are journalled best-effort; the lock table is authoritative.
    fn journal_lock(&self, lock: &Lock) {
        let event = NewEvent::new(EventPayload::LockChanged {
            lock_id: lock.id.clone(),
            resource_key: lock.resource_key.clone(),
            holder_id: lock.holder_id.clone(),
            status: lock.status,
        });
        if let Err(e) = self.events.append(&MailboxId::lock_journal(), vec![event]) {
            warn!(lock_id = %lock.id, error = %e, "lock change not journalled");
        }
    }

    // ── Checkpoints ─────────────────────────────────────────────────────

    /// Persist a snapshot and announce it on the mission mailbox.
    #[instrument(skip(self, snapshot), fields(mission_id = %mission_id))]
    pub fn create_checkpoint(
        &self,
        mission_id: &MissionId,
        trigger: CheckpointTrigger,
        snapshot: CheckpointSnapshot,
    ) -> Result<CheckpointWrite, EngineError> {
        let write = self.checkpoints.create(mission_id, trigger, snapshot)?;
        let checkpoint = &write.checkpoint;
        let event = NewEvent::new(EventPayload::CheckpointCreated {
            checkpoint_id: checkpoint.id.clone(),
            mission_id: checkpoint.mission_id.clone(),
            trigger,
            progress_percent: checkpoint.progress_percent,
        })
        .correlated(checkpoint.id.to_string());
        if let Err(e) = self.events.append(&MailboxId::for_mission(mission_id), vec![event]) {
            warn!(checkpoint_id = %checkpoint.id, error = %e, "checkpoint event not recorded");
        }
        Ok(write)
    }

    pub fn get_checkpoint(&self, id: &CheckpointId) -> Result<Checkpoint, EngineError> {
        Ok(self.checkpoints.get(id)?)
    }

    pub fn get_latest_checkpoint(&self, mission_id: &MissionId) -> Result<Checkpoint, EngineError> {
        Ok(self.checkpoints.get_latest(mission_id)?)
    }

    pub fn list_checkpoints(&self, mission_id: Option<&MissionId>) -> Result<Vec<Checkpoint>, EngineError> {
        Ok(self.checkpoints.list(mission_id)?)
    }

    pub fn delete_checkpoint(&self, id: &CheckpointId) -> Result<(), EngineError> {
        Ok(self.checkpoints.delete(id)?)
    }

    pub fn prune_checkpoints(&self, policy: PrunePolicy, mission_id: Option<&MissionId>) -> Result<usize, EngineError> {
        Ok(self.checkpoints.prune(policy, mission_id)?)
    }

    /// Resume from a checkpoint. With `respawn_agents_on_resume` set, a live
    /// resume also starts a fresh agent for every agent the plan restores;
    /// a failed respawn is logged and left out of the report.
    pub async fn resume_checkpoint(
        &self,
        target: &ResumeTarget,
        options: ResumeOptions,
    ) -> Result<RecoveryReport, EngineError> {
        let mut report = self.recovery.resume(target, options)?;
        if report.dry_run || !self.config.respawn_agents_on_resume {
            return Ok(report);
        }
        for agent in &report.plan.agents_to_restore {
            match self
                .supervisor
                .spawn(&agent.agent_type, &agent.task, agent.config.clone())
                .await
            {
                Ok(record) => report.respawned_agents.push(record.id),
                Err(e) => warn!(agent_id = %agent.agent_id, error = %e, "agent not respawned on resume"),
            }
        }
        Ok(report)
    }

    // ── Agents ──────────────────────────────────────────────────────────

    pub async fn spawn_agent(&self, agent_type: &str, task: &str, config: SpawnConfig) -> Result<AgentRecord, EngineError> {
        self.supervisor.spawn(agent_type, task, config).await
    }

    pub async fn heartbeat(&self, agent_id: &AgentId, sample: Option<ResourceSample>) -> Result<AgentRecord, EngineError> {
        self.supervisor.heartbeat(agent_id, sample).await
    }

    pub fn get_agent(&self, agent_id: &AgentId) -> Result<AgentRecord, EngineError> {
        self.supervisor.get(agent_id)
    }

    pub fn list_agents(&self, status: Option<AgentStatus>) -> Result<Vec<AgentRecord>, EngineError> {
        self.supervisor.list(status)
    }

    pub async fn terminate_agent(&self, agent_id: &AgentId) -> Result<AgentRecord, EngineError> {
        self.supervisor.terminate(agent_id).await
    }

    pub fn agent_resource_trend(&self, agent_id: &AgentId) -> Result<ResourceTrend, EngineError> {
        self.supervisor.resource_trend(agent_id)
    }

    // ── Health ──────────────────────────────────────────────────────────

    /// Never fails; unreadable parts show up as a degraded status.
    pub fn get_system_health(&self) -> SystemHealth {
        let now = self.clock.now();
        let store_reachable = match self.db.ping() {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "store unreachable");
                false
            }
        };
        let locks = flotilla_store::locks::count_live(&self.db, now);
        let agents = self.supervisor.count_by_status();
        let counts_ok = locks.is_ok() && agents.is_ok();

        SystemHealth {
            status: classify(self.db.tier(), store_reachable, counts_ok),
            storage_tier: self.db.tier(),
            database_path: self.db.path().display().to_string(),
            store_reachable,
            active_locks: locks.unwrap_or(0),
            agents: agents
                .unwrap_or_default()
                .into_iter()
                .map(|(status, count)| AgentCount { status, count })
                .collect(),
            supervised_agents: self.supervisor.supervised_count(),
            checkpoint_backends: self.checkpoints.backend_names(),
            checked_at: now,
        }
    }

    // ── Background work ─────────────────────────────────────────────────

    /// Start the lock sweeper, heartbeat checks and, when configured, the
    /// auto-checkpoint loop. All stop when `cancel` fires.
    pub fn start_background(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = vec![
            tokio::spawn(run_lock_sweeper(
                self.locks.clone(),
                self.config.sweep_interval,
                cancel.child_token(),
            )),
            tokio::spawn(self.supervisor.clone().run_health_checks(cancel.child_token())),
        ];

        match (self.config.auto_checkpoint_interval, &self.snapshots) {
            (Some(interval), Some(source)) => handles.push(tokio::spawn(run_auto_checkpoints(
                Arc::clone(self),
                source.clone(),
                interval,
                cancel.child_token(),
            ))),
            (Some(_), None) => warn!("auto checkpoints configured without a snapshot source; disabled"),
            _ => {}
        }
        info!(tasks = handles.len(), "background tasks started");
        handles
    }

    /// Stop every supervised agent.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }
}

//! Agent supervision: spawn workers, watch their heartbeats, recover or
//! retire them.
//!
//! Each live agent is owned by one actor task; every state change for that
//! agent goes through the actor's channel, so transitions for one agent never
//! interleave. Records live in the store; `cache` is read-through only and
//! holds live agents, terminal records are read from the store.

mod actor;
pub mod launcher;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use flotilla_core::agents::{AgentRecord, AgentStatus, ResourceSample, ResourceTrend, SpawnConfig};
use flotilla_core::errors::require_non_empty;
use flotilla_core::events::{EventPayload, NewEvent};
use flotilla_core::ids::{AgentId, MailboxId};
use flotilla_core::Clock;
use flotilla_settings::SupervisorSettings;
use flotilla_store::agents::new_record;
use flotilla_store::{AgentRepo, EventStore, LockRepo, StoreError};

use crate::error::EngineError;
use actor::{AgentActor, AgentCommand};
pub use launcher::{LaunchSpec, LaunchedWorker, ProcessLauncher, WorkerExit, WorkerHandle, WorkerLauncher};

const COMMAND_BUFFER: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub max_recovery_attempts: u32,
    pub cooldown: Duration,
    pub spawn_timeout: Duration,
    pub terminate_grace: Duration,
    pub sample_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from(&SupervisorSettings::default())
    }
}

impl From<&SupervisorSettings> for SupervisorConfig {
    fn from(s: &SupervisorSettings) -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(s.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(s.heartbeat_timeout_ms),
            max_recovery_attempts: s.max_recovery_attempts,
            cooldown: Duration::from_millis(s.cooldown_ms),
            spawn_timeout: Duration::from_millis(s.spawn_timeout_ms),
            terminate_grace: Duration::from_millis(s.terminate_grace_ms),
            sample_capacity: s.sample_capacity,
        }
    }
}

/// State shared by the supervisor facade and every agent actor.
pub(crate) struct Shared {
    agents: AgentRepo,
    locks: Arc<LockRepo>,
    events: Arc<EventStore>,
    launcher: Arc<dyn WorkerLauncher>,
    clock: Arc<dyn Clock>,
    config: SupervisorConfig,
    cache: DashMap<AgentId, AgentRecord>,
    actors: DashMap<AgentId, mpsc::Sender<AgentCommand>>,
    cancel: CancellationToken,
}

impl Shared {
    /// Persist a record change and refresh the cache.
    fn save(&self, record: &AgentRecord) -> Result<AgentRecord, EngineError> {
        let saved = self.agents.update(record)?;
        self.remember(&saved);
        Ok(saved)
    }

    fn remember(&self, record: &AgentRecord) {
        if record.status.is_terminal() {
            self.cache.remove(&record.id);
        } else {
            self.cache.insert(record.id.clone(), record.clone());
        }
    }

    /// Append an `agent_lifecycle` event to the agent's mailbox. Failures
    /// are logged; the record is the source of truth.
    fn emit(&self, record: &AgentRecord, detail: Option<String>) {
        let event = NewEvent::new(EventPayload::AgentLifecycle {
            agent_id: record.id.clone(),
            status: record.status,
            detail,
        });
        if let Err(e) = self.events.append(&record.mailbox_id, vec![event]) {
            warn!(agent_id = %record.id, error = %e, "lifecycle event not recorded");
        }
    }

    fn release_locks(&self, agent_id: &AgentId) {
        if let Err(e) = self.locks.release_all_for_holder(agent_id.as_str()) {
            warn!(agent_id = %agent_id, error = %e, "could not release agent locks");
        }
    }

    /// Insert a `spawning` record.
    fn create_record(
        &self,
        agent_type: &str,
        task: &str,
        mailbox_id: MailboxId,
        config: SpawnConfig,
        recovered_from: Option<(&AgentId, u32)>,
    ) -> Result<AgentRecord, EngineError> {
        let mut record = new_record(agent_type, task, mailbox_id, config, self.clock.now());
        if let Some((previous, attempts)) = recovered_from {
            record.recovered_from = Some(previous.clone());
            record.recovery_attempts = attempts;
        }
        self.agents.insert(&record)?;
        self.remember(&record);
        self.emit(&record, None);
        Ok(record)
    }

    /// Launch the worker for an inserted record and start its actor. On
    /// failure or timeout the record is marked `failed`.
    async fn start(self: &Arc<Self>, mut record: AgentRecord) -> Result<AgentRecord, EngineError> {
        let spec = LaunchSpec::from(&record);
        let launched = match tokio::time::timeout(self.config.spawn_timeout, self.launcher.launch(&spec)).await {
            Ok(Ok(worker)) => worker,
            Ok(Err(e)) => {
                self.fail_spawn(&mut record, &e);
                return Err(e);
            }
            Err(_) => {
                let e = EngineError::Timeout {
                    operation: "spawn",
                    after: self.config.spawn_timeout,
                };
                self.fail_spawn(&mut record, &e);
                return Err(e);
            }
        };

        record.pid = launched.handle.pid();
        let record = match self.save(&record) {
            Ok(saved) => saved,
            Err(e) => {
                let _ = launched.handle.terminate(self.config.terminate_grace).await;
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        self.actors.insert(record.id.clone(), tx);
        tokio::spawn(AgentActor::new(Arc::clone(self), record.clone(), launched, rx).run());
        info!(agent_id = %record.id, pid = record.pid, "agent started");
        Ok(record)
    }

    fn fail_spawn(&self, record: &mut AgentRecord, error: &EngineError) {
        warn!(agent_id = %record.id, error = %error, "agent spawn failed");
        record.status = AgentStatus::Failed;
        record.last_error = Some(error.to_string());
        match self.save(record) {
            Ok(saved) => self.emit(&saved, record.last_error.clone()),
            Err(e) => warn!(agent_id = %record.id, error = %e, "could not mark agent failed"),
        }
    }

    fn get(&self, id: &AgentId) -> Result<AgentRecord, EngineError> {
        if let Some(cached) = self.cache.get(id) {
            return Ok(cached.clone());
        }
        let record = self.agents.get(id).map_err(not_found)?;
        self.remember(&record);
        Ok(record)
    }
}

pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Supervisor {
    pub fn new(
        agents: AgentRepo,
        locks: Arc<LockRepo>,
        events: Arc<EventStore>,
        launcher: Arc<dyn WorkerLauncher>,
        clock: Arc<dyn Clock>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                agents,
                locks,
                events,
                launcher,
                clock,
                config,
                cache: DashMap::new(),
                actors: DashMap::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.shared.config
    }

    /// Create the agent's mailbox and record, launch its worker and start
    /// supervising it.
    #[instrument(skip(self, task, config), fields(agent_type = %agent_type))]
    pub async fn spawn(&self, agent_type: &str, task: &str, config: SpawnConfig) -> Result<AgentRecord, EngineError> {
        require_non_empty("agent_type", agent_type)?;
        require_non_empty("task", task)?;
        if config.timeout_ms == 0 {
            return Err(EngineError::Validation(flotilla_core::ValidationError::new(
                "timeout_ms",
                "must be positive",
            )));
        }
        let record = self
            .shared
            .create_record(agent_type, task, MailboxId::new(), config, None)?;
        self.shared.start(record).await
    }

    /// Record a heartbeat (and optional resource sample) from a worker.
    pub async fn heartbeat(&self, id: &AgentId, sample: Option<ResourceSample>) -> Result<AgentRecord, EngineError> {
        self.ask(id, |reply| AgentCommand::Heartbeat { sample, reply }).await
    }

    /// Run one heartbeat check for an agent now.
    pub async fn check_health(&self, id: &AgentId) -> Result<AgentRecord, EngineError> {
        self.ask(id, |reply| AgentCommand::CheckHealth { reply }).await
    }

    /// Check every supervised agent. Returns how many were checked.
    pub async fn check_all(&self) -> usize {
        let ids: Vec<AgentId> = self.shared.actors.iter().map(|e| e.key().clone()).collect();
        let results = join_all(ids.iter().map(|id| self.check_health(id))).await;
        for (id, result) in ids.iter().zip(&results) {
            if let Err(e) = result {
                debug!(agent_id = %id, error = %e, "health check skipped");
            }
        }
        results.len()
    }

    /// Stop an agent gracefully and release its locks. Terminating an agent
    /// that is already terminal returns its record unchanged.
    #[instrument(skip(self), fields(agent_id = %id))]
    pub async fn terminate(&self, id: &AgentId) -> Result<AgentRecord, EngineError> {
        if self.shared.actors.contains_key(id) {
            match self
                .ask(id, |reply| AgentCommand::Terminate {
                    reason: "terminated on request".into(),
                    reply,
                })
                .await
            {
                Err(EngineError::NotFound(_)) => {}
                other => return other,
            }
        }

        // No actor: either terminal already or left over from a previous run.
        let mut record = self.shared.agents.get(id).map_err(not_found)?;
        if record.status.is_terminal() {
            return Ok(record);
        }
        record.status = AgentStatus::Terminated;
        let saved = self.shared.save(&record)?;
        self.shared.release_locks(id);
        self.shared.emit(&saved, Some("terminated without a supervised worker".into()));
        Ok(saved)
    }

    pub fn get(&self, id: &AgentId) -> Result<AgentRecord, EngineError> {
        self.shared.get(id)
    }

    pub fn list(&self, status: Option<AgentStatus>) -> Result<Vec<AgentRecord>, EngineError> {
        Ok(self.shared.agents.list(status)?)
    }

    pub fn count_by_status(&self) -> Result<Vec<(AgentStatus, i64)>, EngineError> {
        Ok(self.shared.agents.count_by_status()?)
    }

    pub fn resource_trend(&self, id: &AgentId) -> Result<ResourceTrend, EngineError> {
        self.shared.get(id)?;
        Ok(self.shared.agents.resource_trend(id)?)
    }

    /// Agents with a running actor.
    pub fn supervised_count(&self) -> usize {
        self.shared.actors.len()
    }

    /// Periodic heartbeat checks until `cancel` fires.
    pub async fn run_health_checks(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.shared.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let checked = self.check_all().await;
                    debug!(checked, "heartbeat sweep complete");
                }
            }
        }
        debug!("heartbeat checks stopped");
    }

    /// Terminate every supervised agent and stop the actors.
    pub async fn shutdown(&self) {
        let ids: Vec<AgentId> = self.shared.actors.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.terminate(&id).await {
                warn!(agent_id = %id, error = %e, "agent not terminated cleanly");
            }
        }
        self.shared.cancel.cancel();
        info!("supervisor stopped");
    }

    async fn ask<F>(&self, id: &AgentId, build: F) -> Result<AgentRecord, EngineError>
    where
        F: FnOnce(oneshot::Sender<Result<AgentRecord, EngineError>>) -> AgentCommand,
    {
        let Some(tx) = self.shared.actors.get(id).map(|e| e.value().clone()) else {
            return Err(self.unsupervised(id));
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if tx.send(build(reply_tx)).await.is_err() {
            return Err(self.unsupervised(id));
        }
        reply_rx.await.unwrap_or_else(|_| Err(self.unsupervised(id)))
    }

    fn unsupervised(&self, id: &AgentId) -> EngineError {
        match self.shared.agents.get(id) {
            Ok(record) if record.status.is_terminal() => EngineError::Store(StoreError::Conflict(format!(
                "agent {id} is {}",
                record.status
            ))),
            Ok(_) => EngineError::NotFound(format!("agent {id} has no supervised worker")),
            Err(_) => EngineError::NotFound(format!("agent {id}")),
        }
    }
}

fn not_found(e: StoreError) -> EngineError {
    match e {
        StoreError::NotFound(what) => EngineError::NotFound(what),
        other => other.into(),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::watch;

    use super::*;

    /// In-process stand-in for worker processes.
    #[derive(Default)]
    pub(crate) struct FakeLauncher {
        pub launched: Mutex<Vec<LaunchSpec>>,
        pub terminated: Arc<Mutex<Vec<AgentId>>>,
        exits: Mutex<HashMap<AgentId, Arc<watch::Sender<Option<WorkerExit>>>>>,
        pub fail_launches: AtomicBool,
        pub hang_launches: AtomicBool,
    }

    impl FakeLauncher {
        /// Make the worker for `id` exit with `code`.
        pub fn exit(&self, id: &AgentId, code: i32) {
            if let Some(tx) = self.exits.lock().get(id) {
                let _ = tx.send(Some(WorkerExit { code: Some(code) }));
            }
        }

        pub fn launch_count(&self) -> usize {
            self.launched.lock().len()
        }

        pub fn set_failing(&self, failing: bool) {
            self.fail_launches.store(failing, Ordering::SeqCst);
        }
    }

    struct FakeHandle {
        agent_id: AgentId,
        exit: Arc<watch::Sender<Option<WorkerExit>>>,
        terminated: Arc<Mutex<Vec<AgentId>>>,
    }

    #[async_trait]
    impl WorkerHandle for FakeHandle {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        async fn terminate(&self, _grace: Duration) -> Result<(), EngineError> {
            self.terminated.lock().push(self.agent_id.clone());
            let _ = self.exit.send(Some(WorkerExit { code: None }));
            Ok(())
        }
    }

    #[async_trait]
    impl WorkerLauncher for FakeLauncher {
        async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedWorker, EngineError> {
            if self.hang_launches.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.fail_launches.load(Ordering::SeqCst) {
                return Err(EngineError::Spawn("worker binary missing".into()));
            }
            self.launched.lock().push(spec.clone());
            let (tx, rx) = watch::channel(None);
            let tx = Arc::new(tx);
            self.exits.lock().insert(spec.agent_id.clone(), Arc::clone(&tx));
            Ok(LaunchedWorker {
                handle: Arc::new(FakeHandle {
                    agent_id: spec.agent_id.clone(),
                    exit: tx,
                    terminated: Arc::clone(&self.terminated),
                }),
                exit: rx,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::FakeLauncher;
    use super::*;
    use flotilla_core::events::EventType;
    use flotilla_core::ManualClock;
    use flotilla_store::Database;

    struct Fixture {
        supervisor: Supervisor,
        launcher: Arc<FakeLauncher>,
        clock: ManualClock,
        locks: Arc<LockRepo>,
        events: Arc<EventStore>,
    }

    fn fixture() -> Fixture {
        let db = Database::in_memory().unwrap();
        let clock = ManualClock::default();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let launcher = Arc::new(FakeLauncher::default());
        let locks = Arc::new(LockRepo::new(db.clone(), shared.clone()));
        let events = Arc::new(EventStore::new(db.clone(), shared.clone()));
        let config = SupervisorConfig {
            spawn_timeout: Duration::from_millis(200),
            ..SupervisorConfig::default()
        };
        let supervisor = Supervisor::new(
            AgentRepo::new(db, shared.clone()),
            locks.clone(),
            events.clone(),
            launcher.clone(),
            shared,
            config,
        );
        Fixture {
            supervisor,
            launcher,
            clock,
            locks,
            events,
        }
    }

    /// Wait for the actor to process an exit notification.
    async fn settle(f: &Fixture, id: &AgentId, want: AgentStatus) -> AgentRecord {
        for _ in 0..200 {
            let record = f.supervisor.get(id).unwrap();
            if record.status == want {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("agent {id} never reached {want}");
    }

    #[tokio::test]
    async fn spawn_launches_with_worker_contract() {
        let f = fixture();
        let agent = f.supervisor.spawn("coder", "write tests", SpawnConfig::default()).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Spawning);
        assert_eq!(agent.pid, Some(4242));

        let launched = f.launcher.launched.lock().clone();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].agent_id, agent.id);
        assert_eq!(launched[0].mailbox_id, agent.mailbox_id);
        assert_eq!(launched[0].timeout_ms, SpawnConfig::default().timeout_ms);
        assert_eq!(f.supervisor.supervised_count(), 1);
    }

    #[tokio::test]
    async fn failed_launch_marks_agent_failed() {
        let f = fixture();
        f.launcher.set_failing(true);
        let err = f.supervisor.spawn("coder", "t", SpawnConfig::default()).await.unwrap_err();
        assert_eq!(err.error_kind(), "spawn");
        let failed = f.supervisor.list(Some(AgentStatus::Failed)).unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].last_error.as_deref().unwrap_or_default().contains("missing"));
        assert_eq!(f.supervisor.supervised_count(), 0);
    }

    #[tokio::test]
    async fn hung_launch_times_out() {
        let f = fixture();
        f.launcher.hang_launches.store(true, Ordering::SeqCst);
        let err = f.supervisor.spawn("coder", "t", SpawnConfig::default()).await.unwrap_err();
        assert_eq!(err.error_kind(), "timeout");
        assert_eq!(f.supervisor.list(Some(AgentStatus::Failed)).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_moves_to_running_and_samples() {
        let f = fixture();
        let agent = f.supervisor.spawn("coder", "t", SpawnConfig::default()).await.unwrap();
        let sample = ResourceSample {
            cpu_percent: 12.5,
            memory_bytes: 2048,
            sampled_at: f.clock.now(),
        };
        let record = f.supervisor.heartbeat(&agent.id, Some(sample)).await.unwrap();
        assert_eq!(record.status, AgentStatus::Running);
        assert_eq!(record.last_heartbeat_at, Some(f.clock.now()));
        assert_eq!(f.supervisor.resource_trend(&agent.id).unwrap().samples, 1);

        let statuses: Vec<_> = f
            .events
            .get_by_stream(&agent.mailbox_id, None)
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type() == EventType::AgentLifecycle)
            .map(|e| match e.payload {
                EventPayload::AgentLifecycle { status, .. } => status,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(statuses, vec![AgentStatus::Spawning, AgentStatus::Running]);
    }

    #[tokio::test]
    async fn silence_past_timeout_triggers_recovery() {
        let f = fixture();
        let agent = f.supervisor.spawn("coder", "t", SpawnConfig::default()).await.unwrap();
        f.supervisor.heartbeat(&agent.id, None).await.unwrap();

        f.clock.advance_ms(30_000);
        assert_eq!(f.supervisor.check_health(&agent.id).await.unwrap().status, AgentStatus::Running);

        f.clock.advance_ms(31_000);
        let old = f.supervisor.check_health(&agent.id).await.unwrap();
        assert_eq!(old.status, AgentStatus::Terminated);
        let new_id = old.replaced_by.clone().unwrap();
        let replacement = f.supervisor.get(&new_id).unwrap();
        assert_eq!(replacement.recovery_attempts, 1);
        assert_eq!(replacement.recovered_from.as_ref(), Some(&agent.id));
        assert_eq!(replacement.task, agent.task);
        assert_eq!(replacement.mailbox_id, agent.mailbox_id);
        assert_eq!(f.launcher.launch_count(), 2);
        assert_eq!(f.launcher.terminated.lock().clone(), vec![agent.id.clone()]);
    }

    #[tokio::test]
    async fn heartbeat_revives_agent_waiting_out_cooldown() {
        let f = fixture();
        let agent = f.supervisor.spawn("coder", "t", SpawnConfig::default()).await.unwrap();
        let first = f.supervisor.check_health(&agent.id).await.unwrap();
        assert_eq!(first.status, AgentStatus::Spawning);

        f.clock.advance_ms(61_000);
        let checked = f.supervisor.check_health(&agent.id).await.unwrap();
        assert_eq!(checked.status, AgentStatus::Terminated);
        let replacement_id = checked.replaced_by.unwrap();

        // The replacement goes quiet inside its cooldown, so it waits as unhealthy.
        f.clock.advance_ms(61_000);
        let waiting = f.supervisor.check_health(&replacement_id).await.unwrap();
        assert_eq!(waiting.status, AgentStatus::Unhealthy);

        let back = f.supervisor.heartbeat(&replacement_id, None).await.unwrap();
        assert_eq!(back.status, AgentStatus::Running);
        assert_eq!(back.recovery_attempts, 1);
    }

    #[tokio::test]
    async fn recovery_is_bounded() {
        let f = fixture();
        let cooldown = f.supervisor.config().cooldown;
        let mut current = f.supervisor.spawn("coder", "t", SpawnConfig::default()).await.unwrap();
        for attempt in 1..=3u32 {
            f.clock.advance(cooldown + Duration::from_secs(61));
            let retired = f.supervisor.check_health(&current.id).await.unwrap();
            assert_eq!(retired.status, AgentStatus::Terminated);
            current = f.supervisor.get(&retired.replaced_by.unwrap()).unwrap();
            assert_eq!(current.recovery_attempts, attempt);
        }
        f.clock.advance(cooldown + Duration::from_secs(61));
        let last = f.supervisor.check_health(&current.id).await.unwrap();
        assert_eq!(last.status, AgentStatus::Failed);
        assert!(last.replaced_by.is_none());
        assert_eq!(f.launcher.launch_count(), 4);

        // Terminal: never checked or respawned again.
        f.clock.advance(cooldown * 2);
        assert_eq!(f.supervisor.check_all().await, 0);
        assert_eq!(f.launcher.launch_count(), 4);
        assert!(f.supervisor.heartbeat(&current.id, None).await.is_err());
    }

    #[tokio::test]
    async fn clean_exit_terminates() {
        let f = fixture();
        let agent = f.supervisor.spawn("coder", "t", SpawnConfig::default()).await.unwrap();
        f.launcher.exit(&agent.id, 0);
        let done = settle(&f, &agent.id, AgentStatus::Terminated).await;
        assert!(done.replaced_by.is_none());
        assert_eq!(f.launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn crash_exit_respawns() {
        let f = fixture();
        let agent = f.supervisor.spawn("coder", "t", SpawnConfig::default()).await.unwrap();
        f.launcher.exit(&agent.id, 1);
        let old = settle(&f, &agent.id, AgentStatus::Terminated).await;
        let replacement = f.supervisor.get(&old.replaced_by.unwrap()).unwrap();
        assert_eq!(replacement.recovery_attempts, 1);
        assert!(old.last_error.unwrap_or_default().contains("exited"));
    }

    #[tokio::test]
    async fn terminate_releases_locks() {
        let f = fixture();
        let agent = f.supervisor.spawn("coder", "t", SpawnConfig::default()).await.unwrap();
        f.locks.acquire("src/foo.ts", agent.id.as_str(), Some(60_000)).unwrap();

        let done = f.supervisor.terminate(&agent.id).await.unwrap();
        assert_eq!(done.status, AgentStatus::Terminated);
        assert!(f.locks.active_for("src/foo.ts").unwrap().is_none());
        assert_eq!(f.launcher.terminated.lock().len(), 1);

        // Idempotent on a terminal agent.
        assert_eq!(f.supervisor.terminate(&agent.id).await.unwrap().status, AgentStatus::Terminated);
        assert!(f.supervisor.terminate(&AgentId::from_raw("agent_nobody")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn terminal_agents_leave_the_cache() {
        let f = fixture();
        let kept = f.supervisor.spawn("coder", "t", SpawnConfig::default()).await.unwrap();
        let done = f.supervisor.spawn("coder", "t", SpawnConfig::default()).await.unwrap();
        f.supervisor.terminate(&done.id).await.unwrap();
        f.launcher.set_failing(true);
        f.supervisor.spawn("coder", "t", SpawnConfig::default()).await.unwrap_err();

        let cached: Vec<AgentId> = f.supervisor.shared.cache.iter().map(|e| e.key().clone()).collect();
        assert_eq!(cached, vec![kept.id.clone()]);
        // Reads still reach the store and do not repopulate the cache.
        assert_eq!(f.supervisor.get(&done.id).unwrap().status, AgentStatus::Terminated);
        assert!(!f.supervisor.shared.cache.contains_key(&done.id));
    }
}

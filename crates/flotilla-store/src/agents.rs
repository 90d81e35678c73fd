use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, instrument};

use flotilla_core::agents::{AgentRecord, AgentStatus, ResourceSample, ResourceTrend};
use flotilla_core::clock::format_ts;
use flotilla_core::errors::require_non_empty;
use flotilla_core::ids::{AgentId, MailboxId};
use flotilla_core::Clock;

use crate::database::Database;
use crate::error::StoreError;
use crate::mailboxes;
use crate::row_helpers;

const COLUMNS: &str = "id, agent_type, status, pid, mailbox_id, task, config, last_heartbeat_at,
    recovery_attempts, recovered_from, replaced_by, last_error, created_at, updated_at";

/// Samples kept per agent when the caller does not say otherwise.
pub const DEFAULT_SAMPLE_CAPACITY: usize = 100;

/// Authoritative agent records. The supervisor caches these but every
/// state change is written here first.
pub struct AgentRepo {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl AgentRepo {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Insert a new record, creating its mailbox if needed.
    #[instrument(skip(self, agent), fields(agent_id = %agent.id, agent_type = %agent.agent_type))]
    pub fn insert(&self, agent: &AgentRecord) -> Result<(), StoreError> {
        require_non_empty("agent_type", &agent.agent_type)?;
        require_non_empty("task", &agent.task)?;
        let config = serde_json::to_string(&agent.config)?;
        self.db.with_tx(|tx| {
            mailboxes::ensure(tx, &agent.mailbox_id, agent.created_at)?;
            tx.execute(
                &format!("INSERT INTO agents ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"),
                rusqlite::params![
                    agent.id.as_str(),
                    agent.agent_type,
                    agent.status.as_str(),
                    agent.pid,
                    agent.mailbox_id.as_str(),
                    agent.task,
                    config,
                    agent.last_heartbeat_at.map(format_ts),
                    agent.recovery_attempts,
                    agent.recovered_from.as_ref().map(AgentId::as_str),
                    agent.replaced_by.as_ref().map(AgentId::as_str),
                    agent.last_error,
                    format_ts(agent.created_at),
                    format_ts(agent.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get(&self, id: &AgentId) -> Result<AgentRecord, StoreError> {
        self.db
            .with_conn(|conn| load(conn, id))?
            .ok_or_else(|| StoreError::NotFound(format!("agent {id}")))
    }

    /// Persist every mutable field of `agent`. A record that is already
    /// terminal in the store cannot be moved to another status.
    #[instrument(skip(self, agent), fields(agent_id = %agent.id, status = %agent.status))]
    pub fn update(&self, agent: &AgentRecord) -> Result<AgentRecord, StoreError> {
        let now = self.clock.now();
        self.db.with_tx(|tx| {
            let current = load(tx, &agent.id)?.ok_or_else(|| StoreError::NotFound(format!("agent {}", agent.id)))?;
            if current.status.is_terminal() && current.status != agent.status {
                return Err(StoreError::Conflict(format!(
                    "agent {} is {} and cannot become {}",
                    agent.id, current.status, agent.status
                )));
            }
            tx.execute(
                "UPDATE agents SET status = ?1, pid = ?2, last_heartbeat_at = ?3, recovery_attempts = ?4,
                    replaced_by = ?5, last_error = ?6, updated_at = ?7
                 WHERE id = ?8",
                rusqlite::params![
                    agent.status.as_str(),
                    agent.pid,
                    agent.last_heartbeat_at.map(format_ts),
                    agent.recovery_attempts,
                    agent.replaced_by.as_ref().map(AgentId::as_str),
                    agent.last_error,
                    format_ts(now),
                    agent.id.as_str(),
                ],
            )?;
            if current.status != agent.status {
                debug!(from = %current.status, to = %agent.status, "agent status changed");
            }
            load(tx, &agent.id)?.ok_or_else(|| StoreError::NotFound(format!("agent {}", agent.id)))
        })
    }

    /// Agents in one status, or all of them, oldest first.
    pub fn list(&self, status: Option<AgentStatus>) -> Result<Vec<AgentRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut out = Vec::new();
            match status {
                Some(status) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {COLUMNS} FROM agents WHERE status = ?1 ORDER BY created_at ASC, id ASC"
                    ))?;
                    let mut rows = stmt.query([status.as_str()])?;
                    while let Some(row) = rows.next()? {
                        out.push(row_to_agent(row)?);
                    }
                }
                None => {
                    let mut stmt =
                        conn.prepare(&format!("SELECT {COLUMNS} FROM agents ORDER BY created_at ASC, id ASC"))?;
                    let mut rows = stmt.query([])?;
                    while let Some(row) = rows.next()? {
                        out.push(row_to_agent(row)?);
                    }
                }
            }
            Ok(out)
        })
    }

    /// Agents whose status is not terminal.
    pub fn list_live(&self) -> Result<Vec<AgentRecord>, StoreError> {
        Ok(self.list(None)?.into_iter().filter(|a| !a.status.is_terminal()).collect())
    }

    /// Count per status, in lifecycle order, including zeroes.
    pub fn count_by_status(&self) -> Result<Vec<(AgentStatus, i64)>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM agents GROUP BY status")?;
            let mut rows = stmt.query([])?;
            let mut counts: Vec<(AgentStatus, i64)> = AgentStatus::ALL.iter().map(|s| (*s, 0)).collect();
            while let Some(row) = rows.next()? {
                let raw: String = row_helpers::get(row, 0, "agents", "status")?;
                let status: AgentStatus = row_helpers::parse_enum(&raw, "agents", "status")?;
                let n: i64 = row_helpers::get(row, 1, "agents", "status")?;
                if let Some(slot) = counts.iter_mut().find(|(s, _)| *s == status) {
                    slot.1 = n;
                }
            }
            Ok(counts)
        })
    }

    /// Store one resource sample, keeping only the newest `capacity`.
    pub fn record_sample(
        &self,
        agent_id: &AgentId,
        sample: &ResourceSample,
        capacity: usize,
    ) -> Result<(), StoreError> {
        if !sample.cpu_percent.is_finite() || sample.cpu_percent < 0.0 {
            return Err(StoreError::validation("cpu_percent", format!("{} is not a valid reading", sample.cpu_percent)));
        }
        let capacity = i64::try_from(capacity.max(1)).unwrap_or(i64::MAX);
        let memory = i64::try_from(sample.memory_bytes).unwrap_or(i64::MAX);
        self.db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO agent_samples (agent_id, cpu_percent, memory_bytes, sampled_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![agent_id.as_str(), sample.cpu_percent, memory, format_ts(sample.sampled_at)],
            )?;
            tx.execute(
                "DELETE FROM agent_samples WHERE agent_id = ?1 AND id NOT IN (
                    SELECT id FROM agent_samples WHERE agent_id = ?1 ORDER BY id DESC LIMIT ?2
                 )",
                rusqlite::params![agent_id.as_str(), capacity],
            )?;
            Ok(())
        })
    }

    /// Retained samples, oldest first.
    pub fn samples(&self, agent_id: &AgentId) -> Result<Vec<ResourceSample>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT cpu_percent, memory_bytes, sampled_at FROM agent_samples
                 WHERE agent_id = ?1 ORDER BY id ASC",
            )?;
            let mut rows = stmt.query([agent_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let memory: i64 = row_helpers::get(row, 1, "agent_samples", "memory_bytes")?;
                out.push(ResourceSample {
                    cpu_percent: row_helpers::get(row, 0, "agent_samples", "cpu_percent")?,
                    memory_bytes: u64::try_from(memory).unwrap_or(0),
                    sampled_at: row_helpers::get_ts(row, 2, "agent_samples", "sampled_at")?,
                });
            }
            Ok(out)
        })
    }

    pub fn resource_trend(&self, agent_id: &AgentId) -> Result<ResourceTrend, StoreError> {
        Ok(ResourceTrend::from_samples(&self.samples(agent_id)?))
    }
}

fn load(conn: &Connection, id: &AgentId) -> Result<Option<AgentRecord>, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM agents WHERE id = ?1"))?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_agent(row)?)),
        None => Ok(None),
    }
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> Result<AgentRecord, StoreError> {
    let status: String = row_helpers::get(row, 2, "agents", "status")?;
    let config: String = row_helpers::get(row, 6, "agents", "config")?;
    Ok(AgentRecord {
        id: AgentId::from_raw(row_helpers::get::<String>(row, 0, "agents", "id")?),
        agent_type: row_helpers::get(row, 1, "agents", "agent_type")?,
        status: row_helpers::parse_enum(&status, "agents", "status")?,
        pid: row_helpers::get_opt(row, 3, "agents", "pid")?,
        mailbox_id: MailboxId::from_raw(row_helpers::get::<String>(row, 4, "agents", "mailbox_id")?),
        task: row_helpers::get(row, 5, "agents", "task")?,
        config: row_helpers::parse_json(&config, "agents", "config")?,
        last_heartbeat_at: row_helpers::get_ts_opt(row, 7, "agents", "last_heartbeat_at")?,
        recovery_attempts: row_helpers::get(row, 8, "agents", "recovery_attempts")?,
        recovered_from: row_helpers::get_opt::<String>(row, 9, "agents", "recovered_from")?.map(AgentId::from_raw),
        replaced_by: row_helpers::get_opt::<String>(row, 10, "agents", "replaced_by")?.map(AgentId::from_raw),
        last_error: row_helpers::get_opt(row, 11, "agents", "last_error")?,
        created_at: row_helpers::get_ts(row, 12, "agents", "created_at")?,
        updated_at: row_helpers::get_ts(row, 13, "agents", "updated_at")?,
    })
}

/// Fresh `spawning` record stamped with `now`.
pub fn new_record(
    agent_type: &str,
    task: &str,
    mailbox_id: MailboxId,
    config: flotilla_core::agents::SpawnConfig,
    now: DateTime<Utc>,
) -> AgentRecord {
    AgentRecord {
        id: AgentId::new(),
        agent_type: agent_type.to_owned(),
        status: AgentStatus::Spawning,
        pid: None,
        mailbox_id,
        task: task.to_owned(),
        config,
        last_heartbeat_at: None,
        recovery_attempts: 0,
        recovered_from: None,
        replaced_by: None,
        last_error: None,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::agents::SpawnConfig;
    use flotilla_core::ManualClock;

    fn setup() -> (AgentRepo, ManualClock) {
        let clock = ManualClock::default();
        (AgentRepo::new(Database::in_memory().unwrap(), Arc::new(clock.clone())), clock)
    }

    fn spawn(repo: &AgentRepo, clock: &ManualClock) -> AgentRecord {
        let record = new_record("coder", "write the parser", MailboxId::new(), SpawnConfig::default(), clock.now());
        repo.insert(&record).unwrap();
        record
    }

    #[test]
    fn insert_and_get_roundtrip() {
        let (repo, clock) = setup();
        let mut config = SpawnConfig::default();
        config.env.insert("RUST_LOG".into(), "debug".into());
        let record = new_record("reviewer", "review the parser", MailboxId::new(), config, clock.now());
        repo.insert(&record).unwrap();
        let fetched = repo.get(&record.id).unwrap();
        assert_eq!(fetched, record);
        assert_eq!(fetched.config.env.get("RUST_LOG").map(String::as_str), Some("debug"));
    }

    #[test]
    fn unknown_agent_is_not_found() {
        let (repo, _) = setup();
        assert!(matches!(repo.get(&AgentId::from_raw("agent_x")), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn update_persists_fields_and_stamps_time() {
        let (repo, clock) = setup();
        let mut record = spawn(&repo, &clock);
        clock.advance_ms(2_000);
        record.status = AgentStatus::Running;
        record.pid = Some(4242);
        record.last_heartbeat_at = Some(clock.now());
        let saved = repo.update(&record).unwrap();
        assert_eq!(saved.status, AgentStatus::Running);
        assert_eq!(saved.pid, Some(4242));
        assert_eq!(saved.updated_at, clock.now());
        assert!(saved.updated_at > saved.created_at);
    }

    #[test]
    fn terminal_status_is_final() {
        let (repo, clock) = setup();
        let mut record = spawn(&repo, &clock);
        record.status = AgentStatus::Failed;
        repo.update(&record).unwrap();
        record.status = AgentStatus::Running;
        assert_eq!(repo.update(&record).unwrap_err().error_kind(), "conflict");
        assert_eq!(repo.get(&record.id).unwrap().status, AgentStatus::Failed);
    }

    #[test]
    fn counts_include_every_status() {
        let (repo, clock) = setup();
        spawn(&repo, &clock);
        let mut running = spawn(&repo, &clock);
        running.status = AgentStatus::Running;
        repo.update(&running).unwrap();

        let counts = repo.count_by_status().unwrap();
        assert_eq!(counts.len(), AgentStatus::ALL.len());
        assert!(counts.contains(&(AgentStatus::Spawning, 1)));
        assert!(counts.contains(&(AgentStatus::Running, 1)));
        assert!(counts.contains(&(AgentStatus::Failed, 0)));
        assert_eq!(repo.list(Some(AgentStatus::Running)).unwrap().len(), 1);
        assert_eq!(repo.list_live().unwrap().len(), 2);
    }

    #[test]
    fn samples_are_capped() {
        let (repo, clock) = setup();
        let record = spawn(&repo, &clock);
        for i in 0..8u32 {
            let sample = ResourceSample {
                cpu_percent: f64::from(i),
                memory_bytes: u64::from(i) * 1024,
                sampled_at: clock.now(),
            };
            repo.record_sample(&record.id, &sample, 5).unwrap();
        }
        let samples = repo.samples(&record.id).unwrap();
        assert_eq!(samples.len(), 5);
        assert_eq!(samples[0].cpu_percent, 3.0);
        assert_eq!(samples[4].cpu_percent, 7.0);

        let trend = repo.resource_trend(&record.id).unwrap();
        assert_eq!(trend.samples, 5);
        assert_eq!(trend.peak_cpu_percent, 7.0);
        assert_eq!(trend.peak_memory_bytes, 7 * 1024);
    }

    #[test]
    fn bad_sample_rejected() {
        let (repo, clock) = setup();
        let record = spawn(&repo, &clock);
        let sample = ResourceSample { cpu_percent: f64::NAN, memory_bytes: 0, sampled_at: clock.now() };
        assert_eq!(repo.record_sample(&record.id, &sample, 5).unwrap_err().error_kind(), "validation");
    }
}

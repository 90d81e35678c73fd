use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, info, instrument};

use flotilla_core::clock::{add_ms, format_ts};
use flotilla_core::errors::require_non_empty;
use flotilla_core::ids::LockId;
use flotilla_core::locks::{Lock, LockStatus};
use flotilla_core::Clock;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const LOCK_COLUMNS: &str =
    "id, resource_key, holder_id, acquired_at, expires_at, released_at, status";

/// Lease-based advisory locks over named resources.
///
/// At most one `active` row exists per `resource_key` (partial unique index).
/// An active row whose lease has lapsed still blocks nothing: acquire treats
/// it as expired and flips it before inserting the new lease.
pub struct LockRepo {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl LockRepo {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Take the lease on `resource_key`, or refresh it if `holder_id`
    /// already holds it. `ttl_ms = None` leases until released.
    #[instrument(skip(self))]
    pub fn acquire(
        &self,
        resource_key: &str,
        holder_id: &str,
        ttl_ms: Option<u64>,
    ) -> Result<Lock, StoreError> {
        require_non_empty("resource_key", resource_key)?;
        require_non_empty("holder_id", holder_id)?;
        validate_ttl(ttl_ms)?;
        let now = self.clock.now();
        let expires_at = ttl_ms.map(|ms| add_ms(now, ms));

        self.db.with_tx(|tx| {
            if let Some(current) = active_row(tx, resource_key)? {
                if current.is_live(now) {
                    if current.holder_id != holder_id {
                        return Err(StoreError::LockHeld {
                            resource_key: resource_key.to_string(),
                            holder_id: current.holder_id,
                        });
                    }
                    tx.execute(
                        "UPDATE locks SET expires_at = ?1 WHERE id = ?2",
                        rusqlite::params![expires_at.map(format_ts), current.id.as_str()],
                    )?;
                    debug!(lock_id = %current.id, "lease refreshed by holder");
                    return Ok(Lock { expires_at, ..current });
                }
                tx.execute(
                    "UPDATE locks SET status = 'expired' WHERE id = ?1 AND status = 'active'",
                    [current.id.as_str()],
                )?;
                debug!(
                    lock_id = %current.id,
                    previous_holder = %current.holder_id,
                    "lapsed lease expired on acquire"
                );
            }

            let lock = Lock {
                id: LockId::new(),
                resource_key: resource_key.to_string(),
                holder_id: holder_id.to_string(),
                acquired_at: now,
                expires_at,
                released_at: None,
                status: LockStatus::Active,
            };
            tx.execute(
                "INSERT INTO locks (id, resource_key, holder_id, acquired_at, expires_at, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'active')",
                rusqlite::params![
                    lock.id.as_str(),
                    lock.resource_key,
                    lock.holder_id,
                    format_ts(now),
                    expires_at.map(format_ts),
                ],
            )?;
            info!(lock_id = %lock.id, "lock acquired");
            Ok(lock)
        })
    }

    /// Release a lock. Repeating a release is a no-op; a lapsed lock keeps
    /// its `expired` status but still records `released_at`.
    #[instrument(skip(self), fields(lock_id = %lock_id))]
    pub fn release(&self, lock_id: &LockId, holder_id: &str) -> Result<Lock, StoreError> {
        let now = self.clock.now();
        self.db.with_tx(|tx| {
            let lock = owned_row(tx, lock_id, holder_id)?;
            if lock.released_at.is_some() {
                return Ok(lock);
            }
            let status = match lock.status {
                LockStatus::Active => LockStatus::Released,
                other => other,
            };
            tx.execute(
                "UPDATE locks SET released_at = ?1, status = ?2 WHERE id = ?3",
                rusqlite::params![format_ts(now), status.to_string(), lock_id.as_str()],
            )?;
            info!(%status, "lock released");
            Ok(Lock {
                released_at: Some(now),
                status,
                ..lock
            })
        })
    }

    /// Extend a live lease held by `holder_id` to `now + ttl_ms`.
    #[instrument(skip(self), fields(lock_id = %lock_id))]
    pub fn renew(&self, lock_id: &LockId, holder_id: &str, ttl_ms: u64) -> Result<Lock, StoreError> {
        validate_ttl(Some(ttl_ms))?;
        let now = self.clock.now();
        self.db.with_tx(|tx| {
            let lock = owned_row(tx, lock_id, holder_id)?;
            if !lock.is_live(now) {
                let state = match lock.status {
                    LockStatus::Active => "lapsed".to_string(),
                    other => other.to_string(),
                };
                return Err(StoreError::Conflict(format!(
                    "lock {lock_id} is {state} and cannot be renewed"
                )));
            }
            let expires_at = add_ms(now, ttl_ms);
            tx.execute(
                "UPDATE locks SET expires_at = ?1 WHERE id = ?2",
                rusqlite::params![format_ts(expires_at), lock_id.as_str()],
            )?;
            Ok(Lock {
                expires_at: Some(expires_at),
                ..lock
            })
        })
    }

    pub fn get(&self, lock_id: &LockId) -> Result<Lock, StoreError> {
        self.db
            .with_conn(|conn| lock_by_id(conn, lock_id))?
            .ok_or_else(|| StoreError::NotFound(format!("lock {lock_id}")))
    }

    /// The live lease on a resource, if any.
    pub fn active_for(&self, resource_key: &str) -> Result<Option<Lock>, StoreError> {
        let now = self.clock.now();
        Ok(self
            .db
            .with_conn(|conn| active_row(conn, resource_key))?
            .filter(|lock| lock.is_live(now)))
    }

    /// Live leases ordered by resource key.
    pub fn list_active(&self) -> Result<Vec<Lock>, StoreError> {
        let now = format_ts(self.clock.now());
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {LOCK_COLUMNS} FROM locks
                 WHERE status = 'active' AND (expires_at IS NULL OR expires_at > ?1)
                 ORDER BY resource_key ASC"
            ))?;
            let mut rows = stmt.query([now])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_lock(row)?);
            }
            Ok(out)
        })
    }

    pub fn list_active_for_holder(&self, holder_id: &str) -> Result<Vec<Lock>, StoreError> {
        let now = self.clock.now();
        Ok(self
            .list_active()?
            .into_iter()
            .filter(|lock| lock.holder_id == holder_id && lock.is_live(now))
            .collect())
    }

    /// Release every active lease held by `holder_id`.
    #[instrument(skip(self))]
    pub fn release_all_for_holder(&self, holder_id: &str) -> Result<usize, StoreError> {
        let now = format_ts(self.clock.now());
        let released = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE locks SET status = 'released', released_at = ?1
                 WHERE holder_id = ?2 AND status = 'active'",
                rusqlite::params![now, holder_id],
            )?)
        })?;
        if released > 0 {
            info!(released, "released locks of departed holder");
        }
        Ok(released)
    }

    /// Flip every lapsed active lease to `expired` in one statement.
    #[instrument(skip(self))]
    pub fn sweep_expired(&self) -> Result<usize, StoreError> {
        let now = format_ts(self.clock.now());
        let swept = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE locks SET status = 'expired'
                 WHERE status = 'active' AND expires_at IS NOT NULL AND expires_at < ?1",
                [now],
            )?)
        })?;
        if swept > 0 {
            info!(swept, "expired lapsed leases");
        }
        Ok(swept)
    }
}

fn validate_ttl(ttl_ms: Option<u64>) -> Result<(), StoreError> {
    if ttl_ms == Some(0) {
        return Err(StoreError::validation("ttl_ms", "must be positive"));
    }
    Ok(())
}

fn owned_row(conn: &Connection, lock_id: &LockId, holder_id: &str) -> Result<Lock, StoreError> {
    let lock = lock_by_id(conn, lock_id)?
        .ok_or_else(|| StoreError::NotFound(format!("lock {lock_id}")))?;
    if lock.holder_id != holder_id {
        return Err(StoreError::NotHolder {
            lock_id: lock_id.to_string(),
            holder_id: holder_id.to_string(),
        });
    }
    Ok(lock)
}

fn lock_by_id(conn: &Connection, lock_id: &LockId) -> Result<Option<Lock>, StoreError> {
    query_one(
        conn,
        &format!("SELECT {LOCK_COLUMNS} FROM locks WHERE id = ?1"),
        lock_id.as_str(),
    )
}

fn active_row(conn: &Connection, resource_key: &str) -> Result<Option<Lock>, StoreError> {
    query_one(
        conn,
        &format!("SELECT {LOCK_COLUMNS} FROM locks WHERE resource_key = ?1 AND status = 'active'"),
        resource_key,
    )
}

fn query_one(conn: &Connection, sql: &str, key: &str) -> Result<Option<Lock>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([key])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_lock(row)?)),
        None => Ok(None),
    }
}

fn row_to_lock(row: &rusqlite::Row<'_>) -> Result<Lock, StoreError> {
    let status: String = row_helpers::get(row, 6, "locks", "status")?;
    Ok(Lock {
        id: LockId::from_raw(row_helpers::get::<String>(row, 0, "locks", "id")?),
        resource_key: row_helpers::get(row, 1, "locks", "resource_key")?,
        holder_id: row_helpers::get(row, 2, "locks", "holder_id")?,
        acquired_at: row_helpers::get_ts(row, 3, "locks", "acquired_at")?,
        expires_at: row_helpers::get_ts_opt(row, 4, "locks", "expires_at")?,
        released_at: row_helpers::get_ts_opt(row, 5, "locks", "released_at")?,
        status: row_helpers::parse_enum(&status, "locks", "status")?,
    })
}

/// Count of live leases, for health reporting.
pub fn count_live(db: &Database, now: DateTime<Utc>) -> Result<i64, StoreError> {
    db.with_conn(|conn| {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM locks
             WHERE status = 'active' AND (expires_at IS NULL OR expires_at > ?1)",
            [format_ts(now)],
            |row| row.get(0),
        )?)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::ManualClock;

    fn setup() -> (LockRepo, ManualClock) {
        let clock = ManualClock::default();
        let repo = LockRepo::new(Database::in_memory().unwrap(), Arc::new(clock.clone()));
        (repo, clock)
    }

    #[test]
    fn second_holder_is_refused() {
        let (repo, _) = setup();
        repo.acquire("src/foo.ts", "agent-a", Some(5_000)).unwrap();
        let err = repo.acquire("src/foo.ts", "agent-b", Some(5_000)).unwrap_err();
        match err {
            StoreError::LockHeld { resource_key, holder_id } => {
                assert_eq!(resource_key, "src/foo.ts");
                assert_eq!(holder_id, "agent-a");
            }
            other => panic!("expected LockHeld, got {other:?}"),
        }
    }

    #[test]
    fn same_holder_refreshes_lease() {
        let (repo, clock) = setup();
        let first = repo.acquire("src/foo.ts", "agent-a", Some(5_000)).unwrap();
        clock.advance_ms(3_000);
        let again = repo.acquire("src/foo.ts", "agent-a", Some(5_000)).unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.expires_at, Some(add_ms(clock.now(), 5_000)));
        assert_eq!(repo.get(&first.id).unwrap().expires_at, again.expires_at);
    }

    #[test]
    fn lapsed_lease_is_taken_over() {
        let (repo, clock) = setup();
        let old = repo.acquire("src/foo.ts", "agent-a", Some(5_000)).unwrap();
        clock.advance_ms(5_000);
        let new = repo.acquire("src/foo.ts", "agent-b", Some(5_000)).unwrap();
        assert_ne!(new.id, old.id);
        assert_eq!(repo.get(&old.id).unwrap().status, LockStatus::Expired);
        assert_eq!(repo.active_for("src/foo.ts").unwrap().unwrap().holder_id, "agent-b");
    }

    #[test]
    fn release_checks_holder_and_is_idempotent() {
        let (repo, _) = setup();
        let lock = repo.acquire("db/schema", "agent-a", None).unwrap();
        let err = repo.release(&lock.id, "agent-b").unwrap_err();
        assert!(matches!(err, StoreError::NotHolder { .. }));

        let released = repo.release(&lock.id, "agent-a").unwrap();
        assert_eq!(released.status, LockStatus::Released);
        let again = repo.release(&lock.id, "agent-a").unwrap();
        assert_eq!(again.released_at, released.released_at);
        assert!(repo.active_for("db/schema").unwrap().is_none());
    }

    #[test]
    fn release_unknown_is_not_found() {
        let (repo, _) = setup();
        let err = repo.release(&LockId::from_raw("lock_missing"), "agent-a").unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn releasing_expired_lock_keeps_status() {
        let (repo, clock) = setup();
        let lock = repo.acquire("k", "agent-a", Some(100)).unwrap();
        clock.advance_ms(200);
        assert_eq!(repo.sweep_expired().unwrap(), 1);
        let released = repo.release(&lock.id, "agent-a").unwrap();
        assert_eq!(released.status, LockStatus::Expired);
        assert!(released.released_at.is_some());
    }

    #[test]
    fn sweep_only_touches_lapsed_leases() {
        let (repo, clock) = setup();
        repo.acquire("short", "a", Some(1_000)).unwrap();
        repo.acquire("long", "a", Some(60_000)).unwrap();
        repo.acquire("forever", "a", None).unwrap();
        clock.advance_ms(1_001);
        assert_eq!(repo.sweep_expired().unwrap(), 1);
        let keys: Vec<_> = repo.list_active().unwrap().into_iter().map(|l| l.resource_key).collect();
        assert_eq!(keys, vec!["forever", "long"]);
        assert_eq!(repo.sweep_expired().unwrap(), 0);
    }

    #[test]
    fn list_active_hides_lapsed_before_sweep() {
        let (repo, clock) = setup();
        repo.acquire("k", "a", Some(1_000)).unwrap();
        clock.advance_ms(1_000);
        assert!(repo.list_active().unwrap().is_empty());
        assert_eq!(count_live(&repo.db, clock.now()).unwrap(), 0);
    }

    #[test]
    fn renew_extends_live_lease_only() {
        let (repo, clock) = setup();
        let lock = repo.acquire("k", "a", Some(1_000)).unwrap();
        clock.advance_ms(500);
        let renewed = repo.renew(&lock.id, "a", 10_000).unwrap();
        assert_eq!(renewed.expires_at, Some(add_ms(clock.now(), 10_000)));

        clock.advance_ms(10_000);
        let err = repo.renew(&lock.id, "a", 1_000).unwrap_err();
        assert_eq!(err.error_kind(), "conflict");
    }

    #[test]
    fn release_all_for_holder() {
        let (repo, _) = setup();
        repo.acquire("a", "agent-x", None).unwrap();
        repo.acquire("b", "agent-x", Some(10_000)).unwrap();
        repo.acquire("c", "agent-y", None).unwrap();
        assert_eq!(repo.list_active_for_holder("agent-x").unwrap().len(), 2);
        assert_eq!(repo.release_all_for_holder("agent-x").unwrap(), 2);
        let keys: Vec<_> = repo.list_active().unwrap().into_iter().map(|l| l.resource_key).collect();
        assert_eq!(keys, vec!["c"]);
    }

    #[test]
    fn input_validation() {
        let (repo, _) = setup();
        assert_eq!(repo.acquire("", "a", None).unwrap_err().error_kind(), "validation");
        assert_eq!(repo.acquire("k", " ", None).unwrap_err().error_kind(), "validation");
        assert_eq!(repo.acquire("k", "a", Some(0)).unwrap_err().error_kind(), "validation");
    }

    #[test]
    fn one_active_row_per_resource_is_enforced_by_index() {
        let (repo, _) = setup();
        repo.acquire("k", "a", None).unwrap();
        let err = repo
            .db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO locks (id, resource_key, holder_id, acquired_at, status)
                     VALUES ('lock_x', 'k', 'b', '2026-01-01T00:00:00.000Z', 'active')",
                    [],
                )?;
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err.error_kind(), "conflict");
    }

    #[test]
    fn concurrent_acquirers_get_exactly_one_lease() {
        let (repo, _) = setup();
        let repo = Arc::new(repo);
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let repo = Arc::clone(&repo);
                std::thread::spawn(move || {
                    repo.acquire("hot", &format!("agent-{i}"), Some(60_000)).is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
    }
}

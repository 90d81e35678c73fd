use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::schema;

/// Which rung of the startup fallback chain the database landed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageTier {
    Preferred,
    TempDir,
    InMemory,
}

impl StorageTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preferred => "preferred",
            Self::TempDir => "temp_dir",
            Self::InMemory => "in_memory",
        }
    }

    /// Durable across a process restart.
    pub fn is_durable(&self) -> bool {
        !matches!(self, Self::InMemory)
    }
}

impl std::fmt::Display for StorageTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `<temp>/flotilla/flotilla.db`, the second rung of the fallback chain.
pub fn temp_database_path() -> PathBuf {
    std::env::temp_dir().join("flotilla").join("flotilla.db")
}

/// Thread-safe SQLite connection wrapper.
/// Uses parking_lot::Mutex for synchronous access (rusqlite is not Sync).
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
    tier: StorageTier,
}

impl Database {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::open_with_timeout(path, schema::DEFAULT_BUSY_TIMEOUT_MS)
    }

    pub fn open_with_timeout(path: &Path, busy_timeout_ms: u64) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Io(format!("create dir {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        let db = Self::init(conn, path.to_owned(), StorageTier::Preferred, busy_timeout_ms)?;
        info!(path = %path.display(), "database opened");
        Ok(db)
    }

    /// Open an in-memory database (tests and last-resort fallback).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(
            conn,
            PathBuf::from(":memory:"),
            StorageTier::InMemory,
            schema::DEFAULT_BUSY_TIMEOUT_MS,
        )
    }

    /// Preferred path, then the temp-dir path, then in-memory. Each step down
    /// is logged at warn with the reason; failing every tier is an error.
    pub fn open_with_fallback(preferred: &Path, busy_timeout_ms: u64) -> Result<Self, StoreError> {
        Self::open_chain(preferred, &temp_database_path(), busy_timeout_ms)
    }

    pub(crate) fn open_chain(
        preferred: &Path,
        temp: &Path,
        busy_timeout_ms: u64,
    ) -> Result<Self, StoreError> {
        let preferred_err = match Self::open_with_timeout(preferred, busy_timeout_ms) {
            Ok(db) => return Ok(db),
            Err(e) => e,
        };
        warn!(
            path = %preferred.display(),
            error = %preferred_err,
            fallback = %temp.display(),
            "preferred database unavailable, falling back to temp dir"
        );

        let temp_err = match Self::open_with_timeout(temp, busy_timeout_ms) {
            Ok(mut db) => {
                db.tier = StorageTier::TempDir;
                return Ok(db);
            }
            Err(e) => e,
        };
        warn!(
            path = %temp.display(),
            error = %temp_err,
            "temp-dir database unavailable, falling back to in-memory; state will not survive a restart"
        );

        Self::in_memory().map_err(|mem_err| {
            StoreError::Storage(format!(
                "every storage tier failed: preferred: {preferred_err}; temp: {temp_err}; memory: {mem_err}"
            ))
        })
    }

    fn init(
        conn: Connection,
        path: PathBuf,
        tier: StorageTier,
        busy_timeout_ms: u64,
    ) -> Result<Self, StoreError> {
        conn.execute_batch(schema::PRAGMAS)?;
        conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
        conn.execute_batch(schema::CREATE_TABLES)?;

        let version: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .ok();
        if version.is_none() {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [schema::SCHEMA_VERSION],
            )?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
            tier,
        })
    }

    /// Execute a closure with the database connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Execute a closure inside a `BEGIN IMMEDIATE` transaction. The write
    /// lock is taken up front; an `Err` from the closure rolls back.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Cheap liveness check for health reporting.
    pub fn ping(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let _: i64 = conn.query_row("SELECT 1", [], |row| row.get(0))?;
            Ok(())
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tier(&self) -> StorageTier {
        self.tier
    }

    /// Where file checkpoint backups belong for this tier: the configured
    /// directory on the preferred tier, the temp dir otherwise.
    pub fn backup_dir(&self, configured: &Path) -> PathBuf {
        match self.tier {
            StorageTier::Preferred => configured.to_path_buf(),
            StorageTier::TempDir | StorageTier::InMemory => {
                std::env::temp_dir().join("flotilla").join("checkpoints")
            }
        }
    }
}

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use flotilla_core::clock::format_ts;
use flotilla_core::errors::require_non_empty;
use flotilla_core::ids::MailboxId;
use flotilla_core::Clock;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Owner of one event stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailbox {
    pub id: MailboxId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct MailboxRepo {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl MailboxRepo {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Create a mailbox, or return the existing one with that id.
    #[instrument(skip(self), fields(mailbox_id = %id))]
    pub fn create(&self, id: &MailboxId) -> Result<Mailbox, StoreError> {
        require_non_empty("mailbox_id", id.as_str())?;
        let now = self.clock.now();
        self.db.with_tx(|tx| {
            ensure(tx, id, now)?;
            load(tx, id)?.ok_or_else(|| StoreError::NotFound(format!("mailbox {id}")))
        })
    }

    #[instrument(skip(self), fields(mailbox_id = %id))]
    pub fn get(&self, id: &MailboxId) -> Result<Mailbox, StoreError> {
        self.db
            .with_conn(|conn| load(conn, id))?
            .ok_or_else(|| StoreError::NotFound(format!("mailbox {id}")))
    }

    pub fn exists(&self, id: &MailboxId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| exists(conn, id))
    }

    /// Most recently active first.
    pub fn list(&self, limit: u32) -> Result<Vec<Mailbox>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, created_at, updated_at FROM mailboxes
                 ORDER BY updated_at DESC, id ASC LIMIT ?1",
            )?;
            let mut rows = stmt.query([limit])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_mailbox(row)?);
            }
            Ok(out)
        })
    }
}

/// Insert the mailbox if missing, otherwise bump `updated_at`.
pub(crate) fn ensure(conn: &Connection, id: &MailboxId, now: DateTime<Utc>) -> Result<(), StoreError> {
    let ts = format_ts(now);
    conn.execute(
        "INSERT INTO mailboxes (id, created_at, updated_at) VALUES (?1, ?2, ?2)
         ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at",
        rusqlite::params![id.as_str(), ts],
    )?;
    Ok(())
}

pub(crate) fn exists(conn: &Connection, id: &MailboxId) -> Result<bool, StoreError> {
    Ok(conn
        .query_row("SELECT 1 FROM mailboxes WHERE id = ?1", [id.as_str()], |_| Ok(()))
        .optional()?
        .is_some())
}

fn load(conn: &Connection, id: &MailboxId) -> Result<Option<Mailbox>, StoreError> {
    let mut stmt = conn.prepare("SELECT id, created_at, updated_at FROM mailboxes WHERE id = ?1")?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_mailbox(row)?)),
        None => Ok(None),
    }
}

fn row_to_mailbox(row: &rusqlite::Row<'_>) -> Result<Mailbox, StoreError> {
    Ok(Mailbox {
        id: MailboxId::from_raw(row_helpers::get::<String>(row, 0, "mailboxes", "id")?),
        created_at: row_helpers::get_ts(row, 1, "mailboxes", "created_at")?,
        updated_at: row_helpers::get_ts(row, 2, "mailboxes", "updated_at")?,
    })
}

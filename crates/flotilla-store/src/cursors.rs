use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use flotilla_core::clock::format_ts;
use flotilla_core::errors::require_non_empty;
use flotilla_core::events::Event;
use flotilla_core::ids::{CursorId, MailboxId};
use flotilla_core::Clock;

use crate::database::Database;
use crate::error::StoreError;
use crate::events;
use crate::row_helpers;

/// A consumer's read position in one stream. `position` is the last
/// processed `seq`; 0 means nothing processed yet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub id: CursorId,
    pub stream_id: MailboxId,
    pub consumer_id: String,
    pub position: i64,
    pub updated_at: DateTime<Utc>,
}

pub struct CursorRepo {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl CursorRepo {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Move a consumer's cursor. Regressing without `force` is a conflict;
    /// the check and the write are one conditional upsert, so two racing
    /// advances can never move the cursor backwards.
    #[instrument(skip(self), fields(stream_id = %stream_id))]
    pub fn advance(
        &self,
        stream_id: &MailboxId,
        consumer_id: &str,
        position: i64,
        force: bool,
    ) -> Result<Cursor, StoreError> {
        require_non_empty("consumer_id", consumer_id)?;
        if position < 0 {
            return Err(StoreError::validation("position", format!("{position} is negative")));
        }
        let now = self.clock.now();

        self.db.with_tx(|tx| {
            events::require_stream(tx, stream_id)?;
            let head = events::head(tx, stream_id)?;
            if position > head {
                return Err(StoreError::validation(
                    "position",
                    format!("{position} is beyond stream head {head}"),
                ));
            }

            let changed = tx.execute(
                "INSERT INTO cursors (id, stream_id, consumer_id, position, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(stream_id, consumer_id) DO UPDATE
                    SET position = excluded.position, updated_at = excluded.updated_at
                  WHERE excluded.position >= cursors.position OR ?6",
                rusqlite::params![
                    CursorId::new().as_str(),
                    stream_id.as_str(),
                    consumer_id,
                    position,
                    format_ts(now),
                    force,
                ],
            )?;

            let cursor = load(tx, stream_id, consumer_id)?
                .ok_or_else(|| StoreError::NotFound(format!("cursor {stream_id}/{consumer_id}")))?;
            if changed == 0 {
                return Err(StoreError::Conflict(format!(
                    "cursor {stream_id}/{consumer_id} is at {}, refusing to move back to {position}",
                    cursor.position
                )));
            }
            debug!(position = cursor.position, "cursor advanced");
            Ok(cursor)
        })
    }

    /// Current position; 0 when the consumer has never advanced.
    pub fn get_position(&self, stream_id: &MailboxId, consumer_id: &str) -> Result<i64, StoreError> {
        Ok(self.get(stream_id, consumer_id)?.map_or(0, |c| c.position))
    }

    pub fn get(&self, stream_id: &MailboxId, consumer_id: &str) -> Result<Option<Cursor>, StoreError> {
        self.db.with_conn(|conn| load(conn, stream_id, consumer_id))
    }

    /// Events appended past the consumer's position.
    pub fn lag(&self, stream_id: &MailboxId, consumer_id: &str) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            let head = events::head(conn, stream_id)?;
            let position = load(conn, stream_id, consumer_id)?.map_or(0, |c| c.position);
            Ok((head - position).max(0))
        })
    }

    /// The next unprocessed events for a consumer. Does not move the cursor.
    #[instrument(skip(self), fields(stream_id = %stream_id))]
    pub fn read_next(
        &self,
        stream_id: &MailboxId,
        consumer_id: &str,
        limit: u32,
    ) -> Result<Vec<Event>, StoreError> {
        self.db.with_conn(|conn| {
            events::require_stream(conn, stream_id)?;
            let position = load(conn, stream_id, consumer_id)?.map_or(0, |c| c.position);
            events::events_after(conn, stream_id, position, limit)
        })
    }

    pub fn list_for_stream(&self, stream_id: &MailboxId) -> Result<Vec<Cursor>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, stream_id, consumer_id, position, updated_at FROM cursors
                 WHERE stream_id = ?1 ORDER BY consumer_id ASC",
            )?;
            let mut rows = stmt.query([stream_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_cursor(row)?);
            }
            Ok(out)
        })
    }
}

fn load(conn: &Connection, stream_id: &MailboxId, consumer_id: &str) -> Result<Option<Cursor>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, stream_id, consumer_id, position, updated_at FROM cursors
         WHERE stream_id = ?1 AND consumer_id = ?2",
    )?;
    let mut rows = stmt.query(rusqlite::params![stream_id.as_str(), consumer_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_cursor(row)?)),
        None => Ok(None),
    }
}

fn row_to_cursor(row: &rusqlite::Row<'_>) -> Result<Cursor, StoreError> {
    Ok(Cursor {
        id: CursorId::from_raw(row_helpers::get::<String>(row, 0, "cursors", "id")?),
        stream_id: MailboxId::from_raw(row_helpers::get::<String>(row, 1, "cursors", "stream_id")?),
        consumer_id: row_helpers::get(row, 2, "cursors", "consumer_id")?,
        position: row_helpers::get(row, 3, "cursors", "position")?,
        updated_at: row_helpers::get_ts(row, 4, "cursors", "updated_at")?,
    })
}

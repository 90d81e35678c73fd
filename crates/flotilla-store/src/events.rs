use std::sync::Arc;

use rusqlite::Connection;
use tracing::{debug, instrument};

use flotilla_core::clock::format_ts;
use flotilla_core::errors::require_non_empty;
use flotilla_core::events::{Event, EventPayload, EventType, NewEvent};
use flotilla_core::ids::{EventId, MailboxId};
use flotilla_core::Clock;

use crate::database::Database;
use crate::error::StoreError;
use crate::mailboxes;
use crate::retry::{with_retry, RetryPolicy};
use crate::row_helpers;

const EVENT_COLUMNS: &str =
    "id, stream_id, seq, type, payload, causation_id, correlation_id, created_at";

/// A validated event ready for insertion.
struct Prepared {
    id: EventId,
    event_type: EventType,
    payload_json: String,
    event: NewEvent,
}

/// Append-only event log, one stream per mailbox.
pub struct EventStore {
    db: Database,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl EventStore {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            clock,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Append events to a stream, creating its mailbox on first use.
    ///
    /// Sequence numbers continue from the stream's current head with no gaps.
    /// Every payload is validated before anything is written; the batch is
    /// committed atomically.
    #[instrument(skip(self, events), fields(stream_id = %stream_id, count = events.len()))]
    pub fn append(&self, stream_id: &MailboxId, events: Vec<NewEvent>) -> Result<Vec<Event>, StoreError> {
        require_non_empty("stream_id", stream_id.as_str())?;
        if events.is_empty() {
            return Err(StoreError::validation("events", "must not be empty"));
        }

        let mut prepared = Vec::with_capacity(events.len());
        for event in events {
            event.payload.validate()?;
            let (event_type, data) = event.payload.to_parts()?;
            prepared.push(Prepared {
                id: EventId::new(),
                event_type,
                payload_json: serde_json::to_string(&data)?,
                event,
            });
        }

        let appended = with_retry(&self.retry, "events.append", || {
            self.db.with_tx(|tx| insert_batch(tx, stream_id, &prepared, self.clock.as_ref()))
        })?;
        debug!(
            first_seq = appended.first().map(|e| e.seq),
            last_seq = appended.last().map(|e| e.seq),
            "events appended"
        );
        Ok(appended)
    }

    /// Events of a stream ordered by `seq`, starting at `from_seq` inclusive.
    #[instrument(skip(self), fields(stream_id = %stream_id))]
    pub fn get_by_stream(
        &self,
        stream_id: &MailboxId,
        from_seq: Option<i64>,
    ) -> Result<Vec<Event>, StoreError> {
        self.db.with_conn(|conn| {
            require_stream(conn, stream_id)?;
            query_events(
                conn,
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM events
                     WHERE stream_id = ?1 AND seq >= ?2 ORDER BY seq ASC"
                ),
                rusqlite::params![stream_id.as_str(), from_seq.unwrap_or(1)],
            )
        })
    }

    /// Events strictly after `after_seq`, at most `limit`.
    #[instrument(skip(self), fields(stream_id = %stream_id))]
    pub fn list_after(
        &self,
        stream_id: &MailboxId,
        after_seq: i64,
        limit: u32,
    ) -> Result<Vec<Event>, StoreError> {
        self.db.with_conn(|conn| {
            require_stream(conn, stream_id)?;
            events_after(conn, stream_id, after_seq, limit)
        })
    }

    #[instrument(skip(self), fields(event_id = %event_id))]
    pub fn get(&self, event_id: &EventId) -> Result<Event, StoreError> {
        self.db.with_conn(|conn| {
            query_events(
                conn,
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
                [event_id.as_str()],
            )?
            .pop()
            .ok_or_else(|| StoreError::NotFound(format!("event {event_id}")))
        })
    }

    /// Last assigned sequence number; 0 for an empty or unknown stream.
    pub fn head(&self, stream_id: &MailboxId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| head(conn, stream_id))
    }

    pub fn count(&self, stream_id: &MailboxId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM events WHERE stream_id = ?1",
                [stream_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }
}

fn insert_batch(
    conn: &Connection,
    stream_id: &MailboxId,
    prepared: &[Prepared],
    clock: &dyn Clock,
) -> Result<Vec<Event>, StoreError> {
    let now = clock.now();
    let ts = format_ts(now);
    mailboxes::ensure(conn, stream_id, now)?;
    let last = head(conn, stream_id)?;

    let mut stmt = conn.prepare(
        "INSERT INTO events (id, stream_id, seq, type, payload, causation_id, correlation_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    let mut out = Vec::with_capacity(prepared.len());
    for (offset, p) in (1_i64..).zip(prepared) {
        let seq = last + offset;
        stmt.execute(rusqlite::params![
            p.id.as_str(),
            stream_id.as_str(),
            seq,
            p.event_type.as_str(),
            p.payload_json,
            p.event.causation_id.as_ref().map(EventId::as_str),
            p.event.correlation_id,
            ts,
        ])?;
        out.push(Event {
            id: p.id.clone(),
            stream_id: stream_id.clone(),
            seq,
            payload: p.event.payload.clone(),
            causation_id: p.event.causation_id.clone(),
            correlation_id: p.event.correlation_id.clone(),
            created_at: now,
        });
    }
    Ok(out)
}

pub(crate) fn head(conn: &Connection, stream_id: &MailboxId) -> Result<i64, StoreError> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(seq), 0) FROM events WHERE stream_id = ?1",
        [stream_id.as_str()],
        |row| row.get(0),
    )?)
}

pub(crate) fn events_after(
    conn: &Connection,
    stream_id: &MailboxId,
    after_seq: i64,
    limit: u32,
) -> Result<Vec<Event>, StoreError> {
    query_events(
        conn,
        &format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE stream_id = ?1 AND seq > ?2 ORDER BY seq ASC LIMIT ?3"
        ),
        rusqlite::params![stream_id.as_str(), after_seq, limit],
    )
}

pub(crate) fn require_stream(conn: &Connection, stream_id: &MailboxId) -> Result<(), StoreError> {
    if mailboxes::exists(conn, stream_id)? {
        Ok(())
    } else {
        Err(StoreError::NotFound(format!("mailbox {stream_id}")))
    }
}

fn query_events<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<Event>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row_to_event(row)?);
    }
    Ok(out)
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<Event, StoreError> {
    let event_type: String = row_helpers::get(row, 3, "events", "type")?;
    let raw_payload: String = row_helpers::get(row, 4, "events", "payload")?;
    let data: serde_json::Value = row_helpers::parse_json(&raw_payload, "events", "payload")?;
    let payload = EventPayload::from_parts(&event_type, data).map_err(|e| StoreError::CorruptRow {
        table: "events",
        column: "payload",
        detail: format!("{event_type}: {e}"),
    })?;

    Ok(Event {
        id: EventId::from_raw(row_helpers::get::<String>(row, 0, "events", "id")?),
        stream_id: MailboxId::from_raw(row_helpers::get::<String>(row, 1, "events", "stream_id")?),
        seq: row_helpers::get(row, 2, "events", "seq")?,
        payload,
        causation_id: row_helpers::get_opt::<String>(row, 5, "events", "causation_id")?
            .map(EventId::from_raw),
        correlation_id: row_helpers::get_opt(row, 6, "events", "correlation_id")?,
        created_at: row_helpers::get_ts(row, 7, "events", "created_at")?,
    })
}

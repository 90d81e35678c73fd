use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::Value;
use tracing::warn;

use flotilla_core::checkpoints::Checkpoint;
use flotilla_core::clock::format_ts;
use flotilla_core::ids::{CheckpointId, MissionId};

use super::{CheckpointBackend, ClaimOutcome};
use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const COLUMNS: &str = "id, body, consumed_at";

/// Primary checkpoint store: one row per checkpoint in the coordinator
/// database. `consumed_at` lives in its own column so a claim is a single
/// conditional update.
pub struct SqliteCheckpointBackend {
    db: Database,
}

impl SqliteCheckpointBackend {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn query(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Checkpoint>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(params)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                match row_to_checkpoint(row) {
                    Ok(checkpoint) => out.push(checkpoint),
                    Err(e) => warn!(error = %e, "skipping invalid checkpoint row"),
                }
            }
            Ok(out)
        })
    }
}

impl CheckpointBackend for SqliteCheckpointBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let body = serde_json::to_string(checkpoint)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO checkpoints
                    (id, mission_id, trigger, progress_percent, body, created_by, version, created_at, consumed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    checkpoint.id.as_str(),
                    checkpoint.mission_id.as_str(),
                    checkpoint.trigger.to_string(),
                    checkpoint.progress_percent,
                    body,
                    checkpoint.created_by,
                    checkpoint.version,
                    format_ts(checkpoint.created_at),
                    checkpoint.consumed_at.map(format_ts),
                ],
            )?;
            Ok(())
        })
    }

    fn load(&self, id: &CheckpointId) -> Result<Option<Checkpoint>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM checkpoints WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_checkpoint(row)?)),
                None => Ok(None),
            }
        })
    }

    fn latest(&self, mission_id: &MissionId) -> Result<Option<Checkpoint>, StoreError> {
        // Newest first; the first row that validates wins.
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM checkpoints WHERE mission_id = ?1
                 ORDER BY created_at DESC, id DESC"
            ))?;
            let mut rows = stmt.query([mission_id.as_str()])?;
            while let Some(row) = rows.next()? {
                match row_to_checkpoint(row) {
                    Ok(checkpoint) => return Ok(Some(checkpoint)),
                    Err(e) => warn!(mission_id = %mission_id, error = %e, "skipping invalid checkpoint row"),
                }
            }
            Ok(None)
        })
    }

    fn list(&self, mission_id: Option<&MissionId>) -> Result<Vec<Checkpoint>, StoreError> {
        match mission_id {
            Some(mission) => self.query(
                &format!(
                    "SELECT {COLUMNS} FROM checkpoints WHERE mission_id = ?1
                     ORDER BY created_at DESC, id DESC"
                ),
                &[&mission.as_str() as &dyn rusqlite::ToSql],
            ),
            None => self.query(
                &format!("SELECT {COLUMNS} FROM checkpoints ORDER BY created_at DESC, id DESC"),
                &[],
            ),
        }
    }

    fn delete(&self, id: &CheckpointId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM checkpoints WHERE id = ?1", [id.as_str()])? > 0)
        })
    }

    fn set_consumed(
        &self,
        id: &CheckpointId,
        at: DateTime<Utc>,
        force: bool,
    ) -> Result<ClaimOutcome, StoreError> {
        self.db.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE checkpoints SET consumed_at = ?1
                 WHERE id = ?2 AND (consumed_at IS NULL OR ?3)",
                rusqlite::params![format_ts(at), id.as_str(), force],
            )?;
            if changed > 0 {
                return Ok(ClaimOutcome::Claimed);
            }
            existing_consumed_at(tx, id)
        })
    }

    fn revert_consumed(
        &self,
        id: &CheckpointId,
        claimed_at: DateTime<Utc>,
        previous: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE checkpoints SET consumed_at = ?1 WHERE id = ?2 AND consumed_at = ?3",
                rusqlite::params![previous.map(format_ts), id.as_str(), format_ts(claimed_at)],
            )?;
            Ok(changed > 0)
        })
    }
}

fn existing_consumed_at(conn: &Connection, id: &CheckpointId) -> Result<ClaimOutcome, StoreError> {
    let mut stmt = conn.prepare("SELECT consumed_at FROM checkpoints WHERE id = ?1")?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        None => Ok(ClaimOutcome::Missing),
        Some(row) => match row_helpers::get_ts_opt(row, 0, "checkpoints", "consumed_at")? {
            Some(at) => Ok(ClaimOutcome::AlreadyConsumed(at)),
            // Unreachable under the conditional update above; treat as a race.
            None => Err(StoreError::Conflict(format!("checkpoint {id} changed during claim"))),
        },
    }
}

fn row_to_checkpoint(row: &rusqlite::Row<'_>) -> Result<Checkpoint, StoreError> {
    let id: String = row_helpers::get(row, 0, "checkpoints", "id")?;
    let body: String = row_helpers::get(row, 1, "checkpoints", "body")?;
    let consumed_at: Option<String> = row_helpers::get_opt(row, 2, "checkpoints", "consumed_at")?;

    let mut value: Value = row_helpers::parse_json(&body, "checkpoints", "body")?;
    if let Some(obj) = value.as_object_mut() {
        let _ = obj.insert(
            "consumed_at".into(),
            consumed_at.map_or(Value::Null, Value::String),
        );
    }
    let checkpoint = Checkpoint::from_value(&value).map_err(|e| StoreError::CorruptRow {
        table: "checkpoints",
        column: "body",
        detail: e.to_string(),
    })?;
    if checkpoint.id.as_str() != id {
        return Err(StoreError::CorruptRow {
            table: "checkpoints",
            column: "body",
            detail: format!("body id {} does not match row id {id}", checkpoint.id),
        });
    }
    Ok(checkpoint)
}

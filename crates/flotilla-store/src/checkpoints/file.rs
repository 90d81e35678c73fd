use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use flotilla_core::checkpoints::Checkpoint;
use flotilla_core::clock::format_ts;
use flotilla_core::ids::{CheckpointId, MissionId};

use super::{CheckpointBackend, ClaimOutcome};
use crate::error::StoreError;

const ENVELOPE_FORMAT: u32 = 1;

/// On-disk wrapper: the checkpoint JSON is kept as an opaque string so the
/// checksum covers exactly the bytes that were written.
#[derive(Serialize, Deserialize)]
struct Envelope {
    format: u32,
    checksum: String,
    body: String,
}

/// Backup checkpoint store: `<dir>/<mission_id>/<checkpoint_id>.json`,
/// written via temp file + rename.
pub struct FileCheckpointBackend {
    dir: PathBuf,
    // Serializes read-modify-write of consumed_at.
    write_lock: Mutex<()>,
}

impl FileCheckpointBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn mission_dir(&self, mission_id: &MissionId) -> Result<PathBuf, StoreError> {
        check_path_component("mission_id", mission_id.as_str())?;
        Ok(self.dir.join(mission_id.as_str()))
    }

    fn write(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        check_path_component("checkpoint_id", checkpoint.id.as_str())?;
        let dir = self.mission_dir(&checkpoint.mission_id)?;
        std::fs::create_dir_all(&dir)?;

        let body = serde_json::to_string(checkpoint)?;
        let envelope = Envelope {
            format: ENVELOPE_FORMAT,
            checksum: hex_sha256(body.as_bytes()),
            body,
        };
        let bytes = serde_json::to_vec_pretty(&envelope)?;

        let target = dir.join(format!("{}.json", checkpoint.id));
        let temp = dir.join(format!("{}.json.tmp", checkpoint.id));
        {
            let mut file = std::fs::File::create(&temp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&temp, &target).inspect_err(|_| {
            let _ = std::fs::remove_file(&temp);
        })?;
        debug!(path = %target.display(), "checkpoint file written");
        Ok(())
    }

    fn find(&self, id: &CheckpointId) -> Result<Option<PathBuf>, StoreError> {
        check_path_component("checkpoint_id", id.as_str())?;
        let file_name = format!("{id}.json");
        for mission_dir in self.mission_dirs()? {
            let candidate = mission_dir.join(&file_name);
            if candidate.is_file() {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    fn mission_dirs(&self) -> Result<Vec<PathBuf>, StoreError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_dir() {
                dirs.push(path);
            }
        }
        Ok(dirs)
    }

    /// Every valid checkpoint under `dir`; invalid files are logged and skipped.
    fn read_dir_checkpoints(&self, dir: &Path) -> Result<Vec<Checkpoint>, StoreError> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_checkpoint(&path) {
                Ok(checkpoint) => out.push(checkpoint),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping invalid checkpoint file"),
            }
        }
        Ok(out)
    }
}

impl CheckpointBackend for FileCheckpointBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        self.write(checkpoint)
    }

    fn load(&self, id: &CheckpointId) -> Result<Option<Checkpoint>, StoreError> {
        match self.find(id)? {
            Some(path) => read_checkpoint(&path).map(Some),
            None => Ok(None),
        }
    }

    fn latest(&self, mission_id: &MissionId) -> Result<Option<Checkpoint>, StoreError> {
        let mut all = self.read_dir_checkpoints(&self.mission_dir(mission_id)?)?;
        sort_newest_first(&mut all);
        Ok(all.into_iter().next())
    }

    fn list(&self, mission_id: Option<&MissionId>) -> Result<Vec<Checkpoint>, StoreError> {
        let mut all = match mission_id {
            Some(mission) => self.read_dir_checkpoints(&self.mission_dir(mission)?)?,
            None => {
                let mut all = Vec::new();
                for dir in self.mission_dirs()? {
                    all.extend(self.read_dir_checkpoints(&dir)?);
                }
                all
            }
        };
        sort_newest_first(&mut all);
        Ok(all)
    }

    fn delete(&self, id: &CheckpointId) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock();
        match self.find(id)? {
            Some(path) => {
                std::fs::remove_file(path)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn set_consumed(
        &self,
        id: &CheckpointId,
        at: DateTime<Utc>,
        force: bool,
    ) -> Result<ClaimOutcome, StoreError> {
        let _guard = self.write_lock.lock();
        let Some(path) = self.find(id)? else {
            return Ok(ClaimOutcome::Missing);
        };
        let mut checkpoint = read_checkpoint(&path)?;
        if let (Some(existing), false) = (checkpoint.consumed_at, force) {
            return Ok(ClaimOutcome::AlreadyConsumed(existing));
        }
        checkpoint.consumed_at = Some(at);
        self.write(&checkpoint)?;
        Ok(ClaimOutcome::Claimed)
    }

    fn revert_consumed(
        &self,
        id: &CheckpointId,
        claimed_at: DateTime<Utc>,
        previous: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock();
        let Some(path) = self.find(id)? else {
            return Ok(false);
        };
        let mut checkpoint = read_checkpoint(&path)?;
        // Compare at the precision timestamps are stored with.
        if checkpoint.consumed_at.map(format_ts) != Some(format_ts(claimed_at)) {
            return Ok(false);
        }
        checkpoint.consumed_at = previous;
        self.write(&checkpoint)?;
        Ok(true)
    }
}

fn read_checkpoint(path: &Path) -> Result<Checkpoint, StoreError> {
    let raw = std::fs::read(path)?;
    let envelope: Envelope = serde_json::from_slice(&raw).map_err(|e| corrupt(path, format!("envelope: {e}")))?;
    if envelope.format > ENVELOPE_FORMAT {
        return Err(corrupt(path, format!("unsupported envelope format {}", envelope.format)));
    }
    let actual = hex_sha256(envelope.body.as_bytes());
    if actual != envelope.checksum {
        return Err(corrupt(
            path,
            format!("checksum mismatch: expected {}, got {actual}", envelope.checksum),
        ));
    }
    let value: serde_json::Value =
        serde_json::from_str(&envelope.body).map_err(|e| corrupt(path, format!("body: {e}")))?;
    Checkpoint::from_value(&value).map_err(|e| corrupt(path, e.to_string()))
}

fn corrupt(path: &Path, detail: String) -> StoreError {
    StoreError::CorruptRow {
        table: "checkpoint_files",
        column: "body",
        detail: format!("{}: {detail}", path.display()),
    }
}

fn sort_newest_first(checkpoints: &mut [Checkpoint]) {
    checkpoints.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}

/// Ids become file and directory names; keep them to a safe alphabet.
fn check_path_component(field: &str, value: &str) -> Result<(), StoreError> {
    let ok = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !value.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(StoreError::validation(field, format!("{value:?} is not a safe file name")))
    }
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

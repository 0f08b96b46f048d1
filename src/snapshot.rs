//! Last-fetched raw rows per table, persisted as whole files.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::fsutil::write_json_atomic;
use crate::model::RawRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub fetched_at: Option<DateTime<Utc>>,
    pub records: Vec<RawRecord>,
}

/// Older snapshot files hold a bare array without a timestamp.
#[derive(Deserialize)]
#[serde(untagged)]
enum SnapshotFile {
    Current(Snapshot),
    Bare(Vec<RawRecord>),
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{}_raw.json", table))
    }

    /// Returns `Ok(None)` when no snapshot exists yet. An unreadable file is
    /// logged and treated as absent so the next save replaces it.
    pub fn load(&self, table: &str) -> io::Result<Option<Snapshot>> {
        let path = self.path(table);
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        match serde_json::from_str::<SnapshotFile>(&text) {
            Ok(SnapshotFile::Current(s)) => Ok(Some(s)),
            Ok(SnapshotFile::Bare(records)) => Ok(Some(Snapshot {
                fetched_at: None,
                records,
            })),
            Err(err) => {
                warn!(table, path = %path.display(), %err, "unreadable snapshot ignored");
                Ok(None)
            }
        }
    }

    pub fn save(&self, table: &str, records: &[RawRecord]) -> io::Result<Snapshot> {
        let snapshot = Snapshot {
            fetched_at: Some(Utc::now()),
            records: records.to_vec(),
        };
        write_json_atomic(&self.path(table), &snapshot)?;
        debug!(table, records = records.len(), "snapshot saved");
        Ok(snapshot)
    }

    /// Delete the snapshot for `table`; a missing file is not an error.
    pub fn remove(&self, table: &str) -> io::Result<()> {
        match fs::remove_file(self.path(table)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

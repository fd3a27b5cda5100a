//! On-disk mirror of the last successful pool observation.
//!
//! The file holds a single JSON record and is replaced wholesale on every
//! save: the new content goes to a sibling `.tmp` file that is then renamed
//! over the target, so a crash never leaves a torn snapshot behind.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use cloudpool_core::MachinePool;

use crate::error::SnapshotError;

/// A cached pool observation and the time it was fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub pool: MachinePool,
    pub fetch_time: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(pool: MachinePool, fetch_time: DateTime<Utc>) -> Self {
        Self { pool, fetch_time }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot. A missing file is `Ok(None)`.
    pub fn load(&self) -> Result<Option<CacheEntry>, SnapshotError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let entry: CacheEntry = serde_json::from_str(&content)?;
        debug!(path = ?self.path, machines = entry.pool.machines.len(), "pool snapshot loaded");
        Ok(Some(entry))
    }

    /// Atomically replace the snapshot with `entry`.
    pub fn save(&self, entry: &CacheEntry) -> Result<(), SnapshotError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.tmp_path();
        let json = serde_json::to_vec_pretty(entry)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!(path = ?self.path, machines = entry.pool.machines.len(), "pool snapshot saved");
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

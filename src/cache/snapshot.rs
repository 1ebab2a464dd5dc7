//! On-disk snapshot of a repository's observed branches.
//!
//! One JSON document per repository at `<state_dir>/<owner>/<repo>/branches.json`
//! holds both the full branch list and the protected branch list, so a reader
//! never sees one half refreshed and the other stale.
//!
//! Snapshots are written with write-to-temp-then-rename:
//! 1. Write to `branches.json.tmp`
//! 2. fsync the file
//! 3. Rename to `branches.json`
//! 4. fsync the directory

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::fsync::{fsync_dir, fsync_file};
use crate::types::RepoId;

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: u32 = 1;

/// File name of a repository's snapshot.
pub const SNAPSHOT_FILE: &str = "branches.json";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("schema version mismatch: expected {expected}, got {got}")]
    SchemaMismatch { expected: u32, got: u32 },
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Branch state of one repository as last observed on the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchSnapshot {
    pub schema_version: u32,

    /// When the server was last read.
    pub refreshed_at: DateTime<Utc>,

    /// Every branch, in server order.
    pub branches: Vec<String>,

    /// Branches with a protection rule, in server order.
    pub protected_branches: Vec<String>,
}

impl BranchSnapshot {
    pub fn new(branches: Vec<String>, protected_branches: Vec<String>) -> Self {
        BranchSnapshot {
            schema_version: SCHEMA_VERSION,
            refreshed_at: Utc::now(),
            branches,
            protected_branches,
        }
    }

    pub fn is_protected(&self, branch: &str) -> bool {
        self.protected_branches.iter().any(|b| b == branch)
    }
}

/// Location of a repository's snapshot under the state directory.
pub fn snapshot_path(state_dir: &Path, repo: &RepoId) -> PathBuf {
    state_dir.join(&repo.owner).join(&repo.repo).join(SNAPSHOT_FILE)
}

/// Saves a snapshot atomically, creating parent directories as needed.
pub fn save_snapshot_atomic(path: &Path, snapshot: &BranchSnapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(snapshot)?;

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&bytes)?;
        fsync_file(&file)?;
    }

    std::fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent() {
        fsync_dir(parent)?;
    }

    Ok(())
}

/// Loads a snapshot, checking its schema version.
pub fn load_snapshot(path: &Path) -> Result<BranchSnapshot> {
    let bytes = std::fs::read(path)?;
    let snapshot: BranchSnapshot = serde_json::from_slice(&bytes)?;

    if snapshot.schema_version != SCHEMA_VERSION {
        return Err(SnapshotError::SchemaMismatch {
            expected: SCHEMA_VERSION,
            got: snapshot.schema_version,
        });
    }

    Ok(snapshot)
}

/// Attempts to load a snapshot, returning None if the file doesn't exist.
pub fn try_load_snapshot(path: &Path) -> Result<Option<BranchSnapshot>> {
    match load_snapshot(path) {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(SnapshotError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Deletes a snapshot. A missing file is not an error.
pub fn remove_snapshot(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    }
    if let Some(parent) = path.parent() {
        fsync_dir(parent)?;
    }
    Ok(())
}

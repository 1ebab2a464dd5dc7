//! Per-repository cache of observed branch state.
//!
//! The cache holds the last [`BranchSnapshot`] read from the server, both in
//! memory and on disk. Refreshes of one repository are serialized by an async
//! mutex, so a burst of webhooks queues refreshes instead of racing them on
//! the snapshot file. The mutex can be shared between successive caches of
//! the same repository (see [`BranchStateCache::with_refresh_lock`]), which
//! keeps a reload from overlapping a refresh still running on the old cache.
//!
//! # Corruption
//!
//! Every repository has at least one branch. A refresh that reads an empty
//! branch list means the server or the listing is broken, and recording it
//! would make every branch look unprotected-and-absent. Such a refresh deletes
//! the snapshot, marks the cache corrupted, and fails. A corrupted cache
//! refuses further loads and refreshes; only a registry reload (which builds
//! a new cache) clears it.

pub mod fsync;
pub mod snapshot;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::gitea::{BranchListKind, RemoteApi};
use crate::types::RepoId;

pub use snapshot::{
    BranchSnapshot, SCHEMA_VERSION, SnapshotError, load_snapshot, remove_snapshot,
    save_snapshot_atomic, snapshot_path, try_load_snapshot,
};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("snapshot error for {repo}: {source}")]
    Snapshot {
        repo: RepoId,
        #[source]
        source: SnapshotError,
    },

    /// The server reported no branches at all.
    #[error("server returned no branches for {repo}; cache invalidated")]
    EmptyBranchList { repo: RepoId },

    /// An earlier refresh found the cache corrupted.
    #[error("branch cache for {repo} is corrupted; reload required")]
    Corrupted { repo: RepoId },
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Clone)]
enum CacheState {
    /// Nothing loaded yet.
    Unloaded,
    Ready(Arc<BranchSnapshot>),
    Corrupted,
}

/// Observed branch state of one repository.
pub struct BranchStateCache {
    repo: RepoId,
    path: PathBuf,
    remote: Arc<dyn RemoteApi>,
    state: RwLock<CacheState>,
    refresh_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for BranchStateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchStateCache")
            .field("repo", &self.repo)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl BranchStateCache {
    pub fn new(repo: RepoId, state_dir: &Path, remote: Arc<dyn RemoteApi>) -> Self {
        Self::with_refresh_lock(repo, state_dir, remote, Arc::default())
    }

    /// Builds a cache whose refreshes and invalidations hold `refresh_lock`.
    pub fn with_refresh_lock(
        repo: RepoId,
        state_dir: &Path,
        remote: Arc<dyn RemoteApi>,
        refresh_lock: Arc<Mutex<()>>,
    ) -> Self {
        let path = snapshot_path(state_dir, &repo);
        BranchStateCache {
            repo,
            path,
            remote,
            state: RwLock::new(CacheState::Unloaded),
            refresh_lock,
        }
    }

    pub fn repo(&self) -> &RepoId {
        &self.repo
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The snapshot currently held in memory, without any I/O.
    pub async fn current(&self) -> Option<Arc<BranchSnapshot>> {
        match &*self.state.read().await {
            CacheState::Ready(snapshot) => Some(snapshot.clone()),
            _ => None,
        }
    }

    pub async fn is_corrupted(&self) -> bool {
        matches!(*self.state.read().await, CacheState::Corrupted)
    }

    /// Returns the persisted snapshot, refreshing from the server if there is none.
    #[instrument(skip(self), fields(repo = %self.repo))]
    pub async fn load(&self) -> Result<Arc<BranchSnapshot>> {
        match &*self.state.read().await {
            CacheState::Corrupted => return Err(self.corrupted()),
            CacheState::Ready(snapshot) => return Ok(snapshot.clone()),
            CacheState::Unloaded => {}
        }

        let persisted = try_load_snapshot(&self.path).map_err(|source| self.snapshot_err(source))?;
        match persisted {
            Some(snapshot) if !snapshot.branches.is_empty() => {
                debug!(
                    branches = snapshot.branches.len(),
                    protected = snapshot.protected_branches.len(),
                    "Loaded branch snapshot from disk"
                );
                let snapshot = Arc::new(snapshot);
                *self.state.write().await = CacheState::Ready(snapshot.clone());
                Ok(snapshot)
            }
            Some(_) => {
                error!("Persisted snapshot lists no branches");
                self.invalidate_as_corrupted().await;
                Err(CacheError::EmptyBranchList {
                    repo: self.repo.clone(),
                })
            }
            None => {
                debug!("No persisted snapshot; refreshing from server");
                self.refresh().await
            }
        }
    }

    /// Re-reads both branch listings and persists them as one snapshot.
    #[instrument(skip(self), fields(repo = %self.repo))]
    pub async fn refresh(&self) -> Result<Arc<BranchSnapshot>> {
        let _guard = self.refresh_lock.lock().await;

        if self.is_corrupted().await {
            return Err(self.corrupted());
        }

        let all = self.remote.fetch_branches(&self.repo, BranchListKind::All).await;
        let protected = self
            .remote
            .fetch_branches(&self.repo, BranchListKind::Protected)
            .await;

        if all.names.is_empty() {
            error!("Server returned no branches; invalidating cache");
            self.invalidate_as_corrupted().await;
            return Err(CacheError::EmptyBranchList {
                repo: self.repo.clone(),
            });
        }
        if !all.complete || !protected.complete {
            warn!(
                branches_complete = all.complete,
                protected_complete = protected.complete,
                "Branch listing is partial; snapshot may be short"
            );
        }

        let snapshot = BranchSnapshot::new(all.names, protected.names);
        save_snapshot_atomic(&self.path, &snapshot).map_err(|source| self.snapshot_err(source))?;
        info!(
            branches = snapshot.branches.len(),
            protected = snapshot.protected_branches.len(),
            "Branch snapshot refreshed"
        );

        let snapshot = Arc::new(snapshot);
        *self.state.write().await = CacheState::Ready(snapshot.clone());
        Ok(snapshot)
    }

    /// Deletes the persisted snapshot so the next load reads the server.
    pub async fn invalidate(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        remove_snapshot(&self.path).map_err(|source| self.snapshot_err(source))?;
        let mut state = self.state.write().await;
        if !matches!(*state, CacheState::Corrupted) {
            *state = CacheState::Unloaded;
        }
        Ok(())
    }

    async fn invalidate_as_corrupted(&self) {
        if let Err(e) = remove_snapshot(&self.path) {
            warn!(error = %e, "Cannot remove corrupted snapshot");
        }
        *self.state.write().await = CacheState::Corrupted;
    }

    fn corrupted(&self) -> CacheError {
        CacheError::Corrupted {
            repo: self.repo.clone(),
        }
    }

    fn snapshot_err(&self, source: SnapshotError) -> CacheError {
        CacheError::Snapshot {
            repo: self.repo.clone(),
            source,
        }
    }
}

//! The set of repositories under management.
//!
//! A [`Registry`] maps each repository identity to a [`RepoHandler`] bundling
//! its policy, its branch-state cache and the remote API. The map is built
//! from the policy directory as a whole and swapped in atomically: readers
//! clone an `Arc` of the current map, so they see either the old set or the
//! new one, never a mix. Reloading never appends to the previous set.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{BranchSnapshot, BranchStateCache, CacheError};
use crate::gitea::RemoteApi;
use crate::policy::{self, Policy};
use crate::reconcile::{self, SyncMode};
use crate::types::{EventKind, RepoId, Task, TaskResult, WriteKind};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cannot read policy directory {path}: {source}")]
    PolicyDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Startup refuses to run with a partial policy set.
    #[error("{} organization(s) failed to load", .0.len())]
    OrganizationsFailed(Vec<LoadFailure>),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The organization's policy file could not be loaded; none of its
    /// repositories are registered.
    Organization,
    /// The repository is registered but its branch state could not be read.
    Repository,
}

/// Something that could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadFailure {
    pub kind: FailureKind,
    pub scope: String,
    pub message: String,
}

/// What a load or reload ended up registering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadSummary {
    pub organizations: Vec<String>,
    pub repositories: Vec<String>,
    pub failures: Vec<LoadFailure>,
}

/// Everything needed to reconcile one repository.
pub struct RepoHandler {
    policy: Arc<Policy>,
    cache: BranchStateCache,
    remote: Arc<dyn RemoteApi>,
}

impl std::fmt::Debug for RepoHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoHandler")
            .field("repo", self.repo())
            .field("patterns", &self.policy.patterns())
            .finish_non_exhaustive()
    }
}

impl RepoHandler {
    /// `refresh_lock` serializes branch-state refreshes of this repository
    /// across every handler built for it.
    pub fn new(
        policy: Arc<Policy>,
        state_dir: &Path,
        remote: Arc<dyn RemoteApi>,
        refresh_lock: Arc<Mutex<()>>,
    ) -> Self {
        let cache = BranchStateCache::with_refresh_lock(
            policy.repo().clone(),
            state_dir,
            remote.clone(),
            refresh_lock,
        );
        RepoHandler {
            policy,
            cache,
            remote,
        }
    }

    pub fn repo(&self) -> &RepoId {
        self.policy.repo()
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn cache(&self) -> &BranchStateCache {
        &self.cache
    }

    /// Plans protection for every branch in the cached snapshot.
    pub async fn plan(&self, mode: SyncMode) -> std::result::Result<Vec<Task>, CacheError> {
        let snapshot = self.cache.load().await?;
        Ok(reconcile::plan_repository(&self.policy, &snapshot, mode))
    }

    /// Plans protection for one branch named by a webhook.
    pub async fn plan_branch(
        &self,
        branch: &str,
        event: &EventKind,
    ) -> std::result::Result<Option<Task>, CacheError> {
        if event.is_delete() {
            return Ok(None);
        }
        let snapshot = self.cache.load().await?;
        Ok(reconcile::plan_branch(&self.policy, &snapshot, branch, event))
    }

    /// Sends one protection write. Whether it creates or updates a rule is
    /// decided from the snapshot at execution time.
    #[instrument(skip(self, task), fields(repo = %task.repo, branch = %task.branch))]
    pub async fn execute(&self, task: &Task) -> TaskResult {
        let snapshot: Arc<BranchSnapshot> = match self.cache.load().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Skipping task; branch state unavailable");
                return TaskResult::Skipped {
                    reason: e.to_string(),
                };
            }
        };
        let write = WriteKind::for_branch(snapshot.is_protected(&task.branch));

        match self
            .remote
            .apply_protection(&task.repo, &task.branch, self.policy.parameters(), write)
            .await
        {
            Ok(()) => {
                info!(?write, "Branch protection applied");
                TaskResult::Protected { write }
            }
            Err(failure) => {
                warn!(status = ?failure.status, error = %failure.message, "Branch protection failed");
                TaskResult::Failed {
                    status: failure.status,
                    message: failure.message,
                }
            }
        }
    }
}

type HandlerMap = HashMap<RepoId, Arc<RepoHandler>>;

/// The managed repositories, rebuilt wholesale from the policy directory.
pub struct Registry {
    policy_dir: PathBuf,
    state_dir: PathBuf,
    remote: Arc<dyn RemoteApi>,
    handlers: RwLock<Arc<HandlerMap>>,
    /// Outlives handlers, so old and new caches of one repository share it.
    refresh_locks: Mutex<HashMap<RepoId, Arc<Mutex<()>>>>,
    reload_lock: Mutex<()>,
}

impl Registry {
    /// Creates an empty registry. Call [`Registry::load`] to populate it.
    pub fn new(
        policy_dir: impl Into<PathBuf>,
        state_dir: impl Into<PathBuf>,
        remote: Arc<dyn RemoteApi>,
    ) -> Self {
        Registry {
            policy_dir: policy_dir.into(),
            state_dir: state_dir.into(),
            remote,
            handlers: RwLock::new(Arc::new(HashMap::new())),
            refresh_locks: Mutex::new(HashMap::new()),
            reload_lock: Mutex::new(()),
        }
    }

    /// Initial load. Persisted snapshots are reused; any organization that
    /// fails to load aborts startup.
    #[instrument(skip(self), fields(policy_dir = %self.policy_dir.display()))]
    pub async fn load(&self) -> Result<ReloadSummary> {
        let _guard = self.reload_lock.lock().await;
        let (map, summary) = self.build(false).await?;

        let organization_failures: Vec<LoadFailure> = summary
            .failures
            .iter()
            .filter(|f| f.kind == FailureKind::Organization)
            .cloned()
            .collect();
        if !organization_failures.is_empty() {
            return Err(RegistryError::OrganizationsFailed(organization_failures));
        }

        self.install(map).await;
        info!(repositories = summary.repositories.len(), "Registry loaded");
        Ok(summary)
    }

    /// Rebuilds the registry from the policy directory, discarding every
    /// persisted snapshot so branch state is re-read from the server.
    #[instrument(skip(self), fields(policy_dir = %self.policy_dir.display()))]
    pub async fn reload(&self) -> Result<ReloadSummary> {
        let _guard = self.reload_lock.lock().await;
        let (map, summary) = self.build(true).await?;
        self.install(map).await;
        info!(
            repositories = summary.repositories.len(),
            failures = summary.failures.len(),
            "Registry reloaded"
        );
        Ok(summary)
    }

    pub async fn lookup(&self, repo: &RepoId) -> Option<Arc<RepoHandler>> {
        self.handlers.read().await.get(repo).cloned()
    }

    /// Every handler, sorted by repository identity.
    pub async fn handlers(&self) -> Vec<Arc<RepoHandler>> {
        let map = self.handlers.read().await.clone();
        let mut handlers: Vec<_> = map.values().cloned().collect();
        handlers.sort_by(|a, b| a.repo().cmp(b.repo()));
        handlers
    }

    pub async fn len(&self) -> usize {
        self.handlers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.handlers.read().await.is_empty()
    }

    async fn install(&self, map: HandlerMap) {
        self.refresh_locks
            .lock()
            .await
            .retain(|repo, _| map.contains_key(repo));
        *self.handlers.write().await = Arc::new(map);
    }

    async fn refresh_lock(&self, repo: &RepoId) -> Arc<Mutex<()>> {
        self.refresh_locks
            .lock()
            .await
            .entry(repo.clone())
            .or_default()
            .clone()
    }

    async fn build(&self, invalidate: bool) -> Result<(HandlerMap, ReloadSummary)> {
        let files = policy::discover_policy_files(&self.policy_dir).map_err(|source| {
            RegistryError::PolicyDir {
                path: self.policy_dir.clone(),
                source,
            }
        })?;

        let mut summary = ReloadSummary::default();
        let mut map = HandlerMap::new();

        for path in files {
            let scope =
                policy::organization_of(&path).unwrap_or_else(|_| path.display().to_string());
            let policies = match policy::load_organization(&path) {
                Ok(policies) => policies,
                Err(e) => {
                    error!(organization = %scope, error = %e, "Failed to load organization policy");
                    summary.failures.push(LoadFailure {
                        kind: FailureKind::Organization,
                        scope,
                        message: e.to_string(),
                    });
                    continue;
                }
            };
            debug!(organization = %scope, repositories = policies.len(), "Loaded organization");
            summary.organizations.push(scope);

            for policy in policies {
                let repo = policy.repo().clone();
                if map.contains_key(&repo) {
                    warn!(repo = %repo, "Repository declared twice; keeping the first");
                    continue;
                }
                let refresh_lock = self.refresh_lock(&repo).await;
                let handler = RepoHandler::new(
                    Arc::new(policy),
                    &self.state_dir,
                    self.remote.clone(),
                    refresh_lock,
                );
                map.insert(repo, Arc::new(handler));
            }
        }

        let mut loads = JoinSet::new();
        for handler in map.values().cloned() {
            loads.spawn(async move {
                let result = async {
                    if invalidate {
                        handler.cache.invalidate().await?;
                    }
                    handler.cache.load().await.map(|_| ())
                }
                .await;
                (handler.repo().clone(), result)
            });
        }
        while let Some(joined) = loads.join_next().await {
            match joined {
                Ok((repo, Ok(()))) => debug!(repo = %repo, "Branch state loaded"),
                Ok((repo, Err(e))) => {
                    error!(repo = %repo, error = %e, "Branch state failed to load");
                    summary.failures.push(LoadFailure {
                        kind: FailureKind::Repository,
                        scope: repo.full_name(),
                        message: e.to_string(),
                    });
                }
                Err(e) => error!(error = %e, "Branch state load task panicked"),
            }
        }

        let mut repositories: Vec<String> = map.keys().map(RepoId::full_name).collect();
        repositories.sort();
        summary.repositories = repositories;
        summary.failures.sort_by(|a, b| a.scope.cmp(&b.scope));
        Ok((map, summary))
    }
}

//! Shared test utilities: an in-memory Gitea and policy builders.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::gitea::{BranchListKind, BranchListing, ProtectionFailure, RemoteApi};
use crate::policy::{Parameters, Policy};
use crate::types::{RepoId, WriteKind};

/// The repository most tests work on.
pub fn repo() -> RepoId {
    RepoId::new("acme", "widgets")
}

pub fn policy(repo: &RepoId, patterns: &[&str]) -> Arc<Policy> {
    Arc::new(
        Policy::new(
            repo.clone(),
            patterns.iter().map(|p| p.to_string()).collect(),
            Parameters::new(),
        )
        .unwrap(),
    )
}

/// Writes `<organization>.toml` into `dir`.
pub fn write_policy_file(dir: &Path, organization: &str, contents: &str) {
    std::fs::write(dir.join(format!("{organization}.toml")), contents).unwrap();
}

/// A protection write received by [`FakeRemote`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedWrite {
    pub repo: RepoId,
    pub branch: String,
    pub write: WriteKind,
    pub parameters: Parameters,
}

#[derive(Default)]
struct FakeState {
    branches: HashMap<RepoId, Vec<String>>,
    protected: HashMap<RepoId, Vec<String>>,
    rejections: HashMap<(RepoId, String), u16>,
    writes: Vec<RecordedWrite>,
}

/// Tracks how many calls of one kind run at once.
#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory server. Accepted writes add the branch to the protected list,
/// as the real server would.
#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<FakeState>,
    fetches: AtomicUsize,
    fetch_gauge: Gauge,
    write_gauge: Gauge,
    fetch_delay: Duration,
    write_delay: Duration,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    pub fn set_branches(&self, repo: &RepoId, branches: &[&str]) {
        self.state
            .lock()
            .unwrap()
            .branches
            .insert(repo.clone(), branches.iter().map(|b| b.to_string()).collect());
    }

    pub fn set_protected(&self, repo: &RepoId, branches: &[&str]) {
        self.state
            .lock()
            .unwrap()
            .protected
            .insert(repo.clone(), branches.iter().map(|b| b.to_string()).collect());
    }

    /// Makes writes for `branch` fail with `status`.
    pub fn reject(&self, repo: &RepoId, branch: &str, status: u16) {
        self.state
            .lock()
            .unwrap()
            .rejections
            .insert((repo.clone(), branch.to_string()), status);
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn protected(&self, repo: &RepoId) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .protected
            .get(repo)
            .cloned()
            .unwrap_or_default()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_fetches(&self) -> usize {
        self.fetch_gauge.max.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_writes(&self) -> usize {
        self.write_gauge.max.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn fetch_branches(&self, repo: &RepoId, kind: BranchListKind) -> BranchListing {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.fetch_gauge.enter();
        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }
        let names = {
            let state = self.state.lock().unwrap();
            let source = match kind {
                BranchListKind::All => &state.branches,
                BranchListKind::Protected => &state.protected,
            };
            source.get(repo).cloned().unwrap_or_default()
        };
        self.fetch_gauge.exit();
        BranchListing::complete(names)
    }

    async fn apply_protection(
        &self,
        repo: &RepoId,
        branch: &str,
        parameters: &Parameters,
        write: WriteKind,
    ) -> Result<(), ProtectionFailure> {
        self.write_gauge.enter();
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        let result = {
            let mut state = self.state.lock().unwrap();
            if let Some(status) = state.rejections.get(&(repo.clone(), branch.to_string())) {
                Err(ProtectionFailure::rejected(*status, "rejected by fake"))
            } else {
                state.writes.push(RecordedWrite {
                    repo: repo.clone(),
                    branch: branch.to_string(),
                    write,
                    parameters: parameters.clone(),
                });
                let protected = state.protected.entry(repo.clone()).or_default();
                if !protected.iter().any(|b| b == branch) {
                    protected.push(branch.to_string());
                }
                Ok(())
            }
        };
        self.write_gauge.exit();
        result
    }
}

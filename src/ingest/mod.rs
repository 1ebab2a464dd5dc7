//! Webhook post-processing off the request path.
//!
//! Accepting a delivery plans the single-branch task, enqueues it and asks
//! the background [`IngestWorker`] to drain. The request returns before the
//! drain runs. The worker is fed by a bounded channel; when the channel is
//! full the drain request is coalesced into the one already waiting.
//!
//! ```text
//! POST /webhook ──► plan ──► scheduler.enqueue ──► try_send(Drain) ──► 202
//!                                                      │
//!                                     bounded mpsc ◄───┘
//!                                          │
//!                                          ▼
//!                                    IngestWorker ──► scheduler.drain
//! ```

pub mod message;

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::CacheError;
use crate::registry::Registry;
use crate::scheduler::TaskScheduler;
use crate::types::Task;
use crate::webhooks::BranchEvent;

pub use message::IngestMessage;

/// Default capacity of the ingest channel.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("ingest worker has stopped")]
    WorkerStopped,

    /// The repository's branch state could not be read, so nothing was planned.
    #[error(transparent)]
    BranchState(#[from] CacheError),
}

/// How a drain request was handed to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainRequest {
    Queued,
    /// The channel was full; a pending request will pick the task up.
    Coalesced,
}

/// What accepting a delivery amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accepted {
    /// The repository is not under management.
    UnknownRepository,
    /// Nothing to protect: deleted, not matching, or already protected.
    NoTask,
    /// A task was enqueued and a drain requested.
    Enqueued { task: Task, drain: DrainRequest },
}

/// Sending side of the ingest channel.
#[derive(Debug, Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<IngestMessage>,
}

impl IngestHandle {
    /// Asks the worker to drain without waiting for channel space.
    pub fn request_drain(&self) -> Result<DrainRequest, IngestError> {
        match self.tx.try_send(IngestMessage::Drain) {
            Ok(()) => Ok(DrainRequest::Queued),
            Err(TrySendError::Full(_)) => {
                debug!("Ingest channel full; drain request coalesced");
                Ok(DrainRequest::Coalesced)
            }
            Err(TrySendError::Closed(_)) => Err(IngestError::WorkerStopped),
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(IngestMessage::Shutdown).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Creates the bounded ingest channel.
pub fn channel(capacity: usize) -> (IngestHandle, mpsc::Receiver<IngestMessage>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (IngestHandle { tx }, rx)
}

/// Plans and enqueues the task for one validated delivery, then requests a drain.
#[instrument(skip_all, fields(repo = %event.repo, branch = %event.branch, event = %event.event))]
pub async fn accept(
    registry: &Registry,
    scheduler: &TaskScheduler,
    handle: &IngestHandle,
    event: &BranchEvent,
) -> Result<Accepted, IngestError> {
    if handle.is_closed() {
        return Err(IngestError::WorkerStopped);
    }
    let Some(handler) = registry.lookup(&event.repo).await else {
        debug!("Delivery for unmanaged repository");
        return Ok(Accepted::UnknownRepository);
    };

    let task = handler
        .plan_branch(&event.branch, &event.event)
        .await
        .inspect_err(|e| warn!(error = %e, "Cannot plan branch; branch state unavailable"))?;
    let Some(task) = task else {
        return Ok(Accepted::NoTask);
    };

    info!(%task, "Enqueueing protection task");
    scheduler.enqueue([task.clone()]).await;
    let drain = handle.request_drain()?;
    Ok(Accepted::Enqueued { task, drain })
}

/// Background worker that drains the scheduler on request.
pub struct IngestWorker {
    registry: Arc<Registry>,
    scheduler: Arc<TaskScheduler>,
}

impl IngestWorker {
    pub fn new(registry: Arc<Registry>, scheduler: Arc<TaskScheduler>) -> Self {
        IngestWorker {
            registry,
            scheduler,
        }
    }

    /// Spawns the worker with a fresh channel.
    pub fn spawn(self, capacity: usize, shutdown: CancellationToken) -> (IngestHandle, JoinHandle<()>) {
        let (handle, rx) = channel(capacity);
        let task = tokio::spawn(self.run(rx, shutdown));
        (handle, task)
    }

    pub async fn run(self, mut rx: mpsc::Receiver<IngestMessage>, shutdown: CancellationToken) {
        info!("Ingest worker started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping ingest worker");
                    break;
                }
                msg = rx.recv() => match msg {
                    Some(IngestMessage::Drain) => {
                        let report = self.scheduler.drain(&self.registry).await;
                        if !report.all_succeeded() {
                            warn!(
                                failed = report.failed().count(),
                                refresh_failures = report.refresh_failures.len(),
                                "Webhook batch finished with failures"
                            );
                        }
                    }
                    Some(IngestMessage::Shutdown) => {
                        info!("Shutdown message received");
                        break;
                    }
                    None => {
                        debug!("Ingest channel closed");
                        break;
                    }
                }
            }
        }
        info!("Ingest worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SchedulerConfig;
    use crate::test_utils::{FakeRemote, repo, write_policy_file};
    use crate::types::{EventKind, RepoId, TaskAction};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dirs: (TempDir, TempDir),
        remote: Arc<FakeRemote>,
        registry: Arc<Registry>,
        scheduler: Arc<TaskScheduler>,
    }

    async fn fixture() -> Fixture {
        let policies = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let remote = Arc::new(FakeRemote::new());
        remote.set_branches(&repo(), &["main", "release/1.0"]);
        remote.set_protected(&repo(), &["main"]);
        write_policy_file(
            policies.path(),
            "acme",
            "[widgets]\nbranches = [\"^release/.*\", \"^main$\"]\n",
        );
        let registry = Arc::new(Registry::new(policies.path(), state.path(), remote.clone()));
        registry.load().await.unwrap();
        let scheduler = Arc::new(TaskScheduler::new(
            SchedulerConfig::default(),
            CancellationToken::new(),
        ));
        Fixture {
            _dirs: (policies, state),
            remote,
            registry,
            scheduler,
        }
    }

    fn event(repo: RepoId, branch: &str, kind: EventKind) -> BranchEvent {
        BranchEvent {
            repo,
            branch: branch.to_string(),
            event: kind,
        }
    }

    #[tokio::test]
    async fn matching_push_enqueues_and_requests_drain() {
        let fx = fixture().await;
        let (handle, mut rx) = channel(4);

        let accepted = accept(
            &fx.registry,
            &fx.scheduler,
            &handle,
            &event(repo(), "release/1.0", EventKind::Push),
        )
        .await
        .unwrap();

        assert!(matches!(
            accepted,
            Accepted::Enqueued { ref task, drain: DrainRequest::Queued }
                if task.action == TaskAction::Protect && task.branch == "release/1.0"
        ));
        assert_eq!(fx.scheduler.pending_len().await, 1);
        assert_eq!(rx.try_recv().unwrap(), IngestMessage::Drain);
    }

    #[tokio::test]
    async fn deletes_unknown_repos_and_protected_branches_are_no_ops() {
        let fx = fixture().await;
        let (handle, _rx) = channel(4);

        let cases = [
            (event(repo(), "release/1.0", EventKind::Delete), Accepted::NoTask),
            (event(repo(), "main", EventKind::Push), Accepted::NoTask),
            (event(repo(), "feature/x", EventKind::Push), Accepted::NoTask),
            (
                event(RepoId::new("other", "thing"), "main", EventKind::Push),
                Accepted::UnknownRepository,
            ),
        ];
        for (event, expected) in cases {
            let accepted = accept(&fx.registry, &fx.scheduler, &handle, &event)
                .await
                .unwrap();
            assert_eq!(accepted, expected);
        }
        assert_eq!(fx.scheduler.pending_len().await, 0);
    }

    #[tokio::test]
    async fn full_channel_coalesces_drain_requests() {
        let fx = fixture().await;
        let (handle, _rx) = channel(1);
        assert_eq!(handle.request_drain().unwrap(), DrainRequest::Queued);

        let accepted = accept(
            &fx.registry,
            &fx.scheduler,
            &handle,
            &event(repo(), "release/1.0", EventKind::Create),
        )
        .await
        .unwrap();

        assert!(matches!(
            accepted,
            Accepted::Enqueued {
                drain: DrainRequest::Coalesced,
                ..
            }
        ));
        assert_eq!(fx.scheduler.pending_len().await, 1);
    }

    #[tokio::test]
    async fn stopped_worker_rejects_deliveries() {
        let fx = fixture().await;
        let (handle, rx) = channel(1);
        drop(rx);

        let err = accept(
            &fx.registry,
            &fx.scheduler,
            &handle,
            &event(repo(), "release/1.0", EventKind::Push),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, IngestError::WorkerStopped));
        assert_eq!(fx.scheduler.pending_len().await, 0);
    }

    #[tokio::test]
    async fn corrupted_branch_state_is_an_error() {
        let fx = fixture().await;
        let (handle, _rx) = channel(4);
        let handler = fx.registry.lookup(&repo()).await.unwrap();
        fx.remote.set_branches(&repo(), &[]);
        assert!(handler.cache().refresh().await.is_err());

        let err = accept(
            &fx.registry,
            &fx.scheduler,
            &handle,
            &event(repo(), "release/1.0", EventKind::Push),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            IngestError::BranchState(CacheError::Corrupted { .. })
        ));
        assert_eq!(fx.scheduler.pending_len().await, 0);
    }

    #[tokio::test]
    async fn worker_drains_in_the_background() {
        let fx = fixture().await;
        let shutdown = CancellationToken::new();
        let (handle, task) = IngestWorker::new(fx.registry.clone(), fx.scheduler.clone())
            .spawn(4, shutdown.clone());

        accept(
            &fx.registry,
            &fx.scheduler,
            &handle,
            &event(repo(), "release/1.0", EventKind::Push),
        )
        .await
        .unwrap();

        let mut protected = false;
        for _ in 0..100 {
            if fx.remote.protected(&repo()).contains(&"release/1.0".to_string()) {
                protected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(protected);

        handle.shutdown().await;
        task.await.unwrap();
        assert!(handle.is_closed());
    }
}

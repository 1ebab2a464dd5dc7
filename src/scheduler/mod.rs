//! Batched execution of protection tasks.
//!
//! Tasks accumulate in a pending queue until a drain takes all of them at
//! once. A drain runs the batch with bounded concurrency, waits for every
//! unit (the batch barrier), and only then refreshes the branch state of each
//! repository the batch touched. The refresh goes through the registry as it
//! stands after the barrier, so a reload during the batch is refreshed too.
//! Drains never overlap. On shutdown, units still waiting for a permit are
//! skipped and units already writing fail.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::registry::{RepoHandler, Registry};
use crate::types::{BatchReport, RefreshFailure, RepoId, Task, TaskOutcome, TaskResult};

/// Default number of protection writes in flight at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Default bound on a single protection unit.
pub const DEFAULT_UNIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrency: usize,
    pub unit_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            unit_timeout: DEFAULT_UNIT_TIMEOUT,
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_unit_timeout(mut self, unit_timeout: Duration) -> Self {
        self.unit_timeout = unit_timeout;
        self
    }
}

/// The pending queue and the batch runner.
pub struct TaskScheduler {
    config: SchedulerConfig,
    pending: Mutex<Vec<Task>>,
    drain_lock: Mutex<()>,
    shutdown: CancellationToken,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig, shutdown: CancellationToken) -> Self {
        info!(
            max_concurrency = config.max_concurrency,
            unit_timeout = ?config.unit_timeout,
            "Creating task scheduler"
        );
        TaskScheduler {
            config,
            pending: Mutex::new(Vec::new()),
            drain_lock: Mutex::new(()),
            shutdown,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Appends tasks to the pending queue.
    pub async fn enqueue(&self, tasks: impl IntoIterator<Item = Task>) {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.extend(tasks);
        debug!(added = pending.len() - before, pending = pending.len(), "Tasks enqueued");
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Stops the running batch: queued units are skipped and units in flight
    /// fail.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Takes every pending task and runs it as one batch.
    ///
    /// The queue is empty afterwards whatever the outcome. The report holds
    /// one outcome per task taken.
    #[instrument(skip(self, registry))]
    pub async fn drain(&self, registry: &Registry) -> BatchReport {
        let _guard = self.drain_lock.lock().await;
        let tasks = std::mem::take(&mut *self.pending.lock().await);
        if tasks.is_empty() {
            debug!("Drain requested with nothing pending");
            return BatchReport::default();
        }
        info!(tasks = tasks.len(), "Draining task batch");

        let mut report = BatchReport::default();
        let mut seen = HashSet::new();
        let mut touched: BTreeSet<RepoId> = BTreeSet::new();
        let mut in_flight: HashMap<tokio::task::Id, Task> = HashMap::new();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut units = JoinSet::new();

        for task in tasks {
            if !seen.insert((task.repo.clone(), task.branch.clone())) {
                warn!(%task, "Duplicate task in batch; skipping");
                report
                    .outcomes
                    .push(TaskOutcome::new(&task, skipped("duplicate task in batch")));
                continue;
            }
            let Some(handler) = registry.lookup(&task.repo).await else {
                warn!(%task, "Repository is no longer registered; skipping");
                report
                    .outcomes
                    .push(TaskOutcome::new(&task, skipped("repository not registered")));
                continue;
            };
            if handler.cache().is_corrupted().await {
                warn!(%task, "Branch cache corrupted; skipping");
                report.outcomes.push(TaskOutcome::new(
                    &task,
                    skipped("branch cache corrupted; reload required"),
                ));
                continue;
            }

            touched.insert(task.repo.clone());
            let unit = Unit {
                handler,
                task: task.clone(),
                semaphore: semaphore.clone(),
                timeout: self.config.unit_timeout,
                cancel: self.shutdown.child_token(),
            };
            let abort = units.spawn(unit.run());
            in_flight.insert(abort.id(), task);
        }

        // Batch barrier.
        let mut closed = false;
        loop {
            let joined = tokio::select! {
                _ = self.shutdown.cancelled(), if !closed => {
                    info!("Shutdown during batch; units not yet started are skipped");
                    semaphore.close();
                    closed = true;
                    continue;
                }
                joined = units.join_next_with_id() => joined,
            };
            let Some(joined) = joined else {
                break;
            };
            match joined {
                Ok((id, outcome)) => {
                    in_flight.remove(&id);
                    report.outcomes.push(outcome);
                }
                Err(e) => {
                    error!(error = %e, "Protection unit did not complete");
                    if let Some(task) = in_flight.remove(&e.id()) {
                        report.outcomes.push(TaskOutcome::new(
                            &task,
                            TaskResult::Failed {
                                status: None,
                                message: format!("unit did not complete: {e}"),
                            },
                        ));
                    }
                }
            }
        }

        report.refresh_failures = refresh_all(registry, touched).await;

        let failed = report.failed().count();
        info!(
            outcomes = report.outcomes.len(),
            failed,
            refresh_failures = report.refresh_failures.len(),
            "Batch drained"
        );
        report
    }
}

fn skipped(reason: &str) -> TaskResult {
    TaskResult::Skipped {
        reason: reason.to_string(),
    }
}

/// One task running inside a batch.
struct Unit {
    handler: Arc<RepoHandler>,
    task: Task,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl Unit {
    async fn run(self) -> TaskOutcome {
        // The semaphore is closed on shutdown.
        let result = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) if !self.cancel.is_cancelled() => {
                let result = self.execute().await;
                drop(permit);
                result
            }
            Ok(_) | Err(_) => skipped("cancelled before start"),
        };
        TaskOutcome::new(&self.task, result)
    }

    async fn execute(&self) -> TaskResult {
        tokio::select! {
            _ = self.cancel.cancelled() => TaskResult::Failed {
                status: None,
                message: "cancelled by shutdown".to_string(),
            },
            result = tokio::time::timeout(self.timeout, self.handler.execute(&self.task)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(task = %self.task, timeout = ?self.timeout, "Protection unit timed out");
                        TaskResult::Failed {
                            status: None,
                            message: format!("timed out after {:?}", self.timeout),
                        }
                    }
                }
            }
        }
    }
}

/// Refreshes each touched repository once, concurrently across repositories,
/// through the handler currently registered for it.
async fn refresh_all(registry: &Registry, touched: BTreeSet<RepoId>) -> Vec<RefreshFailure> {
    let mut refreshes = JoinSet::new();
    for repo in touched {
        let Some(handler) = registry.lookup(&repo).await else {
            debug!(repo = %repo, "Repository left the registry during the batch; not refreshing");
            continue;
        };
        refreshes.spawn(async move {
            let result = handler.cache().refresh().await;
            (repo, result)
        });
    }

    let mut failures = Vec::new();
    while let Some(joined) = refreshes.join_next().await {
        match joined {
            Ok((_, Ok(_))) => {}
            Ok((repo, Err(e))) => {
                error!(repo = %repo, error = %e, "Post-batch refresh failed");
                failures.push(RefreshFailure {
                    repo: repo.full_name(),
                    message: e.to_string(),
                });
            }
            Err(e) => error!(error = %e, "Post-batch refresh did not complete"),
        }
    }
    failures.sort_by(|a, b| a.repo.cmp(&b.repo));
    failures
}

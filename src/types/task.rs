//! Protection tasks and their outcomes.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::RepoId;

/// What a task does to its branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    /// Protect a matching branch that the server does not protect yet.
    Protect,
    /// Re-apply protection to a matching branch whatever its current state.
    Repatch,
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskAction::Protect => f.write_str("protect"),
            TaskAction::Repatch => f.write_str("repatch"),
        }
    }
}

/// A single unit of protection work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Task {
    pub repo: RepoId,
    pub branch: String,
    pub action: TaskAction,
}

impl Task {
    pub fn new(repo: RepoId, branch: impl Into<String>, action: TaskAction) -> Self {
        Task {
            repo,
            branch: branch.into(),
            action,
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}@{}", self.action, self.repo, self.branch)
    }
}

/// How a protection write reaches the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteKind {
    /// No rule exists yet for the branch; create one.
    Create,
    /// A rule exists; update it in place.
    Update,
}

impl WriteKind {
    pub fn for_branch(already_protected: bool) -> Self {
        if already_protected {
            WriteKind::Update
        } else {
            WriteKind::Create
        }
    }
}

/// Result of executing one task within a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TaskResult {
    /// The server accepted the protection write.
    Protected { write: WriteKind },
    /// The server rejected the write, or the call never completed.
    Failed {
        status: Option<u16>,
        message: String,
    },
    /// The task was never started.
    Skipped { reason: String },
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskResult::Protected { .. })
    }
}

/// A task paired with what happened to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub repo: String,
    pub branch: String,
    pub action: TaskAction,
    #[serde(flatten)]
    pub result: TaskResult,
}

impl TaskOutcome {
    pub fn new(task: &Task, result: TaskResult) -> Self {
        TaskOutcome {
            repo: task.repo.full_name(),
            branch: task.branch.clone(),
            action: task.action,
            result,
        }
    }
}

/// Aggregate of a drained batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// One entry per task taken from the queue, in completion order.
    pub outcomes: Vec<TaskOutcome>,
    /// Repositories whose post-batch refresh failed, with the reason.
    pub refresh_failures: Vec<RefreshFailure>,
}

/// A repository that could not be refreshed after its batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshFailure {
    pub repo: String,
    pub message: String,
}

impl BatchReport {
    /// True when every task was protected and every refresh succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.refresh_failures.is_empty() && self.outcomes.iter().all(|o| o.result.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &TaskOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.result, TaskResult::Failed { .. }))
    }
}

//! Reconciliation: which branches need a protection write.
//!
//! Planning is pure. It compares a repository's [`Policy`] with its last
//! observed [`BranchSnapshot`] and returns the [`Task`]s that bring the server
//! in line. Execution belongs to the scheduler.

use crate::cache::BranchSnapshot;
use crate::policy::Policy;
use crate::types::{EventKind, Task, TaskAction};

/// How aggressively a full-repository sync re-applies protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Protect matching branches that are not protected yet.
    Normal,
    /// Re-apply protection to every matching branch, renewing its parameters.
    Force,
}

/// Plans protection for every known branch of the repository.
pub fn plan_repository(policy: &Policy, snapshot: &BranchSnapshot, mode: SyncMode) -> Vec<Task> {
    snapshot
        .branches
        .iter()
        .filter(|branch| policy.matches(branch))
        .filter_map(|branch| match mode {
            SyncMode::Normal if snapshot.is_protected(branch) => None,
            SyncMode::Normal => Some(Task::new(
                policy.repo().clone(),
                branch.as_str(),
                TaskAction::Protect,
            )),
            SyncMode::Force => Some(Task::new(
                policy.repo().clone(),
                branch.as_str(),
                TaskAction::Repatch,
            )),
        })
        .collect()
}

/// Plans protection for a single branch named by a webhook.
///
/// A deleted branch never yields a task, even when its name matches.
pub fn plan_branch(
    policy: &Policy,
    snapshot: &BranchSnapshot,
    branch: &str,
    event: &EventKind,
) -> Option<Task> {
    if event.is_delete() || !policy.matches(branch) || snapshot.is_protected(branch) {
        return None;
    }
    Some(Task::new(policy.repo().clone(), branch, TaskAction::Protect))
}

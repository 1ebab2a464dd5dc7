//! Core domain types shared across the service.

pub mod event;
pub mod ids;
pub mod task;

pub use event::EventKind;
pub use ids::{InvalidRepoId, RepoId};
pub use task::{
    BatchReport, RefreshFailure, Task, TaskAction, TaskOutcome, TaskResult, WriteKind,
};

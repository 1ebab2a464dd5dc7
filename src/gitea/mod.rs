//! Gitea API client.
//!
//! The reconciliation engine talks to the server through the [`RemoteApi`]
//! trait: two paginated reads (all branches, protected branches) and one
//! write (create or update a protection rule). [`GiteaClient`] implements it
//! over HTTP with reqwest.
//!
//! Key features:
//! - Pagination following the `Link: rel="next"` header
//! - Bounded retry with exponential backoff for page reads
//! - Writes are never retried; failures carry status and body to the caller

mod client;
mod error;
mod retry;

use async_trait::async_trait;

use crate::policy::Parameters;
use crate::types::{RepoId, WriteKind};

pub use client::{ClientConfig, ClientError, GiteaClient, has_next_link};
pub use error::{ApiError, ApiErrorKind, ProtectionFailure};
pub use retry::{RetryConfig, RetryResult, retry_with_backoff};

/// Which branch listing to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchListKind {
    /// Every branch of the repository.
    All,
    /// Branches that have a protection rule.
    Protected,
}

/// Names returned by a paginated listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchListing {
    pub names: Vec<String>,
    /// False when a page was abandoned after exhausting its retries.
    /// The names are then a prefix of the real listing.
    pub complete: bool,
}

impl BranchListing {
    pub fn complete(names: Vec<String>) -> Self {
        BranchListing {
            names,
            complete: true,
        }
    }
}

/// The server operations the reconciliation engine depends on.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Reads a branch listing, page by page.
    ///
    /// Read failures never escape: a page that keeps failing ends pagination
    /// and the listing is marked incomplete.
    async fn fetch_branches(&self, repo: &RepoId, kind: BranchListKind) -> BranchListing;

    /// Creates or updates the protection rule of `branch`.
    async fn apply_protection(
        &self,
        repo: &RepoId,
        branch: &str,
        parameters: &Parameters,
        write: WriteKind,
    ) -> Result<(), ProtectionFailure>;
}

//! Branch event extraction from Gitea webhook deliveries.
//!
//! Only three payload fields matter: `repository.full_name` identifies the
//! repository, `repository.name` must be present, and `ref` names the branch
//! (with any `refs/heads/` prefix removed). The event kind comes from the
//! `X-Gitea-Event` header.

use axum::http::HeaderMap;
use serde::Deserialize;
use thiserror::Error;

use crate::types::{EventKind, RepoId};

/// Header carrying the event kind.
pub const HEADER_EVENT: &str = "x-gitea-event";
/// Event header sent by GitHub-compatible forges.
pub const HEADER_EVENT_FALLBACK: &str = "x-github-event";

const BRANCH_REF_PREFIX: &str = "refs/heads/";

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid repository full name: {0:?}")]
    InvalidRepository(String),
}

/// A validated notification about one branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchEvent {
    pub repo: RepoId,
    pub branch: String,
    pub event: EventKind,
}

#[derive(Deserialize)]
struct RawDelivery {
    repository: Option<RawRepository>,
    #[serde(rename = "ref")]
    git_ref: Option<String>,
}

#[derive(Deserialize)]
struct RawRepository {
    full_name: Option<String>,
    name: Option<String>,
}

/// Validates a delivery and extracts the branch it is about.
pub fn parse_branch_event(headers: &HeaderMap, body: &[u8]) -> Result<BranchEvent, PayloadError> {
    let event = event_kind(headers)?;
    let raw: RawDelivery = serde_json::from_slice(body)?;

    let repository = raw
        .repository
        .ok_or(PayloadError::MissingField("repository"))?;
    let full_name = non_empty(repository.full_name)
        .ok_or(PayloadError::MissingField("repository.full_name"))?;
    non_empty(repository.name).ok_or(PayloadError::MissingField("repository.name"))?;
    let git_ref = non_empty(raw.git_ref).ok_or(PayloadError::MissingField("ref"))?;

    let repo: RepoId = full_name
        .parse()
        .map_err(|_| PayloadError::InvalidRepository(full_name.clone()))?;
    let branch = git_ref
        .strip_prefix(BRANCH_REF_PREFIX)
        .unwrap_or(&git_ref)
        .to_string();

    Ok(BranchEvent {
        repo,
        branch,
        event,
    })
}

fn event_kind(headers: &HeaderMap) -> Result<EventKind, PayloadError> {
    [HEADER_EVENT, HEADER_EVENT_FALLBACK]
        .iter()
        .find_map(|name| headers.get(*name).and_then(|v| v.to_str().ok()))
        .filter(|v| !v.trim().is_empty())
        .map(EventKind::parse)
        .ok_or(PayloadError::MissingHeader(HEADER_EVENT))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

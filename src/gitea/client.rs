//! reqwest-backed Gitea client.
//!
//! All calls authenticate with the `token` query parameter. The client is
//! not scoped to a repository: one instance is shared by every handler.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, HeaderMap, LINK};
use reqwest::{Client, Method, Url};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::error::{ApiError, ProtectionFailure};
use super::retry::{RetryConfig, RetryResult, retry_with_backoff};
use super::{BranchListKind, BranchListing, RemoteApi};
use crate::policy::Parameters;
use crate::types::{RepoId, WriteKind};

/// Items requested per page.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Pages fetched between rate-limit pauses.
const PAGES_PER_PAUSE: u32 = 100;

const RATE_LIMIT_PAUSE: Duration = Duration::from_millis(300);

/// Errors constructing a client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("API base URL {0} cannot carry a path")]
    InvalidBaseUrl(Url),

    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Connection settings for [`GiteaClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API root, e.g. `https://gitea.example.com/api/v1/`.
    pub api_base: Url,
    pub token: String,
    /// Upper bound on every individual HTTP call.
    pub request_timeout: Duration,
    /// Accept invalid TLS certificates (self-signed test servers).
    pub insecure: bool,
    pub retry: RetryConfig,
    pub page_size: u32,
}

impl ClientConfig {
    pub fn new(api_base: Url, token: impl Into<String>) -> Self {
        ClientConfig {
            api_base,
            token: token.into(),
            request_timeout: Duration::from_secs(30),
            insecure: false,
            retry: RetryConfig::DEFAULT,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// HTTP client for the Gitea branch and branch-protection endpoints.
#[derive(Clone)]
pub struct GiteaClient {
    http: Client,
    api_base: Url,
    token: String,
    retry: RetryConfig,
    page_size: u32,
}

// Keeps the token out of logs.
impl std::fmt::Debug for GiteaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GiteaClient")
            .field("api_base", &self.api_base.as_str())
            .field("retry", &self.retry)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

/// One decoded page of a listing.
#[derive(Debug)]
struct Page {
    names: Vec<String>,
    has_next: bool,
}

impl GiteaClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        if config.api_base.cannot_be_a_base() {
            return Err(ClientError::InvalidBaseUrl(config.api_base));
        }

        let http = Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.insecure)
            .build()?;

        Ok(GiteaClient {
            http,
            api_base: config.api_base,
            token: config.token,
            retry: config.retry,
            page_size: config.page_size.max(1),
        })
    }

    /// Builds `<api_base>/repos/<owner>/<repo>/<segments..>?token=...`.
    ///
    /// Each segment is percent-encoded on its own, so a branch such as
    /// `release/1.0` stays a single path segment.
    fn repo_url(&self, repo: &RepoId, segments: &[&str]) -> Url {
        let mut url = self.api_base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty()
                .push("repos")
                .push(&repo.owner)
                .push(&repo.repo)
                .extend(segments);
        }
        url.query_pairs_mut().append_pair("token", &self.token);
        url
    }

    fn list_url(&self, repo: &RepoId, kind: BranchListKind, page: u32) -> Url {
        let endpoint = match kind {
            BranchListKind::All => "branches",
            BranchListKind::Protected => "branch_protections",
        };
        let mut url = self.repo_url(repo, &[endpoint]);
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("limit", &self.page_size.to_string());
        url
    }

    async fn fetch_page(&self, url: Url, kind: BranchListKind) -> Result<Page, ApiError> {
        let response = self
            .http
            .get(url)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(ApiError::transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::status(status.as_u16(), body));
        }

        let has_next = has_next_link(response.headers());
        let items: Vec<serde_json::Value> = response.json().await.map_err(ApiError::decode)?;
        let names = items
            .iter()
            .filter_map(|item| branch_name_of(item, kind))
            .collect();

        Ok(Page { names, has_next })
    }
}

/// Extracts the branch name from one listing item.
fn branch_name_of(item: &serde_json::Value, kind: BranchListKind) -> Option<String> {
    let fields: &[&str] = match kind {
        BranchListKind::All => &["name"],
        BranchListKind::Protected => &["branch_name", "rule_name"],
    };
    fields
        .iter()
        .filter_map(|field| item.get(*field).and_then(|v| v.as_str()))
        .find(|name| !name.is_empty())
        .map(str::to_string)
}

/// Returns true if any `Link` header advertises a `rel="next"` page.
pub fn has_next_link(headers: &HeaderMap) -> bool {
    headers
        .get_all(LINK)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|link| {
            link.split(';').skip(1).any(|param| {
                let param = param.trim();
                param
                    .strip_prefix("rel=")
                    .map(|rel| rel.trim_matches('"').split_whitespace().any(|r| r == "next"))
                    .unwrap_or(false)
            })
        })
}

#[async_trait]
impl RemoteApi for GiteaClient {
    #[instrument(skip(self), fields(repo = %repo))]
    async fn fetch_branches(&self, repo: &RepoId, kind: BranchListKind) -> BranchListing {
        let mut names = Vec::new();
        let mut page = 1;

        loop {
            let url = self.list_url(repo, kind, page);
            let result = retry_with_backoff(self.retry, || self.fetch_page(url.clone(), kind)).await;

            let fetched = match result {
                RetryResult::Success(fetched) => fetched,
                RetryResult::ExhaustedRetries {
                    last_error,
                    attempts,
                } => {
                    warn!(
                        page,
                        attempts,
                        error = %last_error,
                        "Abandoning branch listing after repeated failures; listing is partial"
                    );
                    return BranchListing {
                        names,
                        complete: false,
                    };
                }
                RetryResult::PermanentError(error) => {
                    warn!(page, error = %error, "Unreadable branch listing page; listing is partial");
                    return BranchListing {
                        names,
                        complete: false,
                    };
                }
            };

            debug!(page, count = fetched.names.len(), "Fetched branch page");
            let exhausted = fetched.names.is_empty();
            names.extend(fetched.names);

            if !fetched.has_next || exhausted {
                break;
            }

            page += 1;
            if page % PAGES_PER_PAUSE == 0 {
                tokio::time::sleep(RATE_LIMIT_PAUSE).await;
            }
        }

        BranchListing::complete(names)
    }

    #[instrument(skip(self, parameters), fields(repo = %repo, branch = %branch, write = ?write))]
    async fn apply_protection(
        &self,
        repo: &RepoId,
        branch: &str,
        parameters: &Parameters,
        write: WriteKind,
    ) -> Result<(), ProtectionFailure> {
        let (method, url, body) = match write {
            WriteKind::Create => {
                let mut body = parameters.clone();
                body.insert("branch_name".into(), branch.into());
                body.insert("rule_name".into(), branch.into());
                (
                    Method::POST,
                    self.repo_url(repo, &["branch_protections"]),
                    body,
                )
            }
            // The rule name is the key of the update call and must not be sent.
            WriteKind::Update => {
                let mut body = parameters.clone();
                body.remove("branch_name");
                body.remove("rule_name");
                (
                    Method::PATCH,
                    self.repo_url(repo, &["branch_protections", branch]),
                    body,
                )
            }
        };

        let response = self
            .http
            .request(method, url)
            .header(ACCEPT, "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();
        if matches!(status, 200 | 201) {
            info!(status, "Branch protected");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        warn!(status, body = %body, "Protection write rejected");
        Err(ProtectionFailure::rejected(status, body))
    }
}

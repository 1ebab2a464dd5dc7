//! Webhook endpoints.
//!
//! `POST /webhook` validates a Gitea delivery, plans the single-branch task
//! and hands it to the ingest worker, returning 202 before any protection
//! call is made. `GET /webhook` drains the pending queue in the request and
//! returns the batch report.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::AppState;
use crate::cache::CacheError;
use crate::ingest::{self, Accepted, IngestError};
use crate::types::BatchReport;
use crate::webhooks::{PayloadError, parse_branch_event, verify_signature};

/// Header carrying the hex HMAC of the body.
const HEADER_SIGNATURE: &str = "x-gitea-signature";
/// Prefixed signature header sent by newer servers.
const HEADER_SIGNATURE_256: &str = "x-hub-signature-256";

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing signature header")]
    MissingSignature,

    #[error("invalid signature")]
    InvalidSignature,

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error(transparent)]
    Ingest(#[from] IngestError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::MissingSignature | WebhookError::InvalidSignature => {
                StatusCode::UNAUTHORIZED
            }
            WebhookError::Payload(_) => StatusCode::BAD_REQUEST,
            WebhookError::Ingest(IngestError::WorkerStopped) => StatusCode::SERVICE_UNAVAILABLE,
            WebhookError::Ingest(IngestError::BranchState(
                CacheError::Corrupted { .. } | CacheError::EmptyBranchList { .. },
            )) => StatusCode::CONFLICT,
            WebhookError::Ingest(IngestError::BranchState(CacheError::Snapshot { .. })) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };

        (status, self.to_string()).into_response()
    }
}

/// Accepts one Gitea delivery.
///
/// # Response
///
/// - 202 Accepted: task enqueued, or nothing to do
/// - 400 Bad Request: missing header or field, invalid JSON
/// - 401 Unauthorized: bad or missing signature when a secret is configured
/// - 409 Conflict: the repository's branch cache is corrupted; reload required
/// - 503 Service Unavailable: the ingest worker has stopped, or the branch
///   snapshot cannot be read
///
/// ```ignore
/// POST /branch_protection/webhook HTTP/1.1
/// X-Gitea-Event: push
/// Content-Type: application/json
///
/// {"ref": "refs/heads/release/1.0", "repository": {"full_name": "acme/widgets", "name": "widgets"}}
///
/// HTTP/1.1 202 Accepted
/// ```
pub async fn webhook_handler(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, &'static str), WebhookError> {
    if let Some(secret) = app_state.webhook_secret() {
        let signature = [HEADER_SIGNATURE, HEADER_SIGNATURE_256]
            .iter()
            .find_map(|name| headers.get(*name).and_then(|v| v.to_str().ok()))
            .ok_or(WebhookError::MissingSignature)?;
        if !verify_signature(&body, signature, secret) {
            warn!("Invalid webhook signature");
            return Err(WebhookError::InvalidSignature);
        }
    }

    let event = parse_branch_event(&headers, &body).inspect_err(|e| {
        warn!(error = %e, "Rejecting webhook delivery");
    })?;
    debug!(repo = %event.repo, branch = %event.branch, event = %event.event, "Received webhook");

    let accepted = ingest::accept(
        app_state.registry(),
        app_state.scheduler(),
        app_state.ingest(),
        &event,
    )
    .await?;

    let message = match accepted {
        Accepted::Enqueued { task, drain } => {
            info!(%task, ?drain, "Webhook accepted");
            "Accepted"
        }
        Accepted::UnknownRepository => "Accepted (unmanaged repository)",
        Accepted::NoTask => "Accepted (nothing to protect)",
    };
    Ok((StatusCode::ACCEPTED, message))
}

/// Drains the pending queue now and reports the batch.
pub async fn drain_handler(State(app_state): State<AppState>) -> Json<BatchReport> {
    Json(app_state.scheduler().drain(app_state.registry()).await)
}

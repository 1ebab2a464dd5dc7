//! Operator endpoints: inspection, bulk sync and reload.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{info, warn};

use super::AppState;
use crate::reconcile::SyncMode;
use crate::registry::{RegistryError, ReloadSummary};
use crate::types::{BatchReport, RefreshFailure};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("reload failed: {0}")]
    Reload(#[from] RegistryError),
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = match &self {
            ControlError::Reload(RegistryError::PolicyDir { .. }) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ControlError::Reload(RegistryError::OrganizationsFailed(_)) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
        };
        (status, self.to_string()).into_response()
    }
}

/// Protected branches of every managed repository, keyed by `owner/repo`.
pub async fn list_handler(State(app_state): State<AppState>) -> Json<BTreeMap<String, Vec<String>>> {
    let mut listing = BTreeMap::new();
    for handler in app_state.registry().handlers().await {
        let protected = handler
            .cache()
            .current()
            .await
            .map(|snapshot| snapshot.protected_branches.clone())
            .unwrap_or_default();
        listing.insert(handler.repo().full_name(), protected);
    }
    Json(listing)
}

/// Protects every matching branch that is not yet protected.
pub async fn push_list_handler(State(app_state): State<AppState>) -> Json<BatchReport> {
    Json(sync_all(&app_state, SyncMode::Normal).await)
}

/// Re-applies protection to every matching branch.
pub async fn force_push_list_handler(State(app_state): State<AppState>) -> Json<BatchReport> {
    Json(sync_all(&app_state, SyncMode::Force).await)
}

/// Rebuilds the registry from the policy directory and re-reads branch state.
pub async fn reload_handler(
    State(app_state): State<AppState>,
) -> Result<Json<ReloadSummary>, ControlError> {
    let summary = app_state.registry().reload().await?;
    Ok(Json(summary))
}

async fn sync_all(app_state: &AppState, mode: SyncMode) -> BatchReport {
    let mut unplanned = Vec::new();
    for handler in app_state.registry().handlers().await {
        match handler.plan(mode).await {
            Ok(tasks) => app_state.scheduler().enqueue(tasks).await,
            Err(e) => {
                warn!(repo = %handler.repo(), error = %e, "Cannot plan repository");
                unplanned.push(RefreshFailure {
                    repo: handler.repo().full_name(),
                    message: e.to_string(),
                });
            }
        }
    }

    let mut report = app_state.scheduler().drain(app_state.registry()).await;
    report.refresh_failures.extend(unplanned);
    info!(?mode, outcomes = report.outcomes.len(), "Bulk sync finished");
    report
}

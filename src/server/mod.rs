//! HTTP server for the branch protection service.
//!
//! # Endpoints
//!
//! All routes live under `/branch_protection`:
//!
//! - `GET /hello` - liveness
//! - `GET /list` - protected branches per repository, as JSON
//! - `GET /push_list` - protect every matching unprotected branch
//! - `GET /force_push_list` - re-apply protection to every matching branch
//! - `GET /reload` - rebuild the registry and re-read branch state
//! - `POST /webhook` - accept a Gitea delivery (returns 202 Accepted)
//! - `GET /webhook` - drain the pending queue now

use std::sync::Arc;

pub mod control;
pub mod health;
pub mod webhook;

pub use control::{force_push_list_handler, list_handler, push_list_handler, reload_handler};
pub use health::hello_handler;
pub use webhook::{drain_handler, webhook_handler};

use crate::ingest::IngestHandle;
use crate::registry::Registry;
use crate::scheduler::TaskScheduler;

/// Path prefix of every route.
pub const ROUTE_PREFIX: &str = "/branch_protection";

/// Shared application state, passed to handlers via axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    registry: Arc<Registry>,
    scheduler: Arc<TaskScheduler>,
    ingest: IngestHandle,

    /// Secret for HMAC-SHA256 delivery signatures. Unsigned deliveries are
    /// accepted when unset.
    webhook_secret: Option<Vec<u8>>,
}

impl AppState {
    pub fn new(
        registry: Arc<Registry>,
        scheduler: Arc<TaskScheduler>,
        ingest: IngestHandle,
        webhook_secret: Option<Vec<u8>>,
    ) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                registry,
                scheduler,
                ingest,
                webhook_secret,
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.inner.scheduler
    }

    pub fn ingest(&self) -> &IngestHandle {
        &self.inner.ingest
    }

    pub fn webhook_secret(&self) -> Option<&[u8]> {
        self.inner.webhook_secret.as_deref()
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::get;

    let routes = axum::Router::new()
        .route("/hello", get(hello_handler))
        .route("/list", get(list_handler))
        .route("/push_list", get(push_list_handler))
        .route("/force_push_list", get(force_push_list_handler))
        .route("/reload", get(reload_handler))
        .route("/webhook", get(drain_handler).post(webhook_handler));

    axum::Router::new()
        .nest(ROUTE_PREFIX, routes)
        .with_state(app_state)
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use crate::ingest::{self, IngestMessage};
    use crate::registry::ReloadSummary;
    use crate::scheduler::SchedulerConfig;
    use crate::test_utils::{FakeRemote, repo, write_policy_file};
    use crate::types::{BatchReport, TaskResult, WriteKind};
    use crate::webhooks::sign_payload;

    const POLICY: &str = r#"
[widgets]
branches = "['^release/.*']"
enable_push = "False"
required_approvals = "1"
"#;

    struct TestApp {
        _dirs: (TempDir, TempDir),
        policy_dir: std::path::PathBuf,
        remote: Arc<FakeRemote>,
        state: AppState,
        rx: mpsc::Receiver<IngestMessage>,
    }

    async fn test_app(secret: Option<&[u8]>) -> TestApp {
        let policies = tempfile::tempdir().unwrap();
        let state_dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(FakeRemote::new());
        remote.set_branches(&repo(), &["main", "release/1.0", "release/2.0"]);
        write_policy_file(policies.path(), "acme", POLICY);

        let registry = Arc::new(Registry::new(
            policies.path(),
            state_dir.path(),
            remote.clone(),
        ));
        registry.load().await.unwrap();
        let scheduler = Arc::new(TaskScheduler::new(
            SchedulerConfig::default(),
            CancellationToken::new(),
        ));
        let (handle, rx) = ingest::channel(8);
        let state = AppState::new(registry, scheduler, handle, secret.map(<[u8]>::to_vec));

        TestApp {
            policy_dir: policies.path().to_path_buf(),
            _dirs: (policies, state_dir),
            remote,
            state,
            rx,
        }
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder()
            .uri(format!("{ROUTE_PREFIX}{path}"))
            .body(Body::empty())
            .unwrap()
    }

    fn delivery(event: &str, body: &serde_json::Value, secret: Option<&[u8]>) -> Request<Body> {
        let bytes = serde_json::to_vec(body).unwrap();
        let mut builder = Request::builder()
            .method("POST")
            .uri(format!("{ROUTE_PREFIX}/webhook"))
            .header("content-type", "application/json")
            .header("x-gitea-event", event);
        if let Some(secret) = secret {
            builder = builder.header("x-gitea-signature", sign_payload(&bytes, secret).unwrap());
        }
        builder.body(Body::from(bytes)).unwrap()
    }

    fn push_body(branch: &str) -> serde_json::Value {
        serde_json::json!({
            "ref": format!("refs/heads/{branch}"),
            "repository": {"full_name": "acme/widgets", "name": "widgets"}
        })
    }

    async fn json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn hello_returns_greeting() {
        let app = test_app(None).await;

        let response = build_router(app.state).oneshot(get("/hello")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Hello World!");
    }

    #[tokio::test]
    async fn push_list_protects_and_list_reports() {
        let app = test_app(None).await;
        let router = build_router(app.state);

        let response = router.clone().oneshot(get("/push_list")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report: BatchReport = json(response).await;
        assert_eq!(report.outcomes.len(), 2);
        assert!(report.all_succeeded());

        let writes = app.remote.writes();
        assert_eq!(
            writes[0].parameters.get("enable_push"),
            Some(&serde_json::Value::Bool(false))
        );
        assert_eq!(
            writes[0].parameters.get("required_approvals"),
            Some(&serde_json::json!(1))
        );

        let listing: BTreeMap<String, Vec<String>> =
            json(router.oneshot(get("/list")).await.unwrap()).await;
        let mut protected = listing["acme/widgets"].clone();
        protected.sort();
        assert_eq!(protected, vec!["release/1.0", "release/2.0"]);
    }

    #[tokio::test]
    async fn force_push_list_updates_existing_rules() {
        let app = test_app(None).await;
        let router = build_router(app.state);
        router.clone().oneshot(get("/push_list")).await.unwrap();

        let report: BatchReport =
            json(router.oneshot(get("/force_push_list")).await.unwrap()).await;

        assert_eq!(report.outcomes.len(), 2);
        assert!(report.outcomes.iter().all(|o| o.result
            == TaskResult::Protected {
                write: WriteKind::Update
            }));
    }

    #[tokio::test]
    async fn delivery_missing_full_name_is_rejected_without_queueing() {
        let mut app = test_app(None).await;
        let body = serde_json::json!({
            "ref": "refs/heads/release/3.0",
            "repository": {"name": "widgets"}
        });
        let state = app.state.clone();

        let response = build_router(app.state)
            .oneshot(delivery("push", &body, None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.scheduler().pending_len().await, 0);
        assert!(app.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn matching_delivery_is_enqueued_and_drained_on_demand() {
        let mut app = test_app(None).await;
        app.remote
            .set_branches(&repo(), &["main", "release/1.0", "release/2.0", "release/3.0"]);
        let router = build_router(app.state.clone());

        let response = router
            .clone()
            .oneshot(delivery("create", &push_body("release/3.0"), None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(app.state.scheduler().pending_len().await, 1);
        assert_eq!(app.rx.try_recv().unwrap(), IngestMessage::Drain);
        // Nothing is written until a drain runs.
        assert!(app.remote.writes().is_empty());

        let report: BatchReport = json(router.oneshot(get("/webhook")).await.unwrap()).await;
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].branch, "release/3.0");
        assert!(report.all_succeeded());
    }

    #[tokio::test]
    async fn delete_delivery_is_acknowledged_without_task() {
        let app = test_app(None).await;
        let state = app.state.clone();

        let response = build_router(app.state)
            .oneshot(delivery("delete", &push_body("release/1.0"), None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(state.scheduler().pending_len().await, 0);
    }

    #[tokio::test]
    async fn signatures_are_checked_when_a_secret_is_set() {
        let app = test_app(Some(b"hook-secret")).await;
        let router = build_router(app.state);
        let body = push_body("release/1.0");

        let unsigned = router
            .clone()
            .oneshot(delivery("push", &body, None))
            .await
            .unwrap();
        let wrong = router
            .clone()
            .oneshot(delivery("push", &body, Some(b"other")))
            .await
            .unwrap();
        let signed = router
            .oneshot(delivery("push", &body, Some(b"hook-secret")))
            .await
            .unwrap();

        assert_eq!(unsigned.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(signed.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn stopped_worker_yields_503() {
        let app = test_app(None).await;
        drop(app.rx);

        let response = build_router(app.state)
            .oneshot(delivery("push", &push_body("release/1.0"), None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn corrupted_branch_state_yields_409() {
        let app = test_app(None).await;
        let handler = app.state.registry().lookup(&repo()).await.unwrap();
        app.remote.set_branches(&repo(), &[]);
        assert!(handler.cache().refresh().await.is_err());
        let state = app.state.clone();

        let response = build_router(app.state)
            .oneshot(delivery("push", &push_body("release/1.0"), None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("corrupted"));
        assert_eq!(state.scheduler().pending_len().await, 0);
    }

    #[tokio::test]
    async fn reload_rebuilds_from_policy_directory() {
        let app = test_app(None).await;
        write_policy_file(
            &app.policy_dir,
            "beta",
            "[tools]\nbranches = [\"^main$\"]\n",
        );
        app.remote.set_branches(&crate::types::RepoId::new("beta", "tools"), &["main"]);
        let router = build_router(app.state.clone());

        let summary: ReloadSummary = json(router.oneshot(get("/reload")).await.unwrap()).await;

        assert_eq!(summary.repositories, vec!["acme/widgets", "beta/tools"]);
        assert!(summary.failures.is_empty());
        assert_eq!(app.state.registry().len().await, 2);
    }
}

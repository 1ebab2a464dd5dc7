use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use branch_warden::config::Config;
use branch_warden::gitea::{ClientError, GiteaClient};
use branch_warden::ingest::IngestWorker;
use branch_warden::registry::{Registry, RegistryError};
use branch_warden::scheduler::TaskScheduler;
use branch_warden::server::{AppState, build_router};

#[derive(Debug, Error)]
enum StartupError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "branch_warden=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse();
    info!(?config, "Starting branch warden");

    let client = GiteaClient::new(config.client_config())?;
    let registry = Arc::new(Registry::new(
        &config.policy_dir,
        &config.state_dir,
        Arc::new(client),
    ));
    match registry.load().await {
        Ok(summary) => {
            for failure in &summary.failures {
                error!(scope = %failure.scope, error = %failure.message, "Repository failed to load");
            }
        }
        Err(e) => {
            if let RegistryError::OrganizationsFailed(failures) = &e {
                for failure in failures {
                    error!(organization = %failure.scope, error = %failure.message, "Policy failed to load");
                }
            }
            return Err(e.into());
        }
    }

    let shutdown = CancellationToken::new();
    let scheduler = Arc::new(TaskScheduler::new(
        config.scheduler_config(),
        shutdown.child_token(),
    ));
    let (ingest, worker) = IngestWorker::new(registry.clone(), scheduler.clone())
        .spawn(config.ingest_queue_capacity, shutdown.child_token());

    let stopping = scheduler.clone();
    let app = build_router(AppState::new(
        registry,
        scheduler,
        ingest,
        config.webhook_secret_bytes(),
    ));

    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    info!(addr = %config.listen, "Listening");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Cannot listen for shutdown signal");
            }
            info!("Shutdown requested");
            stopping.shutdown();
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Err(e) = worker.await {
        error!(error = %e, "Ingest worker did not stop cleanly");
    }
    info!("Stopped");
    Ok(())
}

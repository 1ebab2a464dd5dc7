//! Command-line and environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use reqwest::Url;

use crate::gitea::{ClientConfig, RetryConfig};
use crate::ingest::DEFAULT_QUEUE_CAPACITY;
use crate::scheduler::{DEFAULT_MAX_CONCURRENCY, SchedulerConfig};

/// Keeps Gitea branch protection in line with per-organization policy files.
#[derive(Parser, Clone)]
#[command(name = "branch-warden")]
#[command(author, version, about)]
pub struct Config {
    /// Address the HTTP server listens on
    #[arg(long, env = "BRANCH_WARDEN_LISTEN", default_value = "0.0.0.0:6000")]
    pub listen: SocketAddr,

    /// Directory holding one `<organization>.toml` policy file per organization
    #[arg(long, env = "BRANCH_WARDEN_POLICY_DIR", default_value = ".")]
    pub policy_dir: PathBuf,

    /// Directory for persisted branch snapshots
    #[arg(long, env = "BRANCH_WARDEN_STATE_DIR", default_value = "./state")]
    pub state_dir: PathBuf,

    /// Root of the Gitea API
    #[arg(long, env = "GITEA_API_URL", default_value = "https://try.gitea.io/api/v1/")]
    pub api_url: Url,

    /// Access token sent with every API call
    #[arg(long, env = "GITEA_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Secret for webhook signatures; unsigned deliveries are accepted when unset
    #[arg(long, env = "BRANCH_WARDEN_WEBHOOK_SECRET", hide_env_values = true)]
    pub webhook_secret: Option<String>,

    /// Accept invalid TLS certificates from the API server
    #[arg(long, env = "BRANCH_WARDEN_INSECURE")]
    pub insecure: bool,

    /// Protection writes in flight at once
    #[arg(long, env = "BRANCH_WARDEN_MAX_CONCURRENCY", default_value_t = DEFAULT_MAX_CONCURRENCY)]
    pub max_concurrency: usize,

    /// Timeout for each API call, in seconds
    #[arg(long, env = "BRANCH_WARDEN_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Attempts per listing page before pagination stops
    #[arg(long, env = "BRANCH_WARDEN_FETCH_ATTEMPTS", default_value_t = 3)]
    pub fetch_attempts: u32,

    /// Delay before the first page retry, in milliseconds; doubles per retry
    #[arg(long, env = "BRANCH_WARDEN_FETCH_RETRY_DELAY_MS", default_value_t = 100)]
    pub fetch_retry_delay_ms: u64,

    /// Capacity of the webhook ingest queue
    #[arg(long, env = "BRANCH_WARDEN_INGEST_QUEUE_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub ingest_queue_capacity: usize,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("listen", &self.listen)
            .field("policy_dir", &self.policy_dir)
            .field("state_dir", &self.state_dir)
            .field("api_url", &self.api_url.as_str())
            .field("webhook_secret", &self.webhook_secret.as_ref().map(|_| "<set>"))
            .field("insecure", &self.insecure)
            .field("max_concurrency", &self.max_concurrency)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("fetch_attempts", &self.fetch_attempts)
            .field("fetch_retry_delay_ms", &self.fetch_retry_delay_ms)
            .field("ingest_queue_capacity", &self.ingest_queue_capacity)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(self.api_url.clone(), self.token.clone());
        config.request_timeout = self.request_timeout();
        config.insecure = self.insecure;
        config.retry = RetryConfig::with_attempts(
            self.fetch_attempts.max(1),
            Duration::from_millis(self.fetch_retry_delay_ms),
        );
        config
    }

    /// A unit may spend one request timeout on its write plus one on a cold
    /// cache load.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_max_concurrency(self.max_concurrency)
            .with_unit_timeout(self.request_timeout() * 2)
    }

    pub fn webhook_secret_bytes(&self) -> Option<Vec<u8>> {
        self.webhook_secret
            .as_ref()
            .filter(|s| !s.is_empty())
            .map(|s| s.as_bytes().to_vec())
    }
}

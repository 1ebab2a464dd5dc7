//! Exponential backoff retry for paginated Gitea reads.
//!
//! - Default: 3 attempts with 100ms, 200ms delays between them
//! - Attempts and initial delay are configurable from the command line
//!
//! Only transient errors are retried. Permanent errors return immediately.

use std::future::Future;
use std::time::Duration;

use super::error::ApiError;

/// Configuration for exponential backoff retry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,

    /// Initial delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (cap for exponential growth).
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (typically 2.0).
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Default retry configuration for page fetches.
    pub const DEFAULT: Self = Self {
        max_retries: 2,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        backoff_multiplier: 2.0,
    };

    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// Builds a configuration from a total attempt count (at least one).
    pub fn with_attempts(attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries: attempts.saturating_sub(1),
            initial_delay,
            ..Self::DEFAULT
        }
    }

    /// Total attempts including the first.
    pub fn attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Computes the delay for the given retry attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.powi(attempt as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped_secs)
    }

    /// Returns an iterator over all retry delays.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(|attempt| self.delay_for_attempt(attempt))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Result of a retried operation.
#[derive(Debug)]
pub enum RetryResult<T> {
    Success(T),

    /// A transient error occurred after exhausting all retries.
    ExhaustedRetries {
        last_error: ApiError,
        /// Number of attempts made (including the initial attempt).
        attempts: u32,
    },

    /// A permanent error occurred (not retriable).
    PermanentError(ApiError),
}

/// Executes an async operation, retrying transient errors with backoff.
pub async fn retry_with_backoff<T, F, Fut>(config: RetryConfig, mut operation: F) -> RetryResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 0;
    let max_attempts = config.attempts();

    loop {
        match operation().await {
            Ok(value) => return RetryResult::Success(value),
            Err(e) => {
                attempt += 1;

                if !e.kind.is_retriable() {
                    return RetryResult::PermanentError(e);
                }
                if attempt >= max_attempts {
                    return RetryResult::ExhaustedRetries {
                        last_error: e,
                        attempts: attempt,
                    };
                }

                tokio::time::sleep(config.delay_for_attempt(attempt - 1)).await;
            }
        }
    }
}

//! Bounded retry with exponential backoff for cancellable async operations.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u128.checked_pow(attempt).unwrap_or(u128::MAX);
        let backoff_ms = self.initial_delay.as_millis().saturating_mul(factor);
        Duration::from_millis(backoff_ms.min(self.max_delay.as_millis()) as u64)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("cancelled")]
    Cancelled,

    /// The last error, after every attempt failed.
    #[error("{last_error}")]
    Exhausted {
        attempts: u32,
        last_error: eyre::Report,
    },
}

/// Run `operation` until it succeeds, attempts run out, or `cancel` fires.
///
/// The token is checked before every attempt and raced against every sleep,
/// so a cancellation during backoff returns without another attempt.
pub async fn retry<T, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    what: &str,
    mut operation: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = eyre::Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        attempt += 1;
        if attempt >= max_attempts {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last_error: error,
            });
        }

        let delay = config.backoff_for_attempt(attempt - 1);
        warn!(
            operation = what,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Operation failed, retrying"
        );

        if !sleep_or_cancel(delay, cancel).await {
            return Err(RetryError::Cancelled);
        }
    }
}

/// Sleep for `duration`. Returns false if `cancel` fired first.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

//! Caller-composed retries for transient failures.
//!
//! The gateway never retries on its own. Callers that want to ride out a
//! device reboot or a flaky link wrap an operation in `retry_transient`.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::ApiError;

/// Maximum number of retries after the first attempt.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds.
/// 1 second gives a rebooting device room without making users wait too long.
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// retry budget runs out. Backoff doubles after each attempt.
pub async fn retry_transient<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut retries = 0;
    let mut backoff = policy.initial_backoff;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && retries < policy.max_retries => {
                retries += 1;
                warn!(
                    error = %e,
                    retry = retries,
                    backoff_ms = backoff.as_millis() as u64,
                    "Transient failure, backing off"
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2; // Exponential backoff
            }
            Err(e) => return Err(e),
        }
    }
}

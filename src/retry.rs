//! Bounded retry over the error taxonomy.
//!
//! Whether an attempt is worth repeating is not the caller's call: the
//! [`SyncError`] classification decides. Transient faults (5xx, rate
//! limits, truncated transfers) are retried with exponential backoff and
//! jitter; auth expiry, 404s, and fatal errors propagate immediately so
//! the sync loop can drive its own state machine.

use std::future::Future;
use std::time::Duration;

use rand::Rng as _;
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;

/// Backoff bounds for transient failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_secs: 5,
            max_delay_secs: 60,
        }
    }
}

impl RetryConfig {
    /// Delay before the given retry (0-indexed), shaped by the error that
    /// caused it.
    ///
    /// Ordinary transient faults wait `base_delay` doubled per retry and
    /// capped at `max_delay`. A rate-limit response jumps straight to the
    /// cap — the service is telling us to go away, so creeping up to the
    /// ceiling would just burn attempts. Either way a random slice of
    /// `base_delay` is added so parallel configurations don't retry in
    /// lockstep.
    pub fn delay_for(&self, retry: u32, error: &SyncError) -> Duration {
        let doubled = self
            .base_delay_secs
            .saturating_mul(1u64.checked_shl(retry).unwrap_or(u64::MAX));
        let shaped = if matches!(error, SyncError::RateLimited) {
            self.max_delay_secs
        } else {
            doubled.min(self.max_delay_secs)
        };
        let jitter = if self.base_delay_secs > 0 {
            rand::thread_rng().gen_range(0..self.base_delay_secs)
        } else {
            0
        };
        Duration::from_secs(shaped + jitter)
    }
}

/// Run an operation, retrying while its failures classify as retryable.
///
/// The backoff sleep races against the cancellation token; a cancel during
/// the wait surfaces as [`SyncError::Cancelled`] so the caller can flush
/// partial state.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    operation: F,
) -> Result<T, SyncError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let total_attempts = config.max_retries + 1; // 1 initial + max_retries retries
    let mut last_err: Option<SyncError> = None;

    for attempt in 0..total_attempts {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !e.is_retryable() {
                    return Err(e);
                }
                let is_last = attempt + 1 >= total_attempts;
                if is_last {
                    last_err = Some(e);
                    break;
                }
                let delay = config.delay_for(attempt, &e);
                tracing::warn!(
                    "Retryable error (attempt {}/{}), retrying in {}s: {}",
                    attempt + 1,
                    total_attempts,
                    delay.as_secs(),
                    e
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                }
            }
        }
    }

    Err(last_err.expect("loop must have run at least once"))
}

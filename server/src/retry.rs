//! Retry wrapper for calls that cross the process boundary.
//!
//! Transient failures back off exponentially with jitter up to a capped
//! number of attempts; a server-provided `Retry-After` hint overrides the
//! computed delay. Cancellation is checked on entry and during every sleep.

use crate::errors::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Backoff shape shared by the search-engine, store, and LLM adapters.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max_delay: Duration,
    pub attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            initial: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the given retry (1-based), doubled per attempt with up
    /// to 50% added jitter, capped at `max_delay`.
    fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial.saturating_mul(1u32 << attempt.min(16).saturating_sub(1));
        let base = base.min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
        (base + Duration::from_millis(jitter)).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails non-transiently, runs out of attempts,
/// or `cancel` fires.
pub async fn with_backoff<T, F, Fut>(
    cancel: &CancellationToken,
    what: &'static str,
    policy: &BackoffPolicy,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.attempts => {
                let delay = err.retry_after().unwrap_or_else(|| policy.delay(attempt));
                warn!(operation = what, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                }
                attempt += 1;
            }
            Err(err) => return Err(err.context("attempts", attempt)),
        }
    }
}

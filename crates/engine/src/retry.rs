//! Bounded retry with exponential backoff for transient backend faults.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use procstore_core::{KvBackend, StoreError};

/// Retry behavior for facade operations.
///
/// Only [`StoreError::Connection`] is retried; every other category is
/// deterministic and surfaces immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each retry.
    pub backoff: f64,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            backoff: 2.0,
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Applies a [`RetryPolicy`] and keeps running counts for diagnostics.
#[derive(Debug)]
pub struct Retrier {
    policy: RetryPolicy,
    attempts: AtomicU64,
    retries: AtomicU64,
}

impl Retrier {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    /// Attempts made so far, successful ones included.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Attempts that were retries of a failed one.
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Run `op`, retrying connection failures up to the policy's budget.
    /// `probe` is pinged between attempts so reconnecting backends get a
    /// cheap wake-up before the real operation runs again.
    pub async fn run<T, Fut>(
        &self,
        probe: &dyn KvBackend,
        what: &'static str,
        mut op: impl FnMut() -> Fut,
    ) -> Result<T, StoreError>
    where
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut delay = self.policy.initial_delay;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.attempts.fetch_add(1, Ordering::Relaxed);
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(op = what, attempt, error = %e, "retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.mul_f64(self.policy.backoff).min(self.policy.max_delay);
                    if let Err(probe_err) = probe.ping().await {
                        tracing::debug!(op = what, error = %probe_err, "backend still down");
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

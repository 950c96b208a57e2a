//! Bounded retry with exponential backoff and jitter.
//!
//! Wraps Admin API calls. Terminal failures (permission denied, instance
//! absent, bad tokens) pass through on the first attempt; only transient
//! failures are retried, with a capped doubling delay and ±20% jitter so
//! synchronized callers fan out.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use cloudsql_core::ConnectorResult;

/// Retry policy for control-plane calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Multiplier applied per retry.
    pub factor: u32,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Fractional jitter applied to each delay (0.2 = ±20%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            factor: 2,
            max_delay: Duration::from_secs(5),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails terminally, or attempts are
    /// exhausted.
    pub async fn call<T, F, Fut>(&self, mut op: F) -> ConnectorResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ConnectorResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    debug!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// The jittered delay before retry number `attempt` (1-based).
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let factor = u64::from(self.factor).saturating_pow(exp);
        let raw = self
            .base_delay
            .saturating_mul(factor.min(u64::from(u32::MAX)) as u32)
            .min(self.max_delay);
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        raw.mul_f64((1.0 + spread).max(0.0))
    }
}

//! Exponential backoff with classified retryability.
//!
//! Three profiles are used across the runtime: store writes
//! ([`RetryPolicy::store_write`]), transport subscribers
//! ([`RetryPolicy::subscriber`], full jitter), and the aggregate engine's
//! version-conflict loop (which reuses the store-write attempt cap).

use std::future::Future;
use std::time::Duration;

use rand::Rng;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub starting_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Full jitter: sleep a uniform duration in `[0, backoff]`.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Store write profile: 100 ms base, 1.6 s cap, 20 attempts.
    pub fn store_write() -> Self {
        Self {
            starting_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1600),
            multiplier: 2,
            attempts: 20,
            jitter: false,
        }
    }

    /// Subscriber profile: 100 ms base, 6.4 s cap, 24 attempts, full jitter.
    pub fn subscriber() -> Self {
        Self {
            starting_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(6400),
            multiplier: 2,
            attempts: 24,
            jitter: true,
        }
    }

    /// Backoff before retry number `attempt` (0-based), jitter applied.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt.min(31));
        let backoff = self
            .starting_delay
            .saturating_mul(factor)
            .min(self.max_delay);

        if self.jitter && !backoff.is_zero() {
            let nanos = rand::thread_rng().gen_range(0..=backoff.as_nanos());
            Duration::from_nanos(nanos as u64)
        } else {
            backoff
        }
    }
}

/// Drive `op` until it succeeds, a non-retriable error occurs, or the
/// attempt budget runs out. The last error is surfaced unchanged.
pub async fn retry<T, E, F, Fut>(
    policy: RetryPolicy,
    is_retriable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < policy.attempts && is_retriable(&err) => {
                let delay = policy.delay_for(attempt);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after failure");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

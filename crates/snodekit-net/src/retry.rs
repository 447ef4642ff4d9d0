//! Bounded retries with exponential backoff.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// How many times to retry and how long to wait in between.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    pub factor: u32,
    pub min_timeout: Duration,
    pub max_timeout: Duration,
}

impl RetryPolicy {
    pub const fn new(retries: u32, factor: u32, min_timeout: Duration, max_timeout: Duration) -> Self {
        Self {
            retries,
            factor,
            min_timeout,
            max_timeout,
        }
    }

    /// No waiting between attempts.
    pub const fn immediate(retries: u32) -> Self {
        Self::new(retries, 1, Duration::ZERO, Duration::ZERO)
    }

    pub fn attempts(&self) -> u32 {
        self.retries + 1
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = self.factor.max(1).saturating_pow(exponent);
        self.min_timeout
            .saturating_mul(multiplier)
            .min(self.max_timeout.max(self.min_timeout))
    }
}

/// Outcome of one failed attempt.
#[derive(Debug)]
pub enum Attempt<E> {
    /// Worth trying again.
    Retry(E),
    /// Stop now, retrying cannot help.
    Abort(E),
}

impl<E> Attempt<E> {
    pub fn into_inner(self) -> E {
        match self {
            Attempt::Retry(e) | Attempt::Abort(e) => e,
        }
    }
}

/// Run `op` until it succeeds, aborts, or the policy is exhausted. The
/// closure receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Attempt<E>>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(Attempt::Abort(e)) => return Err(e),
            Err(Attempt::Retry(e)) => {
                let retries_left = policy.attempts().saturating_sub(attempt);
                warn!(label, attempt, retries_left, error = %e, "attempt failed");
                if retries_left == 0 {
                    return Err(e);
                }
                tokio::time::sleep(policy.delay_for(attempt)).await;
                attempt += 1;
            }
        }
    }
}

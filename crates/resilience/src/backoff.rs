//! Exponential-backoff retry helper
//!
//! `delay(n) = min(remaining budget, initial * 2^n)`. The helper never sleeps
//! past the total budget; the final attempt may run with almost nothing left.
//! Every error is retried at this layer, whatever its kind.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

const MIN_INITIAL_DELAY: Duration = Duration::from_millis(1);

/// Retry policy: doubling delays starting at `initial`, bounded by a total
/// time budget of `max_duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max_duration: Duration,
}

impl Backoff {
    /// A zero `initial` delay is raised to 1ms.
    pub fn new(initial: Duration, max_duration: Duration) -> Self {
        Self {
            initial: initial.max(MIN_INITIAL_DELAY),
            max_duration,
        }
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    /// Delay before attempt `attempt + 1`, given the budget still left.
    pub fn delay(&self, attempt: u32, remaining: Duration) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(remaining)
    }

    /// Run `op` until it succeeds or the budget is spent.
    ///
    /// Returns the success value, or the error of the last attempt. Only the
    /// calling task sleeps between attempts.
    pub async fn retry<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.retry_if(op, |_| true).await
    }

    /// Like `retry`, but gives up at once on an error `retryable` rejects.
    pub async fn retry_if<T, E, F, Fut, P>(&self, mut op: F, retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        P: Fn(&E) -> bool,
    {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !retryable(&err) {
                warn!(attempts = attempt + 1, error = %err, "non-retryable failure, giving up");
                return Err(err);
            }

            let elapsed = started.elapsed();
            if elapsed >= self.max_duration {
                warn!(
                    attempts = attempt + 1,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %err,
                    "retry budget exhausted"
                );
                return Err(err);
            }

            let delay = self.delay(attempt, self.max_duration - elapsed);
            warn!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "attempt failed, backing off"
            );
            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }
}

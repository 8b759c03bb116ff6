// Retry with jittered exponential backoff

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::gateway::ToolError;

/// Bounded exponential backoff: `base * 2^(attempt-1)`, capped at `max_delay`,
/// with optional full jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ceiling = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);

        if self.jitter && !ceiling.is_zero() {
            let millis = ceiling.as_millis() as u64;
            Duration::from_millis(rand::thread_rng().gen_range(millis / 2..=millis))
        } else {
            ceiling
        }
    }

    /// Backoff that honours a provider hint, still capped by `max_delay`.
    pub fn delay_for(&self, attempt: u32, err: &ToolError) -> Duration {
        let delay = self.backoff(attempt);
        match err.retry_after {
            Some(hint) => delay.max(hint).min(self.max_delay),
            None => delay,
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the attempt budget runs out. `operation` receives the 1-based attempt
/// number. Sleeping between attempts is interrupted by `cancel`.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, ToolError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ToolError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(ToolError::cancelled());
        }

        match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(error) => {
                if !error.is_retryable() || attempt >= max_attempts {
                    return Err(error);
                }

                let delay = policy.delay_for(attempt, &error);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "Retrying after backoff");

                tokio::select! {
                    _ = cancel.cancelled() => return Err(ToolError::cancelled()),
                    _ = sleep(delay) => {}
                }
            }
        }
    }
}

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use herald_api::BusError;

/// Decides whether a failure is worth another attempt.
pub type TransientPredicate = Arc<dyn Fn(&BusError) -> bool + Send + Sync>;

/// Bounds for exponential backoff: at most `max_depth + 1` attempts,
/// retry `n` waits `2^n * min_interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub min_interval: Duration,
    pub max_depth: u32,
}

impl RetryPolicy {
    pub const fn new(min_interval: Duration, max_depth: u32) -> Self {
        Self {
            min_interval,
            max_depth,
        }
    }

    /// Single attempt, no retries.
    pub const fn none() -> Self {
        Self::new(Duration::ZERO, 0)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_depth.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-based). No jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        self.min_interval.saturating_mul(2u32.saturating_pow(retry))
    }
}

/// Exponential-backoff executor for transient failures.
///
/// The error that ends the loop is returned as-is: a caller cannot tell
/// "never retried" from "retries exhausted" without counting attempts itself.
#[derive(Clone)]
pub struct RetryStrategy {
    policy: RetryPolicy,
    is_transient: TransientPredicate,
}

impl std::fmt::Debug for RetryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryStrategy")
            .field("policy", &self.policy)
            .finish()
    }
}

impl RetryStrategy {
    /// Strategy using the reference classification, [`BusError::is_transient`].
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_predicate(policy, BusError::is_transient)
    }

    pub fn with_predicate(
        policy: RetryPolicy,
        is_transient: impl Fn(&BusError) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            policy,
            is_transient: Arc::new(is_transient),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails non-transiently, or
    /// `max_depth` retries are used up.
    ///
    /// `token` is checked before every attempt and interrupts backoff sleeps.
    pub async fn acquire<T, F, Fut>(
        &self,
        mut operation: F,
        token: &CancellationToken,
    ) -> Result<T, BusError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BusError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            if token.is_cancelled() {
                return Err(BusError::Cancelled);
            }

            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            attempt += 1;
            if !(self.is_transient)(&error) {
                return Err(error);
            }
            if attempt > self.policy.max_depth {
                tracing::debug!(attempts = attempt, error = %error, "retries exhausted");
                return Err(error);
            }

            let delay = self.policy.backoff(attempt);
            tracing::warn!(
                attempt,
                max_depth = self.policy.max_depth,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient failure, retrying"
            );

            tokio::select! {
                _ = token.cancelled() => return Err(BusError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

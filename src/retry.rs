//! Bounded retry with exponential backoff and a per-call timeout.
//!
//! Used at every external call site (mail provider, AI capabilities). A call
//! is retried only while its error reports `is_transient()`; after the last
//! attempt the error is handed back for the caller to downgrade into a
//! per-item failure.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::CapabilityError;
use crate::rate_limit::RateBudget;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. `0` is treated as `1`.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Policy with no retries at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based), with up to 25% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.max_delay);
        let jitter_ms = (capped.as_millis() as u64) / 4;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        capped.saturating_add(Duration::from_millis(jitter)).min(self.max_delay)
    }
}

/// Errors that know whether they are worth retrying.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for crate::error::SourceError {
    fn is_transient(&self) -> bool {
        crate::error::SourceError::is_transient(self)
    }
}

impl Transient for crate::error::CapabilityError {
    fn is_transient(&self) -> bool {
        crate::error::CapabilityError::is_transient(self)
    }
}

/// Run `op` under `timeout`, retrying transient failures per `policy`.
///
/// `on_timeout` builds the error value used when a single attempt exceeds
/// the timeout; timeouts are always treated as transient.
pub async fn with_retry<T, E, F, Fut>(
    label: &str,
    policy: RetryPolicy,
    timeout: Duration,
    on_timeout: impl Fn(Duration) -> E,
    mut op: F,
) -> Result<T, E>
where
    E: Transient + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = match tokio::time::timeout(timeout, op()).await {
            Ok(r) => r,
            Err(_) => Err(on_timeout(timeout)),
        };

        match result {
            Ok(v) => return Ok(v),
            Err(e) if attempt < attempts && e.is_transient() => {
                let delay = policy.delay_for(attempt);
                debug!(
                    call = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Budget, timeout and retry applied to every AI capability call.
#[derive(Debug, Clone)]
pub struct CallPolicy {
    pub budget: RateBudget,
    pub retry: RetryPolicy,
    pub timeout: Duration,
}

impl CallPolicy {
    pub fn new(budget: RateBudget, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            budget,
            retry,
            timeout,
        }
    }

    /// Run one capability call. Each attempt first waits for a budget permit.
    pub async fn run<T, F, Fut>(&self, capability: &'static str, mut op: F) -> Result<T, CapabilityError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CapabilityError>>,
    {
        let budget = &self.budget;
        with_retry(
            capability,
            self.retry,
            self.timeout,
            |timeout| CapabilityError::Timeout {
                capability,
                timeout,
            },
            move || {
                let call = op();
                async move {
                    budget.acquire().await;
                    call.await
                }
            },
        )
        .await
    }
}

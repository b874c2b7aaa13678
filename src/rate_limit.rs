//! Process-wide request budgets.
//!
//! One budget guards the mail provider, another the AI capabilities. Callers
//! wait for a permit; an exhausted budget delays work, it never fails it.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{Quota, RateLimiter};

type DirectRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Shared token-bucket budget. Cheap to clone.
#[derive(Clone)]
pub struct RateBudget {
    name: &'static str,
    limiter: Arc<DirectRateLimiter>,
}

impl RateBudget {
    /// Budget allowing `per_second` requests per second (minimum 1).
    pub fn per_second(name: &'static str, per_second: u32) -> Self {
        let rate = NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            name,
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(rate))),
        }
    }

    /// Wait until a request may proceed.
    pub async fn acquire(&self) {
        if self.limiter.check().is_err() {
            tracing::trace!(budget = self.name, "Rate budget exhausted, waiting");
            self.limiter.until_ready().await;
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl std::fmt::Debug for RateBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateBudget").field("name", &self.name).finish()
    }
}

//! Request budgeting for platform calls.
//!
//! - [`SlidingWindow`]: per-tenant budget of N requests per rolling window
//! - [`LeakyBucket`]: global budget shared by every tenant
//! - [`BackoffPolicy`]: exponential backoff with jitter for transient failures
//! - [`CircuitBreaker`]: per-tenant fail-fast after repeated failures
//! - [`ThrottleGuard`]: composes the above and absorbs platform flood-wait signals
//!
//! All clocks are `tokio::time::Instant`, so limiter behaviour can be driven
//! with a paused runtime in tests.

#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod backoff;
pub mod circuit;
pub mod guard;
pub mod leaky_bucket;
pub mod sliding_window;

pub use backoff::{BackoffPolicy, RetryDecision, decision_for};
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, CircuitStateKind};
pub use guard::{LaneSnapshot, ThrottleConfig, ThrottleError, ThrottleGuard, ThrottleObserver};
pub use leaky_bucket::LeakyBucket;
pub use sliding_window::SlidingWindow;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    #[error("rate limit wait {wait_time:?} exceeds maximum {max_wait:?}")]
    WaitExceeded {
        wait_time: Duration,
        max_wait: Duration,
    },
}

/// Point-in-time view of a limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    pub limit: u32,
    pub remaining: u32,
    /// Time until at least one slot frees up.
    pub reset_after: Duration,
    pub is_limited: bool,
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Take one slot if available.
    async fn try_acquire(&self) -> bool;

    /// Take `permits` slots atomically if available.
    async fn try_acquire_n(&self, permits: u32) -> bool;

    /// Wait for a slot, giving up once the wait would exceed `max_wait`.
    ///
    /// Returns how long the caller waited.
    async fn acquire(&self, max_wait: Duration) -> Result<Duration, RateLimitError> {
        let start = tokio::time::Instant::now();

        loop {
            if self.try_acquire().await {
                return Ok(start.elapsed());
            }

            let wait_time = self.wait_time().await;
            let total_waited = start.elapsed();

            if total_waited + wait_time > max_wait {
                return Err(RateLimitError::WaitExceeded {
                    wait_time: total_waited + wait_time,
                    max_wait,
                });
            }

            tokio::time::sleep(wait_time.max(MIN_POLL)).await;
        }
    }

    /// Wait as long as needed for a slot.
    async fn wait_for_slot(&self) {
        while !self.try_acquire().await {
            let wait = self.wait_time().await;
            tokio::time::sleep(wait.max(MIN_POLL)).await;
        }
    }

    fn remaining(&self) -> u32;

    async fn wait_time(&self) -> Duration;

    async fn reset(&self);

    fn state(&self) -> RateLimitState;
}

/// Floor on limiter re-poll sleeps so a zero estimate cannot spin.
const MIN_POLL: Duration = Duration::from_millis(1);

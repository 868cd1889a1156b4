//! Leaky bucket used as the global request budget.
//!
//! Every tenant's request drops one unit into the same bucket, which drains at
//! the platform-wide sustained rate. `capacity` bounds the burst.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::{RateLimitState, RateLimiter};

/// Half a request unit. Between calls the bucket drains a fraction of a unit,
/// which would otherwise make a full bucket report spare capacity.
const LEVEL_GUARD: f64 = 0.5;

#[derive(Debug)]
struct BucketState {
    level: f64,
    last_leak: Instant,
}

#[derive(Debug)]
pub struct LeakyBucket {
    capacity: u32,
    /// Units drained per second.
    leak_rate: f64,
    state: Mutex<BucketState>,
}

impl LeakyBucket {
    #[must_use]
    pub fn new(capacity: u32, leak_rate: f64) -> Self {
        Self {
            capacity: capacity.max(1),
            leak_rate: if leak_rate > 0.0 { leak_rate } else { 1.0 },
            state: Mutex::new(BucketState {
                level: 0.0,
                last_leak: Instant::now(),
            }),
        }
    }

    /// Bucket sized to `requests_per_window`, draining evenly over `window`.
    #[must_use]
    pub fn from_window(requests_per_window: u32, window: Duration) -> Self {
        let leak_rate = f64::from(requests_per_window) / window.as_secs_f64().max(f64::EPSILON);
        Self::new(requests_per_window, leak_rate)
    }

    fn leak(&self, state: &mut BucketState) {
        let now = Instant::now();
        let leaked = now.duration_since(state.last_leak).as_secs_f64() * self.leak_rate;
        if leaked > 0.0 {
            state.level = (state.level - leaked).max(0.0);
            state.last_leak = now;
        }
    }

    fn time_until_room(&self, level: f64, amount: f64) -> Duration {
        let capacity = f64::from(self.capacity);
        if level + amount <= capacity {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((level + amount - capacity) / self.leak_rate)
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    #[must_use]
    pub const fn leak_rate(&self) -> f64 {
        self.leak_rate
    }
}

#[async_trait]
impl RateLimiter for LeakyBucket {
    async fn try_acquire(&self) -> bool {
        self.try_acquire_n(1).await
    }

    async fn try_acquire_n(&self, permits: u32) -> bool {
        let mut state = self.state.lock();
        self.leak(&mut state);

        let amount = f64::from(permits);
        if state.level + amount <= f64::from(self.capacity) {
            state.level += amount;
            true
        } else {
            false
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn remaining(&self) -> u32 {
        let mut state = self.state.lock();
        self.leak(&mut state);
        (f64::from(self.capacity) - state.level).max(0.0) as u32
    }

    async fn wait_time(&self) -> Duration {
        let mut state = self.state.lock();
        self.leak(&mut state);
        self.time_until_room(state.level, 1.0)
    }

    async fn reset(&self) {
        let mut state = self.state.lock();
        state.level = 0.0;
        state.last_leak = Instant::now();
    }

    fn state(&self) -> RateLimitState {
        let mut state = self.state.lock();
        self.leak(&mut state);

        let capacity = f64::from(self.capacity);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let remaining = (capacity - state.level).max(0.0) as u32;

        RateLimitState {
            limit: self.capacity,
            remaining,
            reset_after: self.time_until_room(state.level, 1.0),
            is_limited: state.level + LEVEL_GUARD >= capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn drains_at_configured_rate() {
        let bucket = LeakyBucket::new(5, 10.0);
        for _ in 0..5 {
            assert!(bucket.try_acquire().await);
        }
        assert!(!bucket.try_acquire().await);

        advance(Duration::from_millis(200)).await;
        assert!(bucket.try_acquire().await);
        assert!(bucket.try_acquire().await);
        assert!(!bucket.try_acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn from_window_derives_rate() {
        let bucket = LeakyBucket::from_window(60, Duration::from_secs(60));
        assert_eq!(bucket.capacity(), 60);
        assert!((bucket.leak_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn state_reports_limited_when_full() {
        let bucket = LeakyBucket::new(2, 1.0);
        assert!(!bucket.state().is_limited);
        bucket.try_acquire_n(2).await;

        let state = bucket.state();
        assert_eq!(state.remaining, 0);
        assert!(state.is_limited);
        assert_eq!(state.reset_after, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_slot_sleeps_until_room() {
        let bucket = LeakyBucket::new(1, 2.0);
        bucket.wait_for_slot().await;

        let start = Instant::now();
        bucket.wait_for_slot().await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(500), "waited {waited:?}");
        assert!(waited < Duration::from_millis(510), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn reset_empties_bucket() {
        let bucket = LeakyBucket::new(3, 0.001);
        bucket.try_acquire_n(3).await;
        assert_eq!(bucket.remaining(), 0);
        bucket.reset().await;
        assert_eq!(bucket.remaining(), 3);
    }
}

//! Sliding-window request budget (one per tenant).

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::{RateLimitState, RateLimiter};

/// At most `limit` requests in any rolling `window`.
#[derive(Debug)]
pub struct SlidingWindow {
    limit: u32,
    window: Duration,
    hits: Mutex<VecDeque<Instant>>,
}

impl SlidingWindow {
    #[must_use]
    pub fn new(limit: u32, window: Duration) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            window,
            hits: Mutex::new(VecDeque::with_capacity(limit as usize)),
        }
    }

    fn prune(&self, hits: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&oldest) = hits.front() {
            if now.duration_since(oldest) >= self.window {
                hits.pop_front();
            } else {
                break;
            }
        }
    }

    fn wait_locked(&self, hits: &VecDeque<Instant>, now: Instant) -> Duration {
        if hits.len() < self.limit as usize {
            return Duration::ZERO;
        }
        hits.front().map_or(Duration::ZERO, |&oldest| {
            (oldest + self.window).saturating_duration_since(now)
        })
    }

    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }
}

#[async_trait]
impl RateLimiter for SlidingWindow {
    async fn try_acquire(&self) -> bool {
        self.try_acquire_n(1).await
    }

    async fn try_acquire_n(&self, permits: u32) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock();
        self.prune(&mut hits, now);

        if hits.len() + permits as usize > self.limit as usize {
            return false;
        }
        for _ in 0..permits {
            hits.push_back(now);
        }
        true
    }

    fn remaining(&self) -> u32 {
        let now = Instant::now();
        let mut hits = self.hits.lock();
        self.prune(&mut hits, now);
        let used = u32::try_from(hits.len()).unwrap_or(u32::MAX);
        self.limit.saturating_sub(used)
    }

    async fn wait_time(&self) -> Duration {
        let now = Instant::now();
        let mut hits = self.hits.lock();
        self.prune(&mut hits, now);
        self.wait_locked(&hits, now)
    }

    async fn reset(&self) {
        self.hits.lock().clear();
    }

    fn state(&self) -> RateLimitState {
        let now = Instant::now();
        let mut hits = self.hits.lock();
        self.prune(&mut hits, now);
        let used = u32::try_from(hits.len()).unwrap_or(u32::MAX);
        let remaining = self.limit.saturating_sub(used);
        RateLimitState {
            limit: self.limit,
            remaining,
            reset_after: self.wait_locked(&hits, now),
            is_limited: remaining == 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn enforces_limit_within_window() {
        let window = SlidingWindow::new(3, Duration::from_secs(10));
        assert!(window.try_acquire().await);
        assert!(window.try_acquire().await);
        assert!(window.try_acquire().await);
        assert!(!window.try_acquire().await);
        assert_eq!(window.remaining(), 0);
        assert_eq!(window.wait_time().await, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn slots_free_as_window_slides() {
        let window = SlidingWindow::new(2, Duration::from_secs(10));
        assert!(window.try_acquire().await);
        advance(Duration::from_secs(4)).await;
        assert!(window.try_acquire().await);
        assert!(!window.try_acquire().await);

        advance(Duration::from_secs(6)).await;
        assert_eq!(window.remaining(), 1);
        assert!(window.try_acquire().await);
        assert_eq!(window.wait_time().await, Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn try_acquire_n_is_all_or_nothing() {
        let window = SlidingWindow::new(5, Duration::from_secs(1));
        assert!(window.try_acquire_n(4).await);
        assert!(!window.try_acquire_n(2).await);
        assert_eq!(window.remaining(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_respects_max_wait() {
        let window = SlidingWindow::new(1, Duration::from_secs(30));
        assert!(window.try_acquire().await);
        let err = window.acquire(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, crate::RateLimitError::WaitExceeded { .. }));

        let waited = window.acquire(Duration::from_secs(60)).await.unwrap();
        assert_eq!(waited, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn state_reflects_usage() {
        let window = SlidingWindow::new(2, Duration::from_secs(10));
        window.try_acquire().await;
        let state = window.state();
        assert_eq!(state.limit, 2);
        assert_eq!(state.remaining, 1);
        assert!(!state.is_limited);

        window.reset().await;
        assert_eq!(window.remaining(), 2);
    }
}

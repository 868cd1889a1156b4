//! Retry decisions and exponential backoff.

use std::time::Duration;

use chanpulse_core::PlatformError;
use chanpulse_core::config::BackoffConfig;

/// What to do after a failed platform call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Immediate,
    /// Retry after a policy-computed delay.
    Backoff,
    /// Retry after the delay the platform asked for.
    After(Duration),
    Terminal,
}

impl RetryDecision {
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        !matches!(self, Self::Terminal)
    }

    #[must_use]
    pub const fn retry_after(self) -> Option<Duration> {
        match self {
            Self::After(delay) => Some(delay),
            _ => None,
        }
    }
}

/// Classify a platform failure.
#[must_use]
pub const fn decision_for(err: &PlatformError) -> RetryDecision {
    match err {
        PlatformError::FloodWait { retry_after } => RetryDecision::After(*retry_after),
        PlatformError::Network(_) | PlatformError::Timeout(_) => RetryDecision::Backoff,
        PlatformError::Auth(_) | PlatformError::Protocol(_) => RetryDecision::Terminal,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Backoff retries before giving up. Flood-waits do not count.
    pub max_retries: u32,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}

impl BackoffPolicy {
    #[must_use]
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_ms),
            multiplier: config.multiplier.max(1.0),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_retries: config.max_retries,
            jitter: config.jitter,
        }
    }

    #[must_use]
    pub const fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    #[must_use]
    pub const fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub const fn with_jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Delay before retry `attempt` (0-indexed) given a jitter sample in `[0, 1]`.
    ///
    /// With jitter enabled the delay falls in `[d/2, d]` where `d` is the capped
    /// exponential delay.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, jitter_sample: f64) -> Duration {
        let exp = i32::try_from(attempt.min(63)).unwrap_or(63);
        let raw = self.base.as_secs_f64() * self.multiplier.powi(exp);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let factor = if self.jitter {
            jitter_sample.clamp(0.0, 1.0).mul_add(0.5, 0.5)
        } else {
            1.0
        };
        Duration::from_secs_f64((capped * factor).max(0.0))
    }

    /// Delay for the next retry, or `None` when no retry is permitted.
    #[must_use]
    pub fn next_delay(&self, attempt: u32, decision: RetryDecision) -> Option<Duration> {
        match decision {
            RetryDecision::Terminal => None,
            RetryDecision::After(delay) => Some(delay),
            RetryDecision::Immediate => (attempt < self.max_retries).then_some(Duration::ZERO),
            RetryDecision::Backoff => {
                (attempt < self.max_retries).then(|| self.delay_for(attempt, rand::random::<f64>()))
            }
        }
    }
}

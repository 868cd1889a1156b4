//! Per-tenant circuit breaker.
//!
//! Closed → Open after `failure_threshold` consecutive exhausted calls;
//! Open → HalfOpen once `open_cooldown` elapses; HalfOpen → Closed after
//! `success_threshold` successful probes, or back to Open on any failure.

use std::time::Duration;

use chanpulse_core::config::CircuitConfig;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_cooldown: Duration,
}

impl CircuitBreakerConfig {
    #[must_use]
    pub fn new(failure_threshold: u32, success_threshold: u32, open_cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            open_cooldown,
        }
    }

    #[must_use]
    pub fn from_config(config: &CircuitConfig) -> Self {
        Self::new(
            config.failure_threshold,
            config.success_threshold,
            config.open_cooldown(),
        )
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from_config(&CircuitConfig::default())
    }
}

#[derive(Debug, Clone, Copy)]
enum CircuitState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen { successes: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub state: CircuitStateKind,
    pub consecutive_failures: u32,
    pub cooldown_remaining: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
        }
    }

    /// Whether a call may proceed. Moves Open → HalfOpen once cooled down.
    pub fn allow(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen { .. } => true,
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.open_cooldown {
                    self.state = CircuitState::HalfOpen { successes: 0 };
                    info!(tenant_id = %self.name, "circuit half-open, probing");
                    true
                } else {
                    false
                }
            }
        }
    }

    #[must_use]
    pub const fn is_half_open(&self) -> bool {
        matches!(self.state, CircuitState::HalfOpen { .. })
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self.state, CircuitState::Open { .. })
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => self.consecutive_failures = 0,
            CircuitState::HalfOpen { successes } => {
                let successes = successes + 1;
                if successes >= self.config.success_threshold {
                    self.consecutive_failures = 0;
                    self.state = CircuitState::Closed;
                    info!(tenant_id = %self.name, "circuit closed after successful probe");
                } else {
                    self.state = CircuitState::HalfOpen { successes };
                }
            }
            CircuitState::Open { .. } => {}
        }
    }

    /// Record a failure. Returns `true` if this call opened the circuit.
    pub fn record_failure(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.open();
                    warn!(
                        tenant_id = %self.name,
                        failures = self.consecutive_failures,
                        "circuit opened after consecutive failures"
                    );
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen { .. } => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.open();
                warn!(tenant_id = %self.name, "circuit re-opened after failed probe");
                true
            }
            CircuitState::Open { .. } => false,
        }
    }

    /// Force the circuit open regardless of the failure count.
    pub fn trip(&mut self) {
        if !self.is_open() {
            self.consecutive_failures = self.consecutive_failures.max(self.config.failure_threshold);
            self.open();
            warn!(tenant_id = %self.name, "circuit tripped");
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open {
            opened_at: Instant::now(),
        };
    }

    /// Time left before a probe is allowed, if open.
    #[must_use]
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        match self.state {
            CircuitState::Open { opened_at } => Some(
                self.config
                    .open_cooldown
                    .saturating_sub(opened_at.elapsed()),
            ),
            _ => None,
        }
    }

    #[must_use]
    pub fn status(&self) -> CircuitBreakerStatus {
        let state = match self.state {
            CircuitState::Closed => CircuitStateKind::Closed,
            CircuitState::Open { .. } => CircuitStateKind::Open,
            CircuitState::HalfOpen { .. } => CircuitStateKind::HalfOpen,
        };
        CircuitBreakerStatus {
            state,
            consecutive_failures: self.consecutive_failures,
            cooldown_remaining: self.cooldown_remaining(),
        }
    }
}

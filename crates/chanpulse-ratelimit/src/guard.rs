//! Throttle guard: the single gate every platform call passes through.
//!
//! Each tenant gets a lane holding its sliding-window budget, its flood-wait
//! pause, and its circuit breaker. Lanes are independent: a flood-wait or
//! open circuit on one tenant never delays another. The global leaky bucket
//! is the only shared budget.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chanpulse_core::{CancelToken, Config, PlatformError, TenantId};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backoff::{BackoffPolicy, RetryDecision, decision_for};
use crate::circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus};
use crate::leaky_bucket::LeakyBucket;
use crate::sliding_window::SlidingWindow;
use crate::{RateLimitState, RateLimiter};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThrottleError {
    /// The tenant's lane is paused by a platform flood-wait.
    #[error("tenant {tenant_id} is flood-waiting for {}s", retry_after.as_secs())]
    FloodWait {
        tenant_id: TenantId,
        retry_after: Duration,
    },

    /// The tenant's circuit is open; calls fail fast.
    #[error("circuit open for tenant {tenant_id}")]
    CircuitOpen {
        tenant_id: TenantId,
        retry_in: Option<Duration>,
    },

    /// Backoff retries exhausted without opening the circuit.
    #[error("tenant {tenant_id}: retries exhausted: {last}")]
    Exhausted {
        tenant_id: TenantId,
        last: PlatformError,
    },

    /// Cumulative flood-wait for one call passed the configured ceiling.
    #[error("tenant {tenant_id}: flood wait of {}s exceeds ceiling", waited.as_secs())]
    Stalled {
        tenant_id: TenantId,
        waited: Duration,
    },

    /// Non-retryable platform failure (auth, protocol).
    #[error(transparent)]
    Platform(PlatformError),

    #[error("operation cancelled")]
    Cancelled,
}

impl ThrottleError {
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::Platform(PlatformError::Auth(_)))
    }
}

impl From<ThrottleError> for chanpulse_core::Error {
    fn from(err: ThrottleError) -> Self {
        match err {
            ThrottleError::FloodWait { retry_after, .. } => Self::FloodWait { retry_after },
            ThrottleError::Stalled { waited, .. } => Self::FloodWait {
                retry_after: waited,
            },
            ThrottleError::CircuitOpen { tenant_id, .. } => {
                Self::Network(format!("circuit open for tenant {tenant_id}"))
            }
            ThrottleError::Exhausted { last, .. } => Self::Network(last.to_string()),
            ThrottleError::Platform(PlatformError::Auth(message)) => Self::Auth {
                tenant_id: TenantId::new("unknown"),
                message,
            },
            ThrottleError::Platform(other) => other.into(),
            ThrottleError::Cancelled => Self::Cancelled,
        }
    }
}

/// Receives lane transitions; the session manager uses it to track
/// `FloodWaiting` status.
pub trait ThrottleObserver: Send + Sync {
    fn on_flood_wait(&self, _tenant: &TenantId, _retry_after: Duration) {}
    fn on_flood_wait_cleared(&self, _tenant: &TenantId) {}
    fn on_circuit_open(&self, _tenant: &TenantId) {}
}

#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub per_tenant_requests: u32,
    pub per_tenant_window: Duration,
    pub global_requests_per_sec: f64,
    pub global_burst: u32,
    pub request_timeout: Duration,
    pub flood_wait_ceiling: Duration,
    pub backoff: BackoffPolicy,
    pub circuit: CircuitBreakerConfig,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ThrottleConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let rl = &config.rate_limit;
        Self {
            per_tenant_requests: rl.per_tenant_requests,
            per_tenant_window: rl.per_tenant_window(),
            global_requests_per_sec: rl.global_requests_per_sec,
            global_burst: rl.global_burst,
            request_timeout: rl.request_timeout(),
            flood_wait_ceiling: rl.flood_wait_ceiling(),
            backoff: BackoffPolicy::from_config(&config.backoff),
            circuit: CircuitBreakerConfig::from_config(&config.circuit),
        }
    }
}

#[derive(Debug)]
struct Lane {
    window: SlidingWindow,
    paused_until: Mutex<Option<Instant>>,
    breaker: Mutex<CircuitBreaker>,
    flood_reported: AtomicBool,
}

impl Lane {
    fn pause_remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut paused = self.paused_until.lock();
        match *paused {
            Some(until) if until > now => Some(until - now),
            Some(_) => {
                *paused = None;
                None
            }
            None => None,
        }
    }

    fn pause_for(&self, delay: Duration) {
        let until = Instant::now() + delay;
        let mut paused = self.paused_until.lock();
        if paused.is_none_or(|current| current < until) {
            *paused = Some(until);
        }
    }
}

/// Per-tenant view for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaneSnapshot {
    pub window: RateLimitState,
    pub paused_for: Option<Duration>,
    pub circuit: CircuitBreakerStatus,
}

pub struct ThrottleGuard {
    config: ThrottleConfig,
    global: LeakyBucket,
    lanes: RwLock<HashMap<TenantId, Arc<Lane>>>,
    observer: RwLock<Option<Weak<dyn ThrottleObserver>>>,
}

impl std::fmt::Debug for ThrottleGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleGuard")
            .field("config", &self.config)
            .field("lanes", &self.lanes.read().len())
            .finish_non_exhaustive()
    }
}

impl ThrottleGuard {
    #[must_use]
    pub fn new(config: ThrottleConfig) -> Self {
        let global = LeakyBucket::new(config.global_burst, config.global_requests_per_sec);
        Self {
            config,
            global,
            lanes: RwLock::new(HashMap::new()),
            observer: RwLock::new(None),
        }
    }

    pub fn set_observer(&self, observer: Weak<dyn ThrottleObserver>) {
        *self.observer.write() = Some(observer);
    }

    #[must_use]
    pub const fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    fn observer(&self) -> Option<Arc<dyn ThrottleObserver>> {
        self.observer.read().as_ref().and_then(Weak::upgrade)
    }

    fn lane(&self, tenant: &TenantId) -> Arc<Lane> {
        if let Some(lane) = self.lanes.read().get(tenant) {
            return Arc::clone(lane);
        }
        let mut lanes = self.lanes.write();
        Arc::clone(lanes.entry(tenant.clone()).or_insert_with(|| {
            Arc::new(Lane {
                window: SlidingWindow::new(
                    self.config.per_tenant_requests,
                    self.config.per_tenant_window,
                ),
                paused_until: Mutex::new(None),
                breaker: Mutex::new(CircuitBreaker::new(
                    tenant.as_str(),
                    self.config.circuit.clone(),
                )),
                flood_reported: AtomicBool::new(false),
            })
        }))
    }

    /// Drop a tenant's lane (budget, pause and breaker state).
    pub fn forget(&self, tenant: &TenantId) {
        self.lanes.write().remove(tenant);
    }

    /// Wait for a request slot for `tenant`.
    ///
    /// # Errors
    ///
    /// Returns [`ThrottleError::FloodWait`] with the remaining pause if the lane
    /// is flood-waiting, or [`ThrottleError::CircuitOpen`] if the tenant's
    /// circuit is open. Neither waits.
    pub async fn await_slot(&self, tenant: &TenantId) -> Result<(), ThrottleError> {
        let lane = self.lane(tenant);
        self.admit(tenant, &lane)?;
        self.take_slots(&lane).await;
        Ok(())
    }

    fn admit(&self, tenant: &TenantId, lane: &Lane) -> Result<bool, ThrottleError> {
        if let Some(retry_after) = lane.pause_remaining() {
            return Err(ThrottleError::FloodWait {
                tenant_id: tenant.clone(),
                retry_after,
            });
        }
        let mut breaker = lane.breaker.lock();
        if !breaker.allow() {
            return Err(ThrottleError::CircuitOpen {
                tenant_id: tenant.clone(),
                retry_in: breaker.cooldown_remaining(),
            });
        }
        Ok(breaker.is_half_open())
    }

    async fn take_slots(&self, lane: &Lane) {
        lane.window.wait_for_slot().await;
        self.global.wait_for_slot().await;
    }

    /// Pause `tenant`'s lane for `retry_after`.
    pub fn record_flood_wait(&self, tenant: &TenantId, retry_after: Duration) {
        let lane = self.lane(tenant);
        lane.pause_for(retry_after);
        lane.flood_reported.store(true, Ordering::Release);
        warn!(
            tenant_id = %tenant,
            retry_after_secs = retry_after.as_secs(),
            "platform flood wait, pausing tenant lane"
        );
        if let Some(observer) = self.observer() {
            observer.on_flood_wait(tenant, retry_after);
        }
    }

    fn record_success(&self, tenant: &TenantId, lane: &Lane) {
        lane.breaker.lock().record_success();
        if lane.flood_reported.swap(false, Ordering::AcqRel) {
            if let Some(observer) = self.observer() {
                observer.on_flood_wait_cleared(tenant);
            }
        }
    }

    fn open_circuit(&self, tenant: &TenantId, lane: &Lane, force: bool) -> bool {
        let opened = {
            let mut breaker = lane.breaker.lock();
            if force {
                breaker.trip();
                true
            } else {
                breaker.record_failure()
            }
        };
        if opened {
            if let Some(observer) = self.observer() {
                observer.on_circuit_open(tenant);
            }
        }
        opened
    }

    async fn sleep(cancel: &CancelToken, delay: Duration) -> Result<(), ThrottleError> {
        cancel
            .guard(tokio::time::sleep(delay))
            .await
            .map_err(|_| ThrottleError::Cancelled)
    }

    /// Run a platform call for `tenant` under the full throttle policy.
    ///
    /// Each attempt waits for a budget slot and runs under the per-request
    /// timeout. Flood-waits pause the lane and are always retried, until the
    /// cumulative wait for this call exceeds the ceiling. Network failures and
    /// timeouts back off with jitter; once retries run out the tenant's
    /// circuit records a failure. Auth and protocol failures return at once.
    ///
    /// # Errors
    ///
    /// See [`ThrottleError`]. Cancellation is observed while waiting for a
    /// slot, during the call, and during every sleep.
    pub async fn call<T, F, Fut>(
        &self,
        tenant: &TenantId,
        cancel: &CancelToken,
        mut op: F,
    ) -> Result<T, ThrottleError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PlatformError>>,
    {
        let lane = self.lane(tenant);
        let mut attempt = 0u32;
        let mut flood_waited = Duration::ZERO;

        loop {
            if cancel.is_cancelled() {
                return Err(ThrottleError::Cancelled);
            }

            let probing = match self.admit(tenant, &lane) {
                Ok(probing) => probing,
                Err(ThrottleError::FloodWait { retry_after, .. }) => {
                    flood_waited += retry_after;
                    if flood_waited > self.config.flood_wait_ceiling {
                        return Err(self.stalled(tenant, flood_waited));
                    }
                    Self::sleep(cancel, retry_after).await?;
                    continue;
                }
                Err(err) => return Err(err),
            };

            cancel
                .guard(self.take_slots(&lane))
                .await
                .map_err(|_| ThrottleError::Cancelled)?;

            let timeout = self.config.request_timeout;
            let outcome = cancel
                .guard(tokio::time::timeout(timeout, op()))
                .await
                .map_err(|_| ThrottleError::Cancelled)?
                .unwrap_or(Err(PlatformError::Timeout(timeout)));

            let err = match outcome {
                Ok(value) => {
                    self.record_success(tenant, &lane);
                    return Ok(value);
                }
                Err(err) => err,
            };

            match decision_for(&err) {
                RetryDecision::After(retry_after) => {
                    if flood_waited + retry_after > self.config.flood_wait_ceiling {
                        self.record_flood_wait(tenant, retry_after);
                        return Err(self.stalled(tenant, flood_waited + retry_after));
                    }
                    self.record_flood_wait(tenant, retry_after);
                    flood_waited += retry_after;
                    Self::sleep(cancel, retry_after).await?;
                }
                RetryDecision::Backoff => {
                    if probing {
                        self.open_circuit(tenant, &lane, true);
                        return Err(ThrottleError::CircuitOpen {
                            tenant_id: tenant.clone(),
                            retry_in: Some(self.config.circuit.open_cooldown),
                        });
                    }
                    if let Some(delay) = self.config.backoff.next_delay(attempt, RetryDecision::Backoff) {
                        debug!(
                            tenant_id = %tenant,
                            attempt,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error = %err,
                            "transient platform failure, backing off"
                        );
                        attempt += 1;
                        Self::sleep(cancel, delay).await?;
                    } else if self.open_circuit(tenant, &lane, false) {
                        return Err(ThrottleError::CircuitOpen {
                            tenant_id: tenant.clone(),
                            retry_in: Some(self.config.circuit.open_cooldown),
                        });
                    } else {
                        return Err(ThrottleError::Exhausted {
                            tenant_id: tenant.clone(),
                            last: err,
                        });
                    }
                }
                RetryDecision::Terminal | RetryDecision::Immediate => {
                    return Err(ThrottleError::Platform(err));
                }
            }
        }
    }

    fn stalled(&self, tenant: &TenantId, waited: Duration) -> ThrottleError {
        warn!(
            tenant_id = %tenant,
            waited_secs = waited.as_secs(),
            ceiling_secs = self.config.flood_wait_ceiling.as_secs(),
            "cumulative flood wait exceeded ceiling, reporting sync stall"
        );
        ThrottleError::Stalled {
            tenant_id: tenant.clone(),
            waited,
        }
    }

    #[must_use]
    pub fn snapshot(&self, tenant: &TenantId) -> LaneSnapshot {
        let lane = self.lane(tenant);
        LaneSnapshot {
            window: lane.window.state(),
            paused_for: lane.pause_remaining(),
            circuit: lane.breaker.lock().status(),
        }
    }

    #[must_use]
    pub fn global_state(&self) -> RateLimitState {
        self.global.state()
    }
}

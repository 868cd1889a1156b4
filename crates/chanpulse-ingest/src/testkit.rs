//! In-memory platform for tests, simulation and demos.
//!
//! [`ScriptedPlatform`] holds per-channel history and serves it page by page
//! through [`ScriptedConnector`] sessions. Failures, delays and pauses can be
//! scripted per channel or per tenant without a running gateway.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chanpulse_core::model::WireReactions;
use chanpulse_core::{ChannelId, PlatformError, TenantId, WireEvent};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::client::{HistoryPage, PlatformConnector, PlatformSession};
use crate::credentials::Credential;

/// Base timestamp for seeded events (2024-06-01T00:00:00Z).
pub const SEED_EPOCH: i64 = 1_717_200_000;

/// Fetch gate set with [`ScriptedPlatform::hold_at`].
///
/// The held fetch signals `reached` and then waits for `release`.
#[derive(Debug, Default)]
pub struct Hold {
    pub reached: Notify,
    pub release: Notify,
}

#[derive(Debug, Default)]
struct ChannelScript {
    events: BTreeMap<i64, WireEvent>,
    /// Returned by every fetch until cleared.
    failure: Option<PlatformError>,
    /// Returned by the next fetches, one each.
    queued: VecDeque<PlatformError>,
    fetches: u32,
    holds: HashMap<u32, Arc<Hold>>,
}

#[derive(Debug, Default)]
struct PlatformState {
    channels: HashMap<ChannelId, ChannelScript>,
    connect_failures: HashMap<TenantId, VecDeque<PlatformError>>,
    secrets: HashMap<TenantId, String>,
    fetch_delay: Duration,
}

#[derive(Debug, Default)]
pub struct ScriptedPlatform {
    state: Mutex<PlatformState>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Synthetic event: views grow with the id, every fifth event carries media.
#[must_use]
pub fn wire_event(id: i64) -> WireEvent {
    WireEvent {
        id,
        date: SEED_EPOCH + id * 60,
        views: Some(100 + id * 10),
        forwards: Some(id % 7),
        reactions: Some(WireReactions::Total(id % 5)),
        schema: Some(1),
        kind: Some(if id % 5 == 0 { "photo" } else { "text" }.to_string()),
        text: Some(format!("post {id}")),
        media: (id % 5 == 0).then(|| serde_json::json!({ "type": "photo" })),
    }
}

impl ScriptedPlatform {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add synthetic events with the given ids.
    pub fn seed(&self, channel: ChannelId, ids: impl IntoIterator<Item = i64>) {
        self.push(channel, ids.into_iter().map(wire_event));
    }

    /// Add events as given. An id already present is replaced.
    pub fn push(&self, channel: ChannelId, events: impl IntoIterator<Item = WireEvent>) {
        let mut state = self.state.lock();
        let script = state.channels.entry(channel).or_default();
        for event in events {
            script.events.insert(event.id, event);
        }
    }

    /// Fail every fetch on `channel` with `error` until [`Self::clear_failures`].
    pub fn fail_channel(&self, channel: ChannelId, error: PlatformError) {
        self.state.lock().channels.entry(channel).or_default().failure = Some(error);
    }

    /// Fail the next fetch on `channel` with `error`. Calls queue up.
    pub fn fail_next(&self, channel: ChannelId, error: PlatformError) {
        self.state
            .lock()
            .channels
            .entry(channel)
            .or_default()
            .queued
            .push_back(error);
    }

    /// Fail the tenant's next connect with `error`. Calls queue up.
    pub fn fail_connect(&self, tenant: &TenantId, error: PlatformError) {
        self.state
            .lock()
            .connect_failures
            .entry(tenant.clone())
            .or_default()
            .push_back(error);
    }

    /// Reject connects for `tenant` whose credential differs from `secret`.
    pub fn require_secret(&self, tenant: &TenantId, secret: impl Into<String>) {
        self.state.lock().secrets.insert(tenant.clone(), secret.into());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        for script in state.channels.values_mut() {
            script.failure = None;
            script.queued.clear();
        }
        state.connect_failures.clear();
    }

    /// Delay every fetch by `delay`.
    pub fn set_fetch_delay(&self, delay: Duration) {
        self.state.lock().fetch_delay = delay;
    }

    /// Block the `fetch`-th fetch (1-based) on `channel` until released.
    #[must_use]
    pub fn hold_at(&self, channel: ChannelId, fetch: u32) -> Arc<Hold> {
        let hold = Arc::new(Hold::default());
        self.state
            .lock()
            .channels
            .entry(channel)
            .or_default()
            .holds
            .insert(fetch, Arc::clone(&hold));
        hold
    }

    #[must_use]
    pub fn fetches(&self, channel: ChannelId) -> u32 {
        self.state.lock().channels.get(&channel).map_or(0, |c| c.fetches)
    }

    #[must_use]
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::Acquire)
    }

    /// Most fetches ever running at once, across all sessions.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Acquire)
    }

    async fn fetch(
        &self,
        channel: ChannelId,
        after: i64,
        limit: u32,
    ) -> Result<HistoryPage, PlatformError> {
        let (delay, hold) = {
            let mut state = self.state.lock();
            let delay = state.fetch_delay;
            let script = state.channels.entry(channel).or_default();
            script.fetches += 1;
            (delay, script.holds.remove(&script.fetches))
        };

        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::AcqRel);
        let _in_flight = InFlight(&self.in_flight);

        if let Some(hold) = hold {
            hold.reached.notify_one();
            hold.release.notified().await;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        let script = state.channels.entry(channel).or_default();
        if let Some(err) = script.queued.pop_front() {
            return Err(err);
        }
        if let Some(err) = &script.failure {
            return Err(err.clone());
        }
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        let mut remaining = script.events.range(after + 1..);
        let events: Vec<WireEvent> = remaining.by_ref().take(limit).map(|(_, e)| e.clone()).collect();
        Ok(HistoryPage {
            events,
            has_more: remaining.next().is_some(),
        })
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Connector serving sessions backed by a [`ScriptedPlatform`].
#[derive(Debug, Clone)]
pub struct ScriptedConnector {
    platform: Arc<ScriptedPlatform>,
}

impl ScriptedConnector {
    #[must_use]
    pub const fn new(platform: Arc<ScriptedPlatform>) -> Self {
        Self { platform }
    }
}

#[async_trait]
impl PlatformConnector for ScriptedConnector {
    async fn connect(
        &self,
        tenant: &TenantId,
        credential: &Credential,
    ) -> Result<Arc<dyn PlatformSession>, PlatformError> {
        {
            let mut state = self.platform.state.lock();
            if let Some(err) = state
                .connect_failures
                .get_mut(tenant)
                .and_then(VecDeque::pop_front)
            {
                return Err(err);
            }
            if let Some(expected) = state.secrets.get(tenant) {
                if expected != credential.expose() {
                    return Err(PlatformError::Auth("credential rejected".to_string()));
                }
            }
        }
        self.platform.connects.fetch_add(1, Ordering::AcqRel);
        Ok(Arc::new(ScriptedSession {
            platform: Arc::clone(&self.platform),
            closed: AtomicBool::new(false),
        }))
    }
}

struct ScriptedSession {
    platform: Arc<ScriptedPlatform>,
    closed: AtomicBool,
}

#[async_trait]
impl PlatformSession for ScriptedSession {
    async fn fetch_history(
        &self,
        channel: ChannelId,
        after: i64,
        limit: u32,
    ) -> Result<HistoryPage, PlatformError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PlatformError::Network("session closed".to_string()));
        }
        self.platform.fetch(channel, after, limit).await
    }

    async fn disconnect(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.platform.disconnects.fetch_add(1, Ordering::AcqRel);
        }
    }
}

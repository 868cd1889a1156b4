//! Ingestion engine.
//!
//! One cycle spawns a collection task per tenant. Each task leases the
//! tenant's session, walks its channels through the [`Collector`], and sends
//! every page to a single aggregator over a bounded queue. The aggregator
//! feeds the [`BatchProcessor`], which commits rows and watermarks and
//! forwards fresh metric values to the [`AlertEvaluator`].
//!
//! ```text
//!  tenant task ─┐
//!  tenant task ─┼─▶ mpsc(queue_depth) ─▶ BatchProcessor ─▶ MetricsStore
//!  tenant task ─┘                              │
//!                                              └─▶ AlertEvaluator ─▶ notifiers
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chanpulse_core::{
    ChannelId, Config, Error, Result, SyncReport, SyncStatus, SyncTarget, TenantId,
};
use chanpulse_ratelimit::{ThrottleConfig, ThrottleError, ThrottleGuard, ThrottleObserver};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::alerts::AlertEvaluator;
use crate::client::PlatformConnector;
use crate::collector::{CollectError, Collector};
use crate::credentials::{CredentialCipher, CredentialStore, decode_blob};
use crate::notify::NotifierSet;
use crate::processor::{BatchProcessor, ChannelGroup, JobSummary};
use crate::session::{SessionError, SessionManager};
use crate::store::MetricsStore;

/// Collaborators the engine is assembled from.
pub struct EngineDeps {
    pub connector: Arc<dyn PlatformConnector>,
    pub store: Arc<dyn MetricsStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub cipher: Arc<CredentialCipher>,
    pub notifiers: NotifierSet,
}

/// Per-tenant result of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TenantReport {
    pub channels: usize,
    pub pages: usize,
    pub events: usize,
    /// Channels whose collection ended early.
    pub interrupted: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub tenants: BTreeMap<TenantId, TenantReport>,
    pub summary: JobSummary,
}

#[derive(Debug, Clone)]
struct Fault {
    since: DateTime<Utc>,
    reason: String,
}

struct Inner {
    config: Config,
    sessions: Arc<SessionManager>,
    throttle: Arc<ThrottleGuard>,
    store: Arc<dyn MetricsStore>,
    collector: Collector,
    processor: BatchProcessor,
    alerts: Arc<AlertEvaluator>,
    tenants: RwLock<BTreeMap<TenantId, Vec<ChannelId>>>,
    syncing: Mutex<HashSet<ChannelId>>,
    channel_faults: Mutex<HashMap<ChannelId, Fault>>,
    tenant_faults: Mutex<HashMap<TenantId, Fault>>,
    refresh_queue: Mutex<BTreeSet<ChannelId>>,
    refresh_notify: Notify,
}

#[derive(Clone)]
pub struct IngestEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for IngestEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestEngine")
            .field("tenants", &self.inner.tenants.read().len())
            .field("sessions", &self.inner.sessions)
            .field("processor", &self.inner.processor)
            .finish_non_exhaustive()
    }
}

impl IngestEngine {
    /// Wire the pipeline. The session manager observes the throttle guard
    /// and the alert evaluator receives every committed metric.
    #[must_use]
    pub fn new(config: Config, deps: EngineDeps) -> Self {
        let throttle = Arc::new(ThrottleGuard::new(ThrottleConfig::from_config(&config)));
        let sessions = SessionManager::new(
            deps.connector,
            deps.credentials,
            deps.cipher,
            config.sessions.clone(),
        );
        let observer: Arc<dyn ThrottleObserver> = sessions.clone();
        let observer: Weak<dyn ThrottleObserver> = Arc::downgrade(&observer);
        throttle.set_observer(observer);

        let collector = Collector::new(Arc::clone(&throttle), Arc::clone(&deps.store), &config.collector);
        let processor = BatchProcessor::new(Arc::clone(&deps.store), config.batch.clone());
        let alerts = Arc::new(
            AlertEvaluator::new(
                config.alert_rules.clone(),
                Duration::from_secs(config.alerts.default_cooldown_secs),
            )
            .with_store(Arc::clone(&deps.store))
            .with_notifiers(deps.notifiers),
        );
        processor.set_sink(alerts.clone());

        Self {
            inner: Arc::new(Inner {
                config,
                sessions,
                throttle,
                store: deps.store,
                collector,
                processor,
                alerts,
                tenants: RwLock::new(BTreeMap::new()),
                syncing: Mutex::new(HashSet::new()),
                channel_faults: Mutex::new(HashMap::new()),
                tenant_faults: Mutex::new(HashMap::new()),
                refresh_queue: Mutex::new(BTreeSet::new()),
                refresh_notify: Notify::new(),
            }),
        }
    }

    /// Register every configured tenant and re-attach open alerts.
    ///
    /// # Errors
    ///
    /// Fails on a malformed credential blob or a credential store error.
    pub async fn bootstrap(&self) -> Result<()> {
        let tenants = self.inner.config.tenants.clone();
        for tenant in tenants {
            let blob = decode_blob(&tenant.credential)?;
            self.add_tenant(&tenant.id, blob, tenant.channels).await?;
        }
        let restored = self.inner.alerts.restore().await?;
        if restored > 0 {
            info!(restored, "re-attached open alerts");
        }
        Ok(())
    }

    /// Register a tenant's sealed credential and the channels it collects.
    ///
    /// # Errors
    ///
    /// Fails if the credential store rejects the blob.
    pub async fn add_tenant(
        &self,
        tenant: &TenantId,
        blob: Vec<u8>,
        channels: Vec<ChannelId>,
    ) -> Result<()> {
        self.inner.sessions.register(tenant, blob).await?;
        self.inner.tenant_faults.lock().remove(tenant);
        info!(tenant_id = %tenant, channels = channels.len(), "tenant registered");
        self.inner.tenants.write().insert(tenant.clone(), channels);
        Ok(())
    }

    /// Cancel the tenant's in-flight collection and drop its session.
    ///
    /// Pages already handed to the aggregator still commit; everything past
    /// them is discarded with the watermark untouched. The tenant stays
    /// configured and reconnects on its next cycle.
    pub async fn disconnect_tenant(&self, tenant: &TenantId) -> bool {
        let blob = self.inner.sessions.session(tenant).map(|s| s.encrypted_credential_blob);
        let disconnected = self.inner.sessions.disconnect(tenant).await;
        self.inner.throttle.forget(tenant);
        if let Some(blob) = blob {
            if let Err(err) = self.inner.sessions.register(tenant, blob).await {
                warn!(tenant_id = %tenant, error = %err, "re-registering disconnected tenant failed");
            }
        }
        disconnected
    }

    /// Remove a tenant entirely.
    pub async fn remove_tenant(&self, tenant: &TenantId) -> bool {
        let removed = self.inner.tenants.write().remove(tenant).is_some();
        self.inner.sessions.disconnect(tenant).await;
        self.inner.throttle.forget(tenant);
        self.inner.tenant_faults.lock().remove(tenant);
        removed
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.inner.sessions
    }

    #[must_use]
    pub fn throttle(&self) -> &Arc<ThrottleGuard> {
        &self.inner.throttle
    }

    #[must_use]
    pub fn processor(&self) -> &BatchProcessor {
        &self.inner.processor
    }

    #[must_use]
    pub fn alerts(&self) -> &Arc<AlertEvaluator> {
        &self.inner.alerts
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn MetricsStore> {
        &self.inner.store
    }

    #[must_use]
    pub fn owner_of(&self, channel: ChannelId) -> Option<TenantId> {
        self.inner.owner_of(channel)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Cycles
    // ─────────────────────────────────────────────────────────────────────

    /// Collect and aggregate every configured channel once.
    ///
    /// Queued refreshes are covered by the full cycle and are dropped.
    pub async fn run_cycle(&self) -> CycleReport {
        self.inner.refresh_queue.lock().clear();
        let targets = self.inner.tenants.read().clone();
        self.run_targets(targets).await
    }

    /// Queue an on-demand collection of one channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no tenant collects the channel.
    pub fn refresh(&self, channel: ChannelId) -> Result<()> {
        if self.inner.owner_of(channel).is_none() {
            return Err(Error::Config(format!("channel {channel} is not configured")));
        }
        self.inner.refresh_queue.lock().insert(channel);
        self.inner.refresh_notify.notify_one();
        debug!(channel_id = %channel, "refresh queued");
        Ok(())
    }

    /// Run queued refreshes, if any.
    pub async fn run_refreshes(&self) -> Option<CycleReport> {
        let queued = std::mem::take(&mut *self.inner.refresh_queue.lock());
        if queued.is_empty() {
            return None;
        }
        let mut targets: BTreeMap<TenantId, Vec<ChannelId>> = BTreeMap::new();
        for channel in queued {
            if let Some(owner) = self.inner.owner_of(channel) {
                targets.entry(owner).or_default().push(channel);
            }
        }
        Some(self.run_targets(targets).await)
    }

    async fn run_targets(&self, targets: BTreeMap<TenantId, Vec<ChannelId>>) -> CycleReport {
        let (tx, rx) = mpsc::channel::<ChannelGroup>(self.inner.config.collector.queue_depth.max(1));
        let mut flows = JoinSet::new();
        for (tenant, channels) in targets {
            if channels.is_empty() {
                continue;
            }
            flows.spawn(Arc::clone(&self.inner).collect_tenant(tenant, channels, tx.clone()));
        }
        drop(tx);

        let aggregate = self.inner.processor.process_groups(ReceiverStream::new(rx));
        let join = async {
            let mut tenants = BTreeMap::new();
            while let Some(joined) = flows.join_next().await {
                match joined {
                    Ok((tenant, report)) => {
                        tenants.insert(tenant, report);
                    }
                    Err(e) => error!(error = %e, "tenant collection task failed"),
                }
            }
            tenants
        };
        let (summary, tenants) = tokio::join!(aggregate, join);

        info!(
            tenants = tenants.len(),
            channels = summary.channels.len(),
            batch_committed = summary.batch_committed,
            retried_individually = summary.retried_individually,
            failed = summary.failed,
            integrity_errors = summary.integrity_errors,
            "ingest cycle finished"
        );
        CycleReport { tenants, summary }
    }

    /// Drive cycles until `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self
            .inner
            .config
            .collector
            .cycle_interval()
            .max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "ingest engine started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.run_cycle().await;
                    let evicted = self.inner.sessions.evict_idle().await;
                    if evicted > 0 {
                        debug!(evicted, "idle sessions evicted");
                    }
                }
                () = self.inner.refresh_notify.notified() => {
                    self.run_refreshes().await;
                }
            }
        }

        let tenants: Vec<TenantId> = self.inner.tenants.read().keys().cloned().collect();
        for tenant in tenants {
            self.inner.sessions.disconnect(&tenant).await;
        }
        info!("ingest engine stopped");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────────────────

    /// Dashboard-facing sync state.
    ///
    /// A tenant reports the worst state among its channels, with the oldest
    /// sync time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unknown tenant or channel, or a
    /// storage error if watermarks cannot be read.
    pub async fn get_sync_status(&self, target: &SyncTarget) -> Result<SyncReport> {
        match target {
            SyncTarget::Channel(channel) => {
                let owner = self
                    .inner
                    .owner_of(*channel)
                    .ok_or_else(|| Error::Config(format!("channel {channel} is not configured")))?;
                self.channel_status(&owner, *channel, Utc::now()).await
            }
            SyncTarget::Tenant(tenant) => {
                let channels = self
                    .inner
                    .tenants
                    .read()
                    .get(tenant)
                    .cloned()
                    .ok_or_else(|| Error::Config(format!("tenant {tenant} is not configured")))?;
                let now = Utc::now();
                let mut worst: Option<SyncReport> = None;
                let mut oldest: Option<DateTime<Utc>> = None;
                for channel in channels {
                    let report = self.channel_status(tenant, channel, now).await?;
                    if let Some(at) = report.last_synced_at {
                        oldest = Some(oldest.map_or(at, |o| o.min(at)));
                    }
                    if worst.as_ref().is_none_or(|w| severity(&report.status) > severity(&w.status)) {
                        worst = Some(report);
                    }
                }
                let status = match worst {
                    Some(report) => report.status,
                    None if self.inner.reconnect_required(tenant) => SyncStatus::ReconnectRequired,
                    None => SyncStatus::NeverSynced,
                };
                Ok(SyncReport {
                    last_synced_at: oldest,
                    status,
                })
            }
        }
    }

    async fn channel_status(
        &self,
        tenant: &TenantId,
        channel: ChannelId,
        now: DateTime<Utc>,
    ) -> Result<SyncReport> {
        let last_synced_at = self
            .inner
            .store
            .watermark(channel)
            .await?
            .map(|w| w.last_synced_at);

        let status = if self.inner.reconnect_required(tenant) {
            SyncStatus::ReconnectRequired
        } else if self.inner.processor.is_halted(channel) {
            SyncStatus::NeedsReconciliation
        } else if let Some(fault) = self.inner.fault_for(tenant, channel) {
            SyncStatus::Stalled {
                since: last_synced_at.unwrap_or(fault.since),
                reason: fault.reason,
            }
        } else if self.inner.syncing.lock().contains(&channel) {
            SyncStatus::Syncing
        } else {
            match last_synced_at {
                None => SyncStatus::NeverSynced,
                Some(at) if self.inner.is_stale(at, now) => SyncStatus::Stale { since: at },
                Some(_) => SyncStatus::Ok,
            }
        };
        Ok(SyncReport {
            last_synced_at,
            status,
        })
    }
}

const fn severity(status: &SyncStatus) -> u8 {
    match status {
        SyncStatus::Ok => 0,
        SyncStatus::Syncing => 1,
        SyncStatus::NeverSynced => 2,
        SyncStatus::Stale { .. } => 3,
        SyncStatus::Stalled { .. } => 4,
        SyncStatus::NeedsReconciliation => 5,
        SyncStatus::ReconnectRequired => 6,
    }
}

impl Inner {
    fn owner_of(&self, channel: ChannelId) -> Option<TenantId> {
        self.tenants
            .read()
            .iter()
            .find(|(_, channels)| channels.contains(&channel))
            .map(|(tenant, _)| tenant.clone())
    }

    fn reconnect_required(&self, tenant: &TenantId) -> bool {
        self.sessions.session(tenant).is_some_and(|s| s.auth_expired)
    }

    fn is_stale(&self, last: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let stale_after = i64::try_from(self.config.collector.stale_after_secs).unwrap_or(i64::MAX);
        (now - last).num_seconds() > stale_after
    }

    fn fault_for(&self, tenant: &TenantId, channel: ChannelId) -> Option<Fault> {
        self.channel_faults
            .lock()
            .get(&channel)
            .cloned()
            .or_else(|| self.tenant_faults.lock().get(tenant).cloned())
    }

    fn set_fault(&self, channel: ChannelId, reason: String) {
        self.channel_faults.lock().insert(
            channel,
            Fault {
                since: Utc::now(),
                reason,
            },
        );
    }

    async fn collect_tenant(
        self: Arc<Self>,
        tenant: TenantId,
        channels: Vec<ChannelId>,
        tx: mpsc::Sender<ChannelGroup>,
    ) -> (TenantId, TenantReport) {
        let mut report = TenantReport {
            channels: channels.len(),
            ..TenantReport::default()
        };

        let handle = match self.sessions.acquire(&tenant).await {
            Ok(handle) => {
                self.tenant_faults.lock().remove(&tenant);
                handle
            }
            Err(err) => {
                match &err {
                    SessionError::FloodWait { .. } => {
                        debug!(tenant_id = %tenant, error = %err, "tenant flood-waiting, skipping cycle");
                    }
                    SessionError::AuthExpired(_) => {
                        warn!(tenant_id = %tenant, "tenant needs to reconnect");
                    }
                    SessionError::Reset(_) => {
                        debug!(tenant_id = %tenant, "session reset during connect, skipping cycle");
                    }
                    _ => {
                        warn!(tenant_id = %tenant, error = %err, "session unavailable");
                        self.tenant_faults.lock().insert(
                            tenant.clone(),
                            Fault {
                                since: Utc::now(),
                                reason: err.to_string(),
                            },
                        );
                    }
                }
                report.error = Some(err.to_string());
                return (tenant, report);
            }
        };

        for channel in channels {
            if self.processor.is_halted(channel) {
                warn!(channel_id = %channel, "channel halted pending reconciliation, skipping");
                continue;
            }

            self.syncing.lock().insert(channel);
            let outcome = self.collect_channel(&handle, channel, &tx, &mut report).await;
            self.syncing.lock().remove(&channel);

            let Err(err) = outcome else {
                self.channel_faults.lock().remove(&channel);
                continue;
            };
            report.interrupted += 1;
            match err {
                CollectError::Cancelled => {
                    info!(tenant_id = %tenant, channel_id = %channel, "collection cancelled");
                    report.error = Some(err.to_string());
                    break;
                }
                CollectError::Throttle(ref throttle) if throttle.is_auth() => {
                    warn!(tenant_id = %tenant, error = %err, "platform rejected session");
                    drop(handle);
                    self.sessions.invalidate(&tenant).await;
                    report.error = Some(err.to_string());
                    return (tenant, report);
                }
                CollectError::Throttle(
                    ThrottleError::Stalled { .. } | ThrottleError::CircuitOpen { .. },
                ) => {
                    warn!(tenant_id = %tenant, channel_id = %channel, error = %err, "tenant collection stalled");
                    self.set_fault(channel, err.to_string());
                    report.error = Some(err.to_string());
                    break;
                }
                CollectError::Throttle(_) | CollectError::Store(_) => {
                    warn!(tenant_id = %tenant, channel_id = %channel, error = %err, "channel collection failed");
                    self.set_fault(channel, err.to_string());
                    report.error = Some(err.to_string());
                }
            }
        }
        (tenant, report)
    }

    async fn collect_channel(
        &self,
        handle: &crate::session::SessionHandle,
        channel: ChannelId,
        tx: &mpsc::Sender<ChannelGroup>,
        report: &mut TenantReport,
    ) -> std::result::Result<(), CollectError> {
        let mut pages = std::pin::pin!(self.collector.collect(handle, channel));
        let mut sent = 0_usize;
        while let Some(page) = pages.next().await {
            let page = page?;
            report.pages += 1;
            report.events += page.events.len();
            if tx.send(ChannelGroup::from(page)).await.is_err() {
                error!(channel_id = %channel, "aggregator queue closed");
                return Err(CollectError::Cancelled);
            }
            sent += 1;
        }
        if sent == 0 {
            self.mark_synced(channel).await;
        }
        Ok(())
    }

    /// Record a completed sync for a channel with nothing new, leaving its
    /// watermark in place.
    async fn mark_synced(&self, channel: ChannelId) {
        let result = async {
            let current = self
                .store
                .watermark(channel)
                .await?
                .map_or(0, |w| w.last_event_id);
            self.store.advance_watermark(channel, current, current).await
        }
        .await;
        if let Err(err) = result {
            debug!(channel_id = %channel, error = %err, "sync time not recorded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentialStore;
    use crate::store::MemoryMetricsStore;
    use crate::testkit::{ScriptedConnector, ScriptedPlatform};
    use chanpulse_core::PlatformError;
    use pretty_assertions::assert_eq;

    const KEY: [u8; 32] = [9; 32];

    struct Fixture {
        engine: IngestEngine,
        platform: Arc<ScriptedPlatform>,
        store: Arc<MemoryMetricsStore>,
    }

    async fn fixture(tenants: &[(&str, &[i64])]) -> Fixture {
        let mut config = Config::default();
        config.collector.page_size = 10;
        config.backoff.jitter = false;
        config.backoff.max_retries = 0;
        let platform = Arc::new(ScriptedPlatform::new());
        let store = Arc::new(MemoryMetricsStore::new());
        let cipher = Arc::new(CredentialCipher::new(KEY));
        let engine = IngestEngine::new(
            config,
            EngineDeps {
                connector: Arc::new(ScriptedConnector::new(Arc::clone(&platform))),
                store: store.clone(),
                credentials: Arc::new(MemoryCredentialStore::new()),
                cipher: Arc::clone(&cipher),
                notifiers: NotifierSet::new(),
            },
        );
        for (tenant, channels) in tenants {
            let id = TenantId::new(*tenant);
            let blob = cipher.seal(&id, "secret").unwrap();
            let channels = channels.iter().copied().map(ChannelId::new).collect();
            engine.add_tenant(&id, blob, channels).await.unwrap();
        }
        Fixture {
            engine,
            platform,
            store,
        }
    }

    #[tokio::test]
    async fn cycle_collects_every_channel_and_advances_watermarks() {
        let f = fixture(&[("a", &[1, 2]), ("b", &[3])]).await;
        for channel in [1, 2, 3] {
            f.platform.seed(ChannelId::new(channel), 1..=25);
        }

        let report = f.engine.run_cycle().await;
        assert_eq!(report.tenants.len(), 2);
        assert_eq!(report.tenants[&TenantId::new("a")].pages, 6);
        assert_eq!(report.summary.integrity_errors, 0);
        for channel in [1, 2, 3] {
            let mark = f.store.watermark(ChannelId::new(channel)).await.unwrap().unwrap();
            assert_eq!(mark.last_event_id, 25);
        }

        let again = f.engine.run_cycle().await;
        assert_eq!(again.tenants[&TenantId::new("b")].pages, 0);
        assert_eq!(
            f.engine.get_sync_status(&SyncTarget::Tenant(TenantId::new("a"))).await.unwrap().status,
            SyncStatus::Ok
        );
    }

    #[tokio::test]
    async fn refresh_collects_only_the_queued_channel() {
        let f = fixture(&[("a", &[1, 2])]).await;
        f.platform.seed(ChannelId::new(1), 1..=5);
        f.platform.seed(ChannelId::new(2), 1..=5);

        f.engine.refresh(ChannelId::new(2)).unwrap();
        let report = f.engine.run_refreshes().await.unwrap();
        assert_eq!(report.summary.channels.len(), 1);
        assert!(f.store.watermark(ChannelId::new(1)).await.unwrap().is_none());
        assert!(f.engine.run_refreshes().await.is_none());
        assert!(f.engine.refresh(ChannelId::new(99)).is_err());
    }

    #[tokio::test]
    async fn auth_rejection_reports_reconnect_required() {
        let f = fixture(&[("a", &[1]), ("b", &[2])]).await;
        f.platform.seed(ChannelId::new(1), 1..=5);
        f.platform.seed(ChannelId::new(2), 1..=5);
        f.platform.fail_channel(ChannelId::new(1), PlatformError::Auth("revoked".into()));

        let report = f.engine.run_cycle().await;
        assert!(report.tenants[&TenantId::new("a")].error.is_some());
        assert_eq!(
            f.engine.get_sync_status(&SyncTarget::Channel(ChannelId::new(1))).await.unwrap().status,
            SyncStatus::ReconnectRequired
        );
        assert_eq!(
            f.engine.get_sync_status(&SyncTarget::Channel(ChannelId::new(2))).await.unwrap().status,
            SyncStatus::Ok,
            "other tenants are unaffected"
        );
    }

    #[tokio::test]
    async fn quiet_channels_stay_fresh_after_a_clean_cycle() {
        let f = fixture(&[("a", &[1, 2])]).await;
        let (busy, empty) = (ChannelId::new(1), ChannelId::new(2));
        f.platform.seed(busy, 1..=5);
        f.engine.run_cycle().await;
        let first = f.store.watermark(busy).await.unwrap().unwrap().last_synced_at;

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let report = f.engine.run_cycle().await;
        assert!(report.tenants[&TenantId::new("a")].error.is_none());
        assert_eq!(report.tenants[&TenantId::new("a")].pages, 0);

        let mark = f.store.watermark(busy).await.unwrap().unwrap();
        assert_eq!(mark.last_event_id, 5);
        assert!(mark.last_synced_at > first, "clean cycle refreshes the sync time");

        // Stale when measured from the first sync, fresh from the second.
        let at = first + chrono::Duration::milliseconds(1_801_500);
        let status = f.engine.channel_status(&TenantId::new("a"), busy, at).await.unwrap();
        assert_eq!(status.status, SyncStatus::Ok);

        let status = f
            .engine
            .get_sync_status(&SyncTarget::Channel(empty))
            .await
            .unwrap();
        assert_eq!(status.status, SyncStatus::Ok, "a synced empty channel is not NeverSynced");
        assert_eq!(f.store.watermark(empty).await.unwrap().unwrap().last_event_id, 0);
    }

    #[tokio::test]
    async fn never_synced_and_stale_channels() {
        let f = fixture(&[("a", &[1])]).await;
        let report = f
            .engine
            .get_sync_status(&SyncTarget::Channel(ChannelId::new(1)))
            .await
            .unwrap();
        assert_eq!(report.status, SyncStatus::NeverSynced);

        f.store.force_watermark(ChannelId::new(1), 4);
        let synced = f.store.watermark(ChannelId::new(1)).await.unwrap().unwrap().last_synced_at;
        let later = synced + chrono::Duration::hours(2);
        let report = f
            .engine
            .channel_status(&TenantId::new("a"), ChannelId::new(1), later)
            .await
            .unwrap();
        assert_eq!(report.status, SyncStatus::Stale { since: synced });
        assert!(report.status.describe().starts_with("stale data since"));
    }
}

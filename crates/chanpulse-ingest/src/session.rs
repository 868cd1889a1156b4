//! Tenant session registry.
//!
//! The [`SessionManager`] owns every tenant's protocol session. Sessions are
//! connected lazily on first [`SessionManager::acquire`], shared between a
//! tenant's concurrent collectors through leased [`SessionHandle`]s, and
//! capped at `max_active` live sessions across all tenants. When the pool is
//! full the least-recently-used session with no outstanding leases is
//! disconnected to make room.
//!
//! State machine per tenant:
//!
//! ```text
//! Disconnected ─▶ Connecting ─▶ Active ─▶ FloodWaiting ─▶ Active
//!      ▲                          │
//!      └──── idle-evicted ────────┤
//!      └──── Error ◀──────────────┘
//! ```
//!
//! Plaintext credentials exist only inside [`SessionManager::acquire`] while
//! the connection is being established.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chanpulse_core::config::SessionConfig;
use chanpulse_core::{
    CancelSource, CancelToken, PlatformError, SessionStatus, TenantId, TenantSession,
};
use chanpulse_ratelimit::ThrottleObserver;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{PlatformConnector, PlatformSession};
use crate::credentials::{CredentialCipher, CredentialError, CredentialStore};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("tenant {0} has no registered credential")]
    NotConfigured(TenantId),

    #[error("tenant {0} must re-register: session authorization expired")]
    AuthExpired(TenantId),

    #[error("tenant {tenant_id} is flood-waiting for {}s", retry_after.as_secs())]
    FloodWait {
        tenant_id: TenantId,
        retry_after: Duration,
    },

    #[error("tenant {0} session was reset while connecting")]
    Reset(TenantId),

    #[error("session pool exhausted ({max_active} sessions leased)")]
    PoolExhausted { max_active: usize },

    #[error("tenant {tenant_id}: connect failed: {source}")]
    Connect {
        tenant_id: TenantId,
        #[source]
        source: PlatformError,
    },

    #[error(transparent)]
    Credential(#[from] CredentialError),
}

impl From<SessionError> for chanpulse_core::Error {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotConfigured(tenant_id) => {
                Self::Config(format!("tenant {tenant_id} is not registered"))
            }
            SessionError::AuthExpired(tenant_id) => Self::Auth {
                tenant_id,
                message: "session authorization expired".to_string(),
            },
            SessionError::FloodWait { retry_after, .. } => Self::FloodWait { retry_after },
            SessionError::Reset(_) => Self::Cancelled,
            SessionError::PoolExhausted { max_active } => {
                Self::Network(format!("session pool exhausted ({max_active})"))
            }
            SessionError::Connect { source, .. } => source.into(),
            SessionError::Credential(e) => e.into(),
        }
    }
}

static GENERATION: AtomicU64 = AtomicU64::new(0);

fn next_generation() -> u64 {
    GENERATION.fetch_add(1, Ordering::Relaxed) + 1
}

struct Entry {
    blob: Vec<u8>,
    status: SessionStatus,
    session: Option<Arc<dyn PlatformSession>>,
    leases: usize,
    /// Replaced whenever the live session is replaced or torn down, so stale
    /// handles cannot release leases of a newer session. Unique across
    /// entries, so a re-registered tenant never reuses one.
    generation: u64,
    last_used: Instant,
    last_used_at: Option<DateTime<Utc>>,
    flood_wait_until: Option<Instant>,
    flood_wait_until_at: Option<DateTime<Utc>>,
    auth_expired: bool,
    cancel: CancelSource,
    connect_gate: Arc<tokio::sync::Mutex<()>>,
}

impl Entry {
    fn new(blob: Vec<u8>) -> Self {
        Self {
            blob,
            status: SessionStatus::Disconnected,
            session: None,
            leases: 0,
            generation: next_generation(),
            last_used: Instant::now(),
            last_used_at: None,
            flood_wait_until: None,
            flood_wait_until_at: None,
            auth_expired: false,
            cancel: CancelSource::new(),
            connect_gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn occupies_slot(&self) -> bool {
        self.status.is_live() || self.status == SessionStatus::Connecting
    }

    fn flood_remaining(&mut self, now: Instant) -> Option<Duration> {
        match self.flood_wait_until {
            Some(until) if until > now => Some(until - now),
            Some(_) => {
                self.flood_wait_until = None;
                self.flood_wait_until_at = None;
                if self.status == SessionStatus::FloodWaiting {
                    self.status = SessionStatus::Active;
                }
                None
            }
            None => None,
        }
    }

    /// Detach the live session and invalidate outstanding handles.
    fn teardown(&mut self, status: SessionStatus) -> Option<Arc<dyn PlatformSession>> {
        self.status = status;
        self.leases = 0;
        self.generation = next_generation();
        self.session.take()
    }

    fn snapshot(&self, tenant: &TenantId) -> TenantSession {
        TenantSession {
            tenant_id: tenant.clone(),
            encrypted_credential_blob: self.blob.clone(),
            status: self.status,
            last_used_at: self.last_used_at,
            flood_wait_until: self.flood_wait_until_at,
            auth_expired: self.auth_expired,
        }
    }
}

/// Pool-wide view for status output and leak checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub max_active: usize,
    pub live: usize,
    pub leased: usize,
    pub statuses: BTreeMap<TenantId, SessionStatus>,
}

pub struct SessionManager {
    connector: Arc<dyn PlatformConnector>,
    credentials: Arc<dyn CredentialStore>,
    cipher: Arc<CredentialCipher>,
    config: SessionConfig,
    entries: Mutex<HashMap<TenantId, Entry>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.config)
            .field("tenants", &self.entries.lock().len())
            .finish_non_exhaustive()
    }
}

/// Lease on a tenant's live session. Dropping it releases the lease.
pub struct SessionHandle {
    manager: Arc<SessionManager>,
    tenant: TenantId,
    session: Arc<dyn PlatformSession>,
    cancel: CancelToken,
    generation: u64,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("tenant", &self.tenant)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    #[must_use]
    pub const fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    #[must_use]
    pub fn session(&self) -> &dyn PlatformSession {
        self.session.as_ref()
    }

    /// Fires when the tenant is disconnected or invalidated.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.manager.release_lease(&self.tenant, self.generation);
    }
}

impl SessionManager {
    #[must_use]
    pub fn new(
        connector: Arc<dyn PlatformConnector>,
        credentials: Arc<dyn CredentialStore>,
        cipher: Arc<CredentialCipher>,
        config: SessionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            connector,
            credentials,
            cipher,
            config,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Register (or rotate) a tenant's sealed credential.
    ///
    /// Rotation tears down any live session and clears an expired-auth flag.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Credential`] if the credential store rejects
    /// the write.
    pub async fn register(&self, tenant: &TenantId, blob: Vec<u8>) -> Result<(), SessionError> {
        self.credentials.write(tenant, blob.clone()).await?;

        let stale = {
            let mut entries = self.entries.lock();
            match entries.get_mut(tenant) {
                Some(entry) => {
                    entry.blob = blob;
                    entry.auth_expired = false;
                    entry.cancel.cancel();
                    entry.cancel = CancelSource::new();
                    entry.teardown(SessionStatus::Disconnected)
                }
                None => {
                    entries.insert(tenant.clone(), Entry::new(blob));
                    None
                }
            }
        };
        if let Some(session) = stale {
            info!(tenant_id = %tenant, "credential rotated, dropping live session");
            session.disconnect().await;
        }
        Ok(())
    }

    /// Lease the tenant's session, connecting if needed.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotConfigured`] if the tenant was never registered
    /// - [`SessionError::AuthExpired`] if the session was invalidated
    /// - [`SessionError::FloodWait`] while the tenant is throttled
    /// - [`SessionError::PoolExhausted`] if every live session is leased
    /// - [`SessionError::Connect`] / [`SessionError::Credential`] on connect failure
    pub async fn acquire(self: &Arc<Self>, tenant: &TenantId) -> Result<SessionHandle, SessionError> {
        let gate = {
            let mut entries = self.entries.lock();
            let entry = Self::admit(&mut entries, tenant)?;
            if let Some(handle) = self.lease(tenant, entry) {
                return Ok(handle);
            }
            Arc::clone(&entry.connect_gate)
        };

        // One connect per tenant at a time; later callers reuse the result.
        let _connecting = gate.lock().await;

        let (evicted, epoch) = {
            let mut entries = self.entries.lock();
            let entry = Self::admit(&mut entries, tenant)?;
            if let Some(handle) = self.lease(tenant, entry) {
                return Ok(handle);
            }
            let evicted = self.make_room(&mut entries, tenant)?;
            let Some(entry) = entries.get_mut(tenant) else {
                return Err(SessionError::NotConfigured(tenant.clone()));
            };
            if entry.status == SessionStatus::Error {
                debug!(tenant_id = %tenant, "session error cleared");
            }
            entry.status = SessionStatus::Connecting;
            (evicted, entry.generation)
        };
        if let Some((victim, session)) = evicted {
            info!(tenant_id = %victim, "evicted least-recently-used idle session");
            session.disconnect().await;
        }

        let result = self.connect(tenant).await;

        let (outcome, orphan) = {
            let mut entries = self.entries.lock();
            self.settle_connect(&mut entries, tenant, epoch, result)
        };
        if let Some(session) = orphan {
            session.disconnect().await;
        }
        outcome
    }

    /// Attach a finished connect to the entry it was started for.
    ///
    /// Any teardown while connecting (invalidate, rotation, disconnect) moves
    /// the entry's generation, and the new session is handed back for
    /// disconnection instead of being leased.
    fn settle_connect(
        self: &Arc<Self>,
        entries: &mut HashMap<TenantId, Entry>,
        tenant: &TenantId,
        epoch: u64,
        result: Result<Arc<dyn PlatformSession>, SessionError>,
    ) -> (
        Result<SessionHandle, SessionError>,
        Option<Arc<dyn PlatformSession>>,
    ) {
        let Some(entry) = entries.get_mut(tenant) else {
            return (Err(SessionError::NotConfigured(tenant.clone())), result.ok());
        };
        if entry.generation != epoch {
            debug!(tenant_id = %tenant, status = %entry.status, "session reset while connecting");
            let err = if entry.auth_expired {
                SessionError::AuthExpired(tenant.clone())
            } else {
                SessionError::Reset(tenant.clone())
            };
            return (Err(err), result.ok());
        }

        let outcome = match result {
            Ok(session) => {
                entry.session = Some(session);
                entry.status = SessionStatus::Active;
                entry.generation = next_generation();
                info!(tenant_id = %tenant, status = %entry.status, "session connected");
                self.lease(tenant, entry)
                    .ok_or_else(|| SessionError::NotConfigured(tenant.clone()))
            }
            Err(SessionError::Connect {
                source: PlatformError::Auth(message),
                ..
            }) => {
                entry.status = SessionStatus::Disconnected;
                entry.auth_expired = true;
                warn!(tenant_id = %tenant, error = %message, "session authorization rejected");
                Err(SessionError::AuthExpired(tenant.clone()))
            }
            Err(SessionError::Connect {
                source: PlatformError::FloodWait { retry_after },
                ..
            }) => {
                entry.status = SessionStatus::Disconnected;
                entry.flood_wait_until = Some(Instant::now() + retry_after);
                entry.flood_wait_until_at = chrono::Duration::from_std(retry_after)
                    .ok()
                    .map(|d| Utc::now() + d);
                Err(SessionError::FloodWait {
                    tenant_id: tenant.clone(),
                    retry_after,
                })
            }
            Err(err) => {
                // Stays Error until the next acquire retries the connect.
                entry.status = SessionStatus::Error;
                warn!(tenant_id = %tenant, error = %err, "session connect failed");
                Err(err)
            }
        };
        (outcome, None)
    }

    fn admit<'a>(
        entries: &'a mut HashMap<TenantId, Entry>,
        tenant: &TenantId,
    ) -> Result<&'a mut Entry, SessionError> {
        let entry = entries
            .get_mut(tenant)
            .ok_or_else(|| SessionError::NotConfigured(tenant.clone()))?;
        if entry.auth_expired {
            return Err(SessionError::AuthExpired(tenant.clone()));
        }
        if let Some(retry_after) = entry.flood_remaining(Instant::now()) {
            return Err(SessionError::FloodWait {
                tenant_id: tenant.clone(),
                retry_after,
            });
        }
        Ok(entry)
    }

    fn lease(self: &Arc<Self>, tenant: &TenantId, entry: &mut Entry) -> Option<SessionHandle> {
        if !entry.status.is_live() {
            return None;
        }
        let session = Arc::clone(entry.session.as_ref()?);
        entry.leases += 1;
        entry.last_used = Instant::now();
        entry.last_used_at = Some(Utc::now());
        Some(SessionHandle {
            manager: Arc::clone(self),
            tenant: tenant.clone(),
            session,
            cancel: entry.cancel.token(),
            generation: entry.generation,
        })
    }

    /// Ensure a free slot for `tenant`, evicting the LRU idle session if needed.
    fn make_room(
        &self,
        entries: &mut HashMap<TenantId, Entry>,
        tenant: &TenantId,
    ) -> Result<Option<(TenantId, Arc<dyn PlatformSession>)>, SessionError> {
        let occupied = entries
            .iter()
            .filter(|(id, e)| *id != tenant && e.occupies_slot())
            .count();
        if occupied < self.config.max_active {
            return Ok(None);
        }

        let victim = entries
            .iter()
            .filter(|(id, e)| *id != tenant && e.status.is_live() && e.leases == 0)
            .min_by_key(|(_, e)| e.last_used)
            .map(|(id, _)| id.clone());

        let Some(victim) = victim else {
            return Err(SessionError::PoolExhausted {
                max_active: self.config.max_active,
            });
        };
        let session = entries
            .get_mut(&victim)
            .and_then(|e| e.teardown(SessionStatus::Disconnected));
        Ok(session.map(|s| (victim, s)))
    }

    async fn connect(&self, tenant: &TenantId) -> Result<Arc<dyn PlatformSession>, SessionError> {
        let blob = self.credentials.read(tenant).await?;
        let credential = self.cipher.open(tenant, &blob)?;
        let attempt = tokio::time::timeout(
            self.config.connect_timeout(),
            self.connector.connect(tenant, &credential),
        )
        .await;
        drop(credential);

        match attempt {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(source)) => Err(SessionError::Connect {
                tenant_id: tenant.clone(),
                source,
            }),
            Err(_) => Err(SessionError::Connect {
                tenant_id: tenant.clone(),
                source: PlatformError::Timeout(self.config.connect_timeout()),
            }),
        }
    }

    fn release_lease(&self, tenant: &TenantId, generation: u64) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(tenant) {
            if entry.generation == generation {
                entry.leases = entry.leases.saturating_sub(1);
                entry.last_used = Instant::now();
                entry.last_used_at = Some(Utc::now());
            }
        }
    }

    /// Return a lease. Equivalent to dropping the handle.
    pub fn release(&self, handle: SessionHandle) {
        drop(handle);
    }

    /// Tear down the tenant's session and require re-registration.
    pub async fn invalidate(&self, tenant: &TenantId) {
        let session = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(tenant) else {
                return;
            };
            entry.auth_expired = true;
            entry.cancel.cancel();
            entry.cancel = CancelSource::new();
            entry.teardown(SessionStatus::Disconnected)
        };
        warn!(tenant_id = %tenant, "session invalidated, re-registration required");
        if let Some(session) = session {
            session.disconnect().await;
        }
    }

    /// Cancel the tenant's in-flight work, tear down its session, and forget it.
    ///
    /// Outstanding handles stay valid objects but no longer count as leases.
    pub async fn disconnect(&self, tenant: &TenantId) -> bool {
        let removed = self.entries.lock().remove(tenant);
        let Some(mut entry) = removed else {
            return false;
        };
        entry.cancel.cancel();
        let session = entry.teardown(SessionStatus::Disconnected);
        info!(tenant_id = %tenant, "tenant disconnected");
        if let Some(session) = session {
            session.disconnect().await;
        }
        true
    }

    /// Disconnect unleased sessions idle longer than `idle_timeout`.
    pub async fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout();
        let evicted: Vec<(TenantId, Arc<dyn PlatformSession>)> = {
            let mut entries = self.entries.lock();
            entries
                .iter_mut()
                .filter(|(_, e)| {
                    e.status.is_live()
                        && e.leases == 0
                        && now.duration_since(e.last_used) >= idle_timeout
                })
                .filter_map(|(id, e)| {
                    e.teardown(SessionStatus::Disconnected)
                        .map(|s| (id.clone(), s))
                })
                .collect()
        };
        let count = evicted.len();
        for (tenant, session) in evicted {
            info!(tenant_id = %tenant, "idle session evicted");
            session.disconnect().await;
        }
        count
    }

    #[must_use]
    pub fn session(&self, tenant: &TenantId) -> Option<TenantSession> {
        self.entries.lock().get(tenant).map(|e| e.snapshot(tenant))
    }

    #[must_use]
    pub fn status(&self, tenant: &TenantId) -> Option<SessionStatus> {
        self.entries.lock().get(tenant).map(|e| e.status)
    }

    #[must_use]
    pub fn leases(&self, tenant: &TenantId) -> usize {
        self.entries.lock().get(tenant).map_or(0, |e| e.leases)
    }

    #[must_use]
    pub fn is_registered(&self, tenant: &TenantId) -> bool {
        self.entries.lock().contains_key(tenant)
    }

    /// Cancellation token for the tenant's current flows.
    #[must_use]
    pub fn cancel_token(&self, tenant: &TenantId) -> Option<CancelToken> {
        self.entries.lock().get(tenant).map(|e| e.cancel.token())
    }

    #[must_use]
    pub fn snapshot(&self) -> PoolSnapshot {
        let entries = self.entries.lock();
        PoolSnapshot {
            max_active: self.config.max_active,
            live: entries.values().filter(|e| e.status.is_live()).count(),
            leased: entries.values().map(|e| e.leases).sum(),
            statuses: entries
                .iter()
                .map(|(id, e)| (id.clone(), e.status))
                .collect(),
        }
    }
}

impl ThrottleObserver for SessionManager {
    fn on_flood_wait(&self, tenant: &TenantId, retry_after: Duration) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(tenant) {
            entry.flood_wait_until = Some(Instant::now() + retry_after);
            entry.flood_wait_until_at = chrono::Duration::from_std(retry_after)
                .ok()
                .map(|d| Utc::now() + d);
            if entry.status == SessionStatus::Active {
                entry.status = SessionStatus::FloodWaiting;
                debug!(tenant_id = %tenant, status = %entry.status, "session flood-waiting");
            }
        }
    }

    fn on_flood_wait_cleared(&self, tenant: &TenantId) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(tenant) {
            entry.flood_wait_until = None;
            entry.flood_wait_until_at = None;
            if entry.status == SessionStatus::FloodWaiting {
                entry.status = SessionStatus::Active;
                debug!(tenant_id = %tenant, status = %entry.status, "session resumed");
            }
        }
    }

    fn on_circuit_open(&self, tenant: &TenantId) {
        let session = {
            let mut entries = self.entries.lock();
            entries
                .get_mut(tenant)
                .and_then(|entry| entry.teardown(SessionStatus::Error))
        };
        warn!(tenant_id = %tenant, "circuit open, session marked errored");
        if let Some(session) = session {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move { session.disconnect().await });
            }
        }
    }
}

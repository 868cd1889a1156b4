//! Channel history collection.
//!
//! [`Collector::collect`] pages through a channel's history starting at the
//! persisted watermark. Pages are produced lazily, so a large backlog is never
//! buffered: the consumer pulls the next page only after handling the last.
//! Every fetch goes through the [`ThrottleGuard`]. The collector never moves
//! the watermark; only a committed batch does.

use std::collections::BTreeMap;
use std::sync::Arc;

use chanpulse_core::{ChannelId, RawEvent, WireEvent};
use chanpulse_core::config::CollectorConfig;
use chanpulse_ratelimit::{ThrottleError, ThrottleGuard};
use futures_util::stream::{self, Stream, TryStreamExt};
use thiserror::Error;
use tracing::{debug, warn};

use crate::session::SessionHandle;
use crate::store::{MetricsStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollectError {
    #[error(transparent)]
    Throttle(ThrottleError),

    #[error("reading watermark: {0}")]
    Store(#[from] StoreError),

    #[error("collection cancelled")]
    Cancelled,
}

impl From<ThrottleError> for CollectError {
    fn from(err: ThrottleError) -> Self {
        match err {
            ThrottleError::Cancelled => Self::Cancelled,
            other => Self::Throttle(other),
        }
    }
}

impl From<CollectError> for chanpulse_core::Error {
    fn from(err: CollectError) -> Self {
        match err {
            CollectError::Throttle(e) => e.into(),
            CollectError::Store(e) => e.into(),
            CollectError::Cancelled => Self::Cancelled,
        }
    }
}

/// One validated page of a channel's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedPage {
    pub channel_id: ChannelId,
    /// Cursor the page was fetched from.
    pub after: i64,
    /// Events with `event_id > after`, ascending, deduplicated.
    pub events: Vec<RawEvent>,
    /// Highest id the platform returned, including events dropped by validation.
    pub high: i64,
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    after: i64,
    pages: u32,
    exhausted: bool,
}

#[derive(Clone)]
pub struct Collector {
    throttle: Arc<ThrottleGuard>,
    store: Arc<dyn MetricsStore>,
    page_size: u32,
    max_pages: u32,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("page_size", &self.page_size)
            .field("max_pages", &self.max_pages)
            .finish_non_exhaustive()
    }
}

impl Collector {
    #[must_use]
    pub fn new(
        throttle: Arc<ThrottleGuard>,
        store: Arc<dyn MetricsStore>,
        config: &CollectorConfig,
    ) -> Self {
        Self {
            throttle,
            store,
            page_size: config.page_size.max(1),
            max_pages: config.max_pages_per_cycle.max(1),
        }
    }

    /// Stream the channel's pages past its stored watermark.
    ///
    /// The stream ends when the platform reports no more history, a page comes
    /// back empty, or the per-cycle page budget is spent. After an error the
    /// stream yields nothing more.
    pub fn collect<'a>(
        &'a self,
        session: &'a SessionHandle,
        channel: ChannelId,
    ) -> impl Stream<Item = Result<CollectedPage, CollectError>> + Send + 'a {
        stream::once(async move {
            let after = self
                .store
                .watermark(channel)
                .await?
                .map_or(0, |w| w.last_event_id);
            Ok::<_, CollectError>(self.collect_from(session, channel, after))
        })
        .try_flatten()
    }

    /// Stream pages starting at an explicit cursor.
    pub fn collect_from<'a>(
        &'a self,
        session: &'a SessionHandle,
        channel: ChannelId,
        after: i64,
    ) -> impl Stream<Item = Result<CollectedPage, CollectError>> + Send + 'a {
        let start = Cursor {
            after,
            pages: 0,
            exhausted: false,
        };
        stream::try_unfold(start, move |cursor| async move {
            if cursor.exhausted || cursor.pages >= self.max_pages {
                return Ok(None);
            }
            if session.cancel_token().is_cancelled() {
                return Err(CollectError::Cancelled);
            }

            let page = self.fetch_page(session, channel, cursor.after).await?;
            let Some((page, has_more)) = page else {
                return Ok(None);
            };

            let next = Cursor {
                after: page.high,
                pages: cursor.pages + 1,
                exhausted: !has_more,
            };
            debug!(
                channel_id = %channel,
                page = next.pages,
                events = page.events.len(),
                high = page.high,
                "collected history page"
            );
            Ok(Some((page, next)))
        })
    }

    /// Flatten [`Collector::collect`] into individual events.
    pub fn collect_events<'a>(
        &'a self,
        session: &'a SessionHandle,
        channel: ChannelId,
    ) -> impl Stream<Item = Result<RawEvent, CollectError>> + Send + 'a {
        self.collect(session, channel)
            .map_ok(|page| stream::iter(page.events.into_iter().map(Ok)))
            .try_flatten()
    }

    async fn fetch_page(
        &self,
        session: &SessionHandle,
        channel: ChannelId,
        after: i64,
    ) -> Result<Option<(CollectedPage, bool)>, CollectError> {
        let limit = self.page_size;
        let history = self
            .throttle
            .call(session.tenant(), session.cancel_token(), || {
                session.session().fetch_history(channel, after, limit)
            })
            .await?;

        // The platform may resend events at or below the cursor after a retry.
        let fresh: BTreeMap<i64, &WireEvent> = history
            .events
            .iter()
            .filter(|w| w.id > after)
            .map(|w| (w.id, w))
            .collect();
        let Some(&high) = fresh.keys().next_back() else {
            return Ok(None);
        };

        let mut events = Vec::with_capacity(fresh.len());
        for wire in fresh.values() {
            match RawEvent::from_wire(channel, wire) {
                Ok(event) => events.push(event),
                Err(err) => {
                    warn!(channel_id = %channel, event_id = wire.id, error = %err, "dropping invalid event");
                }
            }
        }

        Ok(Some((
            CollectedPage {
                channel_id: channel,
                after,
                events,
                high,
            },
            history.has_more,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialCipher, MemoryCredentialStore};
    use crate::session::SessionManager;
    use crate::store::MemoryMetricsStore;
    use crate::testkit::{ScriptedConnector, ScriptedPlatform, wire_event};
    use chanpulse_core::config::SessionConfig;
    use chanpulse_core::{Config, TenantId};
    use chanpulse_ratelimit::ThrottleConfig;

    struct Rig {
        platform: Arc<ScriptedPlatform>,
        store: Arc<MemoryMetricsStore>,
        manager: Arc<SessionManager>,
        collector: Collector,
        tenant: TenantId,
    }

    async fn rig(page_size: u32, max_pages: u32) -> Rig {
        let platform = Arc::new(ScriptedPlatform::new());
        let store = Arc::new(MemoryMetricsStore::new());
        let cipher = Arc::new(CredentialCipher::new([1; 32]));
        let manager = SessionManager::new(
            Arc::new(ScriptedConnector::new(Arc::clone(&platform))),
            Arc::new(MemoryCredentialStore::new()),
            Arc::clone(&cipher),
            SessionConfig::default(),
        );
        let tenant = TenantId::new("t");
        manager
            .register(&tenant, cipher.seal(&tenant, "s").unwrap())
            .await
            .unwrap();

        let config = CollectorConfig {
            page_size,
            max_pages_per_cycle: max_pages,
            ..CollectorConfig::default()
        };
        let throttle = Arc::new(ThrottleGuard::new(ThrottleConfig::from_config(&Config::default())));
        let collector = Collector::new(throttle, store.clone(), &config);
        Rig {
            platform,
            store,
            manager,
            collector,
            tenant,
        }
    }

    #[tokio::test]
    async fn resumes_from_the_stored_watermark() {
        let rig = rig(10, 50).await;
        let channel = ChannelId::new(4);
        rig.platform.seed(channel, 1..=25);
        rig.store.force_watermark(channel, 5);

        let handle = rig.manager.acquire(&rig.tenant).await.unwrap();
        let pages: Vec<CollectedPage> = rig.collector.collect(&handle, channel).try_collect().await.unwrap();

        assert_eq!(pages.len(), 2);
        assert_eq!((pages[0].after, pages[0].high), (5, 15));
        assert_eq!((pages[1].after, pages[1].high), (15, 25));
        assert_eq!(rig.platform.fetches(channel), 2, "no fetch after has_more=false");
        assert_eq!(
            rig.store.watermark(channel).await.unwrap().unwrap().last_event_id,
            5,
            "collection never writes watermarks"
        );
    }

    #[tokio::test]
    async fn page_budget_bounds_one_collection() {
        let rig = rig(10, 3).await;
        let channel = ChannelId::new(4);
        rig.platform.seed(channel, 1..=100);

        let handle = rig.manager.acquire(&rig.tenant).await.unwrap();
        let pages: Vec<CollectedPage> = rig.collector.collect(&handle, channel).try_collect().await.unwrap();
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[2].high, 30);
    }

    #[tokio::test]
    async fn events_stream_skips_invalid_events_but_covers_their_ids() {
        let rig = rig(10, 50).await;
        let channel = ChannelId::new(4);
        rig.platform.seed(channel, 1..=6);
        let mut unsupported = wire_event(7);
        unsupported.schema = Some(9);
        rig.platform.push(channel, [unsupported]);

        let handle = rig.manager.acquire(&rig.tenant).await.unwrap();
        let events: Vec<RawEvent> = rig
            .collector
            .collect_events(&handle, channel)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(events.iter().map(|e| e.event_id).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5, 6]);

        let pages: Vec<CollectedPage> = rig.collector.collect(&handle, channel).try_collect().await.unwrap();
        assert_eq!(pages[0].high, 7);
    }

    #[tokio::test]
    async fn cancelled_session_yields_cancelled() {
        let rig = rig(10, 50).await;
        let channel = ChannelId::new(4);
        rig.platform.seed(channel, 1..=5);

        let handle = rig.manager.acquire(&rig.tenant).await.unwrap();
        rig.manager.disconnect(&rig.tenant).await;
        let result: Result<Vec<CollectedPage>, _> = rig.collector.collect(&handle, channel).try_collect().await;
        assert!(matches!(result, Err(CollectError::Cancelled)));
        assert_eq!(rig.platform.fetches(channel), 0);
    }
}

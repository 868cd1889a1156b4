//! Batch analytics processor.
//!
//! Events are grouped by channel and each channel gets its own worker lane,
//! so groups for one channel are applied strictly in arrival order while
//! different channels run in parallel. A semaphore caps how many channel
//! groups are being aggregated and written at once.
//!
//! Per group the worker:
//!
//! 1. reads the stored watermark and drops events at or below it;
//! 2. sorts and deduplicates the rest by id;
//! 3. defers the group if it starts past the stored watermark (a gap);
//! 4. folds the events into the stored per-day rows, skipping events a row
//!    already covers (`applied_through`);
//! 5. commits rows and watermark in one batch, compare-and-set;
//! 6. on a batch failure, writes rows one at a time (each retried once) and
//!    then advances the watermark.
//!
//! A watermark mismatch halts the channel until
//! [`BatchProcessor::clear_reconciliation`] is called.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chanpulse_core::config::BatchConfig;
use chanpulse_core::{AggregatedMetric, ChannelId, MetricName, RawEvent, RunningStats};
use chrono::NaiveDate;
use futures_util::stream::{self, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::collector::CollectedPage;
use crate::store::{MetricKey, MetricsStore, StoreError};

/// Groups queued per channel lane before the dispatcher waits.
const LANE_DEPTH: usize = 4;

/// A run of events for one channel, applied as one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelGroup {
    pub channel_id: ChannelId,
    /// Cursor the events were collected from, when known. A group whose
    /// cursor is past the stored watermark is deferred.
    pub after: Option<i64>,
    /// Highest id covered, including events dropped at validation.
    pub high: i64,
    pub events: Vec<RawEvent>,
}

impl ChannelGroup {
    #[must_use]
    pub fn new(channel_id: ChannelId, events: Vec<RawEvent>) -> Self {
        let high = events.iter().map(|e| e.event_id).max().unwrap_or(0);
        Self {
            channel_id,
            after: None,
            high,
            events,
        }
    }
}

impl From<CollectedPage> for ChannelGroup {
    fn from(page: CollectedPage) -> Self {
        Self {
            channel_id: page.channel_id,
            after: Some(page.after),
            high: page.high,
            events: page.events,
        }
    }
}

/// Ordered by severity; a channel's combined outcome is the worst of its groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelOutcome {
    /// Nothing new to apply.
    Empty,
    /// Rows and watermark committed in one batch.
    Batched,
    /// Batch failed; rows were written individually.
    Fallback,
    /// Group started past the stored watermark; left for a later cycle.
    Deferred,
    /// Watermark mismatch; channel needs reconciliation.
    Halted,
}

/// Per-channel outcome. Counts are metric rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelResult {
    pub committed_count: usize,
    pub failed_count: usize,
    pub new_watermark: i64,
    pub outcome: ChannelOutcome,
}

impl ChannelResult {
    const fn unchanged(watermark: i64, outcome: ChannelOutcome) -> Self {
        Self {
            committed_count: 0,
            failed_count: 0,
            new_watermark: watermark,
            outcome,
        }
    }

    fn absorb(&mut self, other: &Self) {
        self.committed_count += other.committed_count;
        self.failed_count += other.failed_count;
        self.new_watermark = self.new_watermark.max(other.new_watermark);
        self.outcome = self.outcome.max(other.outcome);
    }
}

/// Outcome of one `process` call. Counters other than `failed` count channel
/// groups; `failed` counts metric rows that were skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub channels: BTreeMap<ChannelId, ChannelResult>,
    pub batch_committed: usize,
    pub fallback_committed: usize,
    pub retried_individually: usize,
    pub failed: usize,
    pub deferred: usize,
    pub integrity_errors: usize,
}

impl JobSummary {
    fn record(&mut self, channel: ChannelId, result: &ChannelResult) {
        match result.outcome {
            ChannelOutcome::Batched => self.batch_committed += 1,
            ChannelOutcome::Fallback => {
                self.retried_individually += 1;
                if result.failed_count == 0 {
                    self.fallback_committed += 1;
                }
            }
            ChannelOutcome::Deferred => self.deferred += 1,
            ChannelOutcome::Halted => self.integrity_errors += 1,
            ChannelOutcome::Empty => {}
        }
        self.failed += result.failed_count;
        self.channels
            .entry(channel)
            .and_modify(|existing| existing.absorb(result))
            .or_insert(*result);
    }

    /// Fold another summary in.
    pub fn merge(&mut self, other: Self) {
        self.batch_committed += other.batch_committed;
        self.fallback_committed += other.fallback_committed;
        self.retried_individually += other.retried_individually;
        self.failed += other.failed;
        self.deferred += other.deferred;
        self.integrity_errors += other.integrity_errors;
        for (channel, result) in other.channels {
            self.channels
                .entry(channel)
                .and_modify(|existing| existing.absorb(&result))
                .or_insert(result);
        }
    }

    /// Groups whose rows all reached the store.
    #[must_use]
    pub const fn committed_groups(&self) -> usize {
        self.batch_committed + self.fallback_committed
    }
}

/// Instrumentation hook around each channel group.
pub trait ProcessorObserver: Send + Sync {
    fn on_worker_start(&self, _channel: ChannelId) {}
    fn on_worker_finish(&self, _channel: ChannelId, _result: &ChannelResult) {}
}

/// Receives the latest value of every metric a commit touched.
#[async_trait]
pub trait MetricSink: Send + Sync {
    async fn observe(&self, channel: ChannelId, metric: MetricName, value: f64);
}

struct Inner {
    store: Arc<dyn MetricsStore>,
    config: BatchConfig,
    permits: Arc<Semaphore>,
    channel_locks: Mutex<HashMap<ChannelId, Arc<tokio::sync::Mutex<()>>>>,
    halted: Mutex<HashSet<ChannelId>>,
    observer: RwLock<Option<Arc<dyn ProcessorObserver>>>,
    sink: RwLock<Option<Arc<dyn MetricSink>>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[derive(Clone)]
pub struct BatchProcessor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BatchProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("config", &self.inner.config)
            .field("halted", &self.inner.halted.lock().len())
            .finish_non_exhaustive()
    }
}

impl BatchProcessor {
    #[must_use]
    pub fn new(store: Arc<dyn MetricsStore>, config: BatchConfig) -> Self {
        let workers = config.max_channel_workers.max(1);
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                permits: Arc::new(Semaphore::new(workers)),
                channel_locks: Mutex::new(HashMap::new()),
                halted: Mutex::new(HashSet::new()),
                observer: RwLock::new(None),
                sink: RwLock::new(None),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set_observer(&self, observer: Arc<dyn ProcessorObserver>) {
        *self.inner.observer.write() = Some(observer);
    }

    pub fn set_sink(&self, sink: Arc<dyn MetricSink>) {
        *self.inner.sink.write() = Some(sink);
    }

    /// Most channel groups ever processed at the same time.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.inner.peak.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_halted(&self, channel: ChannelId) -> bool {
        self.inner.halted.lock().contains(&channel)
    }

    #[must_use]
    pub fn halted_channels(&self) -> Vec<ChannelId> {
        let mut halted: Vec<_> = self.inner.halted.lock().iter().copied().collect();
        halted.sort_unstable();
        halted
    }

    /// Resume a halted channel after its store state was reconciled.
    pub fn clear_reconciliation(&self, channel: ChannelId) -> bool {
        let cleared = self.inner.halted.lock().remove(&channel);
        if cleared {
            info!(channel_id = %channel, "channel reconciliation cleared");
        }
        cleared
    }

    /// Aggregate a stream of events.
    ///
    /// In memory-optimized mode events are cut into chunks of `flush_size`
    /// (or whatever arrived within `flush_interval`) and streamed to the
    /// channel lanes; chunks for one channel apply in arrival order, so
    /// events should arrive ascending per channel. Otherwise the whole set is
    /// grouped first and each channel is applied as one sorted group.
    pub async fn process<S>(&self, events: S) -> JobSummary
    where
        S: Stream<Item = RawEvent> + Send,
    {
        if self.inner.config.memory_optimized {
            let size = self.inner.config.flush_size.max(1);
            let interval = self.inner.config.flush_interval().max(Duration::from_millis(1));
            let chunks = tokio_stream::StreamExt::chunks_timeout(events, size, interval);
            let groups = chunks.flat_map(|chunk| stream::iter(group_events(chunk)));
            self.process_groups(groups).await
        } else {
            let all: Vec<RawEvent> = events.collect().await;
            self.process_groups(stream::iter(group_events(all))).await
        }
    }

    /// Aggregate prepared channel groups.
    pub async fn process_groups<S>(&self, groups: S) -> JobSummary
    where
        S: Stream<Item = ChannelGroup> + Send,
    {
        let mut lanes: HashMap<ChannelId, mpsc::Sender<ChannelGroup>> = HashMap::new();
        let mut workers = JoinSet::new();
        let mut groups = std::pin::pin!(groups);

        while let Some(group) = groups.next().await {
            let channel = group.channel_id;
            let lane = lanes.entry(channel).or_insert_with(|| {
                let (tx, rx) = mpsc::channel(LANE_DEPTH);
                workers.spawn(Arc::clone(&self.inner).run_lane(channel, rx));
                tx
            });
            if lane.send(group).await.is_err() {
                error!(channel_id = %channel, "channel lane closed, group dropped");
            }
        }
        drop(lanes);

        let mut summary = JobSummary::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(lane_summary) => summary.merge(lane_summary),
                Err(e) => error!(error = %e, "channel worker failed"),
            }
        }
        debug!(
            channels = summary.channels.len(),
            batch_committed = summary.batch_committed,
            retried_individually = summary.retried_individually,
            failed = summary.failed,
            deferred = summary.deferred,
            integrity_errors = summary.integrity_errors,
            "batch job finished"
        );
        summary
    }
}

fn group_events(events: Vec<RawEvent>) -> Vec<ChannelGroup> {
    let mut by_channel: BTreeMap<ChannelId, Vec<RawEvent>> = BTreeMap::new();
    for event in events {
        by_channel.entry(event.channel_id).or_default().push(event);
    }
    by_channel
        .into_iter()
        .map(|(channel, events)| ChannelGroup::new(channel, events))
        .collect()
}

/// Tracks in-flight groups for the peak-concurrency gauge.
struct ActiveGuard<'a> {
    active: &'a AtomicUsize,
}

impl<'a> ActiveGuard<'a> {
    fn enter(active: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = active.fetch_add(1, Ordering::AcqRel) + 1;
        peak.fetch_max(now, Ordering::AcqRel);
        Self { active }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Inner {
    async fn run_lane(
        self: Arc<Self>,
        channel: ChannelId,
        mut rx: mpsc::Receiver<ChannelGroup>,
    ) -> JobSummary {
        let mut summary = JobSummary::default();
        while let Some(group) = rx.recv().await {
            let Ok(_permit) = Arc::clone(&self.permits).acquire_owned().await else {
                break;
            };
            let lock = self.channel_lock(channel);
            let _serial = lock.lock().await;

            let observer = self.observer.read().clone();
            if let Some(observer) = &observer {
                observer.on_worker_start(channel);
            }
            let result = {
                let _active = ActiveGuard::enter(&self.active, &self.peak);
                self.apply_group(group).await
            };
            if let Some(observer) = &observer {
                observer.on_worker_finish(channel, &result);
            }
            summary.record(channel, &result);
        }
        summary
    }

    fn channel_lock(&self, channel: ChannelId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.channel_locks
                .lock()
                .entry(channel)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    fn halt(&self, channel: ChannelId, err: &StoreError) {
        self.halted.lock().insert(channel);
        error!(
            channel_id = %channel,
            error = %err,
            "watermark mismatch, channel halted pending reconciliation"
        );
    }

    async fn apply_group(&self, group: ChannelGroup) -> ChannelResult {
        let channel = group.channel_id;
        // The group's cursor is the last watermark known without a store read.
        let known = group.after.unwrap_or(0);
        let halted = self.halted.lock().contains(&channel);
        let stored = match self.store.watermark(channel).await {
            Ok(found) => found.map_or(0, |w| w.last_event_id),
            Err(err) if halted => {
                debug!(channel_id = %channel, error = %err, "watermark read failed for halted channel");
                known
            }
            Err(err) => {
                warn!(channel_id = %channel, error = %err, "watermark read failed, deferring group");
                return ChannelResult::unchanged(known, ChannelOutcome::Deferred);
            }
        };
        if halted {
            return ChannelResult::unchanged(stored, ChannelOutcome::Halted);
        }

        if group.after.is_some_and(|after| after > stored) {
            debug!(
                channel_id = %channel,
                after = group.after,
                stored,
                "group starts past the stored watermark, deferring"
            );
            return ChannelResult::unchanged(stored, ChannelOutcome::Deferred);
        }

        let mut events: Vec<RawEvent> = group
            .events
            .into_iter()
            .filter(|e| e.event_id > stored)
            .collect();
        events.sort_by_key(|e| e.event_id);
        events.dedup_by_key(|e| e.event_id);

        let new_watermark = events
            .last()
            .map_or(stored, |e| e.event_id)
            .max(group.high)
            .max(stored);

        if events.is_empty() {
            if new_watermark > stored {
                return match self.store.advance_watermark(channel, stored, new_watermark).await {
                    Ok(()) => ChannelResult::unchanged(new_watermark, ChannelOutcome::Empty),
                    Err(err @ StoreError::WatermarkConflict { .. }) => {
                        self.halt(channel, &err);
                        ChannelResult::unchanged(stored, ChannelOutcome::Halted)
                    }
                    Err(err) => {
                        warn!(channel_id = %channel, error = %err, "watermark advance failed");
                        ChannelResult::unchanged(stored, ChannelOutcome::Empty)
                    }
                };
            }
            return ChannelResult::unchanged(stored, ChannelOutcome::Empty);
        }

        let rows = match self.fold(channel, &events).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(channel_id = %channel, error = %err, "reading stored rows failed, deferring group");
                return ChannelResult::unchanged(stored, ChannelOutcome::Deferred);
            }
        };

        match self
            .store
            .commit_batch(channel, &rows, stored, new_watermark)
            .await
        {
            Ok(()) => {
                self.notify(channel, &rows).await;
                ChannelResult {
                    committed_count: rows.len(),
                    failed_count: 0,
                    new_watermark,
                    outcome: ChannelOutcome::Batched,
                }
            }
            Err(err @ StoreError::WatermarkConflict { .. }) => {
                self.halt(channel, &err);
                ChannelResult::unchanged(stored, ChannelOutcome::Halted)
            }
            Err(err) => {
                warn!(
                    channel_id = %channel,
                    error = %err,
                    rows = rows.len(),
                    "batch commit failed, writing rows individually"
                );
                self.fallback(channel, rows, stored, new_watermark).await
            }
        }
    }

    /// Fold `events` (ascending, all past the watermark) into the stored rows.
    async fn fold(
        &self,
        channel: ChannelId,
        events: &[RawEvent],
    ) -> Result<Vec<AggregatedMetric>, StoreError> {
        let days: Vec<NaiveDate> = events
            .iter()
            .map(RawEvent::date_bucket)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut existing: HashMap<MetricKey, AggregatedMetric> = self
            .store
            .metrics_for(channel, &days)
            .await?
            .into_iter()
            .map(|row| (row.key(), row))
            .collect();

        let mut rows = Vec::new();
        for day in days {
            let day_events: Vec<&RawEvent> =
                events.iter().filter(|e| e.date_bucket() == day).collect();
            for metric in MetricName::ALL {
                let key = (channel, day, metric);
                let mut row = existing
                    .remove(&key)
                    .unwrap_or_else(|| AggregatedMetric::empty(channel, day, metric));
                let fresh = day_events
                    .iter()
                    .filter(|e| e.event_id > row.applied_through);
                let delta = RunningStats::from_samples(fresh.clone().map(|e| metric.sample(e)));
                let Some(through) = fresh.map(|e| e.event_id).max() else {
                    continue;
                };
                if row.apply(&delta, through) {
                    rows.push(row);
                }
            }
        }
        Ok(rows)
    }

    async fn fallback(
        &self,
        channel: ChannelId,
        rows: Vec<AggregatedMetric>,
        stored: i64,
        new_watermark: i64,
    ) -> ChannelResult {
        let mut written = Vec::with_capacity(rows.len());
        let mut failed = 0usize;
        for row in rows {
            let mut last_err = None;
            for _ in 0..2 {
                match self.store.upsert_metric(&row).await {
                    Ok(_) => {
                        last_err = None;
                        break;
                    }
                    Err(err) => last_err = Some(err),
                }
            }
            match last_err {
                None => written.push(row),
                Some(err) => {
                    failed += 1;
                    warn!(
                        channel_id = %channel,
                        date_bucket = %row.date_bucket,
                        metric = %row.metric_name,
                        error = %err,
                        "metric row failed after retry, skipping"
                    );
                }
            }
        }

        self.notify(channel, &written).await;

        let committed_count = written.len();
        match self
            .store
            .advance_watermark(channel, stored, new_watermark)
            .await
        {
            Ok(()) => ChannelResult {
                committed_count,
                failed_count: failed,
                new_watermark,
                outcome: ChannelOutcome::Fallback,
            },
            Err(err @ StoreError::WatermarkConflict { .. }) => {
                self.halt(channel, &err);
                ChannelResult {
                    committed_count,
                    failed_count: failed,
                    new_watermark: stored,
                    outcome: ChannelOutcome::Halted,
                }
            }
            Err(err) => {
                // Rows carry applied_through, so the replay next cycle is a no-op.
                warn!(channel_id = %channel, error = %err, "watermark advance failed after fallback");
                ChannelResult {
                    committed_count,
                    failed_count: failed,
                    new_watermark: stored,
                    outcome: ChannelOutcome::Fallback,
                }
            }
        }
    }

    async fn notify(&self, channel: ChannelId, rows: &[AggregatedMetric]) {
        let sink = self.sink.read().clone();
        let Some(sink) = sink else {
            return;
        };
        let mut latest: BTreeMap<MetricName, &AggregatedMetric> = BTreeMap::new();
        for row in rows {
            latest
                .entry(row.metric_name)
                .and_modify(|current| {
                    if row.date_bucket > current.date_bucket {
                        *current = row;
                    }
                })
                .or_insert(row);
        }
        for (metric, row) in latest {
            sink.observe(channel, metric, row.value).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryMetricsStore;
    use chanpulse_core::{EventPayload, PayloadKind};
    use chrono::{DateTime, Utc};
    use pretty_assertions::assert_eq;

    fn event(channel: i64, id: i64, views: u64) -> RawEvent {
        RawEvent {
            channel_id: ChannelId::new(channel),
            event_id: id,
            occurred_at: DateTime::<Utc>::from_timestamp(1_700_000_000 + id, 0).unwrap(),
            view_count: views,
            forward_count: 1,
            reaction_count: 2,
            payload: EventPayload {
                schema_version: 1,
                kind: PayloadKind::Text,
                text_len: 0,
                has_media: false,
            },
        }
    }

    fn processor(store: &Arc<MemoryMetricsStore>) -> BatchProcessor {
        BatchProcessor::new(
            Arc::clone(store) as Arc<dyn MetricsStore>,
            BatchConfig::default(),
        )
    }

    fn views(store: &MemoryMetricsStore, channel: i64) -> f64 {
        store
            .rows()
            .iter()
            .filter(|r| r.channel_id == ChannelId::new(channel) && r.metric_name == MetricName::Views)
            .map(|r| r.value)
            .sum()
    }

    #[tokio::test]
    async fn batch_commit_writes_rows_and_watermark() {
        let store = Arc::new(MemoryMetricsStore::new());
        let summary = processor(&store)
            .process(stream::iter(vec![event(1, 3, 10), event(1, 1, 20), event(1, 2, 30)]))
            .await;

        let result = summary.channels[&ChannelId::new(1)];
        assert_eq!(result.outcome, ChannelOutcome::Batched);
        assert_eq!(result.new_watermark, 3);
        assert_eq!(result.committed_count, MetricName::ALL.len());
        assert_eq!(summary.batch_committed, 1);
        assert_eq!(views(&store, 1), 60.0);
    }

    #[tokio::test]
    async fn replaying_the_same_events_changes_nothing() {
        let store = Arc::new(MemoryMetricsStore::new());
        let batch = vec![event(1, 1, 10), event(1, 2, 20), event(2, 1, 5)];
        let proc = processor(&store);
        proc.process(stream::iter(batch.clone())).await;
        let before = store.rows();

        let summary = proc.process(stream::iter(batch)).await;
        assert_eq!(store.rows(), before);
        assert!(summary
            .channels
            .values()
            .all(|r| r.outcome == ChannelOutcome::Empty));
    }

    #[tokio::test]
    async fn duplicate_ids_in_one_group_count_once() {
        let store = Arc::new(MemoryMetricsStore::new());
        processor(&store)
            .process(stream::iter(vec![event(1, 1, 10), event(1, 1, 10), event(1, 2, 5)]))
            .await;
        assert_eq!(views(&store, 1), 15.0);
    }

    #[tokio::test]
    async fn failed_batch_falls_back_to_individual_rows() {
        let store = Arc::new(MemoryMetricsStore::new());
        store.fail_batches_for(ChannelId::new(1));
        let summary = processor(&store)
            .process(stream::iter(vec![event(1, 1, 10), event(2, 1, 7)]))
            .await;

        assert_eq!(summary.batch_committed, 1);
        assert_eq!(summary.retried_individually, 1);
        assert_eq!(summary.fallback_committed, 1);
        assert_eq!(summary.channels[&ChannelId::new(1)].new_watermark, 1);
        assert_eq!(views(&store, 1), 10.0);
    }

    #[tokio::test]
    async fn persistently_failing_row_is_skipped() {
        let store = Arc::new(MemoryMetricsStore::new());
        let ch = ChannelId::new(1);
        let day = event(1, 1, 0).date_bucket();
        store.fail_batches_for(ch);
        store.fail_record((ch, day, MetricName::Views), None);

        let summary = processor(&store).process(stream::iter(vec![event(1, 1, 10)])).await;
        let result = summary.channels[&ch];
        assert_eq!(result.outcome, ChannelOutcome::Fallback);
        assert_eq!(result.failed_count, 1);
        assert_eq!(result.committed_count, MetricName::ALL.len() - 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.fallback_committed, 0);
        assert!(store.row(&(ch, day, MetricName::Views)).is_none());
        assert_eq!(result.new_watermark, 1);
    }

    #[tokio::test]
    async fn row_retry_absorbs_a_single_failure() {
        let store = Arc::new(MemoryMetricsStore::new());
        let ch = ChannelId::new(1);
        let day = event(1, 1, 0).date_bucket();
        store.fail_batches_for(ch);
        store.fail_record((ch, day, MetricName::Views), Some(1));

        let summary = processor(&store).process(stream::iter(vec![event(1, 1, 10)])).await;
        assert_eq!(summary.channels[&ch].failed_count, 0);
        assert_eq!(views(&store, 1), 10.0);
    }

    #[tokio::test]
    async fn failed_watermark_advance_replays_idempotently() {
        let store = Arc::new(MemoryMetricsStore::new());
        let ch = ChannelId::new(1);
        store.fail_batches_for(ch);
        store.fail_watermark_for(ch);
        let proc = processor(&store);
        let batch = vec![event(1, 1, 10), event(1, 2, 10)];

        let first = proc.process(stream::iter(batch.clone())).await;
        assert_eq!(first.channels[&ch].new_watermark, 0);
        assert_eq!(views(&store, 1), 20.0);

        store.clear_faults();
        let second = proc.process(stream::iter(batch)).await;
        assert_eq!(second.channels[&ch].new_watermark, 2);
        assert_eq!(views(&store, 1), 20.0, "replay must not double count");
    }

    #[tokio::test]
    async fn gap_in_collected_pages_defers_the_group() {
        let store = Arc::new(MemoryMetricsStore::new());
        let group = ChannelGroup {
            channel_id: ChannelId::new(1),
            after: Some(50),
            high: 60,
            events: vec![event(1, 55, 1)],
        };
        let summary = processor(&store).process_groups(stream::iter(vec![group])).await;
        assert_eq!(summary.deferred, 1);
        assert!(store.rows().is_empty());
    }

    #[tokio::test]
    async fn watermark_mismatch_halts_only_that_channel() {
        #[derive(Clone, Copy)]
        enum Reads {
            Stale,
            Truthful,
            Failing,
        }

        struct StaleReads {
            inner: MemoryMetricsStore,
            reads: Mutex<Reads>,
        }

        #[async_trait]
        impl MetricsStore for StaleReads {
            async fn watermark(
                &self,
                channel: ChannelId,
            ) -> Result<Option<chanpulse_core::ChannelWatermark>, StoreError> {
                let reads = *self.reads.lock();
                match reads {
                    Reads::Stale => Ok(None),
                    Reads::Truthful => self.inner.watermark(channel).await,
                    Reads::Failing => Err(StoreError::Backend("read refused".to_string())),
                }
            }
            async fn watermarks(&self) -> Result<Vec<chanpulse_core::ChannelWatermark>, StoreError> {
                self.inner.watermarks().await
            }
            async fn metrics_for(
                &self,
                channel: ChannelId,
                days: &[NaiveDate],
            ) -> Result<Vec<AggregatedMetric>, StoreError> {
                self.inner.metrics_for(channel, days).await
            }
            async fn commit_batch(
                &self,
                channel: ChannelId,
                rows: &[AggregatedMetric],
                expected: i64,
                new: i64,
            ) -> Result<(), StoreError> {
                self.inner.commit_batch(channel, rows, expected, new).await
            }
            async fn upsert_metric(&self, row: &AggregatedMetric) -> Result<bool, StoreError> {
                self.inner.upsert_metric(row).await
            }
            async fn advance_watermark(
                &self,
                channel: ChannelId,
                expected: i64,
                new: i64,
            ) -> Result<(), StoreError> {
                self.inner.advance_watermark(channel, expected, new).await
            }
            async fn insert_alert(&self, event: &chanpulse_core::AlertEvent) -> Result<(), StoreError> {
                self.inner.insert_alert(event).await
            }
            async fn resolve_alert(
                &self,
                id: uuid::Uuid,
                at: DateTime<Utc>,
            ) -> Result<(), StoreError> {
                self.inner.resolve_alert(id, at).await
            }
            async fn open_alerts(&self) -> Result<Vec<chanpulse_core::AlertEvent>, StoreError> {
                self.inner.open_alerts().await
            }
        }

        let store = Arc::new(StaleReads {
            inner: MemoryMetricsStore::new(),
            reads: Mutex::new(Reads::Stale),
        });
        store.inner.force_watermark(ChannelId::new(1), 100);
        let proc = BatchProcessor::new(store.clone(), BatchConfig::default());

        let summary = proc
            .process(stream::iter(vec![event(1, 101, 1), event(2, 1, 1)]))
            .await;
        assert_eq!(summary.integrity_errors, 1);
        assert_eq!(summary.channels[&ChannelId::new(1)].outcome, ChannelOutcome::Halted);
        assert_eq!(summary.channels[&ChannelId::new(2)].outcome, ChannelOutcome::Batched);
        assert_eq!(proc.halted_channels(), vec![ChannelId::new(1)]);

        *store.reads.lock() = Reads::Truthful;
        let again = proc.process(stream::iter(vec![event(1, 102, 1)])).await;
        assert_eq!(again.channels[&ChannelId::new(1)].outcome, ChannelOutcome::Halted);
        assert_eq!(again.channels[&ChannelId::new(1)].new_watermark, 100, "reports the stored cursor");

        *store.reads.lock() = Reads::Failing;
        let unreadable = ChannelGroup {
            channel_id: ChannelId::new(3),
            after: Some(7),
            high: 9,
            events: vec![event(3, 8, 1)],
        };
        let deferred = proc.process_groups(stream::iter(vec![unreadable])).await;
        assert_eq!(deferred.channels[&ChannelId::new(3)].outcome, ChannelOutcome::Deferred);
        assert_eq!(deferred.channels[&ChannelId::new(3)].new_watermark, 7);

        *store.reads.lock() = Reads::Truthful;
        assert!(proc.clear_reconciliation(ChannelId::new(1)));
        assert!(!proc.is_halted(ChannelId::new(1)));
    }

    #[tokio::test]
    async fn memory_optimized_mode_matches_full_grouping() {
        let events: Vec<RawEvent> = (1..=40).map(|id| event(id % 3, id, 7)).collect();

        let full_store = Arc::new(MemoryMetricsStore::new());
        processor(&full_store).process(stream::iter(events.clone())).await;

        let chunked_store = Arc::new(MemoryMetricsStore::new());
        let config = BatchConfig {
            flush_size: 5,
            memory_optimized: true,
            ..BatchConfig::default()
        };
        let chunked = BatchProcessor::new(chunked_store.clone(), config);
        let summary = chunked.process(stream::iter(events)).await;

        assert!(summary.batch_committed > 3, "expected several chunks per channel");
        for channel in 0..3 {
            assert_eq!(views(&chunked_store, channel), views(&full_store, channel));
        }
        let marks = |store: &MemoryMetricsStore| {
            store
                .rows()
                .iter()
                .map(|r| (r.key(), r.applied_through))
                .collect::<Vec<_>>()
        };
        assert_eq!(marks(&chunked_store), marks(&full_store));
        for channel in 0..3 {
            let ch = ChannelId::new(channel);
            assert_eq!(
                chunked_store.watermark(ch).await.unwrap().map(|w| w.last_event_id),
                full_store.watermark(ch).await.unwrap().map(|w| w.last_event_id)
            );
        }
    }
}

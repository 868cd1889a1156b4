//! Metrics store: aggregated rows, channel watermarks, and alert events.
//!
//! The watermark is advanced only together with the rows that consumed the
//! events up to it: [`MetricsStore::commit_batch`] writes both in one unit of
//! work, compare-and-set on the previous watermark. The per-record fallback
//! path writes rows first and advances the watermark afterwards; rows carry
//! `applied_through`, so replaying the same events after a failed advance is
//! a no-op.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chanpulse_core::{AggregatedMetric, AlertEvent, ChannelId, ChannelWatermark, MetricName};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("storage backend: {0}")]
    Backend(String),

    /// The stored watermark moved since it was read.
    #[error("channel {channel_id}: watermark conflict (expected {expected}, found {found})")]
    WatermarkConflict {
        channel_id: ChannelId,
        expected: i64,
        found: i64,
    },

    #[error("injected failure: {0}")]
    Injected(String),
}

impl From<StoreError> for chanpulse_core::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::WatermarkConflict {
                channel_id,
                expected,
                found,
            } => Self::DataIntegrity {
                channel_id,
                expected,
                found,
            },
            other => Self::Storage(other.to_string()),
        }
    }
}

pub type MetricKey = (ChannelId, NaiveDate, MetricName);

#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn watermark(&self, channel: ChannelId) -> Result<Option<ChannelWatermark>, StoreError>;

    async fn watermarks(&self) -> Result<Vec<ChannelWatermark>, StoreError>;

    /// Stored rows for `channel` on the given days.
    async fn metrics_for(
        &self,
        channel: ChannelId,
        days: &[NaiveDate],
    ) -> Result<Vec<AggregatedMetric>, StoreError>;

    /// Write `rows` and move the watermark from `expected` to `new` atomically.
    ///
    /// `expected` is 0 for a channel that has never synced.
    async fn commit_batch(
        &self,
        channel: ChannelId,
        rows: &[AggregatedMetric],
        expected: i64,
        new: i64,
    ) -> Result<(), StoreError>;

    /// Write one row unless the stored row already covers its events.
    ///
    /// Returns whether the row was written.
    async fn upsert_metric(&self, row: &AggregatedMetric) -> Result<bool, StoreError>;

    async fn advance_watermark(
        &self,
        channel: ChannelId,
        expected: i64,
        new: i64,
    ) -> Result<(), StoreError>;

    async fn insert_alert(&self, event: &AlertEvent) -> Result<(), StoreError>;

    async fn resolve_alert(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn open_alerts(&self) -> Result<Vec<AlertEvent>, StoreError>;
}

/// Checks the compare-and-set precondition shared by both backends.
pub(crate) fn check_advance(
    channel: ChannelId,
    current: i64,
    expected: i64,
    new: i64,
) -> Result<(), StoreError> {
    if current != expected || new < current {
        return Err(StoreError::WatermarkConflict {
            channel_id: channel,
            expected,
            found: current,
        });
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory store
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Faults {
    batch: HashSet<ChannelId>,
    /// Remaining failures per record; `None` fails forever.
    records: HashMap<MetricKey, Option<u32>>,
    watermark: HashSet<ChannelId>,
}

#[derive(Debug, Default)]
struct MemoryState {
    watermarks: HashMap<ChannelId, ChannelWatermark>,
    metrics: BTreeMap<MetricKey, AggregatedMetric>,
    alerts: Vec<AlertEvent>,
    faults: Faults,
    batch_commits: usize,
    record_writes: usize,
}

impl MemoryState {
    fn record_fault(&mut self, key: &MetricKey) -> Option<StoreError> {
        let remaining = self.faults.records.get_mut(key)?;
        match remaining {
            None => {}
            Some(0) => return None,
            Some(n) => *n -= 1,
        }
        Some(StoreError::Injected(format!(
            "record {} {} {}",
            key.0, key.1, key.2
        )))
    }

    fn set_watermark(&mut self, channel: ChannelId, new: i64) {
        self.watermarks.insert(
            channel,
            ChannelWatermark {
                channel_id: channel,
                last_event_id: new,
                last_synced_at: Utc::now(),
            },
        );
    }

    fn current(&self, channel: ChannelId) -> i64 {
        self.watermarks.get(&channel).map_or(0, |w| w.last_event_id)
    }
}

/// Process-local store used when no database is configured, and in tests.
///
/// Faults can be injected per channel batch, per record, or per watermark
/// advance.
#[derive(Debug, Default)]
pub struct MemoryMetricsStore {
    state: Mutex<MemoryState>,
}

impl MemoryMetricsStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every `commit_batch` for `channel`.
    pub fn fail_batches_for(&self, channel: ChannelId) {
        self.state.lock().faults.batch.insert(channel);
    }

    /// Fail `upsert_metric` for one row, `times` times (forever when `None`).
    pub fn fail_record(&self, key: MetricKey, times: Option<u32>) {
        self.state.lock().faults.records.insert(key, times);
    }

    /// Fail `advance_watermark` for `channel`.
    pub fn fail_watermark_for(&self, channel: ChannelId) {
        self.state.lock().faults.watermark.insert(channel);
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults = Faults::default();
    }

    /// Overwrite a watermark, bypassing compare-and-set.
    pub fn force_watermark(&self, channel: ChannelId, last_event_id: i64) {
        self.state.lock().set_watermark(channel, last_event_id);
    }

    #[must_use]
    pub fn rows(&self) -> Vec<AggregatedMetric> {
        self.state.lock().metrics.values().cloned().collect()
    }

    #[must_use]
    pub fn row(&self, key: &MetricKey) -> Option<AggregatedMetric> {
        self.state.lock().metrics.get(key).cloned()
    }

    #[must_use]
    pub fn alerts(&self) -> Vec<AlertEvent> {
        self.state.lock().alerts.clone()
    }

    /// Successful `commit_batch` calls.
    #[must_use]
    pub fn batch_commits(&self) -> usize {
        self.state.lock().batch_commits
    }

    /// Rows written through `upsert_metric`.
    #[must_use]
    pub fn record_writes(&self) -> usize {
        self.state.lock().record_writes
    }
}

#[async_trait]
impl MetricsStore for MemoryMetricsStore {
    async fn watermark(&self, channel: ChannelId) -> Result<Option<ChannelWatermark>, StoreError> {
        Ok(self.state.lock().watermarks.get(&channel).copied())
    }

    async fn watermarks(&self) -> Result<Vec<ChannelWatermark>, StoreError> {
        let mut all: Vec<_> = self.state.lock().watermarks.values().copied().collect();
        all.sort_by_key(|w| w.channel_id);
        Ok(all)
    }

    async fn metrics_for(
        &self,
        channel: ChannelId,
        days: &[NaiveDate],
    ) -> Result<Vec<AggregatedMetric>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .metrics
            .values()
            .filter(|m| m.channel_id == channel && days.contains(&m.date_bucket))
            .cloned()
            .collect())
    }

    async fn commit_batch(
        &self,
        channel: ChannelId,
        rows: &[AggregatedMetric],
        expected: i64,
        new: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.faults.batch.contains(&channel) {
            return Err(StoreError::Injected(format!("batch for channel {channel}")));
        }
        check_advance(channel, state.current(channel), expected, new)?;
        for row in rows {
            state.metrics.insert(row.key(), row.clone());
        }
        state.set_watermark(channel, new);
        state.batch_commits += 1;
        Ok(())
    }

    async fn upsert_metric(&self, row: &AggregatedMetric) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        let key = row.key();
        if let Some(err) = state.record_fault(&key) {
            return Err(err);
        }
        if state
            .metrics
            .get(&key)
            .is_some_and(|stored| stored.applied_through >= row.applied_through)
        {
            return Ok(false);
        }
        state.metrics.insert(key, row.clone());
        state.record_writes += 1;
        Ok(true)
    }

    async fn advance_watermark(
        &self,
        channel: ChannelId,
        expected: i64,
        new: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.faults.watermark.contains(&channel) {
            return Err(StoreError::Injected(format!("watermark for channel {channel}")));
        }
        check_advance(channel, state.current(channel), expected, new)?;
        state.set_watermark(channel, new);
        Ok(())
    }

    async fn insert_alert(&self, event: &AlertEvent) -> Result<(), StoreError> {
        self.state.lock().alerts.push(event.clone());
        Ok(())
    }

    async fn resolve_alert(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if let Some(event) = state.alerts.iter_mut().find(|a| a.id == id) {
            event.resolved_at.get_or_insert(at);
        }
        Ok(())
    }

    async fn open_alerts(&self) -> Result<Vec<AlertEvent>, StoreError> {
        Ok(self
            .state
            .lock()
            .alerts
            .iter()
            .filter(|a| a.is_active())
            .cloned()
            .collect())
    }
}

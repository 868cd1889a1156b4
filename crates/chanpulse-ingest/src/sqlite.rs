//! SQLite-backed metrics and credential store.
//!
//! Writes are serialized through one dedicated writer thread fed by a bounded
//! command queue; each command answers on a oneshot. A batch commit runs in a
//! single `BEGIN IMMEDIATE` transaction that checks and moves the watermark
//! together with the metric rows. Reads open their own connection on the
//! blocking pool (WAL allows them to run alongside the writer).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use async_trait::async_trait;
use chanpulse_core::{
    AggregatedMetric, AlertEvent, ChannelId, ChannelWatermark, MetricName, RuleId, RunningStats,
    TenantId,
};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::credentials::{CredentialError, CredentialStore};
use crate::store::{MetricsStore, StoreError, check_advance};

const WRITE_QUEUE_SIZE: usize = 256;

const SCHEMA: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS channel_watermarks (
    channel_id      INTEGER PRIMARY KEY,
    last_event_id   INTEGER NOT NULL,
    last_synced_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS aggregated_metrics (
    channel_id      INTEGER NOT NULL,
    date_bucket     TEXT NOT NULL,
    metric_name     TEXT NOT NULL,
    value           REAL NOT NULL,
    sample_count    INTEGER NOT NULL,
    stats           TEXT NOT NULL,
    applied_through INTEGER NOT NULL,
    PRIMARY KEY (channel_id, date_bucket, metric_name)
);

CREATE TABLE IF NOT EXISTS alert_events (
    id              TEXT PRIMARY KEY,
    rule_id         TEXT NOT NULL,
    channel_id      INTEGER NOT NULL,
    metric_name     TEXT NOT NULL,
    triggered_at    TEXT NOT NULL,
    observed_value  REAL NOT NULL,
    resolved_at     TEXT
);

CREATE INDEX IF NOT EXISTS idx_alert_events_open
    ON alert_events(channel_id) WHERE resolved_at IS NULL;

CREATE TABLE IF NOT EXISTS credentials (
    tenant_id       TEXT PRIMARY KEY,
    blob            BLOB NOT NULL,
    updated_at      TEXT NOT NULL
);
";

type Reply<T> = oneshot::Sender<Result<T, StoreError>>;

enum WriteCommand {
    CommitBatch {
        channel: ChannelId,
        rows: Vec<AggregatedMetric>,
        expected: i64,
        new: i64,
        respond: Reply<()>,
    },
    UpsertMetric {
        row: AggregatedMetric,
        respond: Reply<bool>,
    },
    AdvanceWatermark {
        channel: ChannelId,
        expected: i64,
        new: i64,
        respond: Reply<()>,
    },
    InsertAlert {
        event: AlertEvent,
        respond: Reply<()>,
    },
    ResolveAlert {
        id: Uuid,
        at: DateTime<Utc>,
        respond: Reply<()>,
    },
    WriteCredential {
        tenant: TenantId,
        blob: Vec<u8>,
        respond: Reply<()>,
    },
    RemoveCredential {
        tenant: TenantId,
        respond: Reply<()>,
    },
    Shutdown {
        respond: oneshot::Sender<()>,
    },
}

fn backend(err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[derive(Clone)]
pub struct SqliteMetricsStore {
    write_tx: mpsc::Sender<WriteCommand>,
    db_path: Arc<PathBuf>,
    writer_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for SqliteMetricsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteMetricsStore")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

impl SqliteMetricsStore {
    /// Open or create the database and start the writer thread.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the database cannot be opened or the
    /// schema cannot be applied.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(backend)?;
        }

        let open_path = db_path.clone();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
            let conn = Connection::open(&open_path).map_err(backend)?;
            conn.busy_timeout(std::time::Duration::from_secs(5))
                .map_err(backend)?;
            conn.execute_batch(SCHEMA).map_err(backend)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("task join error: {e}")))??;

        let (write_tx, mut write_rx) = mpsc::channel::<WriteCommand>(WRITE_QUEUE_SIZE);
        let writer_handle = thread::Builder::new()
            .name("chanpulse-sqlite-writer".to_string())
            .spawn(move || {
                let mut conn = conn;
                writer_loop(&mut conn, &mut write_rx);
            })
            .map_err(backend)?;

        debug!(path = %db_path.display(), "metrics store opened");
        Ok(Self {
            write_tx,
            db_path: Arc::new(db_path),
            writer_handle: Arc::new(Mutex::new(Some(writer_handle))),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    async fn send<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> WriteCommand,
    ) -> Result<T, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.write_tx
            .send(build(tx))
            .await
            .map_err(|_| StoreError::Backend("writer thread not available".to_string()))?;
        rx.await
            .map_err(|_| StoreError::Backend("writer response channel closed".to_string()))?
    }

    async fn query<T, F>(&self, query: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let db_path = Arc::clone(&self.db_path);
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(db_path.as_path()).map_err(backend)?;
            conn.busy_timeout(std::time::Duration::from_secs(5))
                .map_err(backend)?;
            query(&conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("task join error: {e}")))?
    }

    /// Stop the writer thread after draining queued writes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the writer thread panicked.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .write_tx
            .send(WriteCommand::Shutdown { respond: tx })
            .await;
        let _ = rx.await;

        let handle = self.writer_handle.lock().take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| StoreError::Backend("writer thread panicked".to_string()))?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Writer thread
// ─────────────────────────────────────────────────────────────────────────────

fn writer_loop(conn: &mut Connection, rx: &mut mpsc::Receiver<WriteCommand>) {
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            WriteCommand::CommitBatch {
                channel,
                rows,
                expected,
                new,
                respond,
            } => {
                let _ = respond.send(commit_batch_sync(conn, channel, &rows, expected, new));
            }
            WriteCommand::UpsertMetric { row, respond } => {
                let _ = respond.send(upsert_metric_sync(conn, &row));
            }
            WriteCommand::AdvanceWatermark {
                channel,
                expected,
                new,
                respond,
            } => {
                let _ = respond.send(advance_watermark_sync(conn, channel, expected, new));
            }
            WriteCommand::InsertAlert { event, respond } => {
                let _ = respond.send(insert_alert_sync(conn, &event));
            }
            WriteCommand::ResolveAlert { id, at, respond } => {
                let result = conn
                    .execute(
                        "UPDATE alert_events SET resolved_at = ?2 WHERE id = ?1 AND resolved_at IS NULL",
                        params![id.to_string(), at.to_rfc3339()],
                    )
                    .map(|_| ())
                    .map_err(backend);
                let _ = respond.send(result);
            }
            WriteCommand::WriteCredential {
                tenant,
                blob,
                respond,
            } => {
                let result = conn
                    .execute(
                        "INSERT INTO credentials (tenant_id, blob, updated_at) VALUES (?1, ?2, ?3)
                         ON CONFLICT(tenant_id) DO UPDATE SET blob = excluded.blob, updated_at = excluded.updated_at",
                        params![tenant.as_str(), blob, Utc::now().to_rfc3339()],
                    )
                    .map(|_| ())
                    .map_err(backend);
                let _ = respond.send(result);
            }
            WriteCommand::RemoveCredential { tenant, respond } => {
                let result = conn
                    .execute(
                        "DELETE FROM credentials WHERE tenant_id = ?1",
                        params![tenant.as_str()],
                    )
                    .map(|_| ())
                    .map_err(backend);
                let _ = respond.send(result);
            }
            WriteCommand::Shutdown { respond } => {
                let _ = respond.send(());
                break;
            }
        }
    }
}

fn current_watermark(conn: &Connection, channel: ChannelId) -> Result<i64, StoreError> {
    conn.query_row(
        "SELECT last_event_id FROM channel_watermarks WHERE channel_id = ?1",
        params![channel.get()],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .map(|found| found.unwrap_or(0))
    .map_err(backend)
}

fn write_watermark(conn: &Connection, channel: ChannelId, new: i64) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO channel_watermarks (channel_id, last_event_id, last_synced_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(channel_id) DO UPDATE SET last_event_id = excluded.last_event_id,
                                               last_synced_at = excluded.last_synced_at",
        params![channel.get(), new, Utc::now().to_rfc3339()],
    )
    .map(|_| ())
    .map_err(backend)
}

fn write_metric(conn: &Connection, row: &AggregatedMetric) -> Result<bool, StoreError> {
    let stats = serde_json::to_string(&row.stats).map_err(backend)?;
    let changed = conn
        .execute(
            "INSERT INTO aggregated_metrics
                 (channel_id, date_bucket, metric_name, value, sample_count, stats, applied_through)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(channel_id, date_bucket, metric_name) DO UPDATE SET
                 value = excluded.value,
                 sample_count = excluded.sample_count,
                 stats = excluded.stats,
                 applied_through = excluded.applied_through
             WHERE excluded.applied_through > aggregated_metrics.applied_through",
            params![
                row.channel_id.get(),
                row.date_bucket.to_string(),
                row.metric_name.as_str(),
                row.value,
                i64::try_from(row.sample_count).unwrap_or(i64::MAX),
                stats,
                row.applied_through,
            ],
        )
        .map_err(backend)?;
    Ok(changed > 0)
}

fn commit_batch_sync(
    conn: &mut Connection,
    channel: ChannelId,
    rows: &[AggregatedMetric],
    expected: i64,
    new: i64,
) -> Result<(), StoreError> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(backend)?;
    check_advance(channel, current_watermark(&tx, channel)?, expected, new)?;
    for row in rows {
        write_metric(&tx, row)?;
    }
    write_watermark(&tx, channel, new)?;
    tx.commit().map_err(backend)
}

fn upsert_metric_sync(conn: &mut Connection, row: &AggregatedMetric) -> Result<bool, StoreError> {
    write_metric(conn, row)
}

fn advance_watermark_sync(
    conn: &mut Connection,
    channel: ChannelId,
    expected: i64,
    new: i64,
) -> Result<(), StoreError> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(backend)?;
    check_advance(channel, current_watermark(&tx, channel)?, expected, new)?;
    write_watermark(&tx, channel, new)?;
    tx.commit().map_err(backend)
}

fn insert_alert_sync(conn: &mut Connection, event: &AlertEvent) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO alert_events
             (id, rule_id, channel_id, metric_name, triggered_at, observed_value, resolved_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.id.to_string(),
            event.rule_id.as_str(),
            event.channel_id.get(),
            event.metric_name.as_str(),
            event.triggered_at.to_rfc3339(),
            event.observed_value,
            event.resolved_at.map(|at| at.to_rfc3339()),
        ],
    )
    .map(|_| ())
    .map_err(backend)
}

// ─────────────────────────────────────────────────────────────────────────────
// Row decoding
// ─────────────────────────────────────────────────────────────────────────────

fn decode_err(column: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_time(column: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| decode_err(column, e))
}

fn watermark_from_row(row: &Row<'_>) -> rusqlite::Result<ChannelWatermark> {
    Ok(ChannelWatermark {
        channel_id: ChannelId::new(row.get(0)?),
        last_event_id: row.get(1)?,
        last_synced_at: parse_time(2, &row.get::<_, String>(2)?)?,
    })
}

fn metric_from_row(row: &Row<'_>) -> rusqlite::Result<AggregatedMetric> {
    let date_bucket: NaiveDate = row
        .get::<_, String>(1)?
        .parse()
        .map_err(|e| decode_err(1, e))?;
    let metric_name: MetricName = row
        .get::<_, String>(2)?
        .parse()
        .map_err(|e| decode_err(2, e))?;
    let stats: RunningStats =
        serde_json::from_str(&row.get::<_, String>(5)?).map_err(|e| decode_err(5, e))?;
    Ok(AggregatedMetric {
        channel_id: ChannelId::new(row.get(0)?),
        date_bucket,
        metric_name,
        value: row.get(3)?,
        sample_count: u64::try_from(row.get::<_, i64>(4)?).unwrap_or(0),
        stats,
        applied_through: row.get(6)?,
    })
}

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<AlertEvent> {
    let id = Uuid::parse_str(&row.get::<_, String>(0)?).map_err(|e| decode_err(0, e))?;
    let metric_name: MetricName = row
        .get::<_, String>(3)?
        .parse()
        .map_err(|e| decode_err(3, e))?;
    let resolved_at = row
        .get::<_, Option<String>>(6)?
        .map(|raw| parse_time(6, &raw))
        .transpose()?;
    Ok(AlertEvent {
        id,
        rule_id: RuleId::new(row.get::<_, String>(1)?),
        channel_id: ChannelId::new(row.get(2)?),
        metric_name,
        triggered_at: parse_time(4, &row.get::<_, String>(4)?)?,
        observed_value: row.get(5)?,
        resolved_at,
    })
}

#[async_trait]
impl MetricsStore for SqliteMetricsStore {
    async fn watermark(&self, channel: ChannelId) -> Result<Option<ChannelWatermark>, StoreError> {
        self.query(move |conn| {
            conn.query_row(
                "SELECT channel_id, last_event_id, last_synced_at
                 FROM channel_watermarks WHERE channel_id = ?1",
                params![channel.get()],
                watermark_from_row,
            )
            .optional()
            .map_err(backend)
        })
        .await
    }

    async fn watermarks(&self) -> Result<Vec<ChannelWatermark>, StoreError> {
        self.query(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT channel_id, last_event_id, last_synced_at
                     FROM channel_watermarks ORDER BY channel_id",
                )
                .map_err(backend)?;
            let rows = stmt.query_map([], watermark_from_row).map_err(backend)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)
        })
        .await
    }

    async fn metrics_for(
        &self,
        channel: ChannelId,
        days: &[NaiveDate],
    ) -> Result<Vec<AggregatedMetric>, StoreError> {
        let days: Vec<String> = days.iter().map(ToString::to_string).collect();
        self.query(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT channel_id, date_bucket, metric_name, value, sample_count, stats, applied_through
                     FROM aggregated_metrics WHERE channel_id = ?1 AND date_bucket = ?2",
                )
                .map_err(backend)?;
            let mut out = Vec::new();
            for day in &days {
                let rows = stmt
                    .query_map(params![channel.get(), day], metric_from_row)
                    .map_err(backend)?;
                for row in rows {
                    out.push(row.map_err(backend)?);
                }
            }
            Ok(out)
        })
        .await
    }

    async fn commit_batch(
        &self,
        channel: ChannelId,
        rows: &[AggregatedMetric],
        expected: i64,
        new: i64,
    ) -> Result<(), StoreError> {
        let rows = rows.to_vec();
        self.send(|respond| WriteCommand::CommitBatch {
            channel,
            rows,
            expected,
            new,
            respond,
        })
        .await
    }

    async fn upsert_metric(&self, row: &AggregatedMetric) -> Result<bool, StoreError> {
        let row = row.clone();
        self.send(|respond| WriteCommand::UpsertMetric { row, respond })
            .await
    }

    async fn advance_watermark(
        &self,
        channel: ChannelId,
        expected: i64,
        new: i64,
    ) -> Result<(), StoreError> {
        self.send(|respond| WriteCommand::AdvanceWatermark {
            channel,
            expected,
            new,
            respond,
        })
        .await
    }

    async fn insert_alert(&self, event: &AlertEvent) -> Result<(), StoreError> {
        let event = event.clone();
        self.send(|respond| WriteCommand::InsertAlert { event, respond })
            .await
    }

    async fn resolve_alert(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.send(|respond| WriteCommand::ResolveAlert { id, at, respond })
            .await
    }

    async fn open_alerts(&self) -> Result<Vec<AlertEvent>, StoreError> {
        self.query(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, rule_id, channel_id, metric_name, triggered_at, observed_value, resolved_at
                     FROM alert_events WHERE resolved_at IS NULL ORDER BY triggered_at",
                )
                .map_err(backend)?;
            let rows = stmt.query_map([], alert_from_row).map_err(backend)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)
        })
        .await
    }
}

fn credential_err(err: StoreError) -> CredentialError {
    CredentialError::Store(err.to_string())
}

#[async_trait]
impl CredentialStore for SqliteMetricsStore {
    async fn read(&self, tenant: &TenantId) -> Result<Vec<u8>, CredentialError> {
        let id = tenant.clone();
        let found = self.query(move |conn| {
            conn.query_row(
                "SELECT blob FROM credentials WHERE tenant_id = ?1",
                params![id.as_str()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
            .map_err(backend)
        })
        .await
        .map_err(credential_err)?;
        found.ok_or_else(|| CredentialError::NotFound(tenant.clone()))
    }

    async fn write(&self, tenant: &TenantId, blob: Vec<u8>) -> Result<(), CredentialError> {
        let tenant = tenant.clone();
        self.send(|respond| WriteCommand::WriteCredential {
            tenant,
            blob,
            respond,
        })
        .await
        .map_err(credential_err)
    }

    async fn remove(&self, tenant: &TenantId) -> Result<(), CredentialError> {
        let tenant = tenant.clone();
        let result = self
            .send(|respond| WriteCommand::RemoveCredential { tenant, respond })
            .await;
        if let Err(err) = &result {
            warn!(error = %err, "credential removal failed");
        }
        result.map_err(credential_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chanpulse_core::{AlertRule, Comparator};
    use tempfile::TempDir;

    async fn open() -> (TempDir, SqliteMetricsStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteMetricsStore::open(dir.path().join("metrics.db"))
            .await
            .unwrap();
        (dir, store)
    }

    fn views_row(channel: i64, through: i64, samples: &[f64]) -> AggregatedMetric {
        let day = NaiveDate::from_ymd_opt(2024, 5, 2).unwrap();
        let mut row = AggregatedMetric::empty(ChannelId::new(channel), day, MetricName::Views);
        row.apply(&RunningStats::from_samples(samples.iter().copied()), through);
        row
    }

    #[tokio::test]
    async fn batch_commit_persists_rows_and_watermark() {
        let (_dir, store) = open().await;
        let ch = ChannelId::new(42);
        let row = views_row(42, 7, &[100.0, 50.0]);
        store.commit_batch(ch, &[row.clone()], 0, 7).await.unwrap();

        assert_eq!(store.watermark(ch).await.unwrap().unwrap().last_event_id, 7);
        let stored = store.metrics_for(ch, &[row.date_bucket]).await.unwrap();
        assert_eq!(stored, vec![row]);
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn conflicting_batch_rolls_back() {
        let (_dir, store) = open().await;
        let ch = ChannelId::new(1);
        store.advance_watermark(ch, 0, 10).await.unwrap();

        let err = store
            .commit_batch(ch, &[views_row(1, 12, &[1.0])], 3, 12)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::WatermarkConflict { found: 10, .. }));
        let day = NaiveDate::from_ymd_opt(2024, 5, 2).unwrap();
        assert!(store.metrics_for(ch, &[day]).await.unwrap().is_empty());
        assert_eq!(store.watermark(ch).await.unwrap().unwrap().last_event_id, 10);
    }

    #[tokio::test]
    async fn upsert_respects_applied_through() {
        let (_dir, store) = open().await;
        assert!(store.upsert_metric(&views_row(1, 5, &[1.0])).await.unwrap());
        assert!(!store.upsert_metric(&views_row(1, 5, &[9.0])).await.unwrap());
        assert!(store.upsert_metric(&views_row(1, 6, &[9.0])).await.unwrap());
    }

    #[tokio::test]
    async fn alerts_round_trip_and_resolve() {
        let (_dir, store) = open().await;
        let rule = AlertRule {
            id: RuleId::new("views-high"),
            channel_id: ChannelId::new(3),
            metric_name: MetricName::Views,
            threshold: 1000.0,
            comparator: Comparator::Gt,
            cooldown_seconds: Some(600),
        };
        let event = AlertEvent::fired(&rule, 1500.0, Utc::now());
        store.insert_alert(&event).await.unwrap();
        let open = store.open_alerts().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, event.id);
        assert_eq!(open[0].rule_id, rule.id);

        store.resolve_alert(event.id, Utc::now()).await.unwrap();
        assert!(store.open_alerts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn credentials_are_stored_as_blobs() {
        let (_dir, store) = open().await;
        let tenant = TenantId::new("acct");
        assert!(matches!(
            CredentialStore::read(&store, &tenant).await,
            Err(CredentialError::NotFound(_))
        ));
        store.write(&tenant, vec![1, 2, 3]).await.unwrap();
        store.write(&tenant, vec![4, 5]).await.unwrap();
        assert_eq!(CredentialStore::read(&store, &tenant).await.unwrap(), vec![4, 5]);
        store.remove(&tenant).await.unwrap();
        assert!(CredentialStore::read(&store, &tenant).await.is_err());
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/metrics.db");
        let store = SqliteMetricsStore::open(&path).await.unwrap();
        store.advance_watermark(ChannelId::new(9), 0, 99).await.unwrap();
        store.shutdown().await.unwrap();

        let reopened = SqliteMetricsStore::open(&path).await.unwrap();
        let marks = reopened.watermarks().await.unwrap();
        assert_eq!(marks.len(), 1);
        assert_eq!(marks[0].last_event_id, 99);
    }
}

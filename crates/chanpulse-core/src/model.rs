//! Data model of the ingestion pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::ids::{ChannelId, RuleId, TenantId};
use crate::stats::RunningStats;

// ─────────────────────────────────────────────────────────────────────────────
// Sessions
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a tenant's protocol session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Active,
    FloodWaiting,
    Error,
}

impl SessionStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::FloodWaiting => "flood_waiting",
            Self::Error => "error",
        }
    }

    /// Whether a live connection is held for this status.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Active | Self::FloodWaiting)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a tenant's session entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSession {
    pub tenant_id: TenantId,
    #[serde(skip)]
    pub encrypted_credential_blob: Vec<u8>,
    pub status: SessionStatus,
    pub last_used_at: Option<DateTime<Utc>>,
    pub flood_wait_until: Option<DateTime<Utc>>,
    /// Set by invalidation; cleared by re-registration.
    pub auth_expired: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Watermarks and events
// ─────────────────────────────────────────────────────────────────────────────

/// Persisted collection cursor for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelWatermark {
    pub channel_id: ChannelId,
    pub last_event_id: i64,
    pub last_synced_at: DateTime<Utc>,
}

/// Highest payload schema version this build understands.
pub const PAYLOAD_SCHEMA_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Text,
    Photo,
    Video,
    Document,
    Poll,
    Other,
}

impl PayloadKind {
    fn from_wire(kind: Option<&str>) -> Self {
        match kind.map(str::to_ascii_lowercase).as_deref() {
            Some("text" | "message") | None => Self::Text,
            Some("photo") => Self::Photo,
            Some("video" | "animation") => Self::Video,
            Some("document") => Self::Document,
            Some("poll") => Self::Poll,
            Some(_) => Self::Other,
        }
    }
}

/// Opaque, schema-versioned event body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPayload {
    pub schema_version: u16,
    pub kind: PayloadKind,
    pub text_len: u32,
    pub has_media: bool,
}

/// Validated activity event. Immutable once emitted by the collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub channel_id: ChannelId,
    pub event_id: i64,
    pub occurred_at: DateTime<Utc>,
    pub view_count: u64,
    pub forward_count: u64,
    pub reaction_count: u64,
    pub payload: EventPayload,
}

/// Reactions arrive either as a bare total or as per-emoji counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireReactions {
    Total(i64),
    Breakdown(Vec<WireReaction>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireReaction {
    #[serde(default)]
    pub emoji: String,
    pub count: i64,
}

/// Event as returned by the platform gateway. Every field past `id` is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEvent {
    pub id: i64,
    /// Unix seconds.
    pub date: i64,
    #[serde(default)]
    pub views: Option<i64>,
    #[serde(default)]
    pub forwards: Option<i64>,
    #[serde(default)]
    pub reactions: Option<WireReactions>,
    #[serde(default)]
    pub schema: Option<u16>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media: Option<serde_json::Value>,
}

fn non_negative(field: &'static str, value: Option<i64>) -> Result<u64, ValidationError> {
    let value = value.unwrap_or(0);
    u64::try_from(value).map_err(|_| ValidationError::NegativeCounter { field, value })
}

impl RawEvent {
    /// Map a gateway event into the pipeline's typed representation.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for non-positive ids, unsupported schema
    /// versions, negative counters, or unrepresentable timestamps.
    pub fn from_wire(channel_id: ChannelId, wire: &WireEvent) -> Result<Self, ValidationError> {
        if wire.id <= 0 {
            return Err(ValidationError::NonPositiveId(wire.id));
        }
        let schema_version = wire.schema.unwrap_or(PAYLOAD_SCHEMA_VERSION);
        if schema_version == 0 || schema_version > PAYLOAD_SCHEMA_VERSION {
            return Err(ValidationError::UnsupportedSchema(schema_version));
        }
        let occurred_at = DateTime::<Utc>::from_timestamp(wire.date, 0)
            .filter(|_| wire.date > 0)
            .ok_or(ValidationError::BadTimestamp(wire.date))?;

        let reaction_count = match &wire.reactions {
            None => 0,
            Some(WireReactions::Total(total)) => non_negative("reactions", Some(*total))?,
            Some(WireReactions::Breakdown(items)) => {
                let mut total = 0u64;
                for item in items {
                    total = total.saturating_add(non_negative("reactions", Some(item.count))?);
                }
                total
            }
        };

        let text_len = wire
            .text
            .as_deref()
            .map_or(0, |t| u32::try_from(t.chars().count()).unwrap_or(u32::MAX));

        Ok(Self {
            channel_id,
            event_id: wire.id,
            occurred_at,
            view_count: non_negative("views", wire.views)?,
            forward_count: non_negative("forwards", wire.forwards)?,
            reaction_count,
            payload: EventPayload {
                schema_version,
                kind: PayloadKind::from_wire(wire.kind.as_deref()),
                text_len,
                has_media: wire.media.as_ref().is_some_and(|m| !m.is_null()),
            },
        })
    }

    /// UTC day this event aggregates into.
    #[must_use]
    pub fn date_bucket(&self) -> NaiveDate {
        self.occurred_at.date_naive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Aggregates
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    Posts,
    Views,
    Forwards,
    Reactions,
    EngagementRate,
}

impl MetricName {
    pub const ALL: [Self; 5] = [
        Self::Posts,
        Self::Views,
        Self::Forwards,
        Self::Reactions,
        Self::EngagementRate,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Posts => "posts",
            Self::Views => "views",
            Self::Forwards => "forwards",
            Self::Reactions => "reactions",
            Self::EngagementRate => "engagement_rate",
        }
    }

    /// Per-event sample fed into the running statistics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn sample(self, event: &RawEvent) -> f64 {
        match self {
            Self::Posts => 1.0,
            Self::Views => event.view_count as f64,
            Self::Forwards => event.forward_count as f64,
            Self::Reactions => event.reaction_count as f64,
            Self::EngagementRate => {
                let engaged = event.forward_count.saturating_add(event.reaction_count) as f64;
                engaged / event.view_count.max(1) as f64
            }
        }
    }

    /// Reported value for a bucket.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn value_of(self, stats: &RunningStats) -> f64 {
        match self {
            Self::Posts => stats.count() as f64,
            Self::Views | Self::Forwards | Self::Reactions => stats.sum(),
            Self::EngagementRate => stats.mean(),
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "posts" => Ok(Self::Posts),
            "views" => Ok(Self::Views),
            "forwards" => Ok(Self::Forwards),
            "reactions" => Ok(Self::Reactions),
            "engagement_rate" | "engagement" => Ok(Self::EngagementRate),
            other => Err(ValidationError::UnknownMetric(other.to_string())),
        }
    }
}

/// One metric for one channel and UTC day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedMetric {
    pub channel_id: ChannelId,
    pub date_bucket: NaiveDate,
    pub metric_name: MetricName,
    pub value: f64,
    pub sample_count: u64,
    pub stats: RunningStats,
    /// Highest event id folded into this row.
    pub applied_through: i64,
}

impl AggregatedMetric {
    #[must_use]
    pub const fn empty(channel_id: ChannelId, date_bucket: NaiveDate, metric_name: MetricName) -> Self {
        Self {
            channel_id,
            date_bucket,
            metric_name,
            value: 0.0,
            sample_count: 0,
            stats: RunningStats::new(),
            applied_through: 0,
        }
    }

    /// Fold a partial aggregate covering events up to `through`.
    ///
    /// Returns `false` and leaves the row untouched when those events were
    /// already applied.
    pub fn apply(&mut self, delta: &RunningStats, through: i64) -> bool {
        if through <= self.applied_through {
            return false;
        }
        self.stats.merge(delta);
        self.applied_through = through;
        self.sample_count = self.stats.count();
        self.value = self.metric_name.value_of(&self.stats);
        true
    }

    /// Storage key of this row.
    #[must_use]
    pub const fn key(&self) -> (ChannelId, NaiveDate, MetricName) {
        (self.channel_id, self.date_bucket, self.metric_name)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Alerts
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparator {
    #[must_use]
    pub fn breaches(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => value > threshold,
            Self::Gte => value >= threshold,
            Self::Lt => value < threshold,
            Self::Lte => value <= threshold,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }
}

impl FromStr for Comparator {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            ">" | "gt" => Ok(Self::Gt),
            ">=" | "gte" => Ok(Self::Gte),
            "<" | "lt" => Ok(Self::Lt),
            "<=" | "lte" => Ok(Self::Lte),
            other => Err(ValidationError::UnknownComparator(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: RuleId,
    pub channel_id: ChannelId,
    pub metric_name: MetricName,
    pub threshold: f64,
    pub comparator: Comparator,
    /// Falls back to the configured default when absent.
    #[serde(default)]
    pub cooldown_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: Uuid,
    pub rule_id: RuleId,
    pub channel_id: ChannelId,
    pub metric_name: MetricName,
    pub triggered_at: DateTime<Utc>,
    pub observed_value: f64,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl AlertEvent {
    #[must_use]
    pub fn fired(rule: &AlertRule, observed_value: f64, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            rule_id: rule.id.clone(),
            channel_id: rule.channel_id,
            metric_name: rule.metric_name,
            triggered_at: at,
            observed_value,
            resolved_at: None,
        }
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.resolved_at.is_none()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sync status
// ─────────────────────────────────────────────────────────────────────────────

/// Dashboard-facing sync state of a tenant or channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncStatus {
    NeverSynced,
    Syncing,
    Ok,
    /// Data has not refreshed since `since`.
    Stale { since: DateTime<Utc> },
    /// Session credentials were rejected; the tenant must reconnect.
    ReconnectRequired,
    /// Cumulative throttling or an open circuit stopped collection.
    Stalled { since: DateTime<Utc>, reason: String },
    /// A commit mismatch halted the channel.
    NeedsReconciliation,
}

impl SyncStatus {
    /// Human-readable summary for status displays.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::NeverSynced => "never synced".to_string(),
            Self::Syncing => "syncing".to_string(),
            Self::Ok => "up to date".to_string(),
            Self::Stale { since } => format!("stale data since {}", since.to_rfc3339()),
            Self::ReconnectRequired => "reconnect required".to_string(),
            Self::Stalled { since, reason } => {
                format!("stale data since {} ({reason})", since.to_rfc3339())
            }
            Self::NeedsReconciliation => "halted pending reconciliation".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub last_synced_at: Option<DateTime<Utc>>,
    pub status: SyncStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SyncTarget {
    Tenant(TenantId),
    Channel(ChannelId),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn wire(id: i64) -> WireEvent {
        WireEvent {
            id,
            date: 1_700_000_000,
            views: Some(120),
            forwards: Some(3),
            reactions: Some(WireReactions::Breakdown(vec![
                WireReaction {
                    emoji: "+1".into(),
                    count: 4,
                },
                WireReaction {
                    emoji: "fire".into(),
                    count: 5,
                },
            ])),
            schema: None,
            kind: Some("photo".into()),
            text: Some("hello".into()),
            media: Some(serde_json::json!({"w": 10})),
        }
    }

    #[test]
    fn wire_event_maps_to_typed_event() {
        let event = RawEvent::from_wire(ChannelId::new(9), &wire(11)).unwrap();
        assert_eq!(event.event_id, 11);
        assert_eq!(event.view_count, 120);
        assert_eq!(event.reaction_count, 9);
        assert_eq!(event.payload.schema_version, PAYLOAD_SCHEMA_VERSION);
        assert_eq!(event.payload.kind, PayloadKind::Photo);
        assert_eq!(event.payload.text_len, 5);
        assert!(event.payload.has_media);
    }

    #[test]
    fn wire_event_parses_from_json_with_missing_fields() {
        let wire: WireEvent =
            serde_json::from_str(r#"{"id": 3, "date": 1700000000, "reactions": 7}"#).unwrap();
        let event = RawEvent::from_wire(ChannelId::new(1), &wire).unwrap();
        assert_eq!(event.view_count, 0);
        assert_eq!(event.reaction_count, 7);
        assert_eq!(event.payload.kind, PayloadKind::Text);
    }

    #[test]
    fn validation_rejects_bad_events() {
        let channel = ChannelId::new(1);
        assert_eq!(
            RawEvent::from_wire(channel, &wire(0)),
            Err(ValidationError::NonPositiveId(0))
        );

        let mut future_schema = wire(5);
        future_schema.schema = Some(PAYLOAD_SCHEMA_VERSION + 1);
        assert_eq!(
            RawEvent::from_wire(channel, &future_schema),
            Err(ValidationError::UnsupportedSchema(PAYLOAD_SCHEMA_VERSION + 1))
        );

        let mut negative = wire(5);
        negative.views = Some(-1);
        assert_eq!(
            RawEvent::from_wire(channel, &negative),
            Err(ValidationError::NegativeCounter {
                field: "views",
                value: -1
            })
        );
    }

    #[test]
    fn metric_apply_is_guarded_by_applied_through() {
        let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let mut row = AggregatedMetric::empty(ChannelId::new(1), day, MetricName::Views);
        let delta = RunningStats::from_samples([10.0, 20.0]);

        assert!(row.apply(&delta, 2));
        assert!(!row.apply(&delta, 2));
        assert!((row.value - 30.0).abs() < f64::EPSILON);
        assert_eq!(row.sample_count, 2);
    }

    #[test]
    fn comparator_and_metric_names_parse() {
        assert_eq!(">=".parse::<Comparator>().unwrap(), Comparator::Gte);
        assert!(Comparator::Gt.breaches(1001.0, 1000.0));
        assert!(!Comparator::Gt.breaches(1000.0, 1000.0));
        assert_eq!(
            "engagement_rate".parse::<MetricName>().unwrap(),
            MetricName::EngagementRate
        );
        assert!("likes".parse::<MetricName>().is_err());
    }

    #[test]
    fn stale_status_describes_timestamp() {
        let since = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let text = SyncStatus::Stale { since }.describe();
        assert!(text.starts_with("stale data since 2023-11-14"));
    }
}

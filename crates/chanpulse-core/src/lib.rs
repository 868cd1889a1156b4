//! chanpulse core: shared types for the multi-tenant ingestion pipeline.
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌───────────┐   ┌────────────┐   ┌────────┐
//! │ SessionMgr   │──▶│ ThrottleGuard│──▶│ Collector │──▶│ Processor  │──▶│ Alerts │
//! │ (per tenant) │   │ (rate/flood) │   │ (pages)   │   │ (per chan) │   │        │
//! └──────────────┘   └──────────────┘   └───────────┘   └────────────┘   └────────┘
//! ```
//!
//! This crate holds what every stage agrees on: identifiers, the data model,
//! the error taxonomy, configuration, logging setup, cancellation tokens, and
//! the mergeable running statistics used for aggregation.

#![forbid(unsafe_code)]

pub mod cancel;
pub mod config;
pub mod error;
pub mod ids;
pub mod logging;
pub mod model;
pub mod stats;

pub use cancel::{CancelSource, CancelToken, Cancelled};
pub use config::{Config, ConfigError};
pub use error::{Error, PlatformError, Result, ValidationError};
pub use ids::{ChannelId, RuleId, TenantId};
pub use model::{
    AggregatedMetric, AlertEvent, AlertRule, ChannelWatermark, Comparator, EventPayload,
    MetricName, PayloadKind, RawEvent, SessionStatus, SyncReport, SyncStatus, SyncTarget,
    TenantSession, WireEvent,
};
pub use stats::RunningStats;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

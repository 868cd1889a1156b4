//! Tenant sessions, history collection, aggregation and alerting.
//!
//! - [`session`]: per-tenant session registry with a bounded pool
//! - [`client`]: platform connector trait and the HTTP gateway client
//! - [`collector`]: watermark-driven, lazily paged history collection
//! - [`processor`]: per-channel concurrent aggregation with batch fallback
//! - [`store`] / [`sqlite`]: metrics and watermark persistence
//! - [`alerts`] / [`notify`]: threshold rules, cooldowns and delivery
//! - [`engine`]: wires the stages into sync cycles
//! - [`testkit`]: scripted in-memory platform

#![forbid(unsafe_code)]

pub mod alerts;
pub mod client;
pub mod collector;
pub mod credentials;
pub mod engine;
pub mod notify;
pub mod processor;
pub mod session;
pub mod sqlite;
pub mod store;
pub mod testkit;

pub use alerts::{AlertEvaluator, AlertState};
pub use client::{HistoryPage, HttpPlatformConnector, PlatformConnector, PlatformSession};
pub use collector::{CollectError, CollectedPage, Collector};
pub use credentials::{
    Credential, CredentialCipher, CredentialError, CredentialStore, MemoryCredentialStore,
};
pub use engine::{CycleReport, EngineDeps, IngestEngine, TenantReport};
pub use notify::{AlertNotification, AlertNotifier, LogNotifier, NotifierSet, NotifyError, WebhookNotifier};
pub use processor::{
    BatchProcessor, ChannelGroup, ChannelOutcome, ChannelResult, JobSummary, MetricSink,
    ProcessorObserver,
};
pub use session::{PoolSnapshot, SessionError, SessionHandle, SessionManager};
pub use sqlite::SqliteMetricsStore;
pub use store::{MemoryMetricsStore, MetricKey, MetricsStore, StoreError};

//! Error taxonomy shared across the pipeline.
//!
//! [`PlatformError`] is what a single call against the messaging platform can
//! produce. Flood-wait is an explicit variant so callers branch on it instead
//! of treating it as a failure. [`Error`] is the pipeline-level taxonomy every
//! crate-local error converts into.

use std::time::Duration;

use thiserror::Error;

use crate::cancel::Cancelled;
use crate::ids::{ChannelId, TenantId};

/// Outcome of a failed platform call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    /// Server asked us to pause this account for `retry_after`.
    #[error("flood wait: retry after {}s", retry_after.as_secs())]
    FloodWait { retry_after: Duration },

    /// Session rejected; requires re-registration.
    #[error("authorization rejected: {0}")]
    Auth(String),

    /// Transient I/O failure.
    #[error("network error: {0}")]
    Network(String),

    /// Per-request timeout elapsed.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Unexpected response shape or status.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl PlatformError {
    /// Whether retrying the same call can succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::FloodWait { .. } | Self::Network(_) | Self::Timeout(_)
        )
    }

    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::FloodWait { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Rejected at the ingestion boundary before entering aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("event id must be positive, got {0}")]
    NonPositiveId(i64),

    #[error("unsupported payload schema version {0}")]
    UnsupportedSchema(u16),

    #[error("counter {field} is negative ({value})")]
    NegativeCounter { field: &'static str, value: i64 },

    #[error("invalid event timestamp {0}")]
    BadTimestamp(i64),

    #[error("unknown metric name '{0}'")]
    UnknownMetric(String),

    #[error("unknown comparator '{0}'")]
    UnknownComparator(String),
}

/// Pipeline-level error taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    /// Session invalid or expired. Not retried.
    #[error("tenant {tenant_id}: authorization failed: {message}")]
    Auth { tenant_id: TenantId, message: String },

    /// Platform throttle signal.
    #[error("flood wait for {}s", retry_after.as_secs())]
    FloodWait { retry_after: Duration },

    /// Transient failure after retries were exhausted.
    #[error("network error: {0}")]
    Network(String),

    /// Some records of a channel group could not be written.
    #[error("channel {channel_id}: {failed} record(s) failed to commit")]
    PartialBatch { channel_id: ChannelId, failed: usize },

    /// Watermark/metric commit mismatch; the channel is halted.
    #[error("channel {channel_id}: watermark mismatch (expected {expected}, found {found})")]
    DataIntegrity {
        channel_id: ChannelId,
        expected: i64,
        found: i64,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("credential error: {0}")]
    Credential(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the failure is expected to clear on a later cycle.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::FloodWait { .. } | Self::Network(_) | Self::PartialBatch { .. }
        )
    }
}

impl From<Cancelled> for Error {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl From<PlatformError> for Error {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::FloodWait { retry_after } => Self::FloodWait { retry_after },
            PlatformError::Auth(message) => Self::Auth {
                tenant_id: TenantId::new("unknown"),
                message,
            },
            PlatformError::Network(msg) | PlatformError::Protocol(msg) => Self::Network(msg),
            PlatformError::Timeout(after) => Self::Network(format!("timed out after {after:?}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flood_wait_is_retryable_with_hint() {
        let err = PlatformError::FloodWait {
            retry_after: Duration::from_secs(42),
        };
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(42)));
        assert_eq!(err.to_string(), "flood wait: retry after 42s");
    }

    #[test]
    fn auth_is_terminal() {
        let err = PlatformError::Auth("SESSION_REVOKED".into());
        assert!(!err.is_retryable());
        assert!(err.retry_after().is_none());
    }

    #[test]
    fn platform_errors_map_into_taxonomy() {
        let err: Error = PlatformError::Timeout(Duration::from_secs(10)).into();
        assert!(matches!(err, Error::Network(_)));
        assert!(err.is_transient());

        let err: Error = Cancelled.into();
        assert!(matches!(err, Error::Cancelled));
    }
}

//! Pipeline configuration.
//!
//! Loaded from TOML, then overridden from `CHANPULSE_*` environment variables,
//! then validated. Every numeric limit is deployment-tunable; the defaults
//! below are conservative starting points and should be checked against the
//! platform's published limits before going to production.
//!
//! ```toml
//! [rate_limit]
//! per_tenant_requests = 20
//! per_tenant_window_secs = 10
//!
//! [[tenants]]
//! id = "acct-1"
//! credential = "<sealed base64>"
//! channels = [-1001234]
//!
//! [[alert_rules]]
//! id = "views-spike"
//! channel_id = -1001234
//! metric_name = "views"
//! threshold = 1000.0
//! comparator = "gt"
//! ```

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{ChannelId, TenantId};
use crate::model::AlertRule;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "CHANPULSE_";

/// Environment variable carrying the base64 master key for credential sealing.
pub const MASTER_KEY_ENV: &str = "CHANPULSE_MASTER_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid override {key}={value}")]
    Override { key: String, value: String },

    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum concurrently Active sessions across all tenants.
    #[serde(default = "default_max_active")]
    pub max_active: usize,
    /// Unleased sessions idle longer than this are disconnected.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

const fn default_max_active() -> usize {
    50
}
const fn default_idle_timeout_secs() -> u64 {
    900
}
const fn default_connect_timeout_secs() -> u64 {
    15
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_active: default_max_active(),
            idle_timeout_secs: default_idle_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests one tenant may issue per window.
    #[serde(default = "default_per_tenant_requests")]
    pub per_tenant_requests: u32,
    #[serde(default = "default_per_tenant_window_secs")]
    pub per_tenant_window_secs: u64,
    /// Sustained request rate shared by all tenants.
    #[serde(default = "default_global_requests_per_sec")]
    pub global_requests_per_sec: f64,
    #[serde(default = "default_global_burst")]
    pub global_burst: u32,
    /// Bound on a single platform call.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Cumulative flood-wait per call before the sync is reported stalled.
    #[serde(default = "default_flood_wait_ceiling_secs")]
    pub flood_wait_ceiling_secs: u64,
}

const fn default_per_tenant_requests() -> u32 {
    20
}
const fn default_per_tenant_window_secs() -> u64 {
    10
}
const fn default_global_requests_per_sec() -> f64 {
    30.0
}
const fn default_global_burst() -> u32 {
    30
}
const fn default_request_timeout_secs() -> u64 {
    10
}
const fn default_flood_wait_ceiling_secs() -> u64 {
    900
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_tenant_requests: default_per_tenant_requests(),
            per_tenant_window_secs: default_per_tenant_window_secs(),
            global_requests_per_sec: default_global_requests_per_sec(),
            global_burst: default_global_burst(),
            request_timeout_secs: default_request_timeout_secs(),
            flood_wait_ceiling_secs: default_flood_wait_ceiling_secs(),
        }
    }
}

impl RateLimitConfig {
    #[must_use]
    pub const fn per_tenant_window(&self) -> Duration {
        Duration::from_secs(self.per_tenant_window_secs)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub const fn flood_wait_ceiling(&self) -> Duration {
        Duration::from_secs(self.flood_wait_ceiling_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Retries of a transient failure before the tenant's circuit opens.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

const fn default_base_ms() -> u64 {
    500
}
const fn default_multiplier() -> f64 {
    2.0
}
const fn default_max_delay_ms() -> u64 {
    30_000
}
const fn default_max_retries() -> u32 {
    5
}
const fn default_true() -> bool {
    true
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            max_retries: default_max_retries(),
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Failed probes (after retries are exhausted) before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Successful half-open probes before the circuit closes.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_open_cooldown_secs")]
    pub open_cooldown_secs: u64,
}

const fn default_failure_threshold() -> u32 {
    1
}
const fn default_success_threshold() -> u32 {
    1
}
const fn default_open_cooldown_secs() -> u64 {
    60
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_cooldown_secs: default_open_cooldown_secs(),
        }
    }
}

impl CircuitConfig {
    #[must_use]
    pub const fn open_cooldown(&self) -> Duration {
        Duration::from_secs(self.open_cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Upper bound on pages fetched per channel per cycle.
    #[serde(default = "default_max_pages_per_cycle")]
    pub max_pages_per_cycle: u32,
    /// Depth of the queue between tenant tasks and the aggregator.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,
    /// A channel not synced for this long is reported stale.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

const fn default_page_size() -> u32 {
    100
}
const fn default_max_pages_per_cycle() -> u32 {
    50
}
const fn default_queue_depth() -> usize {
    64
}
const fn default_cycle_interval_secs() -> u64 {
    300
}
const fn default_stale_after_secs() -> u64 {
    1800
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_pages_per_cycle: default_max_pages_per_cycle(),
            queue_depth: default_queue_depth(),
            cycle_interval_secs: default_cycle_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl CollectorConfig {
    #[must_use]
    pub const fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Events per chunk in memory-optimized mode, and per aggregator flush.
    #[serde(default = "default_flush_size")]
    pub flush_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Channel groups processed simultaneously.
    #[serde(default = "default_max_channel_workers")]
    pub max_channel_workers: usize,
    #[serde(default)]
    pub memory_optimized: bool,
}

const fn default_flush_size() -> usize {
    500
}
const fn default_flush_interval_ms() -> u64 {
    2_000
}
const fn default_max_channel_workers() -> usize {
    4
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            flush_size: default_flush_size(),
            flush_interval_ms: default_flush_interval_ms(),
            max_channel_workers: default_max_channel_workers(),
            memory_optimized: false,
        }
    }
}

impl BatchConfig {
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_cooldown_secs")]
    pub default_cooldown_secs: u64,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

const fn default_cooldown_secs() -> u64 {
    600
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            default_cooldown_secs: default_cooldown_secs(),
            webhook_url: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path; metrics stay in memory when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8088".to_string()
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    pub id: TenantId,
    /// Sealed credential blob, base64.
    pub credential: String,
    #[serde(default)]
    pub channels: Vec<ChannelId>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Root
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub logging: LogConfig,
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
    #[serde(default)]
    pub alert_rules: Vec<AlertRule>,
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Override {
        key: key.to_string(),
        value: value.to_string(),
    })
}

impl Config {
    /// Read, override from the process environment, and validate.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, an override
    /// is malformed, or validation fails.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_overrides(std::env::vars())?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    /// Parse without overrides or validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed TOML.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `CHANPULSE_<SECTION>_<FIELD>` overrides. Unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Override`] when a recognized key has an
    /// unparseable value.
    pub fn apply_overrides<I, K, V>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let key = key.as_ref();
            let value = value.as_ref();
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "SESSIONS_MAX_ACTIVE" => self.sessions.max_active = parse_override(key, value)?,
                "SESSIONS_IDLE_TIMEOUT_SECS" => {
                    self.sessions.idle_timeout_secs = parse_override(key, value)?;
                }
                "RATE_LIMIT_PER_TENANT_REQUESTS" => {
                    self.rate_limit.per_tenant_requests = parse_override(key, value)?;
                }
                "RATE_LIMIT_PER_TENANT_WINDOW_SECS" => {
                    self.rate_limit.per_tenant_window_secs = parse_override(key, value)?;
                }
                "RATE_LIMIT_GLOBAL_REQUESTS_PER_SEC" => {
                    self.rate_limit.global_requests_per_sec = parse_override(key, value)?;
                }
                "RATE_LIMIT_GLOBAL_BURST" => {
                    self.rate_limit.global_burst = parse_override(key, value)?;
                }
                "RATE_LIMIT_REQUEST_TIMEOUT_SECS" => {
                    self.rate_limit.request_timeout_secs = parse_override(key, value)?;
                }
                "BACKOFF_BASE_MS" => self.backoff.base_ms = parse_override(key, value)?,
                "BACKOFF_MULTIPLIER" => self.backoff.multiplier = parse_override(key, value)?,
                "BACKOFF_MAX_DELAY_MS" => self.backoff.max_delay_ms = parse_override(key, value)?,
                "BACKOFF_MAX_RETRIES" => self.backoff.max_retries = parse_override(key, value)?,
                "BATCH_FLUSH_SIZE" => self.batch.flush_size = parse_override(key, value)?,
                "BATCH_FLUSH_INTERVAL_MS" => {
                    self.batch.flush_interval_ms = parse_override(key, value)?;
                }
                "BATCH_MAX_CHANNEL_WORKERS" => {
                    self.batch.max_channel_workers = parse_override(key, value)?;
                }
                "BATCH_MEMORY_OPTIMIZED" => {
                    self.batch.memory_optimized = parse_override(key, value)?;
                }
                "ALERTS_DEFAULT_COOLDOWN_SECS" => {
                    self.alerts.default_cooldown_secs = parse_override(key, value)?;
                }
                "ALERTS_WEBHOOK_URL" => self.alerts.webhook_url = Some(value.to_string()),
                "STORE_PATH" => self.store.path = Some(PathBuf::from(value)),
                "PLATFORM_BASE_URL" => self.platform.base_url = value.to_string(),
                "LOG_LEVEL" => self.logging.level = value.to_string(),
                _ => {}
            }
        }
        Ok(())
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns every problem found, not just the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.sessions.max_active == 0 {
            errors.push("sessions.max_active must be > 0".to_string());
        }
        if self.rate_limit.per_tenant_requests == 0 {
            errors.push("rate_limit.per_tenant_requests must be > 0".to_string());
        }
        if self.rate_limit.per_tenant_window_secs == 0 {
            errors.push("rate_limit.per_tenant_window_secs must be > 0".to_string());
        }
        if !(self.rate_limit.global_requests_per_sec.is_finite()
            && self.rate_limit.global_requests_per_sec > 0.0)
        {
            errors.push("rate_limit.global_requests_per_sec must be > 0".to_string());
        }
        if self.rate_limit.global_burst == 0 {
            errors.push("rate_limit.global_burst must be > 0".to_string());
        }
        if self.rate_limit.request_timeout_secs == 0 {
            errors.push("rate_limit.request_timeout_secs must be > 0".to_string());
        }
        if !(self.backoff.multiplier.is_finite() && self.backoff.multiplier >= 1.0) {
            errors.push("backoff.multiplier must be >= 1.0".to_string());
        }
        if self.backoff.max_delay_ms < self.backoff.base_ms {
            errors.push("backoff.max_delay_ms must be >= backoff.base_ms".to_string());
        }
        if self.circuit.failure_threshold == 0 || self.circuit.success_threshold == 0 {
            errors.push("circuit thresholds must be > 0".to_string());
        }
        if self.collector.page_size == 0 || self.collector.page_size > 1_000 {
            errors.push("collector.page_size must be within 1..=1000".to_string());
        }
        if self.collector.max_pages_per_cycle == 0 {
            errors.push("collector.max_pages_per_cycle must be > 0".to_string());
        }
        if self.collector.queue_depth == 0 {
            errors.push("collector.queue_depth must be > 0".to_string());
        }
        if self.batch.flush_size == 0 {
            errors.push("batch.flush_size must be > 0".to_string());
        }
        if self.batch.max_channel_workers == 0 {
            errors.push("batch.max_channel_workers must be > 0".to_string());
        }

        let mut tenants = HashSet::new();
        let mut channels = HashSet::new();
        for tenant in &self.tenants {
            if tenant.id.as_str().trim().is_empty() {
                errors.push("tenant id must not be empty".to_string());
            }
            if !tenants.insert(tenant.id.clone()) {
                errors.push(format!("duplicate tenant '{}'", tenant.id));
            }
            for channel in &tenant.channels {
                if !channels.insert(*channel) {
                    errors.push(format!(
                        "channel {channel} is assigned to more than one tenant"
                    ));
                }
            }
        }

        let mut rules = HashSet::new();
        for rule in &self.alert_rules {
            if !rules.insert(rule.id.clone()) {
                errors.push(format!("duplicate alert rule '{}'", rule.id));
            }
            if !rule.threshold.is_finite() {
                errors.push(format!("alert rule '{}' has a non-finite threshold", rule.id));
            }
            if !channels.contains(&rule.channel_id) {
                errors.push(format!(
                    "alert rule '{}' references unconfigured channel {}",
                    rule.id, rule.channel_id
                ));
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Channels configured across every tenant.
    pub fn channels(&self) -> impl Iterator<Item = (&TenantId, ChannelId)> {
        self.tenants
            .iter()
            .flat_map(|t| t.channels.iter().map(move |c| (&t.id, *c)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Comparator, MetricName};
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
[rate_limit]
per_tenant_requests = 5

[batch]
max_channel_workers = 8

[[tenants]]
id = "acct-1"
credential = "c2VhbGVk"
channels = [-100, -200]

[[alert_rules]]
id = "views-spike"
channel_id = -100
metric_name = "views"
threshold = 1000.0
comparator = "gt"
cooldown_seconds = 600
"#;

    #[test]
    fn defaults_apply_to_missing_sections() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.rate_limit.per_tenant_requests, 5);
        assert_eq!(config.rate_limit.per_tenant_window_secs, 10);
        assert_eq!(config.sessions.max_active, 50);
        assert_eq!(config.batch.max_channel_workers, 8);
        assert_eq!(config.batch.flush_size, 500);
        assert_eq!(config.alerts.default_cooldown_secs, 600);
        assert_eq!(config.alert_rules[0].comparator, Comparator::Gt);
        assert_eq!(config.alert_rules[0].metric_name, MetricName::Views);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn overrides_replace_values() {
        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        config
            .apply_overrides([
                ("CHANPULSE_BATCH_MAX_CHANNEL_WORKERS", "2"),
                ("CHANPULSE_BACKOFF_MAX_RETRIES", "9"),
                ("UNRELATED", "x"),
                ("CHANPULSE_UNKNOWN_KEY", "y"),
            ])
            .unwrap();
        assert_eq!(config.batch.max_channel_workers, 2);
        assert_eq!(config.backoff.max_retries, 9);
    }

    #[test]
    fn malformed_override_is_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_overrides([("CHANPULSE_SESSIONS_MAX_ACTIVE", "lots")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Override { .. }));
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        config.batch.max_channel_workers = 0;
        config.backoff.multiplier = 0.5;
        config.alert_rules[0].channel_id = ChannelId::new(-999);

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3, "{errors:?}");
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chanpulse.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.tenants.len(), 1);
        assert_eq!(config.channels().count(), 2);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Config::load(Path::new("/nonexistent/chanpulse.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}

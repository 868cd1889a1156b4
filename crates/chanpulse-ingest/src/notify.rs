//! Alert delivery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chanpulse_core::config::AlertConfig;
use chanpulse_core::{AlertEvent, Comparator};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertNotification {
    Fired {
        event: AlertEvent,
        threshold: f64,
        comparator: Comparator,
    },
    Resolved {
        event: AlertEvent,
    },
}

impl AlertNotification {
    #[must_use]
    pub const fn event(&self) -> &AlertEvent {
        match self {
            Self::Fired { event, .. } | Self::Resolved { event } => event,
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification transport: {0}")]
    Transport(String),

    #[error("notification endpoint returned HTTP {0}")]
    Status(u16),
}

impl From<NotifyError> for chanpulse_core::Error {
    fn from(err: NotifyError) -> Self {
        Self::Network(err.to_string())
    }
}

#[async_trait]
pub trait AlertNotifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn notify(&self, notification: &AlertNotification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl AlertNotifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn notify(&self, notification: &AlertNotification) -> Result<(), NotifyError> {
        match notification {
            AlertNotification::Fired {
                event,
                threshold,
                comparator,
            } => warn!(
                rule_id = %event.rule_id,
                channel_id = %event.channel_id,
                metric = %event.metric_name,
                observed = event.observed_value,
                threshold,
                comparator = comparator.as_str(),
                "alert fired"
            ),
            AlertNotification::Resolved { event } => info!(
                rule_id = %event.rule_id,
                channel_id = %event.channel_id,
                metric = %event.metric_name,
                "alert resolved"
            ),
        }
        Ok(())
    }
}

/// POSTs each notification as JSON.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    /// # Errors
    ///
    /// Returns [`NotifyError::Transport`] if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertNotifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn notify(&self, notification: &AlertNotification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(NotifyError::Status(status.as_u16()))
        }
    }
}

/// Fans a notification out to every notifier. Failures are logged, never returned.
#[derive(Clone, Default)]
pub struct NotifierSet {
    notifiers: Vec<Arc<dyn AlertNotifier>>,
}

impl std::fmt::Debug for NotifierSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.notifiers.iter().map(|n| n.name()))
            .finish()
    }
}

impl NotifierSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, notifier: Arc<dyn AlertNotifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    /// Log notifier, plus a webhook when one is configured.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError`] if the webhook client cannot be built.
    pub fn from_config(config: &AlertConfig, timeout: Duration) -> Result<Self, NotifyError> {
        let mut set = Self::new().with(Arc::new(LogNotifier));
        if let Some(url) = &config.webhook_url {
            set = set.with(Arc::new(WebhookNotifier::new(url.clone(), timeout)?));
        }
        Ok(set)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    pub async fn dispatch(&self, notification: &AlertNotification) {
        for notifier in &self.notifiers {
            if let Err(err) = notifier.notify(notification).await {
                warn!(
                    notifier = notifier.name(),
                    rule_id = %notification.event().rule_id,
                    error = %err,
                    "alert notification failed"
                );
            }
        }
    }
}

#[async_trait]
impl AlertNotifier for NotifierSet {
    fn name(&self) -> &'static str {
        "set"
    }

    async fn notify(&self, notification: &AlertNotification) -> Result<(), NotifyError> {
        self.dispatch(notification).await;
        Ok(())
    }
}

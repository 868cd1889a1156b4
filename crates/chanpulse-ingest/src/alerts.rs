//! Threshold alerting.
//!
//! Each rule moves through:
//!
//! ```text
//!            breach                      cooldown over, still breaching
//! Normal ──────────▶ Cooldown ──────────────────────────────▶ Triggered
//!   ▲    (fires)        │                                         │
//!   │                   │ cooldown over, back under threshold     │ back under
//!   └───────────────────┴─────────────────────────────────────────┘ (resolves)
//! ```
//!
//! A rule fires once per breach: nothing re-fires while it is in cooldown or
//! while the breach is sustained past the cooldown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chanpulse_core::{AlertEvent, AlertRule, ChannelId, MetricName, RuleId};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, warn};

use crate::notify::{AlertNotification, NotifierSet};
use crate::processor::MetricSink;
use crate::store::{MetricsStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Normal,
    Triggered,
    Cooldown,
}

#[derive(Debug, Clone)]
struct RuleState {
    state: AlertState,
    cooldown_until: Option<DateTime<Utc>>,
    open: Option<AlertEvent>,
}

impl RuleState {
    const fn normal() -> Self {
        Self {
            state: AlertState::Normal,
            cooldown_until: None,
            open: None,
        }
    }
}

enum Transition {
    Fire(AlertEvent),
    Resolve(AlertEvent),
}

pub struct AlertEvaluator {
    rules: RwLock<Vec<AlertRule>>,
    states: Mutex<HashMap<RuleId, RuleState>>,
    default_cooldown: Duration,
    store: Option<Arc<dyn MetricsStore>>,
    notifiers: NotifierSet,
}

impl std::fmt::Debug for AlertEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertEvaluator")
            .field("rules", &self.rules.read().len())
            .field("default_cooldown", &self.default_cooldown)
            .field("notifiers", &self.notifiers)
            .finish_non_exhaustive()
    }
}

impl AlertEvaluator {
    #[must_use]
    pub fn new(rules: Vec<AlertRule>, default_cooldown: Duration) -> Self {
        Self {
            rules: RwLock::new(rules),
            states: Mutex::new(HashMap::new()),
            default_cooldown,
            store: None,
            notifiers: NotifierSet::new(),
        }
    }

    /// Persist fired and resolved alerts.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn MetricsStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_notifiers(mut self, notifiers: NotifierSet) -> Self {
        self.notifiers = notifiers;
        self
    }

    /// Replace the rule set. Rules that remain keep their state.
    pub fn set_rules(&self, rules: Vec<AlertRule>) {
        // Lock order matches evaluate_at: rules, then states.
        let mut current = self.rules.write();
        let mut states = self.states.lock();
        states.retain(|id, _| rules.iter().any(|r| &r.id == id));
        *current = rules;
    }

    #[must_use]
    pub fn rules(&self) -> Vec<AlertRule> {
        self.rules.read().clone()
    }

    #[must_use]
    pub fn state(&self, rule: &RuleId) -> AlertState {
        self.states
            .lock()
            .get(rule)
            .map_or(AlertState::Normal, |s| s.state)
    }

    /// Re-attach alerts left open by a previous run so they resolve normally.
    ///
    /// # Errors
    ///
    /// Returns the store error if open alerts cannot be read.
    pub async fn restore(&self) -> Result<usize, StoreError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let open = store.open_alerts().await?;
        let known: Vec<RuleId> = self.rules.read().iter().map(|r| r.id.clone()).collect();
        let mut states = self.states.lock();
        let mut restored = 0;
        for event in open {
            if !known.contains(&event.rule_id) {
                continue;
            }
            states.insert(
                event.rule_id.clone(),
                RuleState {
                    state: AlertState::Triggered,
                    cooldown_until: None,
                    open: Some(event),
                },
            );
            restored += 1;
        }
        Ok(restored)
    }

    fn cooldown_for(&self, rule: &AlertRule) -> chrono::Duration {
        let secs = rule
            .cooldown_seconds
            .unwrap_or(self.default_cooldown.as_secs());
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1_000))
    }

    pub async fn evaluate(
        &self,
        channel: ChannelId,
        metric: MetricName,
        latest_value: f64,
    ) -> Option<AlertEvent> {
        self.evaluate_at(channel, metric, latest_value, Utc::now())
            .await
    }

    /// Evaluate every rule on `(channel, metric)` at `now`.
    ///
    /// Returns the alert fired by this evaluation, if any. When several rules
    /// fire at once, all are persisted and notified and the first is returned.
    pub async fn evaluate_at(
        &self,
        channel: ChannelId,
        metric: MetricName,
        latest_value: f64,
        now: DateTime<Utc>,
    ) -> Option<AlertEvent> {
        let transitions: Vec<(AlertRule, Transition)> = {
            let rules = self.rules.read();
            let mut states = self.states.lock();
            rules
                .iter()
                .filter(|r| r.channel_id == channel && r.metric_name == metric)
                .filter_map(|rule| {
                    let state = states
                        .entry(rule.id.clone())
                        .or_insert_with(RuleState::normal);
                    self.step(rule, state, latest_value, now)
                        .map(|t| (rule.clone(), t))
                })
                .collect()
        };

        let mut fired = None;
        for (rule, transition) in transitions {
            match transition {
                Transition::Fire(event) => {
                    if let Some(store) = &self.store {
                        if let Err(err) = store.insert_alert(&event).await {
                            warn!(rule_id = %rule.id, error = %err, "persisting alert failed");
                        }
                    }
                    self.notifiers
                        .dispatch(&AlertNotification::Fired {
                            event: event.clone(),
                            threshold: rule.threshold,
                            comparator: rule.comparator,
                        })
                        .await;
                    fired.get_or_insert(event);
                }
                Transition::Resolve(event) => {
                    if let (Some(store), Some(at)) = (&self.store, event.resolved_at) {
                        if let Err(err) = store.resolve_alert(event.id, at).await {
                            warn!(rule_id = %rule.id, error = %err, "persisting resolution failed");
                        }
                    }
                    self.notifiers
                        .dispatch(&AlertNotification::Resolved { event })
                        .await;
                }
            }
        }
        fired
    }

    fn step(
        &self,
        rule: &AlertRule,
        state: &mut RuleState,
        value: f64,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        let breached = rule.comparator.breaches(value, rule.threshold);
        match state.state {
            AlertState::Normal if breached => {
                let event = AlertEvent::fired(rule, value, now);
                state.state = AlertState::Cooldown;
                state.cooldown_until = Some(now + self.cooldown_for(rule));
                state.open = Some(event.clone());
                debug!(rule_id = %rule.id, observed = value, "rule breached");
                Some(Transition::Fire(event))
            }
            AlertState::Normal => None,
            AlertState::Cooldown => {
                if state.cooldown_until.is_some_and(|until| now < until) {
                    return None;
                }
                state.cooldown_until = None;
                if breached {
                    state.state = AlertState::Triggered;
                    None
                } else {
                    Self::resolve(state, now)
                }
            }
            AlertState::Triggered if breached => None,
            AlertState::Triggered => Self::resolve(state, now),
        }
    }

    fn resolve(state: &mut RuleState, now: DateTime<Utc>) -> Option<Transition> {
        state.state = AlertState::Normal;
        state.open.take().map(|mut event| {
            event.resolved_at = Some(now);
            Transition::Resolve(event)
        })
    }
}

#[async_trait]
impl MetricSink for AlertEvaluator {
    async fn observe(&self, channel: ChannelId, metric: MetricName, value: f64) {
        self.evaluate(channel, metric, value).await;
    }
}

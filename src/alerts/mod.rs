//! Rule-based alerting over the metrics stream.
//!
//! The engine is push-evaluated: every appended metric sample arrives here
//! (via the collector's observer hook) together with the freshly computed
//! window stats. Rules are data - registered at startup, addable, removable
//! and toggleable at runtime - and the evaluator knows nothing about any
//! specific rule.

use dashmap::DashMap;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::metrics::{GatewayStats, MetricObserver, MetricSample};
use crate::utils::now_millis;

/// Which derived metric a rule watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleMetric {
    /// Evaluated on each latency sample, against the sample value in ms.
    Latency,
    /// Evaluated on each order-result sample, against the window success %.
    SuccessRate,
    /// Evaluated on each error sample, against the window error %.
    ErrorRate,
    /// Evaluated on each connection sample: 1.0 connected, 0.0 lost.
    Connection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
    Equal,
}

impl Condition {
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Condition::GreaterThan => value > threshold,
            Condition::GreaterOrEqual => value >= threshold,
            Condition::LessThan => value < threshold,
            Condition::LessOrEqual => value <= threshold,
            Condition::Equal => (value - threshold).abs() < f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "INFO",
            AlertLevel::Warning => "WARNING",
            AlertLevel::Critical => "CRITICAL",
        }
    }
}

/// `threshold` and `enabled` are hot-updatable; everything else is fixed at
/// registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub name: String,
    pub metric: RuleMetric,
    pub condition: Condition,
    pub threshold: f64,
    pub level: AlertLevel,
    pub consecutive_violations: u32,
    pub cooldown_secs: u64,
    pub enabled: bool,
}

impl AlertRule {
    pub fn new(
        name: impl Into<String>,
        metric: RuleMetric,
        condition: Condition,
        threshold: f64,
    ) -> Self {
        Self {
            name: name.into(),
            metric,
            condition,
            threshold,
            level: AlertLevel::Warning,
            consecutive_violations: 1,
            cooldown_secs: 60,
            enabled: true,
        }
    }

    pub fn with_level(mut self, level: AlertLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_consecutive_violations(mut self, n: u32) -> Self {
        self.consecutive_violations = n;
        self
    }

    pub fn with_cooldown_secs(mut self, secs: u64) -> Self {
        self.cooldown_secs = secs;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(GatewayError::ConfigurationError(
                "alert rule name cannot be empty".to_string(),
            ));
        }
        if self.consecutive_violations == 0 {
            return Err(GatewayError::ConfigurationError(format!(
                "rule '{}': consecutive_violations must be at least 1",
                self.name
            )));
        }
        if !self.threshold.is_finite() {
            return Err(GatewayError::ConfigurationError(format!(
                "rule '{}': threshold must be finite",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub rule_name: String,
    pub gateway: String,
    pub level: AlertLevel,
    pub message: String,
    pub metric_value: f64,
    pub threshold: f64,
    pub timestamp_ms: u64,
    pub resolved: bool,
    pub resolved_at: Option<u64>,
}

pub type AlertSink = Arc<dyn Fn(&Alert) + Send + Sync>;

type PairKey = (String, String); // (rule name, gateway name)

/// Default rule set. Data, not behavior - callers may register any subset
/// and add their own.
pub fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule::new("high-latency-warning", RuleMetric::Latency, Condition::GreaterThan, 500.0)
            .with_level(AlertLevel::Warning)
            .with_consecutive_violations(3)
            .with_cooldown_secs(60),
        AlertRule::new("high-latency-critical", RuleMetric::Latency, Condition::GreaterThan, 2000.0)
            .with_level(AlertLevel::Critical)
            .with_consecutive_violations(3)
            .with_cooldown_secs(60),
        AlertRule::new("low-success-rate", RuleMetric::SuccessRate, Condition::LessThan, 95.0)
            .with_level(AlertLevel::Warning)
            .with_consecutive_violations(1)
            .with_cooldown_secs(120),
        AlertRule::new("high-error-rate", RuleMetric::ErrorRate, Condition::GreaterThan, 10.0)
            .with_level(AlertLevel::Warning)
            .with_consecutive_violations(5)
            .with_cooldown_secs(120),
        AlertRule::new("connection-lost", RuleMetric::Connection, Condition::LessThan, 1.0)
            .with_level(AlertLevel::Critical)
            .with_consecutive_violations(1)
            .with_cooldown_secs(30),
    ]
}

pub struct AlertEngine {
    rules: DashMap<String, AlertRule>,
    counters: DashMap<PairKey, u32>,
    active: DashMap<PairKey, Alert>,
    last_fired: DashMap<PairKey, u64>,
    history: Mutex<VecDeque<Alert>>,
    history_limit: usize,
    sinks: RwLock<Vec<(String, AlertSink)>>,
}

impl AlertEngine {
    pub fn new(history_limit: usize) -> Self {
        Self {
            rules: DashMap::new(),
            counters: DashMap::new(),
            active: DashMap::new(),
            last_fired: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            history_limit: history_limit.max(1),
            sinks: RwLock::new(Vec::new()),
        }
    }

    /// Register a rule. Duplicate names are a configuration error so a
    /// startup typo cannot silently shadow an existing rule.
    pub fn register_rule(&self, rule: AlertRule) -> Result<()> {
        rule.validate()?;
        if self.rules.contains_key(&rule.name) {
            return Err(GatewayError::ConfigurationError(format!(
                "alert rule '{}' already registered",
                rule.name
            )));
        }
        debug!(
            "Registered alert rule '{}' ({:?} {:?} {})",
            rule.name, rule.metric, rule.condition, rule.threshold
        );
        self.rules.insert(rule.name.clone(), rule);
        Ok(())
    }

    pub fn remove_rule(&self, name: &str) -> bool {
        let removed = self.rules.remove(name).is_some();
        if removed {
            self.counters.retain(|(rule, _), _| rule.as_str() != name);
            self.active.retain(|(rule, _), _| rule.as_str() != name);
        }
        removed
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.rules.get_mut(name) {
            Some(mut rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn set_threshold(&self, name: &str, threshold: f64) -> bool {
        if !threshold.is_finite() {
            return false;
        }
        match self.rules.get_mut(name) {
            Some(mut rule) => {
                rule.threshold = threshold;
                true
            }
            None => false,
        }
    }

    pub fn rules(&self) -> Vec<AlertRule> {
        self.rules.iter().map(|e| e.value().clone()).collect()
    }

    /// Register a notifier sink under an id; same-id registration replaces.
    pub fn subscribe(&self, id: impl Into<String>, sink: AlertSink) {
        let id = id.into();
        let mut sinks = self.sinks.write().expect("alert sink lock poisoned");
        if let Some(slot) = sinks.iter_mut().find(|(existing, _)| *existing == id) {
            slot.1 = sink;
        } else {
            sinks.push((id, sink));
        }
    }

    pub fn unsubscribe(&self, id: &str) {
        self.sinks
            .write()
            .expect("alert sink lock poisoned")
            .retain(|(existing, _)| existing.as_str() != id);
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.active.iter().map(|e| e.value().clone()).collect()
    }

    pub fn history(&self) -> Vec<Alert> {
        self.history
            .lock()
            .expect("alert history lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Evaluate one sample against every enabled rule of its metric family.
    pub fn evaluate(&self, gateway: &str, sample: &MetricSample, stats: &GatewayStats) {
        let rules: Vec<AlertRule> = self
            .rules
            .iter()
            .filter(|e| e.value().enabled)
            .map(|e| e.value().clone())
            .collect();

        for rule in rules {
            let value = match (rule.metric, sample) {
                (RuleMetric::Latency, MetricSample::Latency { ms, .. }) => *ms,
                (RuleMetric::SuccessRate, MetricSample::OrderResult { .. }) => stats.success_rate,
                (RuleMetric::ErrorRate, MetricSample::Error { .. }) => stats.error_rate,
                (RuleMetric::Connection, MetricSample::Connection { connected, .. }) => {
                    if *connected {
                        1.0
                    } else {
                        0.0
                    }
                }
                _ => continue,
            };

            let key: PairKey = (rule.name.clone(), gateway.to_string());
            if rule.condition.holds(value, rule.threshold) {
                self.on_violation(key, &rule, gateway, value);
            } else {
                self.on_compliance(key, gateway);
            }
        }
    }

    fn on_violation(&self, key: PairKey, rule: &AlertRule, gateway: &str, value: f64) {
        let count = {
            let mut counter = self.counters.entry(key.clone()).or_insert(0);
            *counter += 1;
            *counter
        };

        if count < rule.consecutive_violations {
            return;
        }
        // The streak completed: reset the counter whether or not a new alert
        // is allowed to fire right now.
        self.counters.insert(key.clone(), 0);

        if self.active.contains_key(&key) {
            debug!(
                "Rule '{}' still violated for '{}', unresolved alert already active",
                rule.name, gateway
            );
            return;
        }
        let now = now_millis();
        if let Some(fired) = self.last_fired.get(&key) {
            if now.saturating_sub(*fired) < rule.cooldown_secs * 1000 {
                debug!(
                    "Rule '{}' for '{}' suppressed by cooldown ({}s)",
                    rule.name, gateway, rule.cooldown_secs
                );
                return;
            }
        }

        let alert = Alert {
            id: Uuid::new_v4(),
            rule_name: rule.name.clone(),
            gateway: gateway.to_string(),
            level: rule.level,
            message: format!(
                "{}: rule '{}' violated on gateway '{}' (value {:.2}, threshold {:.2})",
                rule.level.as_str(),
                rule.name,
                gateway,
                value,
                rule.threshold
            ),
            metric_value: value,
            threshold: rule.threshold,
            timestamp_ms: now,
            resolved: false,
            resolved_at: None,
        };

        warn!("🚨 {}", alert.message);
        self.active.insert(key.clone(), alert.clone());
        self.last_fired.insert(key, now);
        self.push_history(alert.clone());
        self.notify(&alert);
    }

    fn on_compliance(&self, key: PairKey, gateway: &str) {
        self.counters.insert(key.clone(), 0);
        if let Some((_, mut alert)) = self.active.remove(&key) {
            let now = now_millis();
            alert.resolved = true;
            alert.resolved_at = Some(now);
            info!(
                "✅ Alert '{}' on gateway '{}' resolved",
                alert.rule_name, gateway
            );
            self.mark_history_resolved(alert.id, now);
            self.notify(&alert);
        }
    }

    fn push_history(&self, alert: Alert) {
        let mut history = self.history.lock().expect("alert history lock poisoned");
        history.push_back(alert);
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }

    fn mark_history_resolved(&self, id: Uuid, resolved_at: u64) {
        let mut history = self.history.lock().expect("alert history lock poisoned");
        if let Some(entry) = history.iter_mut().rev().find(|a| a.id == id) {
            entry.resolved = true;
            entry.resolved_at = Some(resolved_at);
        }
    }

    fn notify(&self, alert: &Alert) {
        let sinks = self.sinks.read().expect("alert sink lock poisoned").clone();
        for (id, sink) in sinks {
            let outcome = catch_unwind(AssertUnwindSafe(|| sink(alert)));
            if outcome.is_err() {
                let err = GatewayError::HandlerError(format!(
                    "alert sink '{}' panicked on alert '{}'",
                    id, alert.rule_name
                ));
                error!("{}", err);
            }
        }
    }
}

impl MetricObserver for AlertEngine {
    fn on_sample(&self, gateway: &str, sample: &MetricSample, stats: &GatewayStats) {
        self.evaluate(gateway, sample, stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn latency_sample(ms: f64) -> MetricSample {
        MetricSample::Latency { ms, ts: now_millis() }
    }

    fn stats() -> GatewayStats {
        GatewayStats::default()
    }

    fn engine_with(rule: AlertRule) -> AlertEngine {
        let engine = AlertEngine::new(100);
        engine.register_rule(rule).unwrap();
        engine
    }

    #[test]
    fn test_fires_exactly_on_completing_violation() {
        let engine = engine_with(
            AlertRule::new("lat", RuleMetric::Latency, Condition::GreaterThan, 100.0)
                .with_consecutive_violations(3),
        );

        engine.evaluate("gw-a", &latency_sample(150.0), &stats());
        engine.evaluate("gw-a", &latency_sample(150.0), &stats());
        assert!(engine.active_alerts().is_empty());

        engine.evaluate("gw-a", &latency_sample(150.0), &stats());
        assert_eq!(engine.active_alerts().len(), 1);
    }

    #[test]
    fn test_counter_resets_on_any_compliant_sample() {
        let engine = engine_with(
            AlertRule::new("lat", RuleMetric::Latency, Condition::GreaterThan, 100.0)
                .with_consecutive_violations(3),
        );

        engine.evaluate("gw-a", &latency_sample(150.0), &stats());
        engine.evaluate("gw-a", &latency_sample(150.0), &stats());
        engine.evaluate("gw-a", &latency_sample(50.0), &stats()); // streak broken
        engine.evaluate("gw-a", &latency_sample(150.0), &stats());
        engine.evaluate("gw-a", &latency_sample(150.0), &stats());
        assert!(engine.active_alerts().is_empty());

        engine.evaluate("gw-a", &latency_sample(150.0), &stats());
        assert_eq!(engine.active_alerts().len(), 1);
    }

    #[test]
    fn test_at_most_one_unresolved_per_pair_and_auto_resolve() {
        let engine = engine_with(
            AlertRule::new("lat", RuleMetric::Latency, Condition::GreaterThan, 100.0)
                .with_consecutive_violations(1)
                .with_cooldown_secs(0),
        );

        for _ in 0..5 {
            engine.evaluate("gw-a", &latency_sample(500.0), &stats());
        }
        assert_eq!(engine.active_alerts().len(), 1);

        engine.evaluate("gw-a", &latency_sample(10.0), &stats());
        assert!(engine.active_alerts().is_empty());
        let history = engine.history();
        assert_eq!(history.len(), 1);
        assert!(history[0].resolved);
        assert!(history[0].resolved_at.is_some());
    }

    #[test]
    fn test_cooldown_blocks_refire_after_resolution() {
        let engine = engine_with(
            AlertRule::new("lat", RuleMetric::Latency, Condition::GreaterThan, 100.0)
                .with_consecutive_violations(1)
                .with_cooldown_secs(3600),
        );

        engine.evaluate("gw-a", &latency_sample(500.0), &stats());
        assert_eq!(engine.active_alerts().len(), 1);
        engine.evaluate("gw-a", &latency_sample(10.0), &stats()); // resolve

        engine.evaluate("gw-a", &latency_sample(500.0), &stats()); // within cooldown
        assert!(engine.active_alerts().is_empty());
        assert_eq!(engine.history().len(), 1);
    }

    #[test]
    fn test_pairs_are_independent_across_gateways() {
        let engine = engine_with(
            AlertRule::new("lat", RuleMetric::Latency, Condition::GreaterThan, 100.0)
                .with_consecutive_violations(2),
        );

        engine.evaluate("gw-a", &latency_sample(500.0), &stats());
        engine.evaluate("gw-b", &latency_sample(500.0), &stats());
        assert!(engine.active_alerts().is_empty());

        engine.evaluate("gw-a", &latency_sample(500.0), &stats());
        let active = engine.active_alerts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].gateway, "gw-a");
    }

    #[test]
    fn test_success_rate_rule_fires_on_order_sample() {
        let engine = engine_with(
            AlertRule::new("succ", RuleMetric::SuccessRate, Condition::LessThan, 95.0)
                .with_consecutive_violations(1),
        );

        let mut s = stats();
        s.success_rate = 90.0;
        engine.evaluate(
            "gw-x",
            &MetricSample::OrderResult { success: false, ts: now_millis() },
            &s,
        );
        let active = engine.active_alerts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].rule_name, "succ");
        assert_eq!(active[0].metric_value, 90.0);
    }

    #[test]
    fn test_sink_panic_is_isolated() {
        let engine = engine_with(
            AlertRule::new("lat", RuleMetric::Latency, Condition::GreaterThan, 100.0),
        );
        let delivered = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&delivered);

        engine.subscribe("bomb", Arc::new(|_alert: &Alert| panic!("notifier bug")));
        engine.subscribe(
            "counter",
            Arc::new(move |_alert: &Alert| {
                counted.fetch_add(1, Ordering::SeqCst);
            }),
        );

        engine.evaluate("gw-a", &latency_sample(500.0), &stats());
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disabled_rule_is_skipped_and_hot_toggles() {
        let engine = engine_with(
            AlertRule::new("lat", RuleMetric::Latency, Condition::GreaterThan, 100.0),
        );
        assert!(engine.set_enabled("lat", false));
        engine.evaluate("gw-a", &latency_sample(500.0), &stats());
        assert!(engine.active_alerts().is_empty());

        assert!(engine.set_enabled("lat", true));
        engine.evaluate("gw-a", &latency_sample(500.0), &stats());
        assert_eq!(engine.active_alerts().len(), 1);
    }

    #[test]
    fn test_hot_threshold_update() {
        let engine = engine_with(
            AlertRule::new("lat", RuleMetric::Latency, Condition::GreaterThan, 100.0),
        );
        assert!(engine.set_threshold("lat", 1000.0));
        engine.evaluate("gw-a", &latency_sample(500.0), &stats());
        assert!(engine.active_alerts().is_empty());
        assert!(!engine.set_threshold("lat", f64::NAN));
        assert!(!engine.set_threshold("missing", 1.0));
    }

    #[test]
    fn test_duplicate_rule_rejected() {
        let engine = engine_with(
            AlertRule::new("lat", RuleMetric::Latency, Condition::GreaterThan, 100.0),
        );
        let err = engine
            .register_rule(AlertRule::new("lat", RuleMetric::Latency, Condition::GreaterThan, 5.0))
            .unwrap_err();
        assert!(matches!(err, GatewayError::ConfigurationError(_)));
    }

    #[test]
    fn test_default_rules_are_valid() {
        let engine = AlertEngine::new(10);
        for rule in default_rules() {
            engine.register_rule(rule).unwrap();
        }
        assert_eq!(engine.rules().len(), 5);
    }

    #[test]
    fn test_history_is_bounded() {
        let engine = AlertEngine::new(3);
        engine
            .register_rule(
                AlertRule::new("lat", RuleMetric::Latency, Condition::GreaterThan, 100.0)
                    .with_cooldown_secs(0),
            )
            .unwrap();

        for _ in 0..5 {
            engine.evaluate("gw-a", &latency_sample(500.0), &stats()); // fire
            engine.evaluate("gw-a", &latency_sample(10.0), &stats()); // resolve
        }
        assert_eq!(engine.history().len(), 3);
    }
}

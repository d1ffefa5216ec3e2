//! The alert engine: sliding-window metric evaluation and event-driven
//! evaluation with deduplication, grace, cooldown and clear-duration.
//!
//! Both public operations are synchronous and total: they always return,
//! logging internal failures instead of raising them to the caller.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use dm_common::DmError;
use dm_notify::dispatcher::{NotificationMessage, NotificationRequest};
use dm_store::Store;
use dm_store::models::{Alert, AlertRule, AlertState, RuleRuntimeState};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error};

pub use crate::selector::AlertContext;
use crate::selector::rule_matches;

/// Pure function of its inputs; uniquely identifies an active alert.
pub fn make_dedup_key(rule_id: &str, kind: &str, scope_type: &str, scope_id: &str) -> String {
    format!("{rule_id}|{kind}|{scope_type}:{scope_id}")
}

fn runtime_key(rule_id: &str, scope_type: &str, scope_id: &str) -> String {
    format!("{rule_id}|{scope_type}:{scope_id}")
}

fn operator_breach(operator: &str, value: f64, threshold: f64) -> bool {
    match operator {
        ">=" => value >= threshold,
        "<=" => value <= threshold,
        ">" => value > threshold,
        "<" => value < threshold,
        "==" => value == threshold,
        "!=" => value != threshold,
        _ => false,
    }
}

/// Strict inequality on the opposite side of the operator.
fn on_clear_side(operator: &str, value: f64, clear_threshold: f64) -> bool {
    match operator {
        ">=" | ">" => value < clear_threshold,
        "<=" | "<" => value > clear_threshold,
        _ => true,
    }
}

pub struct AlertEngine {
    store: Store,
    notify_tx: Option<UnboundedSender<NotificationRequest>>,
    runtime: Mutex<HashMap<String, RuleRuntimeState>>,
}

impl AlertEngine {
    pub fn new(store: Store, notify_tx: Option<UnboundedSender<NotificationRequest>>) -> Self {
        Self {
            store,
            notify_tx,
            runtime: Mutex::new(HashMap::new()),
        }
    }

    // ── Public surface ──────────────────────────────────────────

    /// Evaluate a metric sample against every matching rule. Returns the
    /// alert rows created or transitioned by this sample.
    pub fn evaluate_metric(&self, metric: &str, value: f64, ctx: &AlertContext) -> Vec<Alert> {
        self.evaluate_metric_at(metric, value, ctx, Utc::now())
    }

    pub fn evaluate_metric_at(
        &self,
        metric: &str,
        value: f64,
        ctx: &AlertContext,
        now: DateTime<Utc>,
    ) -> Vec<Alert> {
        let rules = match self.store.list_enabled_alert_rules() {
            Ok(rules) => rules,
            Err(e) => {
                error!("Alert engine: failed to load rules: {e}");
                return Vec::new();
            }
        };

        let mut touched = Vec::new();
        for rule in rules {
            if rule.metric.as_deref() != Some(metric) {
                continue;
            }
            if self.in_grace(&rule, now) || !rule_matches(&rule, ctx) {
                continue;
            }
            match self.eval_metric_rule(&rule, value, ctx, now) {
                Ok(Some(alert)) => touched.push(alert),
                Ok(None) => {}
                Err(e) => error!(rule = rule.id, "Metric evaluation failed: {e}"),
            }
        }
        touched
    }

    /// Evaluate a domain event against every matching event-driven rule.
    pub fn evaluate_event(
        &self,
        event_kind: &str,
        ctx: &AlertContext,
        event_data: &Value,
    ) -> Vec<Alert> {
        self.evaluate_event_at(event_kind, ctx, event_data, Utc::now())
    }

    pub fn evaluate_event_at(
        &self,
        event_kind: &str,
        ctx: &AlertContext,
        event_data: &Value,
        now: DateTime<Utc>,
    ) -> Vec<Alert> {
        let rules = match self.store.list_enabled_alert_rules() {
            Ok(rules) => rules,
            Err(e) => {
                error!("Alert engine: failed to load rules: {e}");
                return Vec::new();
            }
        };

        let mut touched = Vec::new();
        for rule in rules {
            if rule.is_metric_driven() {
                continue;
            }
            if !event_rule_applies(&rule, event_kind, event_data) {
                continue;
            }
            if self.in_grace(&rule, now) || !rule_matches(&rule, ctx) {
                continue;
            }
            match self.eval_event_rule(&rule, ctx, event_data, now) {
                Ok(alert) => touched.push(alert),
                Err(e) => error!(rule = rule.id, "Event evaluation failed: {e}"),
            }
        }
        touched
    }

    // ── Metric path ─────────────────────────────────────────────

    fn eval_metric_rule(
        &self,
        rule: &AlertRule,
        value: f64,
        ctx: &AlertContext,
        now: DateTime<Utc>,
    ) -> Result<Option<Alert>, DmError> {
        let scope_type = ctx.scope.as_str();
        let rkey = runtime_key(&rule.id, scope_type, &ctx.scope_id);
        let dkey = make_dedup_key(&rule.id, &rule.kind, scope_type, &ctx.scope_id);

        let mut state = self.load_runtime(&rkey)?;

        // Sliding window: duration_seconds bounds how far back samples count.
        let window = rule.duration_seconds.unwrap_or(0).max(0);
        state.samples.push((now, value));
        let cutoff = now - Duration::seconds(window);
        state.samples.retain(|(t, _)| *t >= cutoff);
        if state.window_start.is_none() {
            state.window_start = Some(now);
        }

        let operator = rule.operator.as_deref().unwrap_or(">=");
        let threshold = rule.threshold.unwrap_or(0.0);
        let breached = operator_breach(operator, value, threshold);

        if breached {
            if state.breach_started_at.is_none() {
                state.breach_started_at = Some(now);
            }
            state.breach_count += 1;
        } else {
            state.breach_started_at = None;
            state.breach_count = 0;
        }
        state.last_eval_at = Some(now);

        let active = self.store.find_active_alert(&dkey)?;
        let occurrences_needed = rule.occurrences.unwrap_or(1).max(1);

        let result = match active {
            None if breached && state.breach_count >= occurrences_needed => {
                let mut alert = self.new_alert(rule, ctx, &dkey, Some(value), now);
                // Occurrences counts breaching samples, not row touches
                alert.occurrences = state.breach_count;
                self.maybe_notify(rule, &mut alert, None, now);
                self.store.insert_alert(&alert)?;
                debug!(rule = rule.id, dedup = dkey, "Alert opened");
                Some(alert)
            }
            None => None,
            Some(mut alert) if breached => {
                // Dedup: a second emission updates the row, never duplicates.
                let prev_last_seen = alert.last_seen;
                alert.last_seen = now;
                alert.occurrences += 1;
                alert.current_value = Some(value);
                if alert.state == AlertState::Clearing {
                    // Back on the breach side: abandon clearing
                    alert.state = AlertState::Open;
                    state.clear_started_at = None;
                }
                self.maybe_notify(rule, &mut alert, Some(prev_last_seen), now);
                self.store.update_alert(&alert)?;
                Some(alert)
            }
            Some(mut alert) => {
                // Clear path
                let clear_duration = rule.clear_duration_seconds.unwrap_or(0).max(0);
                match rule.clear_threshold {
                    None => {
                        self.resolve(&mut alert, value, now)?;
                        self.drop_runtime(&rkey, &mut state);
                        Some(alert)
                    }
                    Some(ct) if on_clear_side(operator, value, ct) => {
                        let started = *state.clear_started_at.get_or_insert(now);
                        alert.last_seen = now;
                        alert.current_value = Some(value);
                        if (now - started).num_seconds() >= clear_duration {
                            self.resolve(&mut alert, value, now)?;
                            self.drop_runtime(&rkey, &mut state);
                        } else {
                            alert.state = AlertState::Clearing;
                            self.store.update_alert(&alert)?;
                        }
                        Some(alert)
                    }
                    Some(_) => {
                        // Between clear threshold and threshold: clearing lapses
                        state.clear_started_at = None;
                        if alert.state == AlertState::Clearing {
                            alert.state = AlertState::Open;
                            alert.last_seen = now;
                            self.store.update_alert(&alert)?;
                        }
                        Some(alert)
                    }
                }
            }
        };

        self.store
            .record_rule_evaluation(&rule.id, &ctx.scope_id, value, breached, now)?;
        self.save_runtime(&rkey, &state);
        Ok(result)
    }

    // ── Event path ──────────────────────────────────────────────

    fn eval_event_rule(
        &self,
        rule: &AlertRule,
        ctx: &AlertContext,
        _event_data: &Value,
        now: DateTime<Utc>,
    ) -> Result<Alert, DmError> {
        let scope_type = ctx.scope.as_str();
        let dkey = make_dedup_key(&rule.id, &rule.kind, scope_type, &ctx.scope_id);

        match self.store.find_active_alert(&dkey)? {
            Some(mut alert) => {
                alert.last_seen = now;
                alert.occurrences += 1;
                // Event rules cool down from the last notification
                let reference = alert.last_notified_at;
                self.maybe_notify_with_reference(rule, &mut alert, reference, now);
                self.store.update_alert(&alert)?;
                Ok(alert)
            }
            None => {
                let mut alert = self.new_alert(rule, ctx, &dkey, None, now);
                self.maybe_notify(rule, &mut alert, None, now);
                self.store.insert_alert(&alert)?;
                debug!(rule = rule.id, dedup = dkey, "Event alert opened");
                Ok(alert)
            }
        }
    }

    // ── Helpers ─────────────────────────────────────────────────

    fn in_grace(&self, rule: &AlertRule, now: DateTime<Utc>) -> bool {
        rule.grace_seconds
            .map(|grace| (now - rule.created_at).num_seconds() < grace)
            .unwrap_or(false)
    }

    fn new_alert(
        &self,
        rule: &AlertRule,
        ctx: &AlertContext,
        dedup_key: &str,
        value: Option<f64>,
        now: DateTime<Utc>,
    ) -> Alert {
        Alert {
            id: uuid::Uuid::new_v4().to_string(),
            dedup_key: dedup_key.to_string(),
            rule_id: rule.id.clone(),
            rule_version: rule.version,
            scope_type: ctx.scope.as_str().to_string(),
            scope_id: ctx.scope_id.clone(),
            host_id: ctx.host_id.clone(),
            kind: rule.kind.clone(),
            severity: rule.severity.clone(),
            state: AlertState::Open,
            first_seen: now,
            last_seen: now,
            occurrences: 1,
            current_value: value,
            threshold: rule.threshold,
            last_notified_at: None,
            resolved_at: None,
            resolved_reason: None,
            rule_snapshot: serde_json::to_value(rule).unwrap_or(Value::Null),
        }
    }

    fn resolve(
        &self,
        alert: &mut Alert,
        value: f64,
        now: DateTime<Utc>,
    ) -> Result<(), DmError> {
        alert.state = AlertState::Resolved;
        alert.last_seen = now;
        alert.current_value = Some(value);
        alert.resolved_at = Some(now);
        alert.resolved_reason = Some("condition cleared".into());
        self.store.update_alert(alert)?;
        debug!(alert = alert.id, "Alert resolved");
        Ok(())
    }

    /// `now - last_seen < cooldown` suppresses the notification; the alert
    /// row still updates either way.
    fn maybe_notify(
        &self,
        rule: &AlertRule,
        alert: &mut Alert,
        prev_last_seen: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        let cooled_down = match prev_last_seen {
            Some(prev) => (now - prev).num_seconds() >= rule.effective_cooldown_seconds(),
            None => true,
        };
        if cooled_down {
            self.send_notification(rule, alert, now);
        }
    }

    fn maybe_notify_with_reference(
        &self,
        rule: &AlertRule,
        alert: &mut Alert,
        last_notified: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        let cooled_down = match last_notified {
            Some(prev) => (now - prev).num_seconds() >= rule.effective_cooldown_seconds(),
            None => true,
        };
        if cooled_down {
            self.send_notification(rule, alert, now);
        }
    }

    fn send_notification(&self, rule: &AlertRule, alert: &mut Alert, now: DateTime<Utc>) {
        let Some(tx) = &self.notify_tx else {
            return;
        };
        let Some(channels) = rule.notify_channels.clone().filter(|c| !c.is_empty()) else {
            return;
        };
        let body = match alert.current_value {
            Some(v) => format!(
                "{} on {} (value {v}, threshold {})",
                rule.name,
                alert.scope_id,
                alert.threshold.unwrap_or_default()
            ),
            None => format!("{} on {}", rule.name, alert.scope_id),
        };
        let request = NotificationRequest {
            channel_types: channels,
            message: NotificationMessage {
                title: format!("[{}] {}", alert.severity, rule.name),
                body,
                severity: alert.severity.clone(),
                alert_id: Some(alert.id.clone()),
                timestamp: now,
            },
        };
        if tx.send(request).is_ok() {
            alert.last_notified_at = Some(now);
        }
    }

    fn load_runtime(&self, key: &str) -> Result<RuleRuntimeState, DmError> {
        if let Some(state) = self.runtime.lock().unwrap().get(key) {
            return Ok(state.clone());
        }
        // Cache miss: fall back to the persisted snapshot so a failed write
        // in a previous evaluation never leaves memory ahead of storage.
        Ok(self.store.load_rule_runtime(key)?.unwrap_or_default())
    }

    fn save_runtime(&self, key: &str, state: &RuleRuntimeState) {
        match self.store.save_rule_runtime(key, state) {
            Ok(()) => {
                self.runtime
                    .lock()
                    .unwrap()
                    .insert(key.to_string(), state.clone());
            }
            Err(e) => {
                // Invalidate the cache so the next evaluation reloads the
                // last persisted snapshot.
                error!(key, "Failed to persist rule runtime, dropping cache: {e}");
                self.runtime.lock().unwrap().remove(key);
            }
        }
    }

    fn drop_runtime(&self, key: &str, state: &mut RuleRuntimeState) {
        state.breach_count = 0;
        state.breach_started_at = None;
        state.clear_started_at = None;
        self.runtime.lock().unwrap().remove(key);
        if let Err(e) = self.store.delete_rule_runtime(key) {
            error!(key, "Failed to delete rule runtime: {e}");
        }
    }
}

/// An event rule applies when its kind names the mapped event kind directly
/// or the event payload carries a truthy flag under the rule's kind
/// (`update_detected`, `update_failure`, `update_completed`).
fn event_rule_applies(rule: &AlertRule, event_kind: &str, event_data: &Value) -> bool {
    if rule.kind == event_kind {
        return true;
    }
    event_data
        .get(&rule.kind)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use dm_store::models::RuleScope;
    use tokio::sync::mpsc;

    fn metric_rule() -> AlertRule {
        AlertRule {
            id: "cpu_high".into(),
            name: "High CPU".into(),
            scope: RuleScope::Container,
            kind: "cpu_high".into(),
            severity: "warning".into(),
            enabled: true,
            metric: Some("cpu_percent".into()),
            operator: Some(">=".into()),
            threshold: Some(90.0),
            clear_threshold: Some(80.0),
            duration_seconds: Some(300),
            clear_duration_seconds: Some(60),
            occurrences: Some(3),
            grace_seconds: None,
            cooldown_seconds: Some(300),
            notification_cooldown_seconds: None,
            host_selector: None,
            container_selector: None,
            labels: None,
            notify_channels: Some(vec!["slack".into()]),
            depends_on: None,
            version: 1,
            created_at: Utc::now() - TimeDelta::hours(1),
        }
    }

    fn ctx() -> AlertContext {
        AlertContext::container("h1:abc123def456", "nginx", "h1", "edge")
    }

    fn engine_with_rule(rule: AlertRule) -> (AlertEngine, mpsc::UnboundedReceiver<NotificationRequest>) {
        let store = Store::open_in_memory().unwrap();
        store.create_alert_rule(&rule).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        (AlertEngine::new(store, Some(tx)), rx)
    }

    #[test]
    fn test_sliding_window_cpu_scenario() {
        let (engine, mut rx) = engine_with_rule(metric_rule());
        let t0 = Utc::now();

        // Three breaching samples spaced 1 s apart open exactly one alert
        assert!(engine.evaluate_metric_at("cpu_percent", 95.0, &ctx(), t0).is_empty());
        assert!(engine
            .evaluate_metric_at("cpu_percent", 96.0, &ctx(), t0 + TimeDelta::seconds(1))
            .is_empty());
        let fired = engine.evaluate_metric_at("cpu_percent", 97.0, &ctx(), t0 + TimeDelta::seconds(2));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].state, AlertState::Open);
        assert_eq!(fired[0].current_value, Some(97.0));
        assert!(rx.try_recv().is_ok());

        // A fourth breaching sample updates the row, never duplicates
        let updated = engine.evaluate_metric_at("cpu_percent", 96.0, &ctx(), t0 + TimeDelta::seconds(3));
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].id, fired[0].id);
        assert_eq!(updated[0].occurrences, 4);
        // Cooldown (300 s) suppresses the second notification
        assert!(rx.try_recv().is_err());

        // Sustained clear-side samples for >= 60 s resolve the alert
        let mut t = t0 + TimeDelta::seconds(10);
        let mut last = Vec::new();
        for _ in 0..7 {
            last = engine.evaluate_metric_at("cpu_percent", 75.0, &ctx(), t);
            t += TimeDelta::seconds(10);
        }
        assert_eq!(last[0].state, AlertState::Resolved);

        // Invariant: no active row remains for the dedup key
        let key = make_dedup_key("cpu_high", "cpu_high", "container", "h1:abc123def456");
        assert!(engine.store.find_active_alert(&key).unwrap().is_none());
    }

    #[test]
    fn test_threshold_boundary_operators() {
        let mut rule = metric_rule();
        rule.occurrences = Some(1);
        rule.duration_seconds = Some(0);
        let (engine, _rx) = engine_with_rule(rule);

        // Exactly equal with >= is a breach
        let fired = engine.evaluate_metric_at("cpu_percent", 90.0, &ctx(), Utc::now());
        assert_eq!(fired.len(), 1);

        let mut strict = metric_rule();
        strict.id = "cpu_strict".into();
        strict.kind = "cpu_strict".into();
        strict.operator = Some(">".into());
        strict.occurrences = Some(1);
        strict.duration_seconds = Some(0);
        let (engine2, _rx2) = engine_with_rule(strict);
        assert!(engine2
            .evaluate_metric_at("cpu_percent", 90.0, &ctx(), Utc::now())
            .is_empty());
    }

    #[test]
    fn test_first_breach_fires_with_single_occurrence() {
        let mut rule = metric_rule();
        rule.occurrences = Some(1);
        rule.duration_seconds = Some(0);
        let (engine, _rx) = engine_with_rule(rule);
        let fired = engine.evaluate_metric_at("cpu_percent", 99.0, &ctx(), Utc::now());
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].state, AlertState::Open);
    }

    #[test]
    fn test_zero_clear_duration_resolves_immediately() {
        let mut rule = metric_rule();
        rule.occurrences = Some(1);
        rule.duration_seconds = Some(0);
        rule.clear_duration_seconds = Some(0);
        let (engine, _rx) = engine_with_rule(rule);
        let t0 = Utc::now();

        engine.evaluate_metric_at("cpu_percent", 95.0, &ctx(), t0);
        let cleared = engine.evaluate_metric_at("cpu_percent", 70.0, &ctx(), t0 + TimeDelta::seconds(1));
        assert_eq!(cleared[0].state, AlertState::Resolved);
    }

    #[test]
    fn test_clearing_abandoned_when_value_returns() {
        let mut rule = metric_rule();
        rule.occurrences = Some(1);
        rule.duration_seconds = Some(0);
        let (engine, _rx) = engine_with_rule(rule);
        let t0 = Utc::now();

        engine.evaluate_metric_at("cpu_percent", 95.0, &ctx(), t0);
        // Below clear threshold: enters clearing
        let clearing = engine.evaluate_metric_at("cpu_percent", 75.0, &ctx(), t0 + TimeDelta::seconds(1));
        assert_eq!(clearing[0].state, AlertState::Clearing);
        // Back above threshold before the 60 s elapse: reopened
        let reopened = engine.evaluate_metric_at("cpu_percent", 95.0, &ctx(), t0 + TimeDelta::seconds(30));
        assert_eq!(reopened[0].state, AlertState::Open);
        // Clear again; the 60 s window restarts from here
        let again = engine.evaluate_metric_at("cpu_percent", 75.0, &ctx(), t0 + TimeDelta::seconds(40));
        assert_eq!(again[0].state, AlertState::Clearing);
    }

    #[test]
    fn test_event_rule_dedup_and_cooldown() {
        let mut rule = metric_rule();
        rule.id = "container_down".into();
        rule.kind = "state_change".into();
        rule.metric = None;
        rule.cooldown_seconds = Some(600);
        let (engine, mut rx) = engine_with_rule(rule);
        let t0 = Utc::now();
        let data = serde_json::json!({"new_state": "exited"});

        let first = engine.evaluate_event_at("state_change", &ctx(), &data, t0);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].occurrences, 1);
        assert!(rx.try_recv().is_ok());

        let second = engine.evaluate_event_at("state_change", &ctx(), &data, t0 + TimeDelta::seconds(30));
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, first[0].id);
        assert_eq!(second[0].occurrences, 2);
        // Within cooldown: suppressed
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_event_flag_matching() {
        let mut rule = metric_rule();
        rule.id = "update_watch".into();
        rule.kind = "update_detected".into();
        rule.metric = None;
        let (engine, _rx) = engine_with_rule(rule);

        let with_flag = serde_json::json!({"update_detected": true});
        assert_eq!(
            engine
                .evaluate_event_at("info", &ctx(), &with_flag, Utc::now())
                .len(),
            1
        );

        let without = serde_json::json!({});
        let ctx2 = AlertContext::container("h1:other1234567", "other", "h1", "edge");
        assert!(engine.evaluate_event_at("info", &ctx2, &without, Utc::now()).is_empty());
    }

    #[test]
    fn test_grace_period_skips_matching() {
        let mut rule = metric_rule();
        rule.created_at = Utc::now();
        rule.grace_seconds = Some(3600);
        rule.occurrences = Some(1);
        rule.duration_seconds = Some(0);
        let (engine, _rx) = engine_with_rule(rule);
        assert!(engine
            .evaluate_metric_at("cpu_percent", 99.0, &ctx(), Utc::now())
            .is_empty());
    }

    #[test]
    fn test_dedup_key_stability() {
        assert_eq!(
            make_dedup_key("r1", "cpu", "container", "h1:abc"),
            make_dedup_key("r1", "cpu", "container", "h1:abc"),
        );
        assert_eq!(
            make_dedup_key("r1", "cpu", "container", "h1:abc"),
            "r1|cpu|container:h1:abc"
        );
    }
}

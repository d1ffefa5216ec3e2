//! Alert rules, alerts, and per-(rule, scope) runtime snapshots.

use chrono::{DateTime, Duration, Utc};
use dm_common::DmError;
use rusqlite::{OptionalExtension, Row, params};
use serde_json::Value;

use crate::models::{Alert, AlertRule, AlertState, RuleRuntimeState, RuleScope};
use crate::{Store, opt_ts_from_sql, ts_from_sql, ts_to_sql};

fn json_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    let raw: Option<String> = row.get(idx)?;
    Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
}

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<AlertRule> {
    let notify: Option<Value> = json_col(row, 19)?;
    let depends: Option<Value> = json_col(row, 20)?;
    Ok(AlertRule {
        id: row.get(0)?,
        name: row.get(1)?,
        scope: RuleScope::parse(&row.get::<_, String>(2)?).unwrap_or(RuleScope::Container),
        kind: row.get(3)?,
        severity: row.get(4)?,
        enabled: row.get::<_, i64>(5)? != 0,
        metric: row.get(6)?,
        operator: row.get(7)?,
        threshold: row.get(8)?,
        clear_threshold: row.get(9)?,
        duration_seconds: row.get(10)?,
        clear_duration_seconds: row.get(11)?,
        occurrences: row.get(12)?,
        grace_seconds: row.get(13)?,
        cooldown_seconds: row.get(14)?,
        notification_cooldown_seconds: row.get(15)?,
        host_selector: json_col(row, 16)?,
        container_selector: json_col(row, 17)?,
        labels: json_col(row, 18)?,
        notify_channels: notify.and_then(|v| serde_json::from_value(v).ok()),
        depends_on: depends.and_then(|v| serde_json::from_value(v).ok()),
        version: row.get(21)?,
        created_at: ts_from_sql(&row.get::<_, String>(22)?),
    })
}

const RULE_COLS: &str = "id, name, scope, kind, severity, enabled, metric, operator, threshold, \
                         clear_threshold, duration_seconds, clear_duration_seconds, occurrences, \
                         grace_seconds, cooldown_seconds, notification_cooldown_seconds, \
                         host_selector, container_selector, labels, notify_channels, depends_on, \
                         version, created_at";

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<Alert> {
    let snapshot: String = row.get(18)?;
    Ok(Alert {
        id: row.get(0)?,
        dedup_key: row.get(1)?,
        rule_id: row.get(2)?,
        rule_version: row.get(3)?,
        scope_type: row.get(4)?,
        scope_id: row.get(5)?,
        host_id: row.get(6)?,
        kind: row.get(7)?,
        severity: row.get(8)?,
        state: AlertState::parse(&row.get::<_, String>(9)?).unwrap_or(AlertState::Open),
        first_seen: ts_from_sql(&row.get::<_, String>(10)?),
        last_seen: ts_from_sql(&row.get::<_, String>(11)?),
        occurrences: row.get(12)?,
        current_value: row.get(13)?,
        threshold: row.get(14)?,
        last_notified_at: opt_ts_from_sql(row.get(15)?),
        resolved_at: opt_ts_from_sql(row.get(16)?),
        resolved_reason: row.get(17)?,
        rule_snapshot: serde_json::from_str(&snapshot).unwrap_or(Value::Null),
    })
}

const ALERT_COLS: &str = "id, dedup_key, rule_id, rule_version, scope_type, scope_id, host_id, \
                          kind, severity, state, first_seen, last_seen, occurrences, \
                          current_value, threshold, last_notified_at, resolved_at, \
                          resolved_reason, rule_snapshot";

impl Store {
    // ── Alert rules ─────────────────────────────────────────────

    pub fn create_alert_rule(&self, rule: &AlertRule) -> Result<(), DmError> {
        self.save_rule(rule, false)
    }

    /// Replaces the row and bumps `version`.
    pub fn update_alert_rule(&self, rule: &AlertRule) -> Result<(), DmError> {
        self.save_rule(rule, true)
    }

    fn save_rule(&self, rule: &AlertRule, bump_version: bool) -> Result<(), DmError> {
        let version = if bump_version {
            rule.version + 1
        } else {
            rule.version
        };
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO alert_rules (id, name, scope, kind, severity, enabled, metric, \
                 operator, threshold, clear_threshold, duration_seconds, clear_duration_seconds, \
                 occurrences, grace_seconds, cooldown_seconds, notification_cooldown_seconds, \
                 host_selector, container_selector, labels, notify_channels, depends_on, version, \
                 created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                 ?17, ?18, ?19, ?20, ?21, ?22, ?23) \
                 ON CONFLICT(id) DO UPDATE SET \
                 name = excluded.name, scope = excluded.scope, kind = excluded.kind, \
                 severity = excluded.severity, enabled = excluded.enabled, \
                 metric = excluded.metric, operator = excluded.operator, \
                 threshold = excluded.threshold, clear_threshold = excluded.clear_threshold, \
                 duration_seconds = excluded.duration_seconds, \
                 clear_duration_seconds = excluded.clear_duration_seconds, \
                 occurrences = excluded.occurrences, grace_seconds = excluded.grace_seconds, \
                 cooldown_seconds = excluded.cooldown_seconds, \
                 notification_cooldown_seconds = excluded.notification_cooldown_seconds, \
                 host_selector = excluded.host_selector, \
                 container_selector = excluded.container_selector, labels = excluded.labels, \
                 notify_channels = excluded.notify_channels, depends_on = excluded.depends_on, \
                 version = excluded.version",
                params![
                    rule.id,
                    rule.name,
                    rule.scope.as_str(),
                    rule.kind,
                    rule.severity,
                    rule.enabled as i64,
                    rule.metric,
                    rule.operator,
                    rule.threshold,
                    rule.clear_threshold,
                    rule.duration_seconds,
                    rule.clear_duration_seconds,
                    rule.occurrences,
                    rule.grace_seconds,
                    rule.cooldown_seconds,
                    rule.notification_cooldown_seconds,
                    rule.host_selector.as_ref().map(|v| v.to_string()),
                    rule.container_selector.as_ref().map(|v| v.to_string()),
                    rule.labels.as_ref().map(|v| v.to_string()),
                    rule.notify_channels
                        .as_ref()
                        .and_then(|v| serde_json::to_string(v).ok()),
                    rule.depends_on
                        .as_ref()
                        .and_then(|v| serde_json::to_string(v).ok()),
                    version,
                    ts_to_sql(rule.created_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_alert_rule(&self, id: &str) -> Result<Option<AlertRule>, DmError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {RULE_COLS} FROM alert_rules WHERE id = ?1"),
                params![id],
                rule_from_row,
            )
            .optional()
        })
    }

    pub fn list_alert_rules(&self) -> Result<Vec<AlertRule>, DmError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {RULE_COLS} FROM alert_rules ORDER BY name"))?;
            let rows = stmt.query_map([], rule_from_row)?;
            rows.collect()
        })
    }

    pub fn list_enabled_alert_rules(&self) -> Result<Vec<AlertRule>, DmError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RULE_COLS} FROM alert_rules WHERE enabled = 1"
            ))?;
            let rows = stmt.query_map([], rule_from_row)?;
            rows.collect()
        })
    }

    pub fn delete_alert_rule(&self, id: &str) -> Result<bool, DmError> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM alert_rules WHERE id = ?1", params![id])?;
            Ok(n > 0)
        })
    }

    // ── Alerts ──────────────────────────────────────────────────

    pub fn insert_alert(&self, alert: &Alert) -> Result<(), DmError> {
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO alerts ({ALERT_COLS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
                ),
                params![
                    alert.id,
                    alert.dedup_key,
                    alert.rule_id,
                    alert.rule_version,
                    alert.scope_type,
                    alert.scope_id,
                    alert.host_id,
                    alert.kind,
                    alert.severity,
                    alert.state.as_str(),
                    ts_to_sql(alert.first_seen),
                    ts_to_sql(alert.last_seen),
                    alert.occurrences,
                    alert.current_value,
                    alert.threshold,
                    alert.last_notified_at.map(ts_to_sql),
                    alert.resolved_at.map(ts_to_sql),
                    alert.resolved_reason,
                    alert.rule_snapshot.to_string(),
                ],
            )?;
            Ok(())
        })
    }

    /// The single active (open or clearing) alert for a dedup key, if any.
    pub fn find_active_alert(&self, dedup_key: &str) -> Result<Option<Alert>, DmError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {ALERT_COLS} FROM alerts \
                     WHERE dedup_key = ?1 AND state IN ('open', 'clearing')"
                ),
                params![dedup_key],
                alert_from_row,
            )
            .optional()
        })
    }

    pub fn update_alert(&self, alert: &Alert) -> Result<(), DmError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE alerts SET state = ?1, last_seen = ?2, occurrences = ?3, \
                 current_value = ?4, last_notified_at = ?5, resolved_at = ?6, \
                 resolved_reason = ?7 WHERE id = ?8",
                params![
                    alert.state.as_str(),
                    ts_to_sql(alert.last_seen),
                    alert.occurrences,
                    alert.current_value,
                    alert.last_notified_at.map(ts_to_sql),
                    alert.resolved_at.map(ts_to_sql),
                    alert.resolved_reason,
                    alert.id,
                ],
            )?;
            Ok(())
        })
    }

    pub fn list_alerts(&self, include_resolved: bool) -> Result<Vec<Alert>, DmError> {
        let filter = if include_resolved {
            ""
        } else {
            "WHERE state IN ('open', 'clearing')"
        };
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ALERT_COLS} FROM alerts {filter} ORDER BY last_seen DESC"
            ))?;
            let rows = stmt.query_map([], alert_from_row)?;
            rows.collect()
        })
    }

    pub fn purge_resolved_alerts_older_than(&self, days: i64) -> Result<usize, DmError> {
        let cutoff = Utc::now() - Duration::days(days);
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM alerts WHERE state = 'resolved' AND resolved_at < ?1",
                params![ts_to_sql(cutoff)],
            )
        })
    }

    // ── Rule runtime snapshots ──────────────────────────────────

    pub fn load_rule_runtime(&self, key: &str) -> Result<Option<RuleRuntimeState>, DmError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT state FROM rule_runtime WHERE runtime_key = ?1",
                params![key],
                |row| {
                    let raw: String = row.get(0)?;
                    Ok(serde_json::from_str(&raw).unwrap_or_default())
                },
            )
            .optional()
        })
    }

    pub fn save_rule_runtime(&self, key: &str, state: &RuleRuntimeState) -> Result<(), DmError> {
        let json = serde_json::to_string(state)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rule_runtime (runtime_key, state, updated_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(runtime_key) DO UPDATE SET state = excluded.state, \
                 updated_at = excluded.updated_at",
                params![key, json, ts_to_sql(Utc::now())],
            )?;
            Ok(())
        })
    }

    pub fn delete_rule_runtime(&self, key: &str) -> Result<(), DmError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM rule_runtime WHERE runtime_key = ?1", params![key])?;
            Ok(())
        })
    }

    pub fn record_rule_evaluation(
        &self,
        rule_id: &str,
        scope_id: &str,
        value: f64,
        breached: bool,
        at: DateTime<Utc>,
    ) -> Result<(), DmError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rule_evaluations (rule_id, scope_id, value, breached, at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![rule_id, scope_id, value, breached as i64, ts_to_sql(at)],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: &str) -> AlertRule {
        AlertRule {
            id: id.into(),
            name: "cpu high".into(),
            scope: RuleScope::Container,
            kind: "cpu".into(),
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
            cooldown_seconds: Some(120),
            notification_cooldown_seconds: None,
            host_selector: None,
            container_selector: None,
            labels: None,
            notify_channels: Some(vec!["slack".into()]),
            depends_on: None,
            version: 1,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_rule_roundtrip_and_version_bump() {
        let store = Store::open_in_memory().unwrap();
        store.create_alert_rule(&rule("r1")).unwrap();

        let loaded = store.get_alert_rule("r1").unwrap().unwrap();
        assert_eq!(loaded.threshold, Some(90.0));
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.effective_cooldown_seconds(), 120);

        store.update_alert_rule(&loaded).unwrap();
        let bumped = store.get_alert_rule("r1").unwrap().unwrap();
        assert_eq!(bumped.version, 2);
    }

    #[test]
    fn test_active_alert_lookup_by_dedup_key() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let alert = Alert {
            id: "a1".into(),
            dedup_key: "r1|cpu|container:h1:abc".into(),
            rule_id: "r1".into(),
            rule_version: 1,
            scope_type: "container".into(),
            scope_id: "h1:abc".into(),
            host_id: Some("h1".into()),
            kind: "cpu".into(),
            severity: "warning".into(),
            state: AlertState::Open,
            first_seen: now,
            last_seen: now,
            occurrences: 1,
            current_value: Some(97.0),
            threshold: Some(90.0),
            last_notified_at: None,
            resolved_at: None,
            resolved_reason: None,
            rule_snapshot: serde_json::json!({"id": "r1"}),
        };
        store.insert_alert(&alert).unwrap();

        let found = store
            .find_active_alert("r1|cpu|container:h1:abc")
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "a1");

        let mut resolved = found;
        resolved.state = AlertState::Resolved;
        resolved.resolved_at = Some(Utc::now());
        store.update_alert(&resolved).unwrap();
        assert!(store
            .find_active_alert("r1|cpu|container:h1:abc")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_rule_runtime_snapshot_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let state = RuleRuntimeState {
            breach_count: 2,
            breach_started_at: Some(Utc::now()),
            ..Default::default()
        };
        store.save_rule_runtime("r1|container:h1:abc", &state).unwrap();
        let loaded = store
            .load_rule_runtime("r1|container:h1:abc")
            .unwrap()
            .unwrap();
        assert_eq!(loaded.breach_count, 2);
        store.delete_rule_runtime("r1|container:h1:abc").unwrap();
        assert!(store.load_rule_runtime("r1|container:h1:abc").unwrap().is_none());
    }
}

//! Alert rule validation: bounds, operator/threshold coherence, selector
//! size caps and ReDoS screening.

use dm_common::DmError;
use dm_store::models::AlertRule;
use serde_json::Value;

const MAX_DURATION_SECONDS: i64 = 86_400;
const MIN_OCCURRENCES: i64 = 1;
const MAX_OCCURRENCES: i64 = 100;
const MAX_SELECTOR_SIZE_BYTES: usize = 10_000;
const MAX_LABELS_SIZE_BYTES: usize = 5_000;
const MAX_DEPENDENCIES: usize = 5;
const MAX_NOTIFICATION_CHANNELS: usize = 10;

const VALID_SEVERITIES: &[&str] = &["info", "warning", "critical"];
const VALID_OPERATORS: &[&str] = &[">=", "<=", "==", ">", "<", "!="];
const VALID_CHANNELS: &[&str] = &[
    "telegram", "discord", "slack", "pushover", "gotify", "ntfy", "smtp", "webhook",
];

/// Percentage metrics are bounded to [0, 100].
const PERCENTAGE_METRICS: &[&str] = &["cpu_percent", "memory_percent", "disk_free_pct", "disk_used_pct"];

/// Substrings with catastrophic-backtracking shapes, rejected verbatim.
const REDOS_PATTERNS: &[&str] = &[".*.*.*", ".+.+.+", "(.*)*", "(.+)+", "(.*)+", "(.+)*"];

fn err(message: impl Into<String>) -> DmError {
    DmError::Validation(message.into())
}

pub fn validate_rule(rule: &AlertRule) -> Result<(), DmError> {
    if rule.name.trim().is_empty() {
        return Err(err("Rule name is required"));
    }
    if rule.kind.is_empty() || !rule.kind.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_') {
        return Err(err(
            "Kind must contain only lowercase letters, numbers, and underscores",
        ));
    }
    if !VALID_SEVERITIES.contains(&rule.severity.as_str()) {
        return Err(err(format!(
            "Invalid severity '{}'. Must be one of: {}",
            rule.severity,
            VALID_SEVERITIES.join(", ")
        )));
    }

    if rule.is_metric_driven() {
        validate_threshold(rule)?;
    }
    validate_durations(rule)?;

    if let Some(occurrences) = rule.occurrences {
        if !(MIN_OCCURRENCES..=MAX_OCCURRENCES).contains(&occurrences) {
            return Err(err(format!(
                "Occurrences must be between {MIN_OCCURRENCES} and {MAX_OCCURRENCES}"
            )));
        }
    }

    validate_selector("host_selector", rule.host_selector.as_ref())?;
    validate_selector("container_selector", rule.container_selector.as_ref())?;
    validate_labels(rule.labels.as_ref())?;
    validate_notifications(rule)?;
    validate_dependencies(rule)?;

    Ok(())
}

fn validate_threshold(rule: &AlertRule) -> Result<(), DmError> {
    let metric = rule.metric.as_deref().unwrap_or_default();
    let threshold = rule
        .threshold
        .ok_or_else(|| err("Threshold is required for metric-driven rules"))?;
    let operator = rule
        .operator
        .as_deref()
        .ok_or_else(|| err("Operator is required for metric-driven rules"))?;

    if !VALID_OPERATORS.contains(&operator) {
        return Err(err(format!(
            "Invalid operator '{operator}'. Must be one of: {}",
            VALID_OPERATORS.join(", ")
        )));
    }

    if PERCENTAGE_METRICS.contains(&metric) {
        if !(0.0..=100.0).contains(&threshold) {
            return Err(err("Percentage metric threshold must be between 0 and 100"));
        }
        if let Some(ct) = rule.clear_threshold {
            if !(0.0..=100.0).contains(&ct) {
                return Err(err(
                    "Percentage metric clear threshold must be between 0 and 100",
                ));
            }
        }
    } else if threshold < 0.0 {
        return Err(err("Count metric threshold must be non-negative"));
    }

    // The clear threshold must sit on the opposite side of the threshold
    // relative to the operator, or clearing could never complete.
    if let Some(ct) = rule.clear_threshold {
        match operator {
            ">=" | ">" if ct >= threshold => {
                return Err(err(format!(
                    "Clear threshold must be below threshold for {operator} operator"
                )));
            }
            "<=" | "<" if ct <= threshold => {
                return Err(err(format!(
                    "Clear threshold must be above threshold for {operator} operator"
                )));
            }
            _ => {}
        }
    }

    Ok(())
}

fn validate_durations(rule: &AlertRule) -> Result<(), DmError> {
    for (name, value) in [
        ("duration_seconds", rule.duration_seconds),
        ("clear_duration_seconds", rule.clear_duration_seconds),
        ("grace_seconds", rule.grace_seconds),
        ("cooldown_seconds", rule.cooldown_seconds),
        (
            "notification_cooldown_seconds",
            rule.notification_cooldown_seconds,
        ),
    ] {
        if let Some(v) = value {
            if !(0..=MAX_DURATION_SECONDS).contains(&v) {
                return Err(err(format!(
                    "{name} must be between 0 and {MAX_DURATION_SECONDS}s (24 hours)"
                )));
            }
        }
    }
    Ok(())
}

fn validate_selector(field: &str, selector: Option<&Value>) -> Result<(), DmError> {
    let Some(selector) = selector else {
        return Ok(());
    };
    let size = selector.to_string().len();
    if size > MAX_SELECTOR_SIZE_BYTES {
        return Err(DmError::ValidationSize(format!(
            "{field} too large (max {MAX_SELECTOR_SIZE_BYTES} bytes)"
        )));
    }
    if let Some(pattern) = selector.get("regex").and_then(Value::as_str) {
        validate_regex(pattern)?;
    }
    Ok(())
}

fn validate_labels(labels: Option<&Value>) -> Result<(), DmError> {
    let Some(labels) = labels else {
        return Ok(());
    };
    if labels.to_string().len() > MAX_LABELS_SIZE_BYTES {
        return Err(DmError::ValidationSize(format!(
            "Labels JSON too large (max {MAX_LABELS_SIZE_BYTES} bytes)"
        )));
    }
    if !labels.is_object() {
        return Err(err("Labels must be an object of key/value pairs"));
    }
    Ok(())
}

pub fn validate_regex(pattern: &str) -> Result<(), DmError> {
    regex::Regex::new(pattern)
        .map_err(|e| DmError::ValidationRegex(format!("Invalid regex pattern: {e}")))?;

    for dangerous in REDOS_PATTERNS {
        if pattern.contains(dangerous) {
            return Err(DmError::ValidationRegex(format!(
                "Regex pattern may cause catastrophic backtracking: contains '{dangerous}'"
            )));
        }
    }
    Ok(())
}

fn validate_notifications(rule: &AlertRule) -> Result<(), DmError> {
    let Some(channels) = &rule.notify_channels else {
        return Ok(());
    };
    if channels.len() > MAX_NOTIFICATION_CHANNELS {
        return Err(err(format!(
            "Maximum {MAX_NOTIFICATION_CHANNELS} notification channels allowed"
        )));
    }
    for channel in channels {
        if !VALID_CHANNELS.contains(&channel.as_str()) {
            return Err(err(format!(
                "Invalid notification channel '{channel}'. Must be one of: {}",
                VALID_CHANNELS.join(", ")
            )));
        }
    }
    Ok(())
}

fn validate_dependencies(rule: &AlertRule) -> Result<(), DmError> {
    let Some(depends_on) = &rule.depends_on else {
        return Ok(());
    };
    if depends_on.len() > MAX_DEPENDENCIES {
        return Err(err(format!("Maximum {MAX_DEPENDENCIES} dependencies allowed")));
    }
    if depends_on.iter().any(|dep| dep == &rule.id) {
        return Err(err("Rule cannot depend on itself"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dm_store::models::RuleScope;
    use serde_json::json;

    fn base_rule() -> AlertRule {
        AlertRule {
            id: "cpu_high".into(),
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
            cooldown_seconds: None,
            notification_cooldown_seconds: None,
            host_selector: None,
            container_selector: None,
            labels: None,
            notify_channels: None,
            depends_on: None,
            version: 1,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_valid_rule_passes() {
        validate_rule(&base_rule()).unwrap();
    }

    #[test]
    fn test_clear_threshold_must_oppose_operator() {
        let mut rule = base_rule();
        rule.clear_threshold = Some(95.0);
        let e = validate_rule(&rule).unwrap_err();
        assert!(e.to_string().contains("below threshold"));

        rule.operator = Some("<=".into());
        rule.threshold = Some(10.0);
        rule.clear_threshold = Some(5.0);
        let e = validate_rule(&rule).unwrap_err();
        assert!(e.to_string().contains("above threshold"));
    }

    #[test]
    fn test_redos_pattern_rejected() {
        let mut rule = base_rule();
        rule.container_selector = Some(json!({"regex": ".*.*.*"}));
        assert!(matches!(
            validate_rule(&rule),
            Err(DmError::ValidationRegex(_))
        ));
    }

    #[test]
    fn test_occurrences_bounds() {
        let mut rule = base_rule();
        rule.occurrences = Some(0);
        assert!(validate_rule(&rule).is_err());
        rule.occurrences = Some(101);
        assert!(validate_rule(&rule).is_err());
        rule.occurrences = Some(100);
        validate_rule(&rule).unwrap();
    }

    #[test]
    fn test_duration_bounds() {
        let mut rule = base_rule();
        rule.duration_seconds = Some(86_401);
        assert!(validate_rule(&rule).is_err());
    }

    #[test]
    fn test_self_dependency_rejected() {
        let mut rule = base_rule();
        rule.depends_on = Some(vec!["cpu_high".into()]);
        assert!(validate_rule(&rule).is_err());
    }

    #[test]
    fn test_selector_size_cap() {
        let mut rule = base_rule();
        let big = "x".repeat(MAX_SELECTOR_SIZE_BYTES + 1);
        rule.host_selector = Some(json!({"note": big}));
        assert!(matches!(
            validate_rule(&rule),
            Err(DmError::ValidationSize(_))
        ));
    }

    #[test]
    fn test_unknown_channel_rejected() {
        let mut rule = base_rule();
        rule.notify_channels = Some(vec!["carrier_pigeon".into()]);
        assert!(validate_rule(&rule).is_err());
    }
}

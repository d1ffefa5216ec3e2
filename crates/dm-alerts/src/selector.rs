//! Rule-to-context matching: scope, host/container selectors, label subset.

use std::collections::HashMap;

use dm_store::models::{AlertRule, RuleScope};
use serde_json::Value;
use tracing::warn;

/// The (metric|event, context) a rule is matched against.
#[derive(Debug, Clone)]
pub struct AlertContext {
    pub scope: RuleScope,
    /// Composite `{host_id}:{short_id}` for containers, host id for hosts.
    pub scope_id: String,
    pub scope_name: String,
    pub host_id: Option<String>,
    pub host_name: Option<String>,
    pub labels: HashMap<String, String>,
}

impl AlertContext {
    pub fn container(
        scope_id: impl Into<String>,
        name: impl Into<String>,
        host_id: impl Into<String>,
        host_name: impl Into<String>,
    ) -> Self {
        Self {
            scope: RuleScope::Container,
            scope_id: scope_id.into(),
            scope_name: name.into(),
            host_id: Some(host_id.into()),
            host_name: Some(host_name.into()),
            labels: HashMap::new(),
        }
    }

    pub fn host(host_id: impl Into<String>, host_name: impl Into<String>) -> Self {
        let host_id = host_id.into();
        Self {
            scope: RuleScope::Host,
            scope_id: host_id.clone(),
            scope_name: host_name.into(),
            host_id: Some(host_id),
            host_name: None,
            labels: HashMap::new(),
        }
    }

    pub fn with_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.labels = labels;
        self
    }
}

/// Whether an enabled rule applies to this context. Group-scoped rules are
/// selector-driven and match container contexts.
pub fn rule_matches(rule: &AlertRule, ctx: &AlertContext) -> bool {
    if !rule.enabled {
        return false;
    }
    let scope_ok = match rule.scope {
        RuleScope::Group => ctx.scope == RuleScope::Container,
        scope => scope == ctx.scope,
    };
    if !scope_ok {
        return false;
    }

    if !host_selector_matches(rule.host_selector.as_ref(), ctx) {
        return false;
    }
    if !container_selector_matches(rule.container_selector.as_ref(), ctx) {
        return false;
    }
    labels_match(rule.labels.as_ref(), &ctx.labels)
}

fn host_selector_matches(selector: Option<&Value>, ctx: &AlertContext) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    if let Some(ids) = selector.get("ids").and_then(Value::as_array) {
        let host_id = ctx.host_id.as_deref().unwrap_or_default();
        if !ids.iter().filter_map(Value::as_str).any(|id| id == host_id) {
            return false;
        }
    }
    if let Some(pattern) = selector.get("regex").and_then(Value::as_str) {
        let target = ctx
            .host_name
            .as_deref()
            .or(ctx.host_id.as_deref())
            .unwrap_or_default();
        if !regex_matches(pattern, target) {
            return false;
        }
    }
    true
}

fn container_selector_matches(selector: Option<&Value>, ctx: &AlertContext) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    if ctx.scope != RuleScope::Container {
        return true;
    }
    if let Some(names) = selector.get("names").and_then(Value::as_array) {
        if !names
            .iter()
            .filter_map(Value::as_str)
            .any(|n| n == ctx.scope_name)
        {
            return false;
        }
    }
    if let Some(pattern) = selector.get("regex").and_then(Value::as_str) {
        if !regex_matches(pattern, &ctx.scope_name) {
            return false;
        }
    }
    true
}

/// Every rule label must be present and equal in the context labels.
fn labels_match(rule_labels: Option<&Value>, ctx_labels: &HashMap<String, String>) -> bool {
    let Some(obj) = rule_labels.and_then(Value::as_object) else {
        return true;
    };
    obj.iter().all(|(key, value)| {
        value
            .as_str()
            .map(|v| ctx_labels.get(key).map(String::as_str) == Some(v))
            .unwrap_or(false)
    })
}

fn regex_matches(pattern: &str, target: &str) -> bool {
    match regex::Regex::new(pattern) {
        Ok(re) => re.is_match(target),
        Err(e) => {
            // Rules are validated on write; a bad pattern here means storage
            // predates validation. Fail closed.
            warn!(pattern, "Selector regex failed to compile: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn rule(scope: RuleScope) -> AlertRule {
        AlertRule {
            id: "r1".into(),
            name: "r1".into(),
            scope,
            kind: "state_change".into(),
            severity: "warning".into(),
            enabled: true,
            metric: None,
            operator: None,
            threshold: None,
            clear_threshold: None,
            duration_seconds: None,
            clear_duration_seconds: None,
            occurrences: None,
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

    fn ctx() -> AlertContext {
        AlertContext::container("h1:abc123def456", "web-frontend", "h1", "edge-host")
    }

    #[test]
    fn test_scope_mismatch() {
        let r = rule(RuleScope::Host);
        assert!(!rule_matches(&r, &ctx()));
        assert!(rule_matches(&r, &AlertContext::host("h1", "edge-host")));
    }

    #[test]
    fn test_container_regex_selector() {
        let mut r = rule(RuleScope::Container);
        r.container_selector = Some(json!({"regex": "^web-"}));
        assert!(rule_matches(&r, &ctx()));

        r.container_selector = Some(json!({"regex": "^db-"}));
        assert!(!rule_matches(&r, &ctx()));
    }

    #[test]
    fn test_host_id_selector() {
        let mut r = rule(RuleScope::Container);
        r.host_selector = Some(json!({"ids": ["h1"]}));
        assert!(rule_matches(&r, &ctx()));

        r.host_selector = Some(json!({"ids": ["h2"]}));
        assert!(!rule_matches(&r, &ctx()));
    }

    #[test]
    fn test_label_subset_match() {
        let mut r = rule(RuleScope::Container);
        r.labels = Some(json!({"env": "prod"}));

        let mut labels = HashMap::new();
        labels.insert("env".to_string(), "prod".to_string());
        labels.insert("team".to_string(), "core".to_string());
        assert!(rule_matches(&r, &ctx().with_labels(labels)));

        let mut wrong = HashMap::new();
        wrong.insert("env".to_string(), "staging".to_string());
        assert!(!rule_matches(&r, &ctx().with_labels(wrong)));
    }

    #[test]
    fn test_disabled_rule_never_matches() {
        let mut r = rule(RuleScope::Container);
        r.enabled = false;
        assert!(!rule_matches(&r, &ctx()));
    }

    #[test]
    fn test_group_scope_matches_containers() {
        let r = rule(RuleScope::Group);
        assert!(rule_matches(&r, &ctx()));
    }
}

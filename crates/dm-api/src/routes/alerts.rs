use axum::extract::{Path, Query, State};
use axum::routing::{delete, get};
use axum::{Json, Router};
use chrono::Utc;
use dm_alerts::validate_rule;
use dm_common::DmError;
use dm_store::models::{AlertRule, RuleScope};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::auth::CurrentUser;
use crate::error::ApiResult;
use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/", get(list_alerts).post(create_rule))
        .route("/rules", get(list_rules))
        .route("/rules/{id}", delete(delete_rule))
}

#[derive(Deserialize)]
struct AlertQuery {
    #[serde(default)]
    include_resolved: bool,
}

async fn list_alerts(
    State(state): State<ApiState>,
    _user: CurrentUser,
    Query(query): Query<AlertQuery>,
) -> ApiResult<Json<Value>> {
    let alerts = state.store.list_alerts(query.include_resolved)?;
    Ok(Json(json!({"alerts": alerts})))
}

#[derive(Deserialize)]
struct CreateRuleRequest {
    name: String,
    scope: String,
    kind: String,
    severity: String,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    metric: Option<String>,
    #[serde(default)]
    operator: Option<String>,
    #[serde(default)]
    threshold: Option<f64>,
    #[serde(default)]
    clear_threshold: Option<f64>,
    #[serde(default)]
    duration_seconds: Option<i64>,
    #[serde(default)]
    clear_duration_seconds: Option<i64>,
    #[serde(default)]
    occurrences: Option<i64>,
    #[serde(default)]
    grace_seconds: Option<i64>,
    #[serde(default)]
    cooldown_seconds: Option<i64>,
    #[serde(default)]
    notification_cooldown_seconds: Option<i64>,
    #[serde(default)]
    host_selector: Option<Value>,
    #[serde(default)]
    container_selector: Option<Value>,
    #[serde(default)]
    labels: Option<Value>,
    #[serde(default)]
    notify_channels: Option<Vec<String>>,
    #[serde(default)]
    depends_on: Option<Vec<String>>,
}

async fn create_rule(
    State(state): State<ApiState>,
    user: CurrentUser,
    Json(req): Json<CreateRuleRequest>,
) -> ApiResult<Json<Value>> {
    user.require("alerts:manage")?;
    let scope = RuleScope::parse(&req.scope)
        .ok_or_else(|| DmError::Validation(format!("Invalid scope '{}'", req.scope)))?;

    let rule = AlertRule {
        id: uuid::Uuid::new_v4().to_string(),
        name: req.name,
        scope,
        kind: req.kind,
        severity: req.severity,
        enabled: req.enabled.unwrap_or(true),
        metric: req.metric,
        operator: req.operator,
        threshold: req.threshold,
        clear_threshold: req.clear_threshold,
        duration_seconds: req.duration_seconds,
        clear_duration_seconds: req.clear_duration_seconds,
        occurrences: req.occurrences,
        grace_seconds: req.grace_seconds,
        cooldown_seconds: req.cooldown_seconds,
        notification_cooldown_seconds: req.notification_cooldown_seconds,
        host_selector: req.host_selector,
        container_selector: req.container_selector,
        labels: req.labels,
        notify_channels: req.notify_channels,
        depends_on: req.depends_on,
        version: 1,
        created_at: Utc::now(),
    };
    validate_rule(&rule)?;
    state.store.create_alert_rule(&rule)?;
    let _ = state.store.append_audit(
        &user.username, "alert_rule.create", "alert_rule", Some(&rule.id), None, None, None,
    );
    Ok(Json(json!({"id": rule.id})))
}

async fn list_rules(State(state): State<ApiState>, _user: CurrentUser) -> ApiResult<Json<Value>> {
    let rules = state.store.list_alert_rules()?;
    Ok(Json(json!({"rules": rules})))
}

async fn delete_rule(
    State(state): State<ApiState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    user.require("alerts:manage")?;
    if !state.store.delete_alert_rule(&id)? {
        return Err(DmError::NotFound(format!("Rule {id} not found")).into());
    }
    let _ = state.store.append_audit(
        &user.username, "alert_rule.delete", "alert_rule", Some(&id), None, None, None,
    );
    Ok(Json(json!({"deleted": true})))
}

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use dm_store::models::GlobalSettings;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::auth::CurrentUser;
use crate::error::ApiResult;
use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/health", get(health))
        .route("/events", get(events))
        .route("/settings", get(settings).put(update_settings))
        .route("/audit", get(audit))
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

#[derive(Deserialize)]
struct EventsQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    100
}

async fn events(
    State(state): State<ApiState>,
    _user: CurrentUser,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Value>> {
    let events = state.store.list_recent_events(query.limit.clamp(1, 1000))?;
    Ok(Json(json!({"events": events})))
}

async fn settings(State(state): State<ApiState>, _user: CurrentUser) -> ApiResult<Json<Value>> {
    let settings = state.store.global_settings()?;
    Ok(Json(serde_json::to_value(settings).map_err(dm_common::DmError::from)?))
}

async fn update_settings(
    State(state): State<ApiState>,
    user: CurrentUser,
    Json(settings): Json<GlobalSettings>,
) -> ApiResult<Json<Value>> {
    user.require("settings:manage")?;
    state.store.save_global_settings(&settings)?;
    state.bus.reload_suppression();
    let _ = state.store.append_audit(
        &user.username, "settings.update", "global_settings", Some("1"), None, None, None,
    );
    Ok(Json(json!({"ok": true})))
}

async fn audit(State(state): State<ApiState>, user: CurrentUser) -> ApiResult<Json<Value>> {
    user.require("audit:read")?;
    let entries = state.store.list_audit_entries(200)?;
    Ok(Json(json!({"audit": entries})))
}

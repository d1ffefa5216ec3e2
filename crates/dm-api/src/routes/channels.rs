use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use dm_common::DmError;
use dm_notify::channel_from_row;
use dm_store::models::NotificationChannelRow;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::auth::CurrentUser;
use crate::error::ApiResult;
use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/{id}", axum::routing::delete(remove))
        .route("/{id}/test", post(test))
}

async fn list(State(state): State<ApiState>, _user: CurrentUser) -> ApiResult<Json<Value>> {
    let channels = state.store.list_notification_channels()?;
    let channels: Vec<Value> = channels
        .into_iter()
        .map(|c| {
            json!({
                "id": c.id,
                "type": c.channel_type,
                "name": c.name,
                "enabled": c.enabled,
            })
        })
        .collect();
    Ok(Json(json!({"channels": channels})))
}

#[derive(Deserialize)]
struct CreateChannelRequest {
    #[serde(rename = "type")]
    channel_type: String,
    name: String,
    config: Value,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

async fn create(
    State(state): State<ApiState>,
    user: CurrentUser,
    Json(req): Json<CreateChannelRequest>,
) -> ApiResult<Json<Value>> {
    user.require("notifications:manage")?;
    // Parse through the typed sum to reject bad configs before storing
    let probe = NotificationChannelRow {
        id: 0,
        channel_type: req.channel_type.clone(),
        name: req.name.clone(),
        config: req.config.clone(),
        enabled: req.enabled,
    };
    channel_from_row(&probe)?;

    let id = state
        .store
        .create_notification_channel(&req.channel_type, &req.name, &req.config, req.enabled)?;
    let _ = state.store.append_audit(
        &user.username,
        "notification_channel.create",
        "notification_channel",
        Some(&id.to_string()),
        None,
        None,
        None,
    );
    Ok(Json(json!({"id": id})))
}

async fn remove(
    State(state): State<ApiState>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    user.require("notifications:manage")?;
    if !state.store.delete_notification_channel(id)? {
        return Err(DmError::NotFound(format!("Channel {id} not found")).into());
    }
    Ok(Json(json!({"deleted": true})))
}

async fn test(
    State(state): State<ApiState>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    user.require("notifications:manage")?;
    let row = state
        .store
        .list_notification_channels()?
        .into_iter()
        .find(|c| c.id == id)
        .ok_or_else(|| DmError::NotFound(format!("Channel {id} not found")))?;
    let channel = channel_from_row(&row)?;
    state.dispatcher.test_channel(&channel).await?;
    Ok(Json(json!({"ok": true})))
}

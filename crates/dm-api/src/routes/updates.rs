use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use dm_common::DmError;
use dm_updates::{UpdateContext, noop_progress};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::auth::CurrentUser;
use crate::error::ApiResult;
use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/", get(list))
        .route("/check", post(check_all))
        .route("/{container_id}/apply", post(apply))
}

async fn list(State(state): State<ApiState>, _user: CurrentUser) -> ApiResult<Json<Value>> {
    let updates = state.store.list_container_updates()?;
    Ok(Json(json!({"updates": updates})))
}

async fn check_all(State(state): State<ApiState>, user: CurrentUser) -> ApiResult<Json<Value>> {
    user.require("updates:manage")?;
    let stats = state.checker.check_all_containers().await;
    Ok(Json(serde_json::to_value(stats).map_err(DmError::from)?))
}

#[derive(Deserialize)]
struct ApplyRequest {
    host_id: String,
    container_name: String,
    #[serde(default)]
    image: Option<String>,
}

async fn apply(
    State(state): State<ApiState>,
    user: CurrentUser,
    Path(container_id): Path<String>,
    Json(req): Json<ApplyRequest>,
) -> ApiResult<Json<Value>> {
    user.require("updates:manage")?;

    let composite = dm_common::keys::make_composite_key(&req.host_id, &container_id);
    let new_image = match req.image {
        Some(image) => image,
        None => state
            .store
            .get_container_update(&composite)?
            .and_then(|r| r.latest_image)
            .ok_or_else(|| DmError::NotFound("No known update for this container".into()))?,
    };

    let _ = state.store.append_audit(
        &user.username, "update.apply", "container", Some(&composite), None, None, None,
    );

    // Runs in the background; progress and outcome stream over /ws
    let updates = Arc::clone(&state.updates);
    tokio::spawn(async move {
        updates
            .execute(
                UpdateContext {
                    host_id: req.host_id,
                    container_id,
                    container_name: req.container_name,
                    new_image,
                },
                noop_progress(),
            )
            .await;
    });

    Ok(Json(json!({"accepted": true})))
}

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use dm_common::DmError;
use dm_deploy::DeployRequest;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::auth::CurrentUser;
use crate::error::ApiResult;
use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/{id}", get(fetch).delete(remove))
}

async fn create(
    State(state): State<ApiState>,
    user: CurrentUser,
    Json(req): Json<DeployRequest>,
) -> ApiResult<Json<Value>> {
    user.require("deployments:create")?;
    if req.compose_yaml.trim().is_empty() {
        return Err(DmError::Validation("Compose document is empty".into()).into());
    }
    let _ = state.store.append_audit(
        &user.username, "deployment.create", "deployment", None, None, None, None,
    );

    // The deployment runs in the background; progress streams over /ws
    let executor = Arc::clone(&state.deployments);
    let handle = tokio::spawn(async move { executor.deploy(req).await });
    drop(handle);

    Ok(Json(json!({"accepted": true})))
}

async fn list(State(state): State<ApiState>, _user: CurrentUser) -> ApiResult<Json<Value>> {
    let deployments = state.store.list_deployments(None)?;
    Ok(Json(json!({"deployments": deployments})))
}

async fn fetch(
    State(state): State<ApiState>,
    _user: CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let deployment = state
        .store
        .get_deployment(&id)?
        .ok_or_else(|| DmError::NotFound(format!("Deployment {id} not found")))?;
    Ok(Json(serde_json::to_value(deployment).map_err(DmError::from)?))
}

async fn remove(
    State(state): State<ApiState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    user.require("deployments:delete")?;
    // Gated: terminal states plus planning only
    state.store.delete_deployment(&id)?;
    let _ = state.store.append_audit(
        &user.username, "deployment.delete", "deployment", Some(&id), None, None, None,
    );
    Ok(Json(json!({"deleted": true})))
}

use std::time::Duration;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use dm_common::DmError;
use dm_store::models::ConnectionType;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::auth::CurrentUser;
use crate::error::ApiResult;
use crate::state::ApiState;

const STOP_TIMEOUT_SECS: u64 = 10;
const AGENT_ACTION_TIMEOUT: Duration = Duration::from_secs(60);

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/", get(list))
        .route("/{id}/{action}", post(action))
}

async fn list(State(state): State<ApiState>, _user: CurrentUser) -> Json<Value> {
    let containers = state.monitor.get_containers().await;
    Json(json!({"containers": containers}))
}

#[derive(Deserialize)]
struct ActionRequest {
    host_id: String,
}

async fn action(
    State(state): State<ApiState>,
    user: CurrentUser,
    Path((container_id, action)): Path<(String, String)>,
    Json(req): Json<ActionRequest>,
) -> ApiResult<Json<Value>> {
    user.require("containers:control")?;
    if !matches!(action.as_str(), "start" | "stop" | "restart" | "pause" | "unpause") {
        return Err(DmError::Validation(format!("Unknown action '{action}'")).into());
    }

    let host = state
        .store
        .get_host(&req.host_id)?
        .ok_or_else(|| DmError::NotFound(format!("Host {} not found", req.host_id)))?;

    if host.connection_type == ConnectionType::Agent {
        let agent = state
            .store
            .get_agent_for_host(&host.id)?
            .ok_or_else(|| DmError::AgentUnavailable("No agent for host".into()))?;
        let result = state
            .coordinator
            .execute_command(
                &agent.id,
                "container_action",
                json!({"action": action, "container_id": container_id}),
                AGENT_ACTION_TIMEOUT,
            )
            .await?;
        if !result.ok() {
            return Err(DmError::engine(
                None,
                result.error.unwrap_or_else(|| "Agent action failed".into()),
            )
            .into());
        }
    } else {
        let client = state.monitor.client(&host.id).await.ok_or_else(|| {
            DmError::AgentUnavailable(format!("No engine client for host {}", host.id))
        })?;
        match action.as_str() {
            "start" => client.start_container(&container_id).await?,
            "stop" => client.stop_container(&container_id, STOP_TIMEOUT_SECS).await?,
            "restart" => client.restart_container(&container_id, STOP_TIMEOUT_SECS).await?,
            "pause" => client.pause_container(&container_id).await?,
            "unpause" => client.unpause_container(&container_id).await?,
            _ => unreachable!(),
        }
    }

    let _ = state.store.append_audit(
        &user.username,
        &format!("container.{action}"),
        "container",
        Some(&container_id),
        None,
        None,
        None,
    );
    Ok(Json(json!({"ok": true})))
}

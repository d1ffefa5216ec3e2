use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use dm_common::DmError;
use dm_store::models::{ConnectionType, Host};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::auth::CurrentUser;
use crate::error::ApiResult;
use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/{id}", delete(remove))
        .route("/tokens", post(create_registration_token))
}

async fn list(State(state): State<ApiState>, _user: CurrentUser) -> ApiResult<Json<Value>> {
    let hosts = state.store.list_hosts()?;
    let agents = state.store.list_agents()?;
    let hosts: Vec<Value> = hosts
        .into_iter()
        .map(|h| {
            let agent = agents.iter().find(|a| a.host_id == h.id);
            json!({
                "id": h.id,
                "name": h.name,
                "url": h.url,
                "connection_type": h.connection_type.as_str(),
                "engine_id": h.engine_id,
                "replaced_by_host_id": h.replaced_by_host_id,
                "agent": agent.map(|a| json!({
                    "id": a.id,
                    "version": a.version,
                    "status": a.status.as_str(),
                    "last_seen_at": a.last_seen_at,
                })),
            })
        })
        .collect();
    Ok(Json(json!({"hosts": hosts})))
}

#[derive(Deserialize)]
struct CreateHostRequest {
    name: String,
    url: String,
    connection_type: String,
}

async fn create(
    State(state): State<ApiState>,
    user: CurrentUser,
    Json(req): Json<CreateHostRequest>,
) -> ApiResult<Json<Value>> {
    user.require("hosts:manage")?;
    let connection_type = ConnectionType::parse(&req.connection_type)
        .ok_or_else(|| DmError::Validation(format!("Invalid connection type '{}'", req.connection_type)))?;

    let host = Host {
        id: uuid::Uuid::new_v4().to_string(),
        name: req.name,
        url: req.url,
        connection_type,
        engine_id: None,
        replaced_by_host_id: None,
        tls_material: None,
        created_by: Some(user.username.clone()),
        created_at: Utc::now(),
    };

    // Direct hosts get an engine client; the engine's identity becomes the
    // host's engine_id so a later agent can take it over.
    if connection_type != ConnectionType::Agent {
        state
            .monitor
            .add_host(&host.id, &host.name, &host.url, false)
            .await?;
        if let Some(client) = state.monitor.client(&host.id).await {
            if let Ok(engine_id) = client.engine_id().await {
                if !engine_id.is_empty() {
                    let mut host = host.clone();
                    host.engine_id = Some(engine_id);
                    state.store.create_host(&host)?;
                    info!(host = host.name, "Host created");
                    let _ = state.store.append_audit(
                        &user.username, "host.create", "host", Some(&host.id), None, None, None,
                    );
                    return Ok(Json(json!({"id": host.id})));
                }
            }
        }
    }

    state.store.create_host(&host)?;
    info!(host = host.name, "Host created");
    let _ = state.store.append_audit(
        &user.username, "host.create", "host", Some(&host.id), None, None, None,
    );
    Ok(Json(json!({"id": host.id})))
}

async fn remove(
    State(state): State<ApiState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    user.require("hosts:manage")?;
    let deleted = state.store.delete_host(&id)?;
    if !deleted {
        return Err(DmError::NotFound(format!("Host {id} not found")).into());
    }
    state.monitor.remove_host(&id).await;
    let _ = state.store.append_audit(
        &user.username, "host.delete", "host", Some(&id), None, None, None,
    );
    Ok(Json(json!({"deleted": true})))
}

/// Single-use token for installing an agent; expires after 15 minutes.
async fn create_registration_token(
    State(state): State<ApiState>,
    user: CurrentUser,
) -> ApiResult<Json<Value>> {
    user.require("hosts:manage")?;
    let token = state.store.create_registration_token(Some(&user.username))?;
    Ok(Json(json!({
        "token": token.token,
        "expires_at": token.expires_at,
    })))
}

use axum::extract::{Path, State};
use axum::routing::{delete, get};
use axum::{Json, Router};
use chrono::Utc;
use dm_store::models::ApiKey;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::auth::{CurrentUser, api_key_prefix, generate_api_key, hash_api_key};
use crate::error::ApiResult;
use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/{id}", delete(revoke))
}

async fn list(State(state): State<ApiState>, user: CurrentUser) -> ApiResult<Json<Value>> {
    let keys = state.store.list_api_keys(user.user_id)?;
    let keys: Vec<Value> = keys
        .into_iter()
        .map(|k| {
            json!({
                "id": k.id,
                "name": k.name,
                "prefix": k.prefix,
                "created_at": k.created_at,
                "last_used_at": k.last_used_at,
                "revoked": k.revoked,
            })
        })
        .collect();
    Ok(Json(json!({"api_keys": keys})))
}

#[derive(Deserialize)]
struct CreateRequest {
    name: String,
}

async fn create(
    State(state): State<ApiState>,
    user: CurrentUser,
    Json(req): Json<CreateRequest>,
) -> ApiResult<Json<Value>> {
    user.require("api_keys:manage")?;
    // The full key is returned exactly once; only prefix + hash persist
    let key = generate_api_key();
    let record = ApiKey {
        id: uuid::Uuid::new_v4().to_string(),
        name: req.name,
        prefix: api_key_prefix(&key),
        key_hash: hash_api_key(&key),
        user_id: user.user_id,
        created_at: Utc::now(),
        last_used_at: None,
        revoked: false,
    };
    state.store.insert_api_key(&record)?;
    let _ = state.store.append_audit(
        &user.username,
        "api_key.create",
        "api_key",
        Some(&record.id),
        None,
        None,
        None,
    );
    Ok(Json(json!({
        "id": record.id,
        "name": record.name,
        "api_key": key,
        "prefix": record.prefix,
    })))
}

async fn revoke(
    State(state): State<ApiState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    user.require("api_keys:manage")?;
    // Idempotent: revoking twice succeeds, but only a real state change
    // produces an audit entry
    let changed = state.store.revoke_api_key(&id)?;
    if changed {
        let _ = state.store.append_audit(
            &user.username,
            "api_key.revoke",
            "api_key",
            Some(&id),
            None,
            None,
            None,
        );
    }
    Ok(Json(json!({"revoked": true, "changed": changed})))
}

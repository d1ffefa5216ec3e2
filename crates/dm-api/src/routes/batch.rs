use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use dm_batch::BatchRequest;
use dm_common::DmError;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::auth::CurrentUser;
use crate::error::ApiResult;
use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/", post(create))
        .route("/{id}", get(fetch))
}

#[derive(Deserialize)]
struct CreateBatchRequest {
    action: String,
    container_ids: Vec<String>,
    #[serde(default)]
    params: Option<Value>,
}

async fn create(
    State(state): State<ApiState>,
    user: CurrentUser,
    Json(req): Json<CreateBatchRequest>,
) -> ApiResult<Json<Value>> {
    user.require("containers:control")?;
    if req.container_ids.is_empty() {
        return Err(DmError::Validation("No containers selected".into()).into());
    }
    let job_id = state
        .batch
        .create_job(BatchRequest {
            user_id: Some(user.user_id),
            action: req.action,
            container_ids: req.container_ids,
            params: req.params,
        })
        .await?;
    let _ = state.store.append_audit(
        &user.username, "batch.create", "batch_job", Some(&job_id), None, None, None,
    );
    Ok(Json(json!({"job_id": job_id})))
}

async fn fetch(
    State(state): State<ApiState>,
    _user: CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let job = state
        .store
        .get_batch_job(&id)?
        .ok_or_else(|| DmError::NotFound(format!("Batch job {id} not found")))?;
    let items = state.store.list_batch_job_items(&id)?;
    Ok(Json(json!({"job": job, "items": items})))
}

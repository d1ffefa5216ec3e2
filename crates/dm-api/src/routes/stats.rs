//! Ingest endpoint for the stats sidecar: per-container metric samples are
//! fanned out to UI clients and fed to the alert engine.

use std::collections::HashMap;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use dm_alerts::AlertContext;
use dm_common::keys::make_composite_key;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::auth::CurrentUser;
use crate::error::ApiResult;
use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new().route("/stats", post(ingest))
}

#[derive(Deserialize)]
struct StatsSample {
    host_id: String,
    container_id: String,
    container_name: String,
    /// Metric name → value, e.g. {"cpu_percent": 93.5, "memory_percent": 40.1}
    metrics: HashMap<String, f64>,
    #[serde(default)]
    labels: HashMap<String, String>,
}

#[derive(Deserialize)]
struct StatsBatch {
    samples: Vec<StatsSample>,
}

async fn ingest(
    State(state): State<ApiState>,
    user: CurrentUser,
    Json(batch): Json<StatsBatch>,
) -> ApiResult<Json<Value>> {
    user.require("stats:ingest")?;

    for sample in &batch.samples {
        state.bus.broadcast(
            "container_stats",
            json!({
                "host_id": sample.host_id,
                "container_id": sample.container_id,
                "container_name": sample.container_name,
                "metrics": sample.metrics,
            }),
        );

        let host_name = state
            .monitor
            .host_name(&sample.host_id)
            .await
            .unwrap_or_else(|| sample.host_id.clone());
        let ctx = AlertContext::container(
            make_composite_key(&sample.host_id, &sample.container_id),
            sample.container_name.clone(),
            sample.host_id.clone(),
            host_name,
        )
        .with_labels(sample.labels.clone());

        for (metric, value) in &sample.metrics {
            state.alerts.evaluate_metric(metric, *value, &ctx);
        }
    }

    Ok(Json(json!({"ingested": batch.samples.len()})))
}

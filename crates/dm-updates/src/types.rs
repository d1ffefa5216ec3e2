use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Input to one container update.
#[derive(Debug, Clone)]
pub struct UpdateContext {
    pub host_id: String,
    /// Short (12 char) container id.
    pub container_id: String,
    pub container_name: String,
    pub new_image: String,
}

/// Structured outcome; executors never let errors escape as panics or
/// propagate through the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateResult {
    pub success: bool,
    pub new_container_id: Option<String>,
    pub error: Option<String>,
}

impl UpdateResult {
    pub fn success_result(new_container_id: impl Into<String>) -> Self {
        Self {
            success: true,
            new_container_id: Some(new_container_id.into()),
            error: None,
        }
    }

    pub fn failure_result(error: impl Into<String>) -> Self {
        Self {
            success: false,
            new_container_id: None,
            error: Some(error.into()),
        }
    }
}

/// (stage, percent, message) sink. Invocations are strictly monotonic in
/// percent within one update.
pub type ProgressCallback = Arc<dyn Fn(&str, i64, &str) + Send + Sync>;

pub fn noop_progress() -> ProgressCallback {
    Arc::new(|_, _, _| {})
}

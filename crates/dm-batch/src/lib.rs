//! Bulk container actions with per-host concurrency caps and per-item
//! progress events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dm_agent::AgentCoordinator;
use dm_common::DmError;
use dm_common::event::{Event, EventScope, EventType};
use dm_common::keys::make_composite_key;
use dm_engine::{ContainerInfo, Monitor};
use dm_events::EventBus;
use dm_store::Store;
use dm_store::models::{BatchJob, BatchJobItem, ConnectionType, ContainerSetting};
use dm_updates::{UpdateChecker, UpdateContext, UpdateExecutor, noop_progress};
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// Concurrent operations allowed against a single host.
const PER_HOST_LIMIT: usize = 5;
const AGENT_ACTION_TIMEOUT: Duration = Duration::from_secs(60);
const STOP_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub user_id: Option<i64>,
    pub action: String,
    /// Composite `{host_id}:{short_id}` keys.
    pub container_ids: Vec<String>,
    pub params: Option<Value>,
}

const VALID_ACTIONS: &[&str] = &[
    "start",
    "stop",
    "restart",
    "add-tags",
    "remove-tags",
    "set-auto-restart",
    "set-auto-update",
    "set-desired-state",
    "check-updates",
    "delete-containers",
    "update-containers",
];

pub struct BatchManager {
    store: Store,
    monitor: Monitor,
    coordinator: Arc<AgentCoordinator>,
    bus: Arc<EventBus>,
    updates: Arc<UpdateExecutor>,
    checker: Arc<UpdateChecker>,
    host_semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl BatchManager {
    pub fn new(
        store: Store,
        monitor: Monitor,
        coordinator: Arc<AgentCoordinator>,
        bus: Arc<EventBus>,
        updates: Arc<UpdateExecutor>,
        checker: Arc<UpdateChecker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            monitor,
            coordinator,
            bus,
            updates,
            checker,
            host_semaphores: Mutex::new(HashMap::new()),
        })
    }

    fn semaphore_for(&self, host_id: &str) -> Arc<Semaphore> {
        self.host_semaphores
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(host_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(PER_HOST_LIMIT)))
            .clone()
    }

    /// Create a job and start processing it in the background.
    pub async fn create_job(self: &Arc<Self>, request: BatchRequest) -> Result<String, DmError> {
        if !VALID_ACTIONS.contains(&request.action.as_str()) {
            return Err(DmError::Validation(format!(
                "Unknown batch action '{}'",
                request.action
            )));
        }

        let job_id = format!("job_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);

        // Resolve requested ids against the live container set
        let containers = self.monitor.get_containers().await;
        let by_key: HashMap<String, &ContainerInfo> = containers
            .iter()
            .map(|c| (c.composite_key(), c))
            .collect();

        let mut items = Vec::new();
        for id in &request.container_ids {
            match by_key.get(id) {
                Some(container) => items.push((
                    container.id.clone(),
                    container.name.clone(),
                    container.host_id.clone(),
                )),
                None => warn!(container = id, "Container not found, skipping"),
            }
        }

        let job = BatchJob {
            id: job_id.clone(),
            user_id: request.user_id,
            scope: "container".into(),
            action: request.action.clone(),
            params: request.params.clone(),
            status: "queued".into(),
            total_items: items.len() as i64,
            completed_items: 0,
            success_items: 0,
            error_items: 0,
            skipped_items: 0,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        };
        self.store.create_batch_job(&job, &items)?;
        info!(job_id, action = request.action, items = items.len(), "Batch job created");

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.process_job(&job_id).await;
        });

        Ok(job.id)
    }

    async fn process_job(self: &Arc<Self>, job_id: &str) {
        let Ok(Some(job)) = self.store.get_batch_job(job_id) else {
            error!(job_id, "Batch job vanished before processing");
            return;
        };
        let Ok(items) = self.store.list_batch_job_items(job_id) else {
            return;
        };
        let _ = self.store.mark_batch_job_running(job_id);
        self.broadcast_job(job_id, "running");
        self.emit_job_event(EventType::BatchJobStarted, &job).await;

        let mut handles = Vec::new();
        for item in items {
            if item.status != "queued" {
                continue;
            }
            let manager = Arc::clone(self);
            let job = job.clone();
            handles.push(tokio::spawn(async move {
                manager.process_item(&job, item).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        let final_status = match self.store.get_batch_job(job_id) {
            Ok(Some(job)) => {
                if job.error_items > 0 && job.success_items > 0 {
                    "partial"
                } else if job.error_items > 0 {
                    "failed"
                } else {
                    "completed"
                }
            }
            _ => "failed",
        };
        let _ = self.store.finish_batch_job(job_id, final_status);
        self.broadcast_job(job_id, final_status);

        let event_type = if final_status == "failed" {
            EventType::BatchJobFailed
        } else {
            EventType::BatchJobCompleted
        };
        if let Ok(Some(job)) = self.store.get_batch_job(job_id) {
            self.emit_job_event(event_type, &job).await;
        }
        info!(job_id, final_status, "Batch job finished");
    }

    async fn process_item(&self, job: &BatchJob, item: BatchJobItem) {
        let semaphore = self.semaphore_for(&item.host_id);
        let _permit = semaphore.acquire().await;

        let _ = self.store.mark_batch_item_running(item.id);
        self.broadcast_item(&job.id, &item, "running", None);

        let outcome = self.run_action(job, &item).await;
        let (status, error) = match outcome {
            Ok(ItemOutcome::Done) => ("success", None),
            Ok(ItemOutcome::Skipped) => ("skipped", None),
            Err(e) => ("error", Some(e.to_string())),
        };
        let _ = self
            .store
            .finish_batch_item(item.id, &job.id, status, error.as_deref());
        self.broadcast_item(&job.id, &item, status, error.as_deref());
    }

    async fn run_action(&self, job: &BatchJob, item: &BatchJobItem) -> Result<ItemOutcome, DmError> {
        let container = self
            .monitor
            .find_container(&item.host_id, &item.container_id)
            .await;
        let state = container.as_ref().map(|c| c.state.clone()).unwrap_or_default();
        let composite = make_composite_key(&item.host_id, &item.container_id);

        match job.action.as_str() {
            "start" | "stop" | "restart" => {
                if should_skip_state_action(&job.action, &state) {
                    return Ok(ItemOutcome::Skipped);
                }
                self.engine_action(&item.host_id, &item.container_id, &job.action)
                    .await?;
                Ok(ItemOutcome::Done)
            }
            "delete-containers" => {
                let remove_volumes = param_bool(&job.params, "remove_volumes");
                let client = self.monitor.client(&item.host_id).await.ok_or_else(|| {
                    DmError::AgentUnavailable(format!("No engine client for host {}", item.host_id))
                })?;
                client
                    .remove_container(&item.container_id, true, remove_volumes)
                    .await?;
                Ok(ItemOutcome::Done)
            }
            "add-tags" | "remove-tags" => {
                let tags: Vec<String> = job
                    .params
                    .as_ref()
                    .and_then(|p| p.get("tags"))
                    .and_then(|t| serde_json::from_value(t.clone()).ok())
                    .unwrap_or_default();
                let mut setting = self.setting_for(&composite, &item.host_id)?;
                let before = setting.tags.clone();
                if job.action == "add-tags" {
                    for tag in tags {
                        if !setting.tags.contains(&tag) {
                            setting.tags.push(tag);
                        }
                    }
                } else {
                    setting.tags.retain(|t| !tags.contains(t));
                }
                if setting.tags == before {
                    return Ok(ItemOutcome::Skipped);
                }
                self.store.upsert_container_setting(&setting)?;
                Ok(ItemOutcome::Done)
            }
            "set-auto-restart" | "set-auto-update" => {
                let value = param_bool(&job.params, "value");
                let mut setting = self.setting_for(&composite, &item.host_id)?;
                let current = if job.action == "set-auto-restart" {
                    setting.auto_restart
                } else {
                    setting.auto_update
                };
                if current == value {
                    return Ok(ItemOutcome::Skipped);
                }
                if job.action == "set-auto-restart" {
                    setting.auto_restart = value;
                } else {
                    setting.auto_update = value;
                }
                self.store.upsert_container_setting(&setting)?;
                Ok(ItemOutcome::Done)
            }
            "set-desired-state" => {
                let value = job
                    .params
                    .as_ref()
                    .and_then(|p| p.get("value"))
                    .and_then(Value::as_str)
                    .map(String::from);
                let mut setting = self.setting_for(&composite, &item.host_id)?;
                if setting.desired_state == value {
                    return Ok(ItemOutcome::Skipped);
                }
                setting.desired_state = value;
                self.store.upsert_container_setting(&setting)?;
                Ok(ItemOutcome::Done)
            }
            "check-updates" => {
                self.checker
                    .check_single_container(&item.host_id, &item.container_id)
                    .await?;
                Ok(ItemOutcome::Done)
            }
            "update-containers" => {
                let record = self.store.get_container_update(&composite)?;
                let Some(record) = record.filter(|r| r.update_available) else {
                    return Ok(ItemOutcome::Skipped);
                };
                let Some(new_image) = record.latest_image else {
                    return Ok(ItemOutcome::Skipped);
                };
                let result = self
                    .updates
                    .execute(
                        UpdateContext {
                            host_id: item.host_id.clone(),
                            container_id: item.container_id.clone(),
                            container_name: item.container_name.clone(),
                            new_image,
                        },
                        noop_progress(),
                    )
                    .await;
                if result.success {
                    Ok(ItemOutcome::Done)
                } else {
                    Err(DmError::engine(None, result.error.unwrap_or_default()))
                }
            }
            other => Err(DmError::Validation(format!("Unknown action '{other}'"))),
        }
    }

    async fn engine_action(
        &self,
        host_id: &str,
        container_id: &str,
        action: &str,
    ) -> Result<(), DmError> {
        let host = self
            .store
            .get_host(host_id)?
            .ok_or_else(|| DmError::NotFound(format!("Host {host_id} not found")))?;

        if host.connection_type == ConnectionType::Agent {
            let agent = self
                .store
                .get_agent_for_host(host_id)?
                .ok_or_else(|| DmError::AgentUnavailable("No agent for host".into()))?;
            let result = self
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
                ));
            }
            return Ok(());
        }

        let client = self
            .monitor
            .client(host_id)
            .await
            .ok_or_else(|| DmError::AgentUnavailable(format!("No engine client for host {host_id}")))?;
        match action {
            "start" => client.start_container(container_id).await,
            "stop" => client.stop_container(container_id, STOP_TIMEOUT_SECS).await,
            "restart" => client.restart_container(container_id, STOP_TIMEOUT_SECS).await,
            other => Err(DmError::Validation(format!("Unknown engine action '{other}'"))),
        }
    }

    fn setting_for(&self, composite: &str, host_id: &str) -> Result<ContainerSetting, DmError> {
        Ok(self
            .store
            .get_container_setting(composite)?
            .unwrap_or_else(|| ContainerSetting {
                container_id: composite.to_string(),
                host_id: host_id.to_string(),
                auto_restart: false,
                auto_update: false,
                desired_state: None,
                tags: Vec::new(),
            }))
    }

    fn broadcast_job(&self, job_id: &str, status: &str) {
        self.bus.broadcast(
            "batch_job_update",
            json!({"job_id": job_id, "status": status}),
        );
    }

    fn broadcast_item(&self, job_id: &str, item: &BatchJobItem, status: &str, error: Option<&str>) {
        self.bus.broadcast(
            "batch_item_update",
            json!({
                "job_id": job_id,
                "item_id": item.id,
                "container_id": item.container_id,
                "container_name": item.container_name,
                "host_id": item.host_id,
                "status": status,
                "error": error,
            }),
        );
    }

    async fn emit_job_event(&self, event_type: EventType, job: &BatchJob) {
        self.bus
            .emit(
                Event::new(event_type, EventScope::System, job.id.clone(), job.id.clone())
                    .with_data(json!({
                        "action": job.action,
                        "total": job.total_items,
                        "success": job.success_items,
                        "errors": job.error_items,
                        "skipped": job.skipped_items,
                    })),
            )
            .await;
    }
}

enum ItemOutcome {
    Done,
    Skipped,
}

/// Idempotency: acting on a container already in the target state skips.
fn should_skip_state_action(action: &str, state: &str) -> bool {
    match action {
        "start" => state == "running",
        "stop" => state == "exited" || state == "stopped" || state == "created",
        _ => false,
    }
}

fn param_bool(params: &Option<Value>, key: &str) -> bool {
    params
        .as_ref()
        .and_then(|p| p.get(key))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_on_stopped_container_skips() {
        assert!(should_skip_state_action("stop", "exited"));
        assert!(should_skip_state_action("stop", "stopped"));
        assert!(!should_skip_state_action("stop", "running"));
    }

    #[test]
    fn test_start_on_running_container_skips() {
        assert!(should_skip_state_action("start", "running"));
        assert!(!should_skip_state_action("start", "exited"));
    }

    #[test]
    fn test_restart_never_skips() {
        assert!(!should_skip_state_action("restart", "running"));
        assert!(!should_skip_state_action("restart", "exited"));
    }

    #[test]
    fn test_param_bool() {
        let params = Some(json!({"remove_volumes": true}));
        assert!(param_bool(&params, "remove_volumes"));
        assert!(!param_bool(&params, "missing"));
        assert!(!param_bool(&None, "remove_volumes"));
    }
}

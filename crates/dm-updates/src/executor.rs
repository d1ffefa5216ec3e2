//! The update executor: one container at a time per composite id, with a
//! direct-engine path (backup + recreate + health gate + rollback) and an
//! agent path (single command + completion event).

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dm_common::DmError;
use dm_common::event::{Event, EventScope, EventType};
use dm_common::keys::{make_composite_key, short_id};
use dm_engine::client::EngineClient;
use dm_engine::types::HealthOutcome;
use dm_engine::{Monitor, pull_with_progress};
use dm_events::EventBus;
use dm_store::models::ConnectionType;
use dm_store::{Store, Vault};
use dm_agent::{AgentCoordinator, AgentDomainEvent};
use dm_registry::ImageRef;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::pending::{PendingUpdates, UpdateCompletion};
use crate::types::{ProgressCallback, UpdateContext, UpdateResult};

const BACKUP_SUFFIX: &str = ".dockmon-backup";
const STOP_TIMEOUT_SECS: u64 = 30;
const PULL_TIMEOUT: Duration = Duration::from_secs(1800);
const AGENT_ACK_TIMEOUT: Duration = Duration::from_secs(180);
const AGENT_UPDATE_TIMEOUT: Duration = Duration::from_secs(300);

/// Progress reporting that never moves backwards within one update.
struct MonotonicProgress {
    last: AtomicI64,
    callback: ProgressCallback,
}

impl MonotonicProgress {
    fn new(callback: ProgressCallback) -> Self {
        Self {
            last: AtomicI64::new(0),
            callback,
        }
    }

    fn report(&self, stage: &str, percent: i64, message: &str) {
        let clamped = self.last.fetch_max(percent, Ordering::SeqCst).max(percent);
        (self.callback)(stage, clamped, message);
    }
}

/// Releases the composite-id lock when the update finishes.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

pub struct UpdateExecutor {
    store: Store,
    monitor: Monitor,
    coordinator: Arc<AgentCoordinator>,
    bus: Arc<EventBus>,
    vault: Option<Arc<Vault>>,
    pub pending_updates: Arc<PendingUpdates>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    health_timeout: Duration,
    reconnect_timeout: Duration,
    release_base_url: String,
    http: reqwest::Client,
}

impl UpdateExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        monitor: Monitor,
        coordinator: Arc<AgentCoordinator>,
        bus: Arc<EventBus>,
        vault: Option<Arc<Vault>>,
        health_timeout: Duration,
        reconnect_timeout: Duration,
        release_base_url: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            monitor,
            coordinator,
            bus,
            vault,
            pending_updates: PendingUpdates::new(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            health_timeout,
            reconnect_timeout,
            release_base_url,
            http: reqwest::Client::new(),
        })
    }

    /// Bridge agent `update_complete` frames into the pending registry.
    pub fn spawn_domain_event_listener(self: &Arc<Self>) {
        let executor = Arc::clone(self);
        let mut rx = self.coordinator.subscribe_domain_events();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if let AgentDomainEvent::UpdateComplete {
                    host_id,
                    container_id,
                    success,
                    new_container_id,
                    error,
                } = event
                {
                    executor.pending_updates.resolve(
                        &host_id,
                        short_id(&container_id),
                        UpdateCompletion {
                            success,
                            new_container_id,
                            error,
                        },
                    );
                }
            }
        });
    }

    // ── Entry point ─────────────────────────────────────────────

    /// Run one container update. All failures come back as a structured
    /// result; events are emitted along the way.
    pub async fn execute(&self, ctx: UpdateContext, progress: ProgressCallback) -> UpdateResult {
        let composite = make_composite_key(&ctx.host_id, &ctx.container_id);
        let Some(_guard) = self.acquire(&composite) else {
            return UpdateResult::failure_result(format!(
                "An update for {} is already in progress",
                ctx.container_name
            ));
        };
        let progress = MonotonicProgress::new(progress);

        let host = match self.store.get_host(&ctx.host_id) {
            Ok(Some(host)) => host,
            Ok(None) => return UpdateResult::failure_result("Host not found"),
            Err(e) => return UpdateResult::failure_result(e.to_string()),
        };
        // Captured before the row is re-keyed to the new container id
        let previous_image = self.current_image_of(&composite);

        self.emit_container_event(
            EventType::UpdateStarted,
            &ctx,
            &host.name,
            json!({"target_image": ctx.new_image}),
        )
        .await;

        let result = match host.connection_type {
            ConnectionType::Agent => self.agent_update(&ctx, &progress).await,
            _ => self.direct_update(&ctx, &progress).await,
        };

        match result {
            Ok(result) if result.success => {
                self.emit_container_event(
                    EventType::UpdateCompleted,
                    &ctx,
                    &host.name,
                    json!({
                        "previous_image": previous_image,
                        "new_image": ctx.new_image,
                        "new_container_id": result.new_container_id,
                    }),
                )
                .await;
                progress.report("completed", 100, "Update completed successfully");
                result
            }
            Ok(result) => {
                self.emit_container_event(
                    EventType::UpdateFailed,
                    &ctx,
                    &host.name,
                    json!({"error_message": result.error.clone().unwrap_or_default()}),
                )
                .await;
                result
            }
            Err(e) => {
                error!(container = ctx.container_name, "Update failed: {e}");
                self.emit_container_event(
                    EventType::UpdateFailed,
                    &ctx,
                    &host.name,
                    json!({"error_message": e.to_string()}),
                )
                .await;
                UpdateResult::failure_result(e.to_string())
            }
        }
    }

    fn acquire(&self, composite: &str) -> Option<InFlightGuard> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(composite.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: Arc::clone(&self.in_flight),
            key: composite.to_string(),
        })
    }

    fn current_image_of(&self, composite: &str) -> String {
        self.store
            .get_container_update(composite)
            .ok()
            .flatten()
            .map(|r| r.current_image)
            .unwrap_or_default()
    }

    // ── Direct path ─────────────────────────────────────────────

    async fn direct_update(
        &self,
        ctx: &UpdateContext,
        progress: &MonotonicProgress,
    ) -> Result<UpdateResult, DmError> {
        let client = self
            .monitor
            .client(&ctx.host_id)
            .await
            .ok_or_else(|| DmError::AgentUnavailable(format!("No engine client for host {}", ctx.host_id)))?;

        // Inspect the old container and its image's labels
        progress.report("inspecting", 5, "Inspecting current container");
        let old = client.inspect_container(&ctx.container_id).await?;
        let old_name = old.container_name().to_string();
        let old_image_labels = client
            .inspect_image(&old.config.image)
            .await
            .map(|i| i.labels())
            .unwrap_or_default();

        // Pull the new image with layered progress
        progress.report("pulling", 10, &format!("Pulling {}", ctx.new_image));
        let auth = self.registry_auth_for(&ctx.new_image);
        {
            let bus = Arc::clone(&self.bus);
            let host_id = ctx.host_id.clone();
            let entity_id = ctx.container_id.clone();
            pull_with_progress(&client, &ctx.new_image, auth.as_ref(), PULL_TIMEOUT, move |snap| {
                bus.broadcast(
                    "container_update_layer_progress",
                    json!({
                        "host_id": host_id,
                        "entity_id": entity_id,
                        "overall_progress": snap.overall_progress,
                        "layers": snap.layers,
                        "total_layers": snap.total_layers,
                        "remaining_layers": snap.remaining_layers,
                        "summary": snap.summary,
                        "speed_mbps": snap.speed_mbps,
                    }),
                );
            })
            .await?;
        }
        progress.report("pulled", 40, "Image pulled");
        self.emit_container_event(
            EventType::UpdatePullCompleted,
            ctx,
            "",
            json!({"image": ctx.new_image}),
        )
        .await;

        let new_image_labels = client
            .inspect_image(&ctx.new_image)
            .await
            .map(|i| i.labels())
            .unwrap_or_default();

        // Stop and rename the old container out of the way
        progress.report("backup", 45, "Creating backup of current container");
        client.stop_container(&ctx.container_id, STOP_TIMEOUT_SECS).await?;
        let backup_name = format!("{old_name}{BACKUP_SUFFIX}");
        client.rename_container(&ctx.container_id, &backup_name).await?;
        self.emit_container_event(
            EventType::BackupCreated,
            ctx,
            "",
            json!({"backup_name": backup_name}),
        )
        .await;

        // Create the replacement; roll back on any failure past this point
        match self
            .create_and_start(ctx, &client, &old, &old_image_labels, &new_image_labels, &old_name, progress)
            .await
        {
            Ok(new_id) => {
                // Success: drop the backup
                if let Err(e) = client.remove_container(&backup_name, true, false).await {
                    warn!(container = backup_name, "Failed to remove backup: {e}");
                }
                let new_short = short_id(&new_id).to_string();
                let digest = client
                    .inspect_image(&ctx.new_image)
                    .await
                    .ok()
                    .and_then(|i| i.digest());
                self.store.finish_container_update(
                    &make_composite_key(&ctx.host_id, &ctx.container_id),
                    &make_composite_key(&ctx.host_id, &new_short),
                    &ctx.new_image,
                    digest.as_deref(),
                )?;
                Ok(UpdateResult::success_result(new_short))
            }
            Err(e) => {
                error!(container = ctx.container_name, "Update failed, rolling back: {e}");
                self.rollback(ctx, &client, &backup_name, &old_name).await;
                Ok(UpdateResult::failure_result(e.to_string()))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_and_start(
        &self,
        ctx: &UpdateContext,
        client: &EngineClient,
        old: &dm_engine::types::ContainerInspect,
        old_image_labels: &std::collections::HashMap<String, String>,
        new_image_labels: &std::collections::HashMap<String, String>,
        name: &str,
        progress: &MonotonicProgress,
    ) -> Result<String, DmError> {
        let labels = crate::labels::subtract_labels(
            &old.config.labels,
            old_image_labels,
            new_image_labels,
        );

        // Passthrough: the old HostConfig travels verbatim, with only the
        // Podman compatibility filters applied.
        let host_config = if client.is_podman {
            crate::labels::filter_host_config_for_podman(&old.host_config)
        } else {
            old.host_config.clone()
        };

        let mut body = json!({
            "Image": ctx.new_image,
            "Env": old.config.env,
            "Labels": labels,
            "HostConfig": host_config,
        });
        if let Some(cmd) = &old.config.cmd {
            body["Cmd"] = json!(cmd);
        }
        if let Some(entrypoint) = &old.config.entrypoint {
            body["Entrypoint"] = entrypoint.clone();
        }
        if let Some(ports) = &old.config.exposed_ports {
            body["ExposedPorts"] = ports.clone();
        }
        if let Some(volumes) = &old.config.volumes {
            body["Volumes"] = volumes.clone();
        }
        if let Some(working_dir) = &old.config.working_dir {
            body["WorkingDir"] = json!(working_dir);
        }
        if let Some(user) = &old.config.user {
            body["User"] = json!(user);
        }
        if let Some(healthcheck) = &old.config.healthcheck {
            body["Healthcheck"] = healthcheck.clone();
        }

        progress.report("creating", 55, "Creating replacement container");
        let new_id = client.create_container(name, &body).await?;

        // Reconnect networks with their original aliases
        let mut networks: Vec<_> = old.network_settings.networks.iter().collect();
        networks.sort_by(|a, b| a.0.cmp(b.0));
        for (network, attachment) in networks {
            if let Err(e) = client
                .connect_network(network, &new_id, attachment.aliases.as_deref())
                .await
            {
                // bridge is implicit; anything else is fatal
                if network != "bridge" {
                    return Err(e);
                }
            }
        }

        progress.report("starting", 65, "Starting replacement container");
        client.start_container(&new_id).await?;

        progress.report("health", 80, "Waiting for container health");
        match client
            .wait_healthy(&new_id, self.health_timeout.as_secs())
            .await?
        {
            HealthOutcome::Healthy => Ok(new_id),
            HealthOutcome::Unhealthy => Err(DmError::engine(
                None,
                "Replacement container became unhealthy",
            )),
            HealthOutcome::TimedOut => Err(DmError::Timeout(format!(
                "Replacement container failed the health gate within {} s",
                self.health_timeout.as_secs()
            ))),
        }
    }

    /// Restore the backup: remove the failed replacement, rename back, start.
    async fn rollback(
        &self,
        ctx: &UpdateContext,
        client: &EngineClient,
        backup_name: &str,
        original_name: &str,
    ) {
        if let Err(e) = client.remove_container(original_name, true, false).await {
            warn!(container = original_name, "Rollback: replacement removal failed: {e}");
        }
        if let Err(e) = client.rename_container(backup_name, original_name).await {
            error!(container = backup_name, "Rollback: rename failed: {e}");
            return;
        }
        if let Err(e) = client.start_container(original_name).await {
            error!(container = original_name, "Rollback: restart failed: {e}");
            return;
        }
        info!(container = original_name, "Rollback completed");
        self.emit_container_event(EventType::RollbackCompleted, ctx, "", Value::Null)
            .await;
    }

    // ── Agent path ──────────────────────────────────────────────

    async fn agent_update(
        &self,
        ctx: &UpdateContext,
        progress: &MonotonicProgress,
    ) -> Result<UpdateResult, DmError> {
        let agent = self
            .store
            .get_agent_for_host(&ctx.host_id)?
            .ok_or_else(|| DmError::AgentUnavailable("No agent registered for this host".into()))?;

        let composite = make_composite_key(&ctx.host_id, &ctx.container_id);
        let record = self.store.get_container_update(&composite)?;

        // Agent self-updates use a binary-swap flow, not a recreate
        if let Some(record) = &record {
            if record.current_image.to_lowercase().contains("dockmon-agent") {
                info!(container = ctx.container_name, "Routing to agent self-update");
                return self.self_update(ctx, progress, &agent).await;
            }
        }

        progress.report("initiating", 5, "Sending update command to agent");
        let registry_auth = self.registry_auth_for(&ctx.new_image).map(|(username, password)| {
            json!({"username": username, "password": password})
        });

        // Register before sending so the completion event cannot be lost
        let rx = self
            .pending_updates
            .register(&ctx.host_id, &ctx.container_id);

        let payload = json!({
            "container_id": ctx.container_id,
            "new_image": ctx.new_image,
            "stop_timeout": STOP_TIMEOUT_SECS,
            "health_timeout": self.health_timeout.as_secs(),
            "registry_auth": registry_auth,
        });

        let ack = self
            .coordinator
            .execute_command(&agent.id, "update_container", payload, AGENT_ACK_TIMEOUT)
            .await;
        let ack = match ack {
            Ok(ack) => ack,
            Err(e) => {
                self.pending_updates.unregister(&ctx.host_id, &ctx.container_id);
                return Err(e);
            }
        };
        if !ack.ok() {
            self.pending_updates.unregister(&ctx.host_id, &ctx.container_id);
            return Ok(UpdateResult::failure_result(format!(
                "Agent rejected update command: {}",
                ack.error.unwrap_or_default()
            )));
        }

        progress.report("agent_updating", 20, "Agent is performing the update");
        let completion = self
            .pending_updates
            .wait_for_completion(&ctx.host_id, &ctx.container_id, rx, AGENT_UPDATE_TIMEOUT)
            .await;

        if !completion.success {
            return Ok(UpdateResult::failure_result(
                completion
                    .error
                    .unwrap_or_else(|| "Agent update failed or timed out".into()),
            ));
        }

        let new_container_id = completion
            .new_container_id
            .as_deref()
            .map(|id| short_id(id).to_string())
            .unwrap_or_else(|| ctx.container_id.clone());

        let latest_digest = record.as_ref().and_then(|r| r.latest_digest.clone());
        self.store.finish_container_update(
            &composite,
            &make_composite_key(&ctx.host_id, &new_container_id),
            &ctx.new_image,
            latest_digest.as_deref(),
        )?;

        Ok(UpdateResult::success_result(new_container_id))
    }

    // ── Agent self-update ───────────────────────────────────────

    async fn self_update(
        &self,
        ctx: &UpdateContext,
        progress: &MonotonicProgress,
        agent: &dm_store::models::Agent,
    ) -> Result<UpdateResult, DmError> {
        progress.report("initiating", 10, "Sending self-update command to agent");

        let version = extract_version_from_image(&ctx.new_image);
        let agent_os = agent.agent_os.as_deref().unwrap_or("linux");
        let agent_arch = agent.agent_arch.as_deref().unwrap_or("amd64");
        let binary_url = format!(
            "{}/agent-v{version}/dockmon-agent-{agent_os}-{agent_arch}",
            self.release_base_url
        );
        let checksum = self.fetch_agent_checksum(&version, agent_arch).await;

        let payload = json!({
            "image": ctx.new_image,
            "version": version,
            "binary_url": binary_url,
            "checksum": checksum,
        });
        let ack = self
            .coordinator
            .execute_command(&agent.id, "self_update", payload, Duration::from_secs(150))
            .await?;
        if !ack.ok() {
            return Ok(UpdateResult::failure_result(format!(
                "Failed to send self-update command: {}",
                ack.error.unwrap_or_default()
            )));
        }

        // The agent restarts; the response arrives as a new registration,
        // not on the original socket.
        progress.report("agent_reconnecting", 50, "Agent is restarting with new version");
        let reported_version = self
            .coordinator
            .wait_for_reconnection(&agent.engine_id, self.reconnect_timeout)
            .await?;
        info!(
            agent_id = agent.id,
            version = reported_version,
            expected = version,
            "Agent reconnected after self-update"
        );

        let composite = make_composite_key(&ctx.host_id, &ctx.container_id);
        self.store
            .finish_container_update(&composite, &composite, &ctx.new_image, None)?;

        // Container id is unchanged for self-updates
        Ok(UpdateResult::success_result(ctx.container_id.clone()))
    }

    async fn fetch_agent_checksum(&self, version: &str, arch: &str) -> Option<String> {
        let url = format!(
            "{}/agent-v{version}/dockmon-agent-linux-{arch}.sha256",
            self.release_base_url
        );
        match self.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp
                .text()
                .await
                .ok()
                .map(|t| t.split_whitespace().next().unwrap_or_default().to_string())
                .filter(|t| !t.is_empty()),
            _ => {
                warn!(version, arch, "No checksum available for agent binary");
                None
            }
        }
    }

    // ── Helpers ─────────────────────────────────────────────────

    /// Stored credentials for the image's registry, decrypted via the vault.
    fn registry_auth_for(&self, image: &str) -> Option<(String, String)> {
        let registry = ImageRef::parse(image).registry;
        let cred = self.store.get_registry_credential(&registry).ok().flatten()?;
        let vault = self.vault.as_ref()?;
        match vault.decrypt(&cred.password_encrypted) {
            Ok(password) => Some((cred.username, password)),
            Err(e) => {
                error!(registry, "Failed to decrypt registry credentials: {e}");
                None
            }
        }
    }

    async fn emit_container_event(
        &self,
        event_type: EventType,
        ctx: &UpdateContext,
        host_name: &str,
        data: Value,
    ) {
        let host_name = if host_name.is_empty() {
            self.monitor
                .host_name(&ctx.host_id)
                .await
                .unwrap_or_else(|| ctx.host_id.clone())
        } else {
            host_name.to_string()
        };
        self.bus
            .emit(
                Event::new(
                    event_type,
                    EventScope::Container,
                    make_composite_key(&ctx.host_id, &ctx.container_id),
                    ctx.container_name.clone(),
                )
                .with_host(ctx.host_id.clone(), host_name)
                .with_data(data),
            )
            .await;
    }
}

fn extract_version_from_image(image: &str) -> String {
    match image.rsplit_once(':') {
        Some((_, tag)) if !tag.contains('/') => tag.to_string(),
        _ => "latest".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_extraction() {
        assert_eq!(extract_version_from_image("dockmon-agent:1.2.0"), "1.2.0");
        assert_eq!(extract_version_from_image("dockmon-agent"), "latest");
        assert_eq!(
            extract_version_from_image("registry.example.com:5000/dockmon-agent"),
            "latest"
        );
    }

    #[tokio::test]
    async fn test_monotonic_progress() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress = MonotonicProgress::new(Arc::new(move |_stage, pct, _msg| {
            sink.lock().unwrap().push(pct);
        }));
        progress.report("a", 10, "");
        progress.report("b", 40, "");
        progress.report("c", 30, ""); // late event must not regress
        progress.report("d", 80, "");
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen, vec![10, 40, 40, 80]);
    }

    #[test]
    fn test_in_flight_lock_single_update_per_container() {
        let set = Arc::new(Mutex::new(HashSet::new()));
        let guard = InFlightGuard {
            set: Arc::clone(&set),
            key: "h1:abc".into(),
        };
        set.lock().unwrap().insert("h1:abc".to_string());
        assert!(set.lock().unwrap().contains("h1:abc"));
        drop(guard);
        assert!(!set.lock().unwrap().contains("h1:abc"));
    }
}

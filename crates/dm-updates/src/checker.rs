//! Periodic update check: digest comparison per container under its
//! floating-tag tracking mode.

use std::sync::Arc;

use chrono::Utc;
use dm_common::DmError;
use dm_common::event::{Event, EventScope, EventType};
use dm_common::keys::make_composite_key;
use dm_engine::{ContainerInfo, Monitor};
use dm_events::EventBus;
use dm_registry::{ImageRef, RegistryAdapter, TagMode};
use dm_store::models::{ContainerUpdate, FloatingTagMode};
use dm_store::{Store, Vault};
use serde_json::json;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CheckStats {
    pub total: usize,
    pub checked: usize,
    pub updates_found: usize,
    pub errors: usize,
}

pub struct UpdateChecker {
    store: Store,
    monitor: Monitor,
    registry: RegistryAdapter,
    bus: Arc<EventBus>,
    vault: Option<Arc<Vault>>,
}

impl UpdateChecker {
    pub fn new(
        store: Store,
        monitor: Monitor,
        bus: Arc<EventBus>,
        vault: Option<Arc<Vault>>,
    ) -> Self {
        Self {
            store,
            monitor,
            registry: RegistryAdapter::new(),
            bus,
            vault,
        }
    }

    /// Sweep every container on every host.
    pub async fn check_all_containers(&self) -> CheckStats {
        info!("Starting update check for all containers");
        let mut stats = CheckStats::default();

        let skip_compose = self
            .store
            .global_settings()
            .map(|s| s.skip_compose_containers)
            .unwrap_or(true);

        let containers = self.monitor.get_containers().await;
        stats.total = containers.len();

        for container in containers {
            if skip_compose && container.is_compose_managed() {
                debug!(container = container.name, "Skipping compose container");
                continue;
            }
            match self.check_container(&container).await {
                Ok(Some(update_available)) => {
                    stats.checked += 1;
                    if update_available {
                        stats.updates_found += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(container = container.name, "Update check failed: {e}");
                    stats.errors += 1;
                }
            }
        }

        info!(
            total = stats.total,
            checked = stats.checked,
            updates = stats.updates_found,
            errors = stats.errors,
            "Update check complete"
        );
        stats
    }

    /// Manual single-container check.
    pub async fn check_single_container(
        &self,
        host_id: &str,
        container_id: &str,
    ) -> Result<Option<ContainerUpdate>, DmError> {
        let container = self
            .monitor
            .find_container(host_id, container_id)
            .await
            .ok_or_else(|| DmError::NotFound(format!("Container {container_id} not found")))?;
        self.check_container(&container).await?;
        self.store
            .get_container_update(&container.composite_key())
    }

    /// Returns Some(update_available) when the check completed.
    async fn check_container(&self, container: &ContainerInfo) -> Result<Option<bool>, DmError> {
        if container.image.is_empty() || container.image.starts_with("sha256:") {
            return Ok(None); // locally built or untagged
        }
        let composite = container.composite_key();

        let mode = self
            .store
            .get_container_update(&composite)?
            .map(|r| r.floating_tag_mode)
            .unwrap_or(FloatingTagMode::Exact);
        let tag_mode = TagMode::parse(mode.as_str()).unwrap_or(TagMode::Exact);

        let auth = self.registry_auth_for(&container.image);
        let floating = self
            .registry
            .compute_floating_tag(&container.image, tag_mode, auth.as_ref())
            .await?;

        // Prefer the digest the engine is actually running
        let current_digest = match self.engine_digest(container).await {
            Some(digest) => digest,
            None => {
                self.registry
                    .resolve_tag(&container.image, auth.as_ref())
                    .await?
                    .digest
            }
        };
        let latest = self.registry.resolve_tag(&floating, auth.as_ref()).await?;
        let update_available = current_digest != latest.digest;

        // Emit only when this latest digest is news
        let previous = self.store.get_container_update(&composite)?;
        let is_new_update = update_available
            && previous
                .as_ref()
                .map(|r| r.latest_digest.as_deref() != Some(latest.digest.as_str()))
                .unwrap_or(true);

        self.store.upsert_container_update(&ContainerUpdate {
            container_id: composite.clone(),
            host_id: container.host_id.clone(),
            current_image: container.image.clone(),
            current_digest: Some(current_digest.clone()),
            latest_image: Some(floating.clone()),
            latest_digest: Some(latest.digest.clone()),
            update_available,
            floating_tag_mode: mode,
            registry_url: Some(latest.registry.clone()),
            platform: Some("linux/amd64".into()),
            last_checked_at: Some(Utc::now()),
            last_updated_at: previous.and_then(|r| r.last_updated_at),
        })?;

        if is_new_update {
            info!(
                container = container.name,
                latest = floating,
                "New update available"
            );
            self.bus
                .emit(
                    Event::new(
                        EventType::UpdateAvailable,
                        EventScope::Container,
                        make_composite_key(&container.host_id, &container.id),
                        container.name.clone(),
                    )
                    .with_host(container.host_id.clone(), container.host_name.clone())
                    .with_data(json!({
                        "current_image": container.image,
                        "latest_image": floating,
                        "current_digest": current_digest,
                        "latest_digest": latest.digest,
                    })),
                )
                .await;
        }

        Ok(Some(update_available))
    }

    async fn engine_digest(&self, container: &ContainerInfo) -> Option<String> {
        let client = self.monitor.client(&container.host_id).await?;
        client
            .inspect_image(&container.image)
            .await
            .ok()
            .and_then(|i| i.digest())
    }

    fn registry_auth_for(&self, image: &str) -> Option<(String, String)> {
        let registry = ImageRef::parse(image).registry;
        let cred = self.store.get_registry_credential(&registry).ok().flatten()?;
        let vault = self.vault.as_ref()?;
        vault
            .decrypt(&cred.password_encrypted)
            .ok()
            .map(|password| (cred.username, password))
    }
}

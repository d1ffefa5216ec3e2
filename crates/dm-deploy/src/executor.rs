//! Deployment execution: ordered creation with health gating and
//! partial-failure rollback on the direct path, full delegation on the
//! agent path.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dm_agent::AgentCoordinator;
use dm_common::DmError;
use dm_common::keys::{make_composite_key, short_id};
use dm_engine::client::EngineClient;
use dm_engine::types::HealthOutcome;
use dm_engine::{Monitor, pull_with_progress};
use dm_events::EventBus;
use dm_store::Store;
use dm_store::models::{Deployment, DeploymentStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::compose::parse_compose;
use crate::plan::{DeploymentPlan, ServiceSpec, overall_progress, plan};

const PULL_TIMEOUT: Duration = Duration::from_secs(1800);
const AGENT_DEPLOY_TIMEOUT: Duration = Duration::from_secs(900);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    pub host_id: String,
    pub name: String,
    pub compose_yaml: String,
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub env_file: Option<String>,
    #[serde(default = "default_true")]
    pub wait_for_healthy: bool,
    /// Seconds; 0 means "use the configured default", not "skip".
    #[serde(default)]
    pub health_timeout: u64,
    #[serde(default = "default_true")]
    pub rollback_on_failure: bool,
    #[serde(default)]
    pub remove_volumes_on_rollback: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceOutcome {
    pub container_id: String,
    pub container_name: String,
    pub image: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentResult {
    pub deployment_id: String,
    pub success: bool,
    pub services: BTreeMap<String, ServiceOutcome>,
    #[serde(default)]
    pub partial_success: bool,
    #[serde(default)]
    pub failed_services: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Payload for the agent's `deploy_compose` command. The agent performs the
/// whole workflow; profiles must travel so it sees the same service set.
pub fn build_agent_deploy_payload(req: &DeployRequest, default_health_timeout: u64) -> Value {
    json!({
        "name": req.name,
        "compose_yaml": req.compose_yaml,
        "env_file": req.env_file,
        "profiles": req.profiles,
        "wait_for_healthy": req.wait_for_healthy,
        "health_timeout": if req.health_timeout == 0 {
            default_health_timeout
        } else {
            req.health_timeout
        },
        "rollback_on_failure": req.rollback_on_failure,
    })
}

/// Mirror of the deploy payload for teardown; the same profiles are
/// required so the agent resolves the full service set.
pub fn build_agent_teardown_payload(
    name: &str,
    compose_yaml: &str,
    profiles: &[String],
    remove_volumes: bool,
) -> Value {
    json!({
        "name": name,
        "compose_yaml": compose_yaml,
        "profiles": profiles,
        "remove_volumes": remove_volumes,
    })
}

/// Everything created during execution, for reverse-order rollback.
#[derive(Default)]
struct CreatedResources {
    containers: Vec<(String, String)>, // (id, service name)
    networks: Vec<String>,
    volumes: Vec<String>,
}

pub struct DeploymentExecutor {
    store: Store,
    monitor: Monitor,
    coordinator: Arc<AgentCoordinator>,
    bus: Arc<EventBus>,
    default_health_timeout: Duration,
}

impl DeploymentExecutor {
    pub fn new(
        store: Store,
        monitor: Monitor,
        coordinator: Arc<AgentCoordinator>,
        bus: Arc<EventBus>,
        default_health_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            monitor,
            coordinator,
            bus,
            default_health_timeout,
        })
    }

    fn health_timeout(&self, req: &DeployRequest) -> Duration {
        if req.health_timeout == 0 {
            self.default_health_timeout
        } else {
            Duration::from_secs(req.health_timeout)
        }
    }

    // ── Entry point ─────────────────────────────────────────────

    pub async fn deploy(&self, req: DeployRequest) -> DeploymentResult {
        let deployment_id = make_composite_key(
            &req.host_id,
            &format!("dep-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]),
        );

        let row = Deployment {
            id: deployment_id.clone(),
            host_id: req.host_id.clone(),
            deployment_type: "stack".into(),
            name: req.name.clone(),
            status: DeploymentStatus::Planning,
            definition: json!({
                "compose_yaml": req.compose_yaml,
                "profiles": req.profiles,
                "wait_for_healthy": req.wait_for_healthy,
                "health_timeout": req.health_timeout,
            }),
            progress_percent: 0,
            current_stage: Some("planning".into()),
            error_message: None,
            started_at: None,
            completed_at: None,
            committed: false,
            rollback_on_failure: req.rollback_on_failure,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.create_deployment(&row) {
            return self.fail(&deployment_id, &req, e.to_string()).await;
        }

        // Planning
        let deployment_plan = match parse_compose(&req.compose_yaml)
            .and_then(|compose| plan(&compose, &req.name, &req.profiles))
        {
            Ok(plan) => plan,
            Err(e) => return self.fail(&deployment_id, &req, e.to_string()).await,
        };

        let host = match self.store.get_host(&req.host_id) {
            Ok(Some(host)) => host,
            Ok(None) => return self.fail(&deployment_id, &req, "Host not found".into()).await,
            Err(e) => return self.fail(&deployment_id, &req, e.to_string()).await,
        };

        let _ = self.store.mark_deployment_started(&deployment_id);

        let result = if host.connection_type == dm_store::models::ConnectionType::Agent {
            self.deploy_via_agent(&deployment_id, &req).await
        } else {
            self.deploy_direct(&deployment_id, &req, &deployment_plan).await
        };

        match result {
            Ok(result) => {
                let status = if result.success {
                    DeploymentStatus::Completed
                } else if result.partial_success {
                    DeploymentStatus::Failed
                } else if req.rollback_on_failure {
                    DeploymentStatus::RolledBack
                } else {
                    DeploymentStatus::Failed
                };
                let _ = self
                    .store
                    .finish_deployment(&deployment_id, status, result.error.as_deref());
                self.broadcast_complete(&result);
                result
            }
            Err(e) => self.fail(&deployment_id, &req, e.to_string()).await,
        }
    }

    async fn fail(
        &self,
        deployment_id: &str,
        _req: &DeployRequest,
        error: String,
    ) -> DeploymentResult {
        error!(deployment_id, "Deployment failed: {error}");
        let _ = self
            .store
            .finish_deployment(deployment_id, DeploymentStatus::Failed, Some(&error));
        let result = DeploymentResult {
            deployment_id: deployment_id.to_string(),
            success: false,
            services: BTreeMap::new(),
            partial_success: false,
            failed_services: Vec::new(),
            error: Some(error),
        };
        self.broadcast_complete(&result);
        result
    }

    // ── Direct path ─────────────────────────────────────────────

    async fn deploy_direct(
        &self,
        deployment_id: &str,
        req: &DeployRequest,
        deployment_plan: &DeploymentPlan,
    ) -> Result<DeploymentResult, DmError> {
        let client = self.monitor.client(&req.host_id).await.ok_or_else(|| {
            DmError::AgentUnavailable(format!("No engine client for host {}", req.host_id))
        })?;

        let total = deployment_plan.total_services();
        let mut created = CreatedResources::default();
        let mut services: BTreeMap<String, ServiceOutcome> = BTreeMap::new();
        let health_timeout = self.health_timeout(req);

        self.progress(deployment_id, 1, "creating_networks", "Creating networks");
        for network in &deployment_plan.networks {
            if network.external {
                continue;
            }
            if !client.network_exists(&network.name).await? {
                client
                    .create_network(&network.name, network.driver.as_deref())
                    .await?;
                created.networks.push(network.name.clone());
            }
        }
        for volume in &deployment_plan.volumes {
            if volume.external {
                continue;
            }
            client.create_volume(&volume.name).await?;
            created.volumes.push(volume.name.clone());
        }

        let mut services_done = 0usize;
        let mut failure: Option<(String, String)> = None;

        'groups: for group in &deployment_plan.groups {
            let mut group_ids: Vec<(String, &ServiceSpec)> = Vec::new();

            for service in group {
                match self
                    .bring_up_service(deployment_id, req, &client, service, services_done, total)
                    .await
                {
                    Ok(container_id) => {
                        created
                            .containers
                            .push((container_id.clone(), service.name.clone()));
                        group_ids.push((container_id.clone(), service));
                        services.insert(
                            service.name.clone(),
                            ServiceOutcome {
                                container_id: short_id(&container_id).to_string(),
                                container_name: service.container_name.clone(),
                                image: service.image.clone(),
                                status: "running".into(),
                            },
                        );
                    }
                    Err(e) => {
                        failure = Some((service.name.clone(), e.to_string()));
                        break 'groups;
                    }
                }
            }

            // Health gate the whole group before the next one starts
            if req.wait_for_healthy {
                let _ = self.store.set_deployment_progress(
                    deployment_id,
                    DeploymentStatus::WaitingForHealth,
                    overall_progress(services_done, total, 80, 20, 0.0),
                    Some("waiting_for_health"),
                );
                for (container_id, service) in &group_ids {
                    match client
                        .wait_healthy(container_id, health_timeout.as_secs())
                        .await?
                    {
                        HealthOutcome::Healthy => {}
                        HealthOutcome::Unhealthy => {
                            failure = Some((
                                service.name.clone(),
                                format!("Service '{}' became unhealthy", service.name),
                            ));
                            break 'groups;
                        }
                        HealthOutcome::TimedOut => {
                            failure = Some((
                                service.name.clone(),
                                format!(
                                    "Service '{}' failed health gate within {} s",
                                    service.name,
                                    health_timeout.as_secs()
                                ),
                            ));
                            break 'groups;
                        }
                    }
                }
            }
            services_done += group.len();
        }

        match failure {
            None => {
                self.progress(deployment_id, 100, "completed", "Deployment complete");
                Ok(DeploymentResult {
                    deployment_id: deployment_id.to_string(),
                    success: true,
                    services,
                    partial_success: false,
                    failed_services: Vec::new(),
                    error: None,
                })
            }
            Some((failed_service, message)) => {
                warn!(deployment_id, service = failed_service, "Deployment failed: {message}");
                if req.rollback_on_failure {
                    self.rollback(&client, &created, req.remove_volumes_on_rollback)
                        .await;
                    services.clear();
                }
                Ok(DeploymentResult {
                    deployment_id: deployment_id.to_string(),
                    success: false,
                    partial_success: !req.rollback_on_failure && !services.is_empty(),
                    services,
                    failed_services: vec![failed_service],
                    error: Some(message),
                })
            }
        }
    }

    async fn bring_up_service(
        &self,
        deployment_id: &str,
        req: &DeployRequest,
        client: &EngineClient,
        service: &ServiceSpec,
        services_done: usize,
        total: usize,
    ) -> Result<String, DmError> {
        // Pull phase: 0-40 within the service's share
        self.progress(
            deployment_id,
            overall_progress(services_done, total, 0, 40, 0.0),
            "pulling_image",
            &format!("Pulling {}", service.image),
        );
        let _ = self.store.set_deployment_progress(
            deployment_id,
            DeploymentStatus::PullingImage,
            overall_progress(services_done, total, 0, 40, 0.0),
            Some("pulling_image"),
        );
        {
            let bus = Arc::clone(&self.bus);
            let deployment_id = deployment_id.to_string();
            let host_id = req.host_id.clone();
            pull_with_progress(client, &service.image, None, PULL_TIMEOUT, move |snap| {
                bus.broadcast(
                    "deployment_layer_progress",
                    json!({
                        "host_id": host_id,
                        "entity_id": deployment_id,
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

        // Create phase: 40-60
        self.progress(
            deployment_id,
            overall_progress(services_done, total, 40, 20, 0.0),
            "creating",
            &format!("Creating {}", service.container_name),
        );
        let body = service_create_body(service);
        let container_id = client.create_container(&service.container_name, &body).await?;

        for network in &service.networks {
            let scoped = format!("{}_{network}", req.name);
            client.connect_network(&scoped, &container_id, None).await?;
        }

        // Start phase: 60-80
        self.progress(
            deployment_id,
            overall_progress(services_done, total, 60, 20, 0.0),
            "starting",
            &format!("Starting {}", service.container_name),
        );
        client.start_container(&container_id).await?;

        Ok(container_id)
    }

    /// Remove created services in reverse dependency order, then created
    /// non-external networks, then (optionally) created volumes.
    async fn rollback(
        &self,
        client: &EngineClient,
        created: &CreatedResources,
        remove_volumes: bool,
    ) {
        info!("Rolling back deployment");
        for (container_id, service) in created.containers.iter().rev() {
            if let Err(e) = client.remove_container(container_id, true, false).await {
                warn!(service, "Rollback: container removal failed: {e}");
            }
        }
        for network in created.networks.iter().rev() {
            if let Err(e) = client.remove_network(network).await {
                warn!(network, "Rollback: network removal failed: {e}");
            }
        }
        if remove_volumes {
            for volume in created.volumes.iter().rev() {
                if let Err(e) = client.remove_volume(volume).await {
                    warn!(volume, "Rollback: volume removal failed: {e}");
                }
            }
        }
    }

    // ── Agent path ──────────────────────────────────────────────

    async fn deploy_via_agent(
        &self,
        deployment_id: &str,
        req: &DeployRequest,
    ) -> Result<DeploymentResult, DmError> {
        let agent = self
            .store
            .get_agent_for_host(&req.host_id)?
            .ok_or_else(|| DmError::AgentUnavailable("No agent registered for this host".into()))?;

        let mut payload =
            build_agent_deploy_payload(req, self.default_health_timeout.as_secs());
        payload["deployment_id"] = json!(deployment_id);

        let result = self
            .coordinator
            .execute_command(&agent.id, "deploy_compose", payload, AGENT_DEPLOY_TIMEOUT)
            .await?;

        if !result.ok() {
            return Ok(DeploymentResult {
                deployment_id: deployment_id.to_string(),
                success: false,
                services: BTreeMap::new(),
                partial_success: false,
                failed_services: Vec::new(),
                error: result.error,
            });
        }

        let payload = result.payload.unwrap_or(Value::Null);
        let services: BTreeMap<String, ServiceOutcome> = payload
            .get("services")
            .and_then(|s| serde_json::from_value(s.clone()).ok())
            .unwrap_or_default();
        Ok(DeploymentResult {
            deployment_id: deployment_id.to_string(),
            success: true,
            services,
            partial_success: false,
            failed_services: Vec::new(),
            error: None,
        })
    }

    /// Tear down a stack. On agent hosts the same profiles are sent so the
    /// agent resolves the full service set.
    pub async fn teardown(
        &self,
        deployment_id: &str,
        remove_volumes: bool,
    ) -> Result<(), DmError> {
        let deployment = self
            .store
            .get_deployment(deployment_id)?
            .ok_or_else(|| DmError::NotFound(format!("Deployment {deployment_id} not found")))?;

        let compose_yaml = deployment
            .definition
            .get("compose_yaml")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let profiles: Vec<String> = deployment
            .definition
            .get("profiles")
            .and_then(|p| serde_json::from_value(p.clone()).ok())
            .unwrap_or_default();

        let host = self
            .store
            .get_host(&deployment.host_id)?
            .ok_or_else(|| DmError::NotFound("Host not found".into()))?;

        if host.connection_type == dm_store::models::ConnectionType::Agent {
            let agent = self
                .store
                .get_agent_for_host(&host.id)?
                .ok_or_else(|| DmError::AgentUnavailable("No agent for host".into()))?;
            let payload = build_agent_teardown_payload(
                &deployment.name,
                &compose_yaml,
                &profiles,
                remove_volumes,
            );
            let result = self
                .coordinator
                .execute_command(&agent.id, "teardown_compose", payload, AGENT_DEPLOY_TIMEOUT)
                .await?;
            if !result.ok() {
                return Err(DmError::engine(
                    None,
                    result.error.unwrap_or_else(|| "Teardown failed".into()),
                ));
            }
            return Ok(());
        }

        let client = self.monitor.client(&host.id).await.ok_or_else(|| {
            DmError::AgentUnavailable(format!("No engine client for host {}", host.id))
        })?;
        let compose = parse_compose(&compose_yaml)?;
        let stack_plan = plan(&compose, &deployment.name, &profiles)?;

        for group in stack_plan.groups.iter().rev() {
            for service in group {
                if let Err(e) = client
                    .remove_container(&service.container_name, true, false)
                    .await
                {
                    warn!(container = service.container_name, "Teardown removal failed: {e}");
                }
            }
        }
        for network in &stack_plan.networks {
            if !network.external {
                let _ = client.remove_network(&network.name).await;
            }
        }
        if remove_volumes {
            for volume in &stack_plan.volumes {
                if !volume.external {
                    let _ = client.remove_volume(&volume.name).await;
                }
            }
        }
        Ok(())
    }

    // ── Progress events ─────────────────────────────────────────

    fn progress(&self, deployment_id: &str, progress: i64, stage: &str, message: &str) {
        self.bus.broadcast(
            "deployment_progress",
            json!({
                "deployment_id": deployment_id,
                "progress": progress,
                "stage": stage,
                "message": message,
            }),
        );
    }

    fn broadcast_complete(&self, result: &DeploymentResult) {
        self.bus.broadcast(
            "deployment_complete",
            json!({
                "deployment_id": result.deployment_id,
                "success": result.success,
                "services": result.services,
                "partial_success": result.partial_success,
                "failed_services": result.failed_services,
                "error": result.error,
            }),
        );
    }
}

fn service_create_body(service: &ServiceSpec) -> Value {
    let mut exposed_ports = serde_json::Map::new();
    let mut port_bindings = serde_json::Map::new();
    for mapping in &service.ports {
        // "host:container" or bare container port
        let (host_port, container_port) = match mapping.split_once(':') {
            Some((host, container)) => (Some(host), container),
            None => (None, mapping.as_str()),
        };
        let key = format!("{container_port}/tcp");
        exposed_ports.insert(key.clone(), json!({}));
        if let Some(host_port) = host_port {
            port_bindings.insert(key, json!([{"HostPort": host_port}]));
        }
    }

    let mut host_config = json!({
        "Binds": service.volumes,
        "PortBindings": port_bindings,
    });
    if let Some(restart) = &service.restart {
        host_config["RestartPolicy"] = json!({"Name": restart});
    }

    let mut body = json!({
        "Image": service.image,
        "Env": service.env,
        "Labels": service.labels,
        "ExposedPorts": exposed_ports,
        "HostConfig": host_config,
    });
    if let Some(command) = &service.command {
        body["Cmd"] = command.clone();
    }
    if let Some(healthcheck) = &service.healthcheck {
        body["Healthcheck"] = healthcheck.clone();
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> DeployRequest {
        DeployRequest {
            host_id: "h1".into(),
            name: "shop".into(),
            compose_yaml: "services:\n  web:\n    image: nginx\n".into(),
            profiles: vec!["dev".into()],
            env_file: None,
            wait_for_healthy: true,
            health_timeout: 120,
            rollback_on_failure: true,
            remove_volumes_on_rollback: false,
        }
    }

    #[test]
    fn test_agent_payload_carries_profiles_and_timeout() {
        let payload = build_agent_deploy_payload(&request(), 60);
        assert_eq!(payload["profiles"], json!(["dev"]));
        assert_eq!(payload["health_timeout"], 120);
        assert_eq!(payload["wait_for_healthy"], true);
    }

    #[test]
    fn test_zero_health_timeout_means_default() {
        let mut req = request();
        req.health_timeout = 0;
        let payload = build_agent_deploy_payload(&req, 60);
        assert_eq!(payload["health_timeout"], 60);
    }

    #[test]
    fn test_teardown_payload_mirrors_profiles() {
        let payload = build_agent_teardown_payload("shop", "services: {}", &["dev".into()], true);
        assert_eq!(payload["profiles"], json!(["dev"]));
        assert_eq!(payload["remove_volumes"], true);
    }

    #[test]
    fn test_service_create_body_ports() {
        let service = ServiceSpec {
            name: "web".into(),
            image: "nginx:1.25".into(),
            container_name: "shop-web".into(),
            env: vec!["A=1".into()],
            ports: vec!["8080:80".into(), "9090".into()],
            volumes: vec!["data:/data".into()],
            networks: vec![],
            labels: Default::default(),
            command: None,
            healthcheck: None,
            restart: Some("unless-stopped".into()),
            depends_on: vec![],
        };
        let body = service_create_body(&service);
        assert_eq!(body["HostConfig"]["PortBindings"]["80/tcp"][0]["HostPort"], "8080");
        assert!(body["ExposedPorts"].get("9090/tcp").is_some());
        assert!(body["HostConfig"]["PortBindings"].get("9090/tcp").is_none());
        assert_eq!(body["HostConfig"]["RestartPolicy"]["Name"], "unless-stopped");
    }
}

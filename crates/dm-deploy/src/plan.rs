//! Deployment planning: profile filtering, dependency layering, and the
//! ordered operation list (networks, volumes, then service groups).

use std::collections::{HashMap, HashSet};

use dm_common::DmError;
use serde_json::Value;

use crate::compose::{ComposeFile, ComposeService};

#[derive(Debug, Clone)]
pub struct NetworkOp {
    pub name: String,
    pub external: bool,
    pub driver: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VolumeOp {
    pub name: String,
    pub external: bool,
}

#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub container_name: String,
    pub env: Vec<String>,
    pub ports: Vec<String>,
    pub volumes: Vec<String>,
    pub networks: Vec<String>,
    pub labels: HashMap<String, String>,
    pub command: Option<Value>,
    pub healthcheck: Option<Value>,
    pub restart: Option<String>,
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    pub networks: Vec<NetworkOp>,
    pub volumes: Vec<VolumeOp>,
    /// Service groups in dependency order; services within one group have
    /// all dependencies satisfied by earlier groups and may run in parallel.
    pub groups: Vec<Vec<ServiceSpec>>,
}

impl DeploymentPlan {
    pub fn total_services(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }
}

/// Build the ordered plan for a compose document under the selected
/// profiles. Rejects `build:` services and dependency cycles.
pub fn plan(
    compose: &ComposeFile,
    stack_name: &str,
    profiles: &[String],
) -> Result<DeploymentPlan, DmError> {
    // Profile filter: a service with no profiles is always active
    let selected: HashMap<&String, &ComposeService> = compose
        .services
        .iter()
        .filter(|(_, service)| {
            service.profiles.is_empty() || service.profiles.iter().any(|p| profiles.contains(p))
        })
        .collect();

    if selected.is_empty() {
        return Err(DmError::Validation(
            "No services selected (check profiles)".into(),
        ));
    }

    let mut specs = HashMap::new();
    for (name, service) in &selected {
        if service.build.is_some() {
            return Err(DmError::Validation(format!(
                "Service '{name}' uses build:, which is not supported"
            )));
        }
        let image = service.image.clone().ok_or_else(|| {
            DmError::Validation(format!("Service '{name}' has no image"))
        })?;

        let depends_on: Vec<String> = service.depends_on.names();
        for dep in &depends_on {
            if !selected.contains_key(dep) {
                return Err(DmError::Validation(format!(
                    "Service '{name}' depends on '{dep}' which is not in the selected service set"
                )));
            }
        }

        specs.insert(
            (*name).clone(),
            ServiceSpec {
                name: (*name).clone(),
                image,
                container_name: service
                    .container_name
                    .clone()
                    .unwrap_or_else(|| format!("{stack_name}-{name}")),
                env: service.environment.to_env_list(),
                ports: service.ports.clone(),
                volumes: service.volumes.clone(),
                networks: service.networks.clone(),
                labels: service.labels.clone(),
                command: service.command.clone(),
                healthcheck: service.healthcheck.clone(),
                restart: service.restart.clone(),
                depends_on,
            },
        );
    }

    let groups = layer_services(&specs)?;

    let mut networks: Vec<NetworkOp> = compose
        .networks
        .iter()
        .map(|(name, net)| {
            let net = net.clone().unwrap_or_default();
            NetworkOp {
                name: format!("{stack_name}_{name}"),
                external: net.external,
                driver: net.driver,
            }
        })
        .collect();
    networks.sort_by(|a, b| a.name.cmp(&b.name));

    let mut volumes: Vec<VolumeOp> = compose
        .volumes
        .iter()
        .map(|(name, vol)| VolumeOp {
            name: format!("{stack_name}_{name}"),
            external: vol.clone().unwrap_or_default().external,
        })
        .collect();
    volumes.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(DeploymentPlan {
        networks,
        volumes,
        groups,
    })
}

/// Kahn-style layering: each group contains services whose dependencies
/// live in earlier groups. A leftover means a cycle.
fn layer_services(specs: &HashMap<String, ServiceSpec>) -> Result<Vec<Vec<ServiceSpec>>, DmError> {
    let mut placed: HashSet<String> = HashSet::new();
    let mut remaining: Vec<&ServiceSpec> = specs.values().collect();
    remaining.sort_by(|a, b| a.name.cmp(&b.name));
    let mut groups = Vec::new();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<&ServiceSpec>, Vec<&ServiceSpec>) = remaining
            .into_iter()
            .partition(|s| s.depends_on.iter().all(|d| placed.contains(d)));

        if ready.is_empty() {
            let names: Vec<&str> = blocked.iter().map(|s| s.name.as_str()).collect();
            return Err(DmError::Validation(format!(
                "Dependency cycle among services: {}",
                names.join(", ")
            )));
        }

        for service in &ready {
            placed.insert(service.name.clone());
        }
        groups.push(ready.into_iter().cloned().collect());
        remaining = blocked;
    }

    Ok(groups)
}

/// Per-service phase progress, weighted across the whole deployment.
/// Phase bases: pull 0-40, create 40-60, start 60-80, health 80-100.
pub fn overall_progress(
    services_done: usize,
    total_services: usize,
    phase_base: i64,
    phase_span: i64,
    fraction: f64,
) -> i64 {
    if total_services == 0 {
        return 100;
    }
    let service_progress = phase_base as f64 + phase_span as f64 * fraction.clamp(0.0, 1.0);
    let done = services_done as f64 * 100.0;
    ((done + service_progress) / total_services as f64) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::parse_compose;

    const STACK: &str = r#"
services:
  proxy:
    image: traefik:v3
    depends_on: [web, api]
  web:
    image: nginx:1.25
    depends_on: [db]
  api:
    image: ghcr.io/org/api:2.0
    depends_on: [db]
  db:
    image: postgres:16
networks:
  backend: {}
  upstream:
    external: true
volumes:
  pgdata:
"#;

    #[test]
    fn test_layering_orders_dependencies() {
        let compose = parse_compose(STACK).unwrap();
        let plan = plan(&compose, "shop", &[]).unwrap();

        assert_eq!(plan.groups.len(), 3);
        assert_eq!(plan.groups[0][0].name, "db");
        let second: Vec<&str> = plan.groups[1].iter().map(|s| s.name.as_str()).collect();
        assert_eq!(second, vec!["api", "web"]);
        assert_eq!(plan.groups[2][0].name, "proxy");
        assert_eq!(plan.total_services(), 4);
    }

    #[test]
    fn test_cycle_rejected() {
        let yaml = r#"
services:
  a:
    image: x
    depends_on: [b]
  b:
    image: y
    depends_on: [a]
"#;
        let compose = parse_compose(yaml).unwrap();
        let err = plan(&compose, "s", &[]).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_build_rejected() {
        let yaml = r#"
services:
  app:
    build: .
"#;
        let compose = parse_compose(yaml).unwrap();
        let err = plan(&compose, "s", &[]).unwrap_err();
        assert!(err.to_string().contains("build"));
    }

    #[test]
    fn test_profiles_filter_services() {
        let yaml = r#"
services:
  web:
    image: nginx
  debug:
    image: busybox
    profiles: [dev]
"#;
        let compose = parse_compose(yaml).unwrap();

        let default_plan = plan(&compose, "s", &[]).unwrap();
        assert_eq!(default_plan.total_services(), 1);

        let dev_plan = plan(&compose, "s", &["dev".to_string()]).unwrap();
        assert_eq!(dev_plan.total_services(), 2);
    }

    #[test]
    fn test_external_network_flagged() {
        let compose = parse_compose(STACK).unwrap();
        let plan = plan(&compose, "shop", &[]).unwrap();
        let upstream = plan
            .networks
            .iter()
            .find(|n| n.name == "shop_upstream")
            .unwrap();
        assert!(upstream.external);
    }

    #[test]
    fn test_progress_phase_weighting() {
        // Single service, halfway through its pull
        assert_eq!(overall_progress(0, 1, 0, 40, 0.5), 20);
        // Two services: first done, second in health phase
        assert_eq!(overall_progress(1, 2, 80, 20, 0.0), 90);
        // Completion
        assert_eq!(overall_progress(2, 2, 0, 0, 0.0), 100);
    }
}

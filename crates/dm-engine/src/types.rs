use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Container listing entry (subset of the engine's `/containers/json` row).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSummary {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Names", default)]
    pub names: Vec<String>,
    #[serde(rename = "Image", default)]
    pub image: String,
    #[serde(rename = "State", default)]
    pub state: String,
    #[serde(rename = "Status", default)]
    pub status: String,
    #[serde(rename = "Labels", default)]
    pub labels: HashMap<String, String>,
}

impl ContainerSummary {
    pub fn name(&self) -> &str {
        self.names
            .first()
            .map(|n| n.trim_start_matches('/'))
            .unwrap_or("")
    }
}

/// Full inspect document. `host_config` is kept as opaque JSON so updates can
/// pass it back to the create endpoint verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInspect {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Config", default)]
    pub config: ContainerConfig,
    #[serde(rename = "HostConfig", default)]
    pub host_config: Value,
    #[serde(rename = "NetworkSettings", default)]
    pub network_settings: NetworkSettings,
    #[serde(rename = "State", default)]
    pub state: ContainerState,
    #[serde(rename = "Image", default)]
    pub image_id: String,
}

impl ContainerInspect {
    pub fn container_name(&self) -> &str {
        self.name.trim_start_matches('/')
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "Image", default)]
    pub image: String,
    #[serde(rename = "Labels", default)]
    pub labels: HashMap<String, String>,
    #[serde(rename = "Env", default)]
    pub env: Vec<String>,
    #[serde(rename = "Cmd", default)]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "Entrypoint", default)]
    pub entrypoint: Option<Value>,
    #[serde(rename = "ExposedPorts", default)]
    pub exposed_ports: Option<Value>,
    #[serde(rename = "Volumes", default)]
    pub volumes: Option<Value>,
    #[serde(rename = "WorkingDir", default)]
    pub working_dir: Option<String>,
    #[serde(rename = "User", default)]
    pub user: Option<String>,
    #[serde(rename = "Healthcheck", default)]
    pub healthcheck: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSettings {
    #[serde(rename = "Networks", default)]
    pub networks: HashMap<String, NetworkAttachment>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkAttachment {
    #[serde(rename = "Aliases", default)]
    pub aliases: Option<Vec<String>>,
    #[serde(rename = "NetworkID", default)]
    pub network_id: String,
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerState {
    #[serde(rename = "Status", default)]
    pub status: String,
    #[serde(rename = "Running", default)]
    pub running: bool,
    #[serde(rename = "ExitCode", default)]
    pub exit_code: i64,
    #[serde(rename = "Health", default)]
    pub health: Option<Health>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Health {
    #[serde(rename = "Status", default)]
    pub status: String,
}

/// Image inspect subset: labels for subtraction, digests for update checks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageInspect {
    #[serde(rename = "Id", default)]
    pub id: String,
    #[serde(rename = "RepoDigests", default)]
    pub repo_digests: Vec<String>,
    #[serde(rename = "Config", default)]
    pub config: ImageConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(rename = "Labels", default)]
    pub labels: Option<HashMap<String, String>>,
}

impl ImageInspect {
    pub fn labels(&self) -> HashMap<String, String> {
        self.config.labels.clone().unwrap_or_default()
    }

    /// First `sha256:` digest from RepoDigests, if the image was pulled.
    pub fn digest(&self) -> Option<String> {
        self.repo_digests
            .iter()
            .find_map(|d| d.split_once('@').map(|(_, digest)| digest.to_string()))
    }
}

/// Health-gate outcome for a freshly (re)started container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    Healthy,
    Unhealthy,
    TimedOut,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inspect_parses_engine_payload() {
        let raw = serde_json::json!({
            "Id": "abc123def456abc123def456",
            "Name": "/web",
            "Config": {
                "Image": "nginx:1.24",
                "Labels": {"com.docker.compose.project": "shop"}
            },
            "HostConfig": {"Binds": ["/data:/data"], "NanoCpus": 500000000},
            "NetworkSettings": {
                "Networks": {
                    "shop_default": {"Aliases": ["web"], "NetworkID": "n1", "IPAddress": "172.1.0.2"}
                }
            },
            "State": {"Status": "running", "Running": true, "Health": {"Status": "healthy"}}
        });
        let inspect: ContainerInspect = serde_json::from_value(raw).unwrap();
        assert_eq!(inspect.container_name(), "web");
        assert_eq!(inspect.host_config["NanoCpus"], 500000000);
        assert_eq!(
            inspect.network_settings.networks["shop_default"]
                .aliases
                .as_deref(),
            Some(&["web".to_string()][..])
        );
        assert_eq!(
            inspect.state.health.as_ref().map(|h| h.status.as_str()),
            Some("healthy")
        );
    }

    #[test]
    fn test_image_digest_extraction() {
        let image = ImageInspect {
            id: "sha256:xyz".into(),
            repo_digests: vec!["ghcr.io/org/app@sha256:abc123".into()],
            config: ImageConfig::default(),
        };
        assert_eq!(image.digest().as_deref(), Some("sha256:abc123"));
    }
}

//! Host monitor: owns one engine client per directly-reachable host and a
//! cached view of the fleet's containers. Agent-backed hosts have no client
//! here; their containers arrive through agent events.

use std::collections::HashMap;
use std::sync::Arc;

use dm_common::DmError;
use dm_common::keys::{make_composite_key, short_id};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::client::EngineClient;

/// Fleet-wide container view, keyed for multi-host support.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub host_id: String,
    pub host_name: String,
    /// Short (12 char) container id.
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
    pub labels: HashMap<String, String>,
}

impl ContainerInfo {
    pub fn composite_key(&self) -> String {
        make_composite_key(&self.host_id, &self.id)
    }

    pub fn is_compose_managed(&self) -> bool {
        self.labels
            .keys()
            .any(|k| k.starts_with("com.docker.compose"))
    }
}

struct HostEntry {
    name: String,
    client: EngineClient,
}

/// Shared monitor handle.
#[derive(Clone, Default)]
pub struct Monitor {
    hosts: Arc<RwLock<HashMap<String, HostEntry>>>,
    /// Containers reported by agents, merged into the fleet view.
    agent_containers: Arc<RwLock<HashMap<String, Vec<ContainerInfo>>>>,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_host(
        &self,
        host_id: &str,
        name: &str,
        url: &str,
        is_podman: bool,
    ) -> Result<(), DmError> {
        let client = EngineClient::new(url, is_podman)?;
        let mut hosts = self.hosts.write().await;
        hosts.insert(
            host_id.to_string(),
            HostEntry {
                name: name.to_string(),
                client,
            },
        );
        info!(host_id, name, "Host registered with monitor");
        Ok(())
    }

    pub async fn remove_host(&self, host_id: &str) {
        self.hosts.write().await.remove(host_id);
        self.agent_containers.write().await.remove(host_id);
    }

    pub async fn client(&self, host_id: &str) -> Option<EngineClient> {
        self.hosts.read().await.get(host_id).map(|e| e.client.clone())
    }

    pub async fn host_name(&self, host_id: &str) -> Option<String> {
        self.hosts.read().await.get(host_id).map(|e| e.name.clone())
    }

    /// Replace the agent-reported container set for a host.
    pub async fn set_agent_containers(&self, host_id: &str, containers: Vec<ContainerInfo>) {
        self.agent_containers
            .write()
            .await
            .insert(host_id.to_string(), containers);
    }

    /// Current container set across all hosts. Direct hosts are queried
    /// live; agent hosts contribute their last reported set.
    pub async fn get_containers(&self) -> Vec<ContainerInfo> {
        let mut result = Vec::new();

        let hosts: Vec<(String, String, EngineClient)> = {
            let guard = self.hosts.read().await;
            guard
                .iter()
                .map(|(id, e)| (id.clone(), e.name.clone(), e.client.clone()))
                .collect()
        };

        for (host_id, host_name, client) in hosts {
            match client.list_containers(true).await {
                Ok(list) => {
                    for c in list {
                        result.push(ContainerInfo {
                            host_id: host_id.clone(),
                            host_name: host_name.clone(),
                            id: short_id(&c.id).to_string(),
                            name: c.name().to_string(),
                            image: c.image.clone(),
                            state: c.state.clone(),
                            status: c.status.clone(),
                            labels: c.labels.clone(),
                        });
                    }
                }
                Err(e) => {
                    warn!(host_id, "Failed to list containers: {e}");
                }
            }
        }

        let agent_map = self.agent_containers.read().await;
        for containers in agent_map.values() {
            result.extend(containers.iter().cloned());
        }

        result
    }

    pub async fn find_container(&self, host_id: &str, container_id: &str) -> Option<ContainerInfo> {
        self.get_containers()
            .await
            .into_iter()
            .find(|c| c.host_id == host_id && c.id == container_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_agent_containers_merge_into_view() {
        let monitor = Monitor::new();
        monitor
            .set_agent_containers(
                "h1",
                vec![ContainerInfo {
                    host_id: "h1".into(),
                    host_name: "edge".into(),
                    id: "abc123def456".into(),
                    name: "web".into(),
                    image: "nginx:1.24".into(),
                    state: "running".into(),
                    status: "Up 2 hours".into(),
                    labels: HashMap::new(),
                }],
            )
            .await;

        let containers = monitor.get_containers().await;
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].composite_key(), "h1:abc123def456");
    }

    #[test]
    fn test_compose_detection() {
        let mut labels = HashMap::new();
        labels.insert("com.docker.compose.project".to_string(), "shop".to_string());
        let c = ContainerInfo {
            host_id: "h1".into(),
            host_name: "edge".into(),
            id: "abc".into(),
            name: "web".into(),
            image: "nginx".into(),
            state: "running".into(),
            status: String::new(),
            labels,
        };
        assert!(c.is_compose_managed());
    }
}

//! Thin client for the Docker/Podman Engine HTTP API.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dm_common::DmError;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::types::{ContainerInspect, ContainerSummary, HealthOutcome, ImageInspect};

/// A container without a healthcheck counts as healthy after staying
/// `running` for this long.
pub const STABILITY_WINDOW_SECS: u64 = 3;

#[derive(Clone)]
pub struct EngineClient {
    http: reqwest::Client,
    base_url: String,
    /// Podman targets need NanoCpus/MemorySwappiness filtering on create.
    pub is_podman: bool,
}

impl EngineClient {
    pub fn new(base_url: &str, is_podman: bool) -> Result<Self, DmError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| DmError::engine(None, e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            is_podman,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, DmError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        // Engine errors come back as {"message": "..."}
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(String::from))
            .unwrap_or(body);
        Err(DmError::engine(Some(status.as_u16()), message))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, DmError> {
        let resp = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| DmError::engine(None, e.to_string()))?;
        Self::check(resp)
            .await?
            .json()
            .await
            .map_err(|e| DmError::engine(None, e.to_string()))
    }

    async fn post_empty(&self, path: &str) -> Result<(), DmError> {
        let resp = self
            .http
            .post(self.url(path))
            .send()
            .await
            .map_err(|e| DmError::engine(None, e.to_string()))?;
        Self::check(resp).await.map(|_| ())
    }

    // ── Containers ──────────────────────────────────────────────

    pub async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, DmError> {
        self.get_json(&format!("/containers/json?all={}", all as u8))
            .await
    }

    pub async fn inspect_container(&self, id: &str) -> Result<ContainerInspect, DmError> {
        self.get_json(&format!("/containers/{id}/json")).await
    }

    /// Low-level create with an opaque body (passthrough of the old
    /// HostConfig is the caller's concern). Returns the new container id.
    pub async fn create_container(&self, name: &str, body: &Value) -> Result<String, DmError> {
        let resp = self
            .http
            .post(self.url(&format!("/containers/create?name={name}")))
            .json(body)
            .send()
            .await
            .map_err(|e| DmError::engine(None, e.to_string()))?;
        let created: Value = Self::check(resp)
            .await?
            .json()
            .await
            .map_err(|e| DmError::engine(None, e.to_string()))?;
        created
            .get("Id")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| DmError::engine(None, "Create response missing Id"))
    }

    pub async fn start_container(&self, id: &str) -> Result<(), DmError> {
        self.post_empty(&format!("/containers/{id}/start")).await
    }

    pub async fn stop_container(&self, id: &str, timeout_secs: u64) -> Result<(), DmError> {
        self.post_empty(&format!("/containers/{id}/stop?t={timeout_secs}"))
            .await
    }

    pub async fn restart_container(&self, id: &str, timeout_secs: u64) -> Result<(), DmError> {
        self.post_empty(&format!("/containers/{id}/restart?t={timeout_secs}"))
            .await
    }

    pub async fn pause_container(&self, id: &str) -> Result<(), DmError> {
        self.post_empty(&format!("/containers/{id}/pause")).await
    }

    pub async fn unpause_container(&self, id: &str) -> Result<(), DmError> {
        self.post_empty(&format!("/containers/{id}/unpause")).await
    }

    pub async fn rename_container(&self, id: &str, new_name: &str) -> Result<(), DmError> {
        self.post_empty(&format!("/containers/{id}/rename?name={new_name}"))
            .await
    }

    pub async fn remove_container(&self, id: &str, force: bool, volumes: bool) -> Result<(), DmError> {
        let resp = self
            .http
            .delete(self.url(&format!(
                "/containers/{id}?force={}&v={}",
                force as u8, volumes as u8
            )))
            .send()
            .await
            .map_err(|e| DmError::engine(None, e.to_string()))?;
        Self::check(resp).await.map(|_| ())
    }

    // ── Images ──────────────────────────────────────────────────

    pub async fn inspect_image(&self, reference: &str) -> Result<ImageInspect, DmError> {
        self.get_json(&format!("/images/{reference}/json")).await
    }

    /// Raw pull stream (JSON lines). The pull tracker consumes this.
    pub async fn pull_stream(
        &self,
        image: &str,
        auth: Option<&(String, String)>,
    ) -> Result<reqwest::Response, DmError> {
        let (from_image, tag) = match image.rsplit_once(':') {
            // A colon inside a registry host:port segment is not a tag.
            Some((name, tag)) if !tag.contains('/') => (name, tag),
            _ => (image, "latest"),
        };
        let mut req = self.http.post(self.url(&format!(
            "/images/create?fromImage={from_image}&tag={tag}"
        )));
        if let Some((username, password)) = auth {
            let header = URL_SAFE_NO_PAD
                .encode(json!({"username": username, "password": password}).to_string());
            req = req.header("X-Registry-Auth", header);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| DmError::engine(None, e.to_string()))?;
        Self::check(resp).await
    }

    // ── Networks & volumes ──────────────────────────────────────

    pub async fn create_network(&self, name: &str, driver: Option<&str>) -> Result<(), DmError> {
        let body = json!({"Name": name, "Driver": driver.unwrap_or("bridge")});
        let resp = self
            .http
            .post(self.url("/networks/create"))
            .json(&body)
            .send()
            .await
            .map_err(|e| DmError::engine(None, e.to_string()))?;
        Self::check(resp).await.map(|_| ())
    }

    pub async fn remove_network(&self, name: &str) -> Result<(), DmError> {
        let resp = self
            .http
            .delete(self.url(&format!("/networks/{name}")))
            .send()
            .await
            .map_err(|e| DmError::engine(None, e.to_string()))?;
        Self::check(resp).await.map(|_| ())
    }

    pub async fn network_exists(&self, name: &str) -> Result<bool, DmError> {
        match self.get_json::<Value>(&format!("/networks/{name}")).await {
            Ok(_) => Ok(true),
            Err(DmError::Engine { status: Some(404), .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn connect_network(
        &self,
        network: &str,
        container: &str,
        aliases: Option<&[String]>,
    ) -> Result<(), DmError> {
        let mut endpoint_config = json!({});
        if let Some(aliases) = aliases {
            endpoint_config["Aliases"] = json!(aliases);
        }
        let body = json!({"Container": container, "EndpointConfig": endpoint_config});
        let resp = self
            .http
            .post(self.url(&format!("/networks/{network}/connect")))
            .json(&body)
            .send()
            .await
            .map_err(|e| DmError::engine(None, e.to_string()))?;
        Self::check(resp).await.map(|_| ())
    }

    pub async fn create_volume(&self, name: &str) -> Result<(), DmError> {
        let resp = self
            .http
            .post(self.url("/volumes/create"))
            .json(&json!({"Name": name}))
            .send()
            .await
            .map_err(|e| DmError::engine(None, e.to_string()))?;
        Self::check(resp).await.map(|_| ())
    }

    pub async fn remove_volume(&self, name: &str) -> Result<(), DmError> {
        let resp = self
            .http
            .delete(self.url(&format!("/volumes/{name}")))
            .send()
            .await
            .map_err(|e| DmError::engine(None, e.to_string()))?;
        Self::check(resp).await.map(|_| ())
    }

    // ── Health gate ─────────────────────────────────────────────

    /// Wait for a container to become healthy: Docker healthcheck when one
    /// is defined, otherwise a 3-second running-stability window.
    pub async fn wait_healthy(&self, id: &str, timeout_secs: u64) -> Result<HealthOutcome, DmError> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs.max(1));
        let mut stable_since: Option<tokio::time::Instant> = None;

        loop {
            let inspect = self.inspect_container(id).await?;
            match &inspect.state.health {
                Some(health) => match health.status.as_str() {
                    "healthy" => return Ok(HealthOutcome::Healthy),
                    "unhealthy" => return Ok(HealthOutcome::Unhealthy),
                    _ => {
                        stable_since = None;
                    }
                },
                None => {
                    if inspect.state.running {
                        let since = stable_since.get_or_insert_with(tokio::time::Instant::now);
                        if since.elapsed() >= Duration::from_secs(STABILITY_WINDOW_SECS) {
                            return Ok(HealthOutcome::Healthy);
                        }
                    } else {
                        // Exited before the stability window elapsed
                        if stable_since.is_some() {
                            return Ok(HealthOutcome::Unhealthy);
                        }
                        stable_since = None;
                    }
                }
            }

            if tokio::time::Instant::now() >= deadline {
                debug!(container = id, "Health gate timed out");
                return Ok(HealthOutcome::TimedOut);
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Ping the engine. Used when a host is added and by the monitor loop.
    pub async fn ping(&self) -> Result<(), DmError> {
        let resp = self
            .http
            .get(self.url("/_ping"))
            .send()
            .await
            .map_err(|e| DmError::engine(None, e.to_string()))?;
        Self::check(resp).await.map(|_| ())
    }

    /// Engine identity (`/info` ID field) used as the host's engine_id.
    pub async fn engine_id(&self) -> Result<String, DmError> {
        let info: Value = self.get_json("/info").await?;
        let id = info
            .get("ID")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        info!(engine_id = %id, "Resolved engine identity");
        Ok(id)
    }
}

//! OCI/Docker v2 registry adapter: image reference parsing, manifest digest
//! resolution, tag listing, and floating tag computation.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use dm_common::DmError;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json";

/// How a container tracks newer images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagMode {
    Exact,
    Minor,
    Major,
    Latest,
}

impl TagMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exact" => Some(Self::Exact),
            "minor" => Some(Self::Minor),
            "major" => Some(Self::Major),
            "latest" => Some(Self::Latest),
            _ => None,
        }
    }
}

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Registry host, `docker.io` when implicit.
    pub registry: String,
    /// Repository path, with `library/` filled in for Docker Hub singles.
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    /// Parse `nginx:1.25`, `ghcr.io/org/app:latest`,
    /// `registry.example.com:5000/app:v1`, etc. The prefix before the first
    /// `/` is a registry only when it contains a `.` or `:`.
    pub fn parse(image: &str) -> Self {
        let (registry, rest) = match image.split_once('/') {
            Some((head, rest)) if head.contains('.') || head.contains(':') => {
                (head.to_lowercase(), rest.to_string())
            }
            _ => ("docker.io".to_string(), image.to_string()),
        };

        let (repository, tag) = match rest.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
            _ => (rest, "latest".to_string()),
        };

        let repository = if registry == "docker.io" && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };

        Self {
            registry,
            repository,
            tag,
        }
    }

    /// API endpoint host (Docker Hub uses a distinct API hostname).
    fn api_host(&self) -> &str {
        if self.registry == "docker.io" {
            "registry-1.docker.io"
        } else {
            &self.registry
        }
    }

    /// Re-assemble a reference string with a different tag.
    pub fn with_tag(&self, tag: &str) -> String {
        let repo = if self.registry == "docker.io" {
            self.repository
                .strip_prefix("library/")
                .unwrap_or(&self.repository)
                .to_string()
        } else {
            self.repository.clone()
        };
        if self.registry == "docker.io" {
            format!("{repo}:{tag}")
        } else {
            format!("{}/{repo}:{tag}", self.registry)
        }
    }
}

/// Result of resolving a tag against the registry.
#[derive(Debug, Clone)]
pub struct ResolvedTag {
    pub digest: String,
    pub registry: String,
}

pub struct RegistryAdapter {
    http: reqwest::Client,
}

impl Default for RegistryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

impl RegistryAdapter {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { http }
    }

    /// Resolve an image reference to its manifest digest.
    pub async fn resolve_tag(
        &self,
        image: &str,
        auth: Option<&(String, String)>,
    ) -> Result<ResolvedTag, DmError> {
        let image_ref = ImageRef::parse(image);
        let token = self.fetch_token(&image_ref, auth).await?;

        let url = format!(
            "https://{}/v2/{}/manifests/{}",
            image_ref.api_host(),
            image_ref.repository,
            image_ref.tag
        );

        let mut req = self.http.head(&url).header("Accept", MANIFEST_ACCEPT);
        if let Some(token) = &token {
            req = req.bearer_auth(token);
        } else if let Some((user, pass)) = auth {
            req = req.header("Authorization", basic_auth(user, pass));
        }

        let resp = req
            .send()
            .await
            .map_err(|e| DmError::engine(None, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(DmError::engine(
                Some(resp.status().as_u16()),
                format!("Manifest lookup failed for {image}"),
            ));
        }

        let digest = resp
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .ok_or_else(|| DmError::engine(None, "Registry returned no content digest"))?;

        debug!(image, digest, "Resolved manifest digest");
        Ok(ResolvedTag {
            digest,
            registry: image_ref.registry,
        })
    }

    /// List tags for an image's repository.
    pub async fn list_tags(
        &self,
        image: &str,
        auth: Option<&(String, String)>,
    ) -> Result<Vec<String>, DmError> {
        let image_ref = ImageRef::parse(image);
        let token = self.fetch_token(&image_ref, auth).await?;

        let url = format!(
            "https://{}/v2/{}/tags/list?n=1000",
            image_ref.api_host(),
            image_ref.repository
        );
        let mut req = self.http.get(&url);
        if let Some(token) = &token {
            req = req.bearer_auth(token);
        } else if let Some((user, pass)) = auth {
            req = req.header("Authorization", basic_auth(user, pass));
        }

        let resp = req
            .send()
            .await
            .map_err(|e| DmError::engine(None, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(DmError::engine(
                Some(resp.status().as_u16()),
                format!("Tag listing failed for {image}"),
            ));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| DmError::engine(None, e.to_string()))?;
        Ok(body
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Compute the floating reference to track for an image under a mode.
    /// Exact and latest are offline; minor/major consult the tag list.
    pub async fn compute_floating_tag(
        &self,
        image: &str,
        mode: TagMode,
        auth: Option<&(String, String)>,
    ) -> Result<String, DmError> {
        let image_ref = ImageRef::parse(image);
        match mode {
            TagMode::Exact => Ok(image.to_string()),
            TagMode::Latest => Ok(image_ref.with_tag("latest")),
            TagMode::Minor | TagMode::Major => {
                let tags = self.list_tags(image, auth).await?;
                let selected = select_floating_tag(&image_ref.tag, mode, &tags)
                    .unwrap_or_else(|| image_ref.tag.clone());
                Ok(image_ref.with_tag(&selected))
            }
        }
    }

    /// Challenge-response token fetch for registries that answer 401 with a
    /// Bearer challenge (Docker Hub, ghcr.io).
    async fn fetch_token(
        &self,
        image_ref: &ImageRef,
        auth: Option<&(String, String)>,
    ) -> Result<Option<String>, DmError> {
        let probe = format!("https://{}/v2/", image_ref.api_host());
        let resp = self
            .http
            .get(&probe)
            .send()
            .await
            .map_err(|e| DmError::engine(None, e.to_string()))?;

        if resp.status().as_u16() != 401 {
            return Ok(None);
        }
        let challenge = resp
            .headers()
            .get("WWW-Authenticate")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let Some((realm, service)) = parse_bearer_challenge(&challenge) else {
            return Ok(None);
        };

        let scope = format!("repository:{}:pull", image_ref.repository);
        let mut req = self
            .http
            .get(&realm)
            .query(&[("service", service.as_str()), ("scope", scope.as_str())]);
        if let Some((user, pass)) = auth {
            req = req.header("Authorization", basic_auth(user, pass));
        }

        let token_resp: TokenResponse = req
            .send()
            .await
            .map_err(|e| DmError::engine(None, e.to_string()))?
            .json()
            .await
            .map_err(|e| DmError::engine(None, e.to_string()))?;
        Ok(token_resp.token.or(token_resp.access_token))
    }
}

fn basic_auth(user: &str, pass: &str) -> String {
    format!("Basic {}", B64.encode(format!("{user}:{pass}")))
}

fn parse_bearer_challenge(header: &str) -> Option<(String, String)> {
    let rest = header.strip_prefix("Bearer ")?;
    let mut realm = None;
    let mut service = None;
    for part in rest.split(',') {
        let (key, value) = part.trim().split_once('=')?;
        let value = value.trim_matches('"');
        match key {
            "realm" => realm = Some(value.to_string()),
            "service" => service = Some(value.to_string()),
            _ => {}
        }
    }
    Some((realm?, service?))
}

/// Semantic version extracted from a tag, preserving any `v` prefix.
fn parse_version(tag: &str) -> Option<(bool, Vec<u64>)> {
    let (prefixed, body) = match tag.strip_prefix('v') {
        Some(rest) => (true, rest),
        None => (false, tag),
    };
    // Reject tags with suffixes like -alpine or -rc1 so a floating update
    // never crosses variants.
    if body.is_empty() || !body.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    let parts: Result<Vec<u64>, _> = body.split('.').map(str::parse).collect();
    parts.ok().map(|p| (prefixed, p))
}

/// Pick the floating tag for `current` under `mode` from the repository's
/// tag list. Returns None when the current tag is not version-shaped or no
/// candidate beats it.
pub fn select_floating_tag(current: &str, mode: TagMode, tags: &[String]) -> Option<String> {
    let (prefixed, current_parts) = parse_version(current)?;
    let current_major = *current_parts.first()?;

    let mut best: Option<(Vec<u64>, &str)> = None;
    for tag in tags {
        let Some((candidate_prefixed, parts)) = parse_version(tag) else {
            continue;
        };
        // Stay within the same tag style and precision
        if candidate_prefixed != prefixed || parts.len() != current_parts.len() {
            continue;
        }
        if mode == TagMode::Minor && parts.first() != Some(&current_major) {
            continue;
        }
        if parts < current_parts {
            continue;
        }
        if best.as_ref().map(|(b, _)| &parts > b).unwrap_or(true) {
            best = Some((parts, tag));
        }
    }
    best.map(|(_, tag)| tag.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_docker_hub_single() {
        let image_ref = ImageRef::parse("nginx:1.25");
        assert_eq!(image_ref.registry, "docker.io");
        assert_eq!(image_ref.repository, "library/nginx");
        assert_eq!(image_ref.tag, "1.25");
        assert_eq!(image_ref.with_tag("latest"), "nginx:latest");
    }

    #[test]
    fn test_parse_explicit_registry_with_port() {
        let image_ref = ImageRef::parse("registry.example.com:5000/app:v1");
        assert_eq!(image_ref.registry, "registry.example.com:5000");
        assert_eq!(image_ref.repository, "app");
        assert_eq!(image_ref.tag, "v1");
    }

    #[test]
    fn test_parse_org_repo_defaults_to_hub() {
        let image_ref = ImageRef::parse("grafana/grafana");
        assert_eq!(image_ref.registry, "docker.io");
        assert_eq!(image_ref.repository, "grafana/grafana");
        assert_eq!(image_ref.tag, "latest");
    }

    #[test]
    fn test_select_minor_stays_in_major() {
        let tags: Vec<String> = ["1.24.0", "1.25.3", "1.26.1", "2.0.0", "1.26.1-alpine"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            select_floating_tag("1.24.0", TagMode::Minor, &tags),
            Some("1.26.1".to_string())
        );
    }

    #[test]
    fn test_select_major_picks_highest() {
        let tags: Vec<String> = ["1.24.0", "2.0.0", "2.1.0"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            select_floating_tag("1.24.0", TagMode::Major, &tags),
            Some("2.1.0".to_string())
        );
    }

    #[test]
    fn test_select_respects_v_prefix_and_precision() {
        let tags: Vec<String> = ["v1.1", "v1.2", "1.3", "v1.2.9"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            select_floating_tag("v1.1", TagMode::Minor, &tags),
            Some("v1.2".to_string())
        );
    }

    #[test]
    fn test_select_non_version_tag() {
        let tags: Vec<String> = vec!["latest".into(), "stable".into()];
        assert_eq!(select_floating_tag("stable", TagMode::Minor, &tags), None);
    }

    #[test]
    fn test_parse_bearer_challenge() {
        let header = "Bearer realm=\"https://auth.docker.io/token\",service=\"registry.docker.io\"";
        let (realm, service) = parse_bearer_challenge(header).unwrap();
        assert_eq!(realm, "https://auth.docker.io/token");
        assert_eq!(service, "registry.docker.io");
    }
}

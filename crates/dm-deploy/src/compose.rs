//! Compose document model. Only the subset the executor drives is typed;
//! unknown keys are ignored on parse.

use std::collections::HashMap;

use dm_common::DmError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ComposeFile {
    #[serde(default)]
    pub services: HashMap<String, ComposeService>,
    #[serde(default)]
    pub networks: HashMap<String, Option<ComposeNetwork>>,
    #[serde(default)]
    pub volumes: HashMap<String, Option<ComposeVolume>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ComposeService {
    #[serde(default)]
    pub image: Option<String>,
    /// `build:` is rejected by the planner; captured only to detect it.
    #[serde(default)]
    pub build: Option<Value>,
    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub depends_on: DependsOn,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub command: Option<Value>,
    #[serde(default)]
    pub healthcheck: Option<Value>,
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub restart: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ComposeNetwork {
    #[serde(default)]
    pub external: bool,
    #[serde(default)]
    pub driver: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ComposeVolume {
    #[serde(default)]
    pub external: bool,
}

/// `depends_on` comes as a list of names or a map with conditions.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(untagged)]
pub enum DependsOn {
    #[default]
    #[serde(skip)]
    None,
    List(Vec<String>),
    Map(HashMap<String, Value>),
}

impl DependsOn {
    pub fn names(&self) -> Vec<String> {
        match self {
            Self::None => Vec::new(),
            Self::List(names) => names.clone(),
            Self::Map(map) => map.keys().cloned().collect(),
        }
    }
}

/// Environment: list (`KEY=VAL`) or map form.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Environment {
    #[default]
    #[serde(skip)]
    None,
    List(Vec<String>),
    Map(HashMap<String, Option<String>>),
}

impl Environment {
    pub fn to_env_list(&self) -> Vec<String> {
        match self {
            Self::None => Vec::new(),
            Self::List(list) => list.clone(),
            Self::Map(map) => {
                let mut entries: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("{k}={}", v.clone().unwrap_or_default()))
                    .collect();
                entries.sort();
                entries
            }
        }
    }
}

pub fn parse_compose(yaml: &str) -> Result<ComposeFile, DmError> {
    serde_yaml::from_str(yaml)
        .map_err(|e| DmError::Validation(format!("Invalid compose document: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
services:
  web:
    image: nginx:1.25
    ports: ["8080:80"]
    depends_on: [db]
    networks: [frontend]
    profiles: [dev]
  db:
    image: postgres:16
    environment:
      POSTGRES_PASSWORD: secret
    volumes: ["pgdata:/var/lib/postgresql/data"]
networks:
  frontend:
    driver: bridge
  upstream:
    external: true
volumes:
  pgdata:
"#;

    #[test]
    fn test_parse_sample() {
        let compose = parse_compose(SAMPLE).unwrap();
        assert_eq!(compose.services.len(), 2);
        assert_eq!(compose.services["web"].depends_on.names(), vec!["db"]);
        assert_eq!(compose.services["web"].profiles, vec!["dev"]);
        assert!(compose.networks["upstream"].as_ref().unwrap().external);
        assert!(compose.volumes.contains_key("pgdata"));
    }

    #[test]
    fn test_environment_map_form() {
        let compose = parse_compose(SAMPLE).unwrap();
        let env = compose.services["db"].environment.to_env_list();
        assert_eq!(env, vec!["POSTGRES_PASSWORD=secret"]);
    }

    #[test]
    fn test_depends_on_map_form() {
        let yaml = r#"
services:
  web:
    image: nginx
    depends_on:
      db:
        condition: service_healthy
  db:
    image: postgres
"#;
        let compose = parse_compose(yaml).unwrap();
        assert_eq!(compose.services["web"].depends_on.names(), vec!["db"]);
    }

    #[test]
    fn test_invalid_yaml_rejected() {
        assert!(matches!(
            parse_compose(": not compose"),
            Err(DmError::Validation(_))
        ));
    }
}

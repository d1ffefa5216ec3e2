use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration, loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Listen address for the HTTP API.
    pub api_port: u16,
    /// Directory holding the SQLite database and other app data.
    pub data_dir: PathBuf,
    /// Hex-encoded 32-byte key for the credential vault. Generated and
    /// persisted under data_dir on first start when unset.
    pub vault_key_hex: Option<String>,
    /// Expected agent heartbeat cadence; 3 missed beats mark the agent degraded.
    pub agent_heartbeat_secs: u64,
    /// Grace after socket loss before an agent is marked offline.
    pub agent_offline_grace_secs: u64,
    /// Hard maximum age for pending agent commands before the sweeper expires them.
    pub pending_command_max_age_secs: u64,
    /// Time an agent gets to reconnect after a self-update.
    pub self_update_reconnect_secs: u64,
    /// Default per-container health gate timeout for updates and deployments.
    pub default_health_timeout_secs: u64,
    /// Minutes east of UTC for wall-clock scheduled jobs.
    pub timezone_offset_minutes: i32,
    /// Days to keep resolved alerts before the purge job removes them.
    pub resolved_alert_retention_days: i64,
    /// Days to keep event-log rows before the purge job removes them.
    pub event_retention_days: i64,
    /// Release registry base URL for agent binaries and checksums.
    pub agent_release_base_url: String,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            api_port: 8001,
            data_dir: PathBuf::from("/app/data"),
            vault_key_hex: None,
            agent_heartbeat_secs: 30,
            agent_offline_grace_secs: 60,
            pending_command_max_age_secs: 600,
            self_update_reconnect_secs: 300,
            default_health_timeout_secs: 60,
            timezone_offset_minutes: 0,
            resolved_alert_retention_days: 30,
            event_retention_days: 30,
            agent_release_base_url: "https://github.com/darthnorse/dockmon/releases/download"
                .to_string(),
        }
    }
}

impl EnvConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("API_PORT") {
            if let Ok(port) = v.parse() {
                config.api_port = port;
            }
        }
        if let Ok(v) = std::env::var("DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("VAULT_KEY") {
            config.vault_key_hex = Some(v);
        }
        if let Ok(v) = std::env::var("AGENT_HEARTBEAT_SECS") {
            if let Ok(n) = v.parse() {
                config.agent_heartbeat_secs = n;
            }
        }
        if let Ok(v) = std::env::var("AGENT_OFFLINE_GRACE_SECS") {
            if let Ok(n) = v.parse() {
                config.agent_offline_grace_secs = n;
            }
        }
        if let Ok(v) = std::env::var("PENDING_COMMAND_MAX_AGE_SECS") {
            if let Ok(n) = v.parse() {
                config.pending_command_max_age_secs = n;
            }
        }
        if let Ok(v) = std::env::var("SELF_UPDATE_RECONNECT_SECS") {
            if let Ok(n) = v.parse() {
                config.self_update_reconnect_secs = n;
            }
        }
        if let Ok(v) = std::env::var("DEFAULT_HEALTH_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                config.default_health_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("TIMEZONE_OFFSET_MINUTES") {
            if let Ok(n) = v.parse() {
                config.timezone_offset_minutes = n;
            }
        }
        if let Ok(v) = std::env::var("AGENT_RELEASE_BASE_URL") {
            config.agent_release_base_url = v;
        }

        config
    }

    /// Load a .env file (if any) then the environment.
    pub fn load(env_file: Option<&Path>) -> Self {
        if let Some(path) = env_file {
            load_dotenv(path);
        } else {
            let candidates = [PathBuf::from("/app/.env"), PathBuf::from(".env")];
            for candidate in &candidates {
                if candidate.exists() {
                    load_dotenv(candidate);
                    break;
                }
            }
        }

        Self::from_env()
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("dockmon.db")
    }
}

/// Load a basic .env file (KEY=VALUE per line).
fn load_dotenv(path: &Path) {
    if let Ok(content) = std::fs::read_to_string(path) {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim().trim_matches('"').trim_matches('\'');
                if std::env::var(key).is_err() {
                    // SAFETY: called before spawning any threads (single-threaded init)
                    unsafe { std::env::set_var(key, value) };
                }
            }
        }
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How the control plane reaches a host's engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Local,
    Remote,
    Agent,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Agent => "agent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Self::Local),
            "remote" => Some(Self::Remote),
            "agent" => Some(Self::Agent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub name: String,
    pub url: String,
    pub connection_type: ConnectionType,
    pub engine_id: Option<String>,
    pub replaced_by_host_id: Option<String>,
    /// Encrypted TLS material blob, opaque to the core.
    pub tls_material: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Offline,
    Degraded,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Degraded => "degraded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            "degraded" => Some(Self::Degraded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub host_id: String,
    pub engine_id: String,
    pub version: String,
    pub proto_version: u32,
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub agent_os: Option<String>,
    pub agent_arch: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationToken {
    pub token: String,
    pub created_by_user: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    Host,
    Container,
    Group,
}

impl RuleScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Container => "container",
            Self::Group => "group",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "host" => Some(Self::Host),
            "container" => Some(Self::Container),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

/// Alert rule. Metric-driven iff `metric` is set; event-driven otherwise.
///
/// Cooldown precedence: `notification_cooldown_seconds` wins when set;
/// the legacy `cooldown_seconds` is read only when it is null.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub scope: RuleScope,
    pub kind: String,
    pub severity: String,
    pub enabled: bool,
    pub metric: Option<String>,
    pub operator: Option<String>,
    pub threshold: Option<f64>,
    pub clear_threshold: Option<f64>,
    pub duration_seconds: Option<i64>,
    pub clear_duration_seconds: Option<i64>,
    pub occurrences: Option<i64>,
    pub grace_seconds: Option<i64>,
    pub cooldown_seconds: Option<i64>,
    pub notification_cooldown_seconds: Option<i64>,
    pub host_selector: Option<Value>,
    pub container_selector: Option<Value>,
    pub labels: Option<Value>,
    pub notify_channels: Option<Vec<String>>,
    pub depends_on: Option<Vec<String>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

impl AlertRule {
    pub fn is_metric_driven(&self) -> bool {
        self.metric.is_some()
    }

    /// Effective notification cooldown (see field docs for precedence).
    pub fn effective_cooldown_seconds(&self) -> i64 {
        self.notification_cooldown_seconds
            .or(self.cooldown_seconds)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Open,
    Clearing,
    Resolved,
}

impl AlertState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Clearing => "clearing",
            Self::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "clearing" => Some(Self::Clearing),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub dedup_key: String,
    pub rule_id: String,
    pub rule_version: i64,
    pub scope_type: String,
    pub scope_id: String,
    pub host_id: Option<String>,
    pub kind: String,
    pub severity: String,
    pub state: AlertState,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrences: i64,
    pub current_value: Option<f64>,
    pub threshold: Option<f64>,
    pub last_notified_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_reason: Option<String>,
    pub rule_snapshot: Value,
}

/// Persisted per-(rule, scope) evaluation state. Kept only while relevant;
/// reloaded after a failed write so memory never drifts from storage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleRuntimeState {
    pub window_start: Option<DateTime<Utc>>,
    pub samples: Vec<(DateTime<Utc>, f64)>,
    pub breach_count: i64,
    pub breach_started_at: Option<DateTime<Utc>>,
    pub clear_started_at: Option<DateTime<Utc>>,
    pub last_eval_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FloatingTagMode {
    Exact,
    Minor,
    Major,
    Latest,
}

impl FloatingTagMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Minor => "minor",
            Self::Major => "major",
            Self::Latest => "latest",
        }
    }

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

/// One row per composite container id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerUpdate {
    pub container_id: String,
    pub host_id: String,
    pub current_image: String,
    pub current_digest: Option<String>,
    pub latest_image: Option<String>,
    pub latest_digest: Option<String>,
    pub update_available: bool,
    pub floating_tag_mode: FloatingTagMode,
    pub registry_url: Option<String>,
    pub platform: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Planning,
    Pending,
    PullingImage,
    Executing,
    WaitingForHealth,
    Completed,
    Failed,
    RolledBack,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Pending => "pending",
            Self::PullingImage => "pulling_image",
            Self::Executing => "executing",
            Self::WaitingForHealth => "waiting_for_health",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "planning" => Some(Self::Planning),
            "pending" => Some(Self::Pending),
            "pulling_image" => Some(Self::PullingImage),
            "executing" => Some(Self::Executing),
            "waiting_for_health" => Some(Self::WaitingForHealth),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "rolled_back" => Some(Self::RolledBack),
            _ => None,
        }
    }

    /// Deletion is allowed in terminal states plus planning (nothing executed).
    pub fn is_deletable(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::RolledBack | Self::Planning
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub host_id: String,
    pub deployment_type: String,
    pub name: String,
    pub status: DeploymentStatus,
    pub definition: Value,
    pub progress_percent: i64,
    pub current_stage: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub committed: bool,
    pub rollback_on_failure: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationChannelRow {
    pub id: i64,
    pub channel_type: String,
    pub name: String,
    pub config: Value,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub name: String,
    pub prefix: String,
    pub key_hash: String,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub role: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupPermission {
    pub group_id: i64,
    pub capability: String,
    pub allowed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: i64,
    pub who: String,
    pub when: DateTime<Utc>,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub details: Option<Value>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogRow {
    pub id: i64,
    pub event_type: String,
    pub category: String,
    pub severity: String,
    pub title: String,
    pub message: String,
    pub scope_type: String,
    pub scope_id: String,
    pub scope_name: String,
    pub host_id: Option<String>,
    pub host_name: Option<String>,
    pub old_state: Option<String>,
    pub new_state: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Singleton row (id = 1) carrying app-wide defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSettings {
    pub app_version: String,
    pub timezone_offset_minutes: i32,
    pub update_check_time: String,
    pub skip_compose_containers: bool,
    pub default_health_timeout_secs: i64,
    pub event_suppression_patterns: Vec<String>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            timezone_offset_minutes: 0,
            update_check_time: "04:00".to_string(),
            skip_compose_containers: true,
            default_health_timeout_secs: 60,
            event_suppression_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: String,
    pub user_id: Option<i64>,
    pub scope: String,
    pub action: String,
    pub params: Option<Value>,
    pub status: String,
    pub total_items: i64,
    pub completed_items: i64,
    pub success_items: i64,
    pub error_items: i64,
    pub skipped_items: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJobItem {
    pub id: i64,
    pub job_id: String,
    pub container_id: String,
    pub container_name: String,
    pub host_id: String,
    pub status: String,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryCredential {
    pub registry_url: String,
    pub username: String,
    pub password_encrypted: String,
}

/// Per-container desired state, keyed by composite id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSetting {
    pub container_id: String,
    pub host_id: String,
    pub auto_restart: bool,
    pub auto_update: bool,
    pub desired_state: Option<String>,
    pub tags: Vec<String>,
}

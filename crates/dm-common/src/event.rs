use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Stable event type identifiers carried through the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Container update events
    UpdateAvailable,
    UpdateStarted,
    UpdatePullCompleted,
    BackupCreated,
    UpdateCompleted,
    UpdateFailed,
    UpdateSkippedValidation,
    RollbackCompleted,

    // Container state events
    ContainerStarted,
    ContainerStopped,
    ContainerRestarted,
    ContainerDied,
    ContainerDeleted,
    ContainerHealthChanged,

    // Host events
    HostConnected,
    HostDisconnected,
    HostMigrated,

    // System events
    SystemStartup,
    SystemShutdown,

    // Batch job events
    BatchJobStarted,
    BatchJobCompleted,
    BatchJobFailed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpdateAvailable => "update_available",
            Self::UpdateStarted => "update_started",
            Self::UpdatePullCompleted => "update_pull_completed",
            Self::BackupCreated => "backup_created",
            Self::UpdateCompleted => "update_completed",
            Self::UpdateFailed => "update_failed",
            Self::UpdateSkippedValidation => "update_skipped_validation",
            Self::RollbackCompleted => "rollback_completed",
            Self::ContainerStarted => "container_started",
            Self::ContainerStopped => "container_stopped",
            Self::ContainerRestarted => "container_restarted",
            Self::ContainerDied => "container_died",
            Self::ContainerDeleted => "container_deleted",
            Self::ContainerHealthChanged => "container_health_changed",
            Self::HostConnected => "host_connected",
            Self::HostDisconnected => "host_disconnected",
            Self::HostMigrated => "host_migrated",
            Self::SystemStartup => "system_startup",
            Self::SystemShutdown => "system_shutdown",
            Self::BatchJobStarted => "batch_job_started",
            Self::BatchJobCompleted => "batch_job_completed",
            Self::BatchJobFailed => "batch_job_failed",
        }
    }

    /// Alert evaluation kind for this event, or None when the event does not
    /// participate in alert matching (system/batch events).
    pub fn alert_kind(&self) -> Option<&'static str> {
        match self {
            Self::UpdateAvailable => Some("info"),
            Self::UpdateStarted
            | Self::UpdatePullCompleted
            | Self::BackupCreated
            | Self::UpdateCompleted
            | Self::RollbackCompleted
            | Self::ContainerDeleted => Some("action_taken"),
            Self::UpdateFailed => Some("error"),
            Self::ContainerStarted
            | Self::ContainerRestarted
            | Self::ContainerStopped
            | Self::ContainerDied
            | Self::ContainerHealthChanged => Some("state_change"),
            Self::HostConnected => Some("connection"),
            Self::HostDisconnected => Some("disconnection"),
            _ => None,
        }
    }

    /// (category, severity) used for the event-log row.
    pub fn log_class(&self) -> (&'static str, &'static str) {
        match self {
            Self::ContainerStarted | Self::ContainerRestarted => ("container", "info"),
            Self::ContainerStopped | Self::ContainerDeleted => ("container", "warning"),
            Self::ContainerDied => ("container", "error"),
            Self::ContainerHealthChanged => ("health_check", "warning"),
            Self::UpdateFailed => ("container", "error"),
            Self::RollbackCompleted => ("container", "warning"),
            Self::UpdateAvailable
            | Self::UpdateStarted
            | Self::UpdatePullCompleted
            | Self::BackupCreated
            | Self::UpdateCompleted
            | Self::UpdateSkippedValidation => ("container", "info"),
            Self::HostConnected | Self::HostMigrated => ("host", "info"),
            Self::HostDisconnected => ("host", "error"),
            _ => ("system", "info"),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a domain event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventScope {
    Container,
    Host,
    System,
}

impl EventScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Host => "host",
            Self::System => "system",
        }
    }
}

/// Domain event flowing through the bus.
///
/// For container scope, `scope_id` is the composite `{host_id}:{short_id}` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub scope_type: EventScope,
    pub scope_id: String,
    pub scope_name: String,
    pub host_id: Option<String>,
    pub host_name: Option<String>,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        event_type: EventType,
        scope_type: EventScope,
        scope_id: impl Into<String>,
        scope_name: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            scope_type,
            scope_id: scope_id.into(),
            scope_name: scope_name.into(),
            host_id: None,
            host_name: None,
            data: Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_host(mut self, host_id: impl Into<String>, host_name: impl Into<String>) -> Self {
        self.host_id = Some(host_id.into());
        self.host_name = Some(host_name.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    fn data_str(&self, key: &str) -> &str {
        self.data.get(key).and_then(Value::as_str).unwrap_or("?")
    }

    /// Human-readable (title, message) pair for the event-log row and the
    /// `event_notification` WebSocket payload.
    pub fn render(&self) -> (String, String) {
        let name = &self.scope_name;
        match self.event_type {
            EventType::UpdateAvailable => (
                format!("Update Available: {name}"),
                format!(
                    "Update available: {} -> {}",
                    self.data_str("current_image"),
                    self.data_str("latest_image")
                ),
            ),
            EventType::UpdateStarted => (
                format!("Update Started: {name}"),
                format!(
                    "Starting container update to {}",
                    self.data_str("target_image")
                ),
            ),
            EventType::UpdatePullCompleted => (
                format!("Image Pull Completed: {name}"),
                format!("Successfully pulled {}", self.data_str("image")),
            ),
            EventType::BackupCreated => (
                format!("Backup Created: {name}"),
                format!(
                    "Created backup {} for rollback capability",
                    self.data_str("backup_name")
                ),
            ),
            EventType::UpdateCompleted => (
                format!("Container Update: {name}"),
                format!(
                    "Container successfully updated from {} to {}",
                    self.data_str("previous_image"),
                    self.data_str("new_image")
                ),
            ),
            EventType::UpdateFailed => (
                format!("Container Update Failed: {name}"),
                format!(
                    "Container update failed: {}",
                    self.data_str("error_message")
                ),
            ),
            EventType::UpdateSkippedValidation => (
                format!("Update Skipped: {name}"),
                format!("Auto-update skipped: {}", self.data_str("reason")),
            ),
            EventType::RollbackCompleted => (
                format!("Rollback Completed: {name}"),
                format!("Successfully rolled back {name} to previous version"),
            ),
            EventType::ContainerStarted => (
                format!("Container Started: {name}"),
                format!("Container {name} started"),
            ),
            EventType::ContainerRestarted => (
                format!("Container Restarted: {name}"),
                format!("Container {name} restarted"),
            ),
            EventType::ContainerStopped => (
                format!("Container Stopped: {name}"),
                format!(
                    "Container {name} changed state: {} -> {}",
                    self.data_str("old_state"),
                    self.data_str("new_state")
                ),
            ),
            EventType::ContainerDied => {
                let msg = match self.data.get("exit_code").and_then(Value::as_i64) {
                    Some(code) => format!("Container {name} died with exit code {code}"),
                    None => format!("Container {name} died"),
                };
                (format!("Container Died: {name}"), msg)
            }
            EventType::ContainerDeleted => (
                format!("Container Deleted: {name}"),
                format!("Container {name} deleted"),
            ),
            EventType::ContainerHealthChanged => (
                format!("Container Health Changed: {name}"),
                format!(
                    "Container {name} health status: {} -> {}",
                    self.data_str("old_state"),
                    self.data_str("new_state")
                ),
            ),
            EventType::HostConnected => {
                let display = self.host_name.as_deref().unwrap_or(name);
                (
                    format!("Host Connected: {display}"),
                    format!("Host {display} connected ({})", self.data_str("url")),
                )
            }
            EventType::HostDisconnected => {
                let display = self.host_name.as_deref().unwrap_or(name);
                (
                    format!("Host Disconnected: {display}"),
                    format!("Host disconnected: {}", self.data_str("error")),
                )
            }
            EventType::HostMigrated => {
                let old = self.data_str("old_host_name");
                let new = self.data_str("new_host_name");
                (
                    format!("Host Migrated: {old} -> {new}"),
                    format!(
                        "Host '{old}' has been migrated to agent-based connection as '{new}'. \
                         Container settings preserved."
                    ),
                )
            }
            EventType::SystemStartup => ("System Startup".to_string(), "DockMon started".to_string()),
            EventType::SystemShutdown => {
                ("System Shutdown".to_string(), "DockMon shutting down".to_string())
            }
            EventType::BatchJobStarted => (
                format!("Batch Job Started: {name}"),
                format!("Batch {} started", self.data_str("action")),
            ),
            EventType::BatchJobCompleted => (
                format!("Batch Job Completed: {name}"),
                format!("Batch {} completed", self.data_str("action")),
            ),
            EventType::BatchJobFailed => (
                format!("Batch Job Failed: {name}"),
                format!("Batch {} failed", self.data_str("action")),
            ),
        }
    }

    /// Alert evaluation payload: event data plus the matching flags the
    /// alert engine keys on.
    pub fn alert_payload(&self, alert_kind: &str) -> Value {
        let mut payload = json!({
            "timestamp": self.timestamp.to_rfc3339(),
            "event_type": alert_kind,
            "triggered_by": "event_bus",
        });
        if let (Some(obj), Some(data)) = (payload.as_object_mut(), self.data.as_object()) {
            for (k, v) in data {
                obj.insert(k.clone(), v.clone());
            }
            match self.event_type {
                EventType::UpdateAvailable => {
                    obj.insert("update_detected".into(), Value::Bool(true));
                }
                EventType::UpdateFailed => {
                    obj.insert("update_failure".into(), Value::Bool(true));
                }
                EventType::UpdateCompleted => {
                    obj.insert("update_completed".into(), Value::Bool(true));
                }
                _ => {}
            }
        }
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_serde() {
        let json = serde_json::to_string(&EventType::UpdateAvailable).unwrap();
        assert_eq!(json, "\"update_available\"");
        let parsed: EventType = serde_json::from_str("\"container_died\"").unwrap();
        assert_eq!(parsed, EventType::ContainerDied);
    }

    #[test]
    fn test_alert_kind_mapping() {
        assert_eq!(EventType::ContainerDied.alert_kind(), Some("state_change"));
        assert_eq!(EventType::HostDisconnected.alert_kind(), Some("disconnection"));
        assert_eq!(EventType::SystemStartup.alert_kind(), None);
    }

    #[test]
    fn test_render_update_available() {
        let event = Event::new(
            EventType::UpdateAvailable,
            EventScope::Container,
            "h1:abc",
            "nginx",
        )
        .with_data(json!({"current_image": "nginx:1.24", "latest_image": "nginx:1.25"}));
        let (title, message) = event.render();
        assert_eq!(title, "Update Available: nginx");
        assert!(message.contains("nginx:1.24 -> nginx:1.25"));
    }

    #[test]
    fn test_alert_payload_flags() {
        let event = Event::new(
            EventType::UpdateFailed,
            EventScope::Container,
            "h1:abc",
            "nginx",
        )
        .with_data(json!({"error_message": "pull failed"}));
        let payload = event.alert_payload("error");
        assert_eq!(payload["update_failure"], Value::Bool(true));
        assert_eq!(payload["error_message"], "pull failed");
    }
}

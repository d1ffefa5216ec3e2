//! Fleet watcher: polls directly-connected engines, diffs container state
//! against the previous pass, and emits the resulting domain events.
//! Health flips are debounced so one flapping probe never raises an alert.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dm_common::event::{Event, EventScope, EventType};
use dm_common::keys::make_composite_key;
use dm_engine::{ContainerInfo, DebouncedHealth, HealthStatus, Monitor};
use dm_events::EventBus;
use serde_json::json;
use tracing::info;

const POLL_INTERVAL: Duration = Duration::from_secs(10);
const HEALTH_FAILURE_THRESHOLD: u32 = 3;
const HEALTH_SUCCESS_THRESHOLD: u32 = 2;

struct TrackedContainer {
    name: String,
    state: String,
    health: DebouncedHealth,
}

pub struct FleetWatcher {
    monitor: Monitor,
    bus: Arc<EventBus>,
}

impl FleetWatcher {
    pub fn new(monitor: Monitor, bus: Arc<EventBus>) -> Self {
        Self { monitor, bus }
    }

    pub async fn run(self) {
        info!("Fleet watcher started");
        let mut tracked: HashMap<String, TrackedContainer> = HashMap::new();
        let mut primed = false;
        let mut interval = tokio::time::interval(POLL_INTERVAL);

        loop {
            interval.tick().await;
            let containers = self.monitor.get_containers().await;
            let mut seen: HashMap<String, &ContainerInfo> = HashMap::new();
            for container in &containers {
                seen.insert(container.composite_key(), container);
            }

            if primed {
                for (key, container) in &seen {
                    match tracked.get_mut(key) {
                        Some(previous) => {
                            if previous.state != container.state {
                                self.emit_state_change(container, &previous.state).await;
                            }
                            if let Some(probe) = health_probe(&container.status) {
                                let before = previous.health.current_status;
                                if let Some(after) = previous.health.record(probe) {
                                    self.emit_health_change(container, before, after).await;
                                }
                            }
                        }
                        None => {
                            if container.state == "running" {
                                self.emit(container, EventType::ContainerStarted, json!({}))
                                    .await;
                            }
                        }
                    }
                }

                // Containers gone since the last pass
                let gone: Vec<String> = tracked
                    .keys()
                    .filter(|key| !seen.contains_key(*key))
                    .cloned()
                    .collect();
                for key in gone {
                    if let Some(previous) = tracked.get(&key) {
                        if let Some((host_id, short_id)) = dm_common::keys::parse_composite_key(&key)
                        {
                            let host_name = self
                                .monitor
                                .host_name(host_id)
                                .await
                                .unwrap_or_else(|| host_id.to_string());
                            self.bus
                                .emit(
                                    Event::new(
                                        EventType::ContainerDeleted,
                                        EventScope::Container,
                                        make_composite_key(host_id, short_id),
                                        previous.name.clone(),
                                    )
                                    .with_host(host_id, host_name)
                                    .with_data(json!({})),
                                )
                                .await;
                        }
                    }
                }
            }

            tracked.retain(|key, _| seen.contains_key(key));
            for (key, container) in seen {
                tracked
                    .entry(key)
                    .and_modify(|t| {
                        t.state = container.state.clone();
                        t.name = container.name.clone();
                    })
                    .or_insert_with(|| TrackedContainer {
                        name: container.name.clone(),
                        state: container.state.clone(),
                        health: DebouncedHealth::new(
                            HEALTH_FAILURE_THRESHOLD,
                            HEALTH_SUCCESS_THRESHOLD,
                        ),
                    });
            }
            primed = true;
        }
    }

    async fn emit_state_change(&self, container: &ContainerInfo, old_state: &str) {
        let data = json!({
            "old_state": old_state,
            "new_state": container.state,
            "exit_code": exit_code(&container.status),
        });
        let event_type = match (old_state, container.state.as_str()) {
            (_, "running") => EventType::ContainerStarted,
            ("running", "exited") => {
                if exit_code(&container.status).map(|c| c != 0).unwrap_or(false) {
                    EventType::ContainerDied
                } else {
                    EventType::ContainerStopped
                }
            }
            _ => EventType::ContainerStopped,
        };
        self.emit(container, event_type, data).await;
    }

    async fn emit_health_change(
        &self,
        container: &ContainerInfo,
        before: HealthStatus,
        after: HealthStatus,
    ) {
        let data = json!({
            "old_state": format!("{before:?}").to_lowercase(),
            "new_state": format!("{after:?}").to_lowercase(),
        });
        self.emit(container, EventType::ContainerHealthChanged, data)
            .await;
    }

    async fn emit(&self, container: &ContainerInfo, event_type: EventType, data: serde_json::Value) {
        self.bus
            .emit(
                Event::new(
                    event_type,
                    EventScope::Container,
                    container.composite_key(),
                    container.name.clone(),
                )
                .with_host(container.host_id.clone(), container.host_name.clone())
                .with_data(data),
            )
            .await;
    }
}

/// Health probe from the engine's status line: "Up 2 hours (healthy)".
fn health_probe(status: &str) -> Option<bool> {
    if status.contains("(healthy)") {
        Some(true)
    } else if status.contains("(unhealthy)") {
        Some(false)
    } else {
        None
    }
}

/// Exit code from "Exited (137) 2 minutes ago".
fn exit_code(status: &str) -> Option<i64> {
    let start = status.find('(')? + 1;
    let end = status[start..].find(')')? + start;
    status[start..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_probe_parsing() {
        assert_eq!(health_probe("Up 2 hours (healthy)"), Some(true));
        assert_eq!(health_probe("Up 10 seconds (unhealthy)"), Some(false));
        assert_eq!(health_probe("Up 2 hours"), None);
    }

    #[test]
    fn test_exit_code_parsing() {
        assert_eq!(exit_code("Exited (137) 2 minutes ago"), Some(137));
        assert_eq!(exit_code("Exited (0) 1 hour ago"), Some(0));
        assert_eq!(exit_code("Up 2 hours"), None);
    }
}

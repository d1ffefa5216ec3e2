//! Agent coordinator: accepts registered agent sessions, tracks lifecycle
//! (`online -> degraded -> offline`), routes correlated commands, translates
//! agent events onto the bus, and supports the self-update reconnect wait.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dm_common::DmError;
use dm_common::event::{Event, EventScope, EventType};
use dm_common::keys::{make_composite_key, short_id};
use dm_engine::{ContainerInfo, Monitor};
use dm_events::EventBus;
use dm_store::Store;
use dm_store::models::{Agent, AgentStatus, ConnectionType, Host};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::pending::PendingCommands;
use crate::protocol::{AgentFrame, CommandResult, CommandStatus, PROTO_VERSION, ServerFrame};

/// Domain signals extracted from agent frames for the executors.
#[derive(Debug, Clone)]
pub enum AgentDomainEvent {
    UpdateComplete {
        host_id: String,
        container_id: String,
        success: bool,
        new_container_id: Option<String>,
        error: Option<String>,
    },
    Progress {
        host_id: String,
        deployment_id: Option<String>,
        update_id: Option<String>,
        progress: i64,
        stage: Option<String>,
        message: Option<String>,
        data: Option<Value>,
    },
}

#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub token: String,
    pub engine_id: String,
    pub version: String,
    pub proto_version: u32,
    pub capabilities: Vec<String>,
    pub os: Option<String>,
    pub arch: Option<String>,
    pub hostname: Option<String>,
}

struct AgentSession {
    tx: mpsc::Sender<ServerFrame>,
    connected_at: DateTime<Utc>,
    /// Distinguishes a reconnect from the session the grace task watched.
    epoch: u64,
}

pub struct AgentCoordinator {
    store: Store,
    bus: Arc<EventBus>,
    monitor: Monitor,
    sessions: tokio::sync::RwLock<HashMap<String, AgentSession>>,
    pending: PendingCommands,
    domain_tx: broadcast::Sender<AgentDomainEvent>,
    reconnect_waiters: Mutex<HashMap<String, Vec<oneshot::Sender<String>>>>,
    session_epoch: std::sync::atomic::AtomicU64,
    heartbeat_interval: Duration,
    offline_grace: Duration,
    pending_max_age: Duration,
}

impl AgentCoordinator {
    pub fn new(
        store: Store,
        bus: Arc<EventBus>,
        monitor: Monitor,
        heartbeat_interval: Duration,
        offline_grace: Duration,
        pending_max_age: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            monitor,
            sessions: tokio::sync::RwLock::new(HashMap::new()),
            pending: PendingCommands::new(),
            domain_tx: broadcast::channel(256).0,
            reconnect_waiters: Mutex::new(HashMap::new()),
            session_epoch: std::sync::atomic::AtomicU64::new(1),
            heartbeat_interval,
            offline_grace,
            pending_max_age,
        })
    }

    pub fn subscribe_domain_events(&self) -> broadcast::Receiver<AgentDomainEvent> {
        self.domain_tx.subscribe()
    }

    // ── Handshake ───────────────────────────────────────────────

    /// Consume the registration token, create or reuse the agent row, and
    /// migrate an existing `remote` host with the same engine id.
    pub async fn register(&self, req: RegisterRequest) -> Result<(Agent, Host), DmError> {
        self.store.consume_registration_token(&req.token)?;

        let existing_agent = self.store.get_agent_by_engine_id(&req.engine_id)?;
        let live_host = self.store.find_live_host_by_engine_id(&req.engine_id)?;

        let host = match live_host {
            Some(host) if host.connection_type == ConnectionType::Agent => host,
            Some(old_host) => {
                // A non-agent host owns this engine: migrate it.
                let new_host = Host {
                    id: uuid::Uuid::new_v4().to_string(),
                    name: old_host.name.clone(),
                    url: format!("agent://{}", req.engine_id),
                    connection_type: ConnectionType::Agent,
                    engine_id: None,
                    replaced_by_host_id: None,
                    tls_material: None,
                    created_by: old_host.created_by.clone(),
                    created_at: Utc::now(),
                };
                self.store.create_host(&new_host)?;
                self.store.migrate_host(&old_host.id, &new_host.id)?;
                // The engine id is free now that the old host is replaced
                self.store.set_host_engine_id(&new_host.id, &req.engine_id)?;
                self.monitor.remove_host(&old_host.id).await;

                info!(
                    old_host = old_host.id,
                    new_host = new_host.id,
                    engine_id = req.engine_id,
                    "Host migrated to agent connection"
                );
                self.bus
                    .emit(
                        Event::new(
                            EventType::HostMigrated,
                            EventScope::Host,
                            new_host.id.clone(),
                            new_host.name.clone(),
                        )
                        .with_host(new_host.id.clone(), new_host.name.clone())
                        .with_data(serde_json::json!({
                            "old_host_name": old_host.name,
                            "new_host_name": new_host.name,
                            "old_host_id": old_host.id,
                        })),
                    )
                    .await;
                let mut host = new_host;
                host.engine_id = Some(req.engine_id.clone());
                host
            }
            None => {
                let name = req
                    .hostname
                    .clone()
                    .unwrap_or_else(|| format!("agent-{}", short_id(&req.engine_id)));
                let host = Host {
                    id: uuid::Uuid::new_v4().to_string(),
                    name,
                    url: format!("agent://{}", req.engine_id),
                    connection_type: ConnectionType::Agent,
                    engine_id: Some(req.engine_id.clone()),
                    replaced_by_host_id: None,
                    tls_material: None,
                    created_by: None,
                    created_at: Utc::now(),
                };
                self.store.create_host(&host)?;
                host
            }
        };

        let agent = Agent {
            id: existing_agent
                .as_ref()
                .map(|a| a.id.clone())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            host_id: host.id.clone(),
            engine_id: req.engine_id.clone(),
            version: req.version.clone(),
            proto_version: req.proto_version.max(1),
            capabilities: req.capabilities.clone(),
            status: AgentStatus::Online,
            last_seen_at: Some(Utc::now()),
            agent_os: req.os.clone(),
            agent_arch: req.arch.clone(),
            created_at: existing_agent
                .map(|a| a.created_at)
                .unwrap_or_else(Utc::now),
        };
        self.store.upsert_agent(&agent)?;

        // Wake anyone waiting on a self-update reconnection
        let waiters = self
            .reconnect_waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&req.engine_id);
        if let Some(waiters) = waiters {
            for waiter in waiters {
                let _ = waiter.send(agent.version.clone());
            }
        }

        self.bus
            .emit(
                Event::new(
                    EventType::HostConnected,
                    EventScope::Host,
                    host.id.clone(),
                    host.name.clone(),
                )
                .with_host(host.id.clone(), host.name.clone())
                .with_data(serde_json::json!({"url": host.url, "agent_version": agent.version})),
            )
            .await;

        info!(agent_id = agent.id, engine_id = req.engine_id, "Agent registered");
        Ok((agent, host))
    }

    pub fn register_ack(&self, agent: &Agent) -> ServerFrame {
        ServerFrame::RegisterAck {
            agent_id: agent.id.clone(),
            host_id: agent.host_id.clone(),
            proto_version: PROTO_VERSION,
        }
    }

    // ── Session lifecycle ───────────────────────────────────────

    pub async fn attach_session(&self, agent_id: &str, tx: mpsc::Sender<ServerFrame>) {
        let epoch = self
            .session_epoch
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.sessions.write().await.insert(
            agent_id.to_string(),
            AgentSession {
                tx,
                connected_at: Utc::now(),
                epoch,
            },
        );
        if let Err(e) = self.store.set_agent_status(agent_id, AgentStatus::Online) {
            error!(agent_id, "Failed to mark agent online: {e}");
        }
    }

    /// Socket loss: fail in-flight commands now, mark offline after grace.
    pub async fn detach_session(self: &Arc<Self>, agent_id: &str) {
        let epoch = match self.sessions.write().await.remove(agent_id) {
            Some(session) => session.epoch,
            None => return,
        };
        self.pending.fail_all_for_agent(agent_id);

        let coordinator = Arc::clone(self);
        let agent_id = agent_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(coordinator.offline_grace).await;
            // A newer session with a higher epoch means the agent came back
            let reconnected = coordinator
                .sessions
                .read()
                .await
                .get(&agent_id)
                .map(|s| s.epoch > epoch)
                .unwrap_or(false);
            if reconnected {
                return;
            }
            if let Err(e) = coordinator.store.set_agent_status(&agent_id, AgentStatus::Offline) {
                error!(agent_id, "Failed to mark agent offline: {e}");
                return;
            }
            info!(agent_id, "Agent offline after grace window");
            if let Ok(Some(agent)) = coordinator.store.get_agent(&agent_id) {
                if let Ok(Some(host)) = coordinator.store.get_host(&agent.host_id) {
                    coordinator
                        .bus
                        .emit(
                            Event::new(
                                EventType::HostDisconnected,
                                EventScope::Host,
                                host.id.clone(),
                                host.name.clone(),
                            )
                            .with_host(host.id, host.name)
                            .with_data(serde_json::json!({"error": "Agent connection lost"})),
                        )
                        .await;
                }
            }
        });
    }

    pub async fn is_connected(&self, agent_id: &str) -> bool {
        self.sessions.read().await.contains_key(agent_id)
    }

    pub async fn connected_since(&self, agent_id: &str) -> Option<DateTime<Utc>> {
        self.sessions.read().await.get(agent_id).map(|s| s.connected_at)
    }

    // ── Command routing ─────────────────────────────────────────

    /// Send a command and wait for the correlated response. Errors only for
    /// agents that are not online; timeouts come back as results.
    pub async fn execute_command(
        &self,
        agent_id: &str,
        command: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<CommandResult, DmError> {
        let agent = self
            .store
            .get_agent(agent_id)?
            .ok_or_else(|| DmError::NotFound(format!("Agent {agent_id} not found")))?;
        if agent.status != AgentStatus::Online {
            return Err(DmError::AgentUnavailable(format!(
                "Agent {agent_id} is {}",
                agent.status.as_str()
            )));
        }
        let tx = {
            let sessions = self.sessions.read().await;
            sessions
                .get(agent_id)
                .map(|s| s.tx.clone())
                .ok_or_else(|| {
                    DmError::AgentUnavailable(format!("No live session for agent {agent_id}"))
                })?
        };

        let (correlation_id, rx) = self.pending.register(agent_id);
        let frame = ServerFrame::Command {
            command: command.to_string(),
            correlation_id: correlation_id.clone(),
            payload,
        };

        if tx.send(frame).await.is_err() {
            self.pending.remove(&correlation_id);
            return Err(DmError::AgentUnavailable(format!(
                "Send failed for agent {agent_id}"
            )));
        }
        debug!(agent_id, command, correlation_id, "Command dispatched");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Ok(CommandResult::failure(
                correlation_id,
                CommandStatus::Disconnected,
                "Pending entry dropped",
            )),
            Err(_) => {
                self.pending.remove(&correlation_id);
                Ok(CommandResult::failure(
                    correlation_id,
                    CommandStatus::Timeout,
                    format!("No response within {} s", timeout.as_secs()),
                ))
            }
        }
    }

    /// Wait for a fresh registration from the same engine id, as after a
    /// `self_update`. Resolves with the version the new register reported.
    pub async fn wait_for_reconnection(
        &self,
        engine_id: &str,
        timeout: Duration,
    ) -> Result<String, DmError> {
        let (tx, rx) = oneshot::channel();
        self.reconnect_waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(engine_id.to_string())
            .or_default()
            .push(tx);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(version)) => Ok(version),
            _ => Err(DmError::Timeout(format!(
                "Agent {engine_id} did not reconnect within {} s",
                timeout.as_secs()
            ))),
        }
    }

    // ── Inbound frames ──────────────────────────────────────────

    pub async fn handle_frame(
        &self,
        agent_id: &str,
        host_id: &str,
        host_name: &str,
        frame: AgentFrame,
    ) {
        match frame {
            AgentFrame::Register { .. } => {
                warn!(agent_id, "Duplicate register frame ignored");
            }
            AgentFrame::Ping => {
                if let Err(e) = self.store.touch_agent(agent_id) {
                    error!(agent_id, "Heartbeat persist failed: {e}");
                }
                let tx = self.sessions.read().await.get(agent_id).map(|s| s.tx.clone());
                if let Some(tx) = tx {
                    let _ = tx.send(ServerFrame::Pong).await;
                }
            }
            AgentFrame::CommandResponse {
                correlation_id,
                success,
                payload,
                error,
            } => {
                let result = if success {
                    CommandResult::success(correlation_id.clone(), payload)
                } else {
                    CommandResult::failure(
                        correlation_id.clone(),
                        CommandStatus::Error,
                        error.unwrap_or_else(|| "Agent reported failure".into()),
                    )
                };
                self.pending.resolve(&correlation_id, result);
            }
            AgentFrame::Event { event } => {
                self.translate_agent_event(host_id, host_name, event).await;
            }
            AgentFrame::Progress {
                deployment_id,
                update_id,
                progress,
                stage,
                message,
                data,
            } => {
                let ws_type = if deployment_id.is_some() {
                    "deployment_progress"
                } else {
                    "update_progress"
                };
                self.bus.broadcast(
                    ws_type,
                    serde_json::json!({
                        "host_id": host_id,
                        "deployment_id": deployment_id,
                        "update_id": update_id,
                        "progress": progress,
                        "stage": stage,
                        "message": message,
                        "data": data,
                    }),
                );
                let _ = self.domain_tx.send(AgentDomainEvent::Progress {
                    host_id: host_id.to_string(),
                    deployment_id,
                    update_id,
                    progress,
                    stage,
                    message,
                    data,
                });
            }
            AgentFrame::UpdateComplete {
                container_id,
                success,
                new_container_id,
                error,
            } => {
                let _ = self.domain_tx.send(AgentDomainEvent::UpdateComplete {
                    host_id: host_id.to_string(),
                    container_id,
                    success,
                    new_container_id,
                    error,
                });
            }
            AgentFrame::Containers { containers } => {
                let parsed: Vec<ContainerInfo> = containers
                    .into_iter()
                    .filter_map(|c| {
                        Some(ContainerInfo {
                            host_id: host_id.to_string(),
                            host_name: host_name.to_string(),
                            id: short_id(c.get("id")?.as_str()?).to_string(),
                            name: c.get("name")?.as_str()?.to_string(),
                            image: c
                                .get("image")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            state: c
                                .get("state")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            status: c
                                .get("status")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            labels: c
                                .get("labels")
                                .and_then(|l| serde_json::from_value(l.clone()).ok())
                                .unwrap_or_default(),
                        })
                    })
                    .collect();
                self.monitor.set_agent_containers(host_id, parsed).await;
                self.bus.broadcast("containers_update", serde_json::json!({"host_id": host_id}));
            }
        }
    }

    async fn translate_agent_event(&self, host_id: &str, host_name: &str, payload: Value) {
        let Some(event_type) = payload
            .get("event_type")
            .and_then(Value::as_str)
            .and_then(|s| serde_json::from_value::<EventType>(Value::String(s.to_string())).ok())
        else {
            warn!(host_id, "Agent event with unknown event_type dropped");
            return;
        };
        let container_id = payload
            .get("container_id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let container_name = payload
            .get("container_name")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let mut data = payload.clone();
        if let Some(obj) = data.as_object_mut() {
            obj.remove("event_type");
        }

        self.bus
            .emit(
                Event::new(
                    event_type,
                    EventScope::Container,
                    make_composite_key(host_id, short_id(container_id)),
                    container_name,
                )
                .with_host(host_id, host_name)
                .with_data(data),
            )
            .await;
    }

    // ── Background tasks ────────────────────────────────────────

    /// Degrade agents whose heartbeats go stale while the socket stays open.
    pub async fn run_heartbeat_monitor(self: Arc<Self>) {
        let stale_after = self.heartbeat_interval * 3;
        let mut interval = tokio::time::interval(self.heartbeat_interval);
        loop {
            interval.tick().await;
            let agents = match self.store.list_agents() {
                Ok(agents) => agents,
                Err(e) => {
                    error!("Heartbeat monitor: failed to list agents: {e}");
                    continue;
                }
            };
            let now = Utc::now();
            for agent in agents {
                if agent.status != AgentStatus::Online {
                    continue;
                }
                let stale = agent
                    .last_seen_at
                    .map(|seen| (now - seen).num_seconds() as u64 > stale_after.as_secs())
                    .unwrap_or(true);
                if stale && self.is_connected(&agent.id).await {
                    warn!(agent_id = agent.id, "Heartbeats stale, marking degraded");
                    let _ = self.store.set_agent_status(&agent.id, AgentStatus::Degraded);
                }
            }
        }
    }

    /// Expire pending commands past the hard maximum age.
    pub async fn run_pending_sweeper(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            let swept = self.pending.sweep(self.pending_max_age);
            if swept > 0 {
                warn!(swept, "Expired stale pending commands");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dm_alerts::AlertEngine;

    fn coordinator() -> Arc<AgentCoordinator> {
        let store = Store::open_in_memory().unwrap();
        let alerts = Arc::new(AlertEngine::new(store.clone(), None));
        let bus = Arc::new(EventBus::new(store.clone(), alerts));
        AgentCoordinator::new(
            store,
            bus,
            Monitor::new(),
            Duration::from_secs(30),
            Duration::from_millis(50),
            Duration::from_secs(600),
        )
    }

    fn register_request(store: &Store, engine_id: &str, version: &str) -> RegisterRequest {
        let token = store.create_registration_token(Some("admin")).unwrap();
        RegisterRequest {
            token: token.token,
            engine_id: engine_id.into(),
            version: version.into(),
            proto_version: 1,
            capabilities: vec!["deploy".into()],
            os: Some("linux".into()),
            arch: Some("amd64".into()),
            hostname: Some("edge-1".into()),
        }
    }

    #[tokio::test]
    async fn test_register_creates_agent_and_host() {
        let coordinator = coordinator();
        let req = register_request(&coordinator.store, "E1", "1.0.0");
        let (agent, host) = coordinator.register(req).await.unwrap();

        assert_eq!(agent.status, AgentStatus::Online);
        assert_eq!(host.connection_type, ConnectionType::Agent);
        assert_eq!(host.engine_id.as_deref(), Some("E1"));
        assert_eq!(host.name, "edge-1");
    }

    #[tokio::test]
    async fn test_register_with_used_token_fails() {
        let coordinator = coordinator();
        let req = register_request(&coordinator.store, "E1", "1.0.0");
        let replay = req.clone();
        coordinator.register(req).await.unwrap();
        let err = coordinator.register(replay).await.unwrap_err();
        assert!(matches!(err, DmError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_remote_host_migration() {
        let coordinator = coordinator();
        coordinator
            .store
            .create_host(&Host {
                id: "old-host".into(),
                name: "build-box".into(),
                url: "tcp://10.0.0.5:2376".into(),
                connection_type: ConnectionType::Remote,
                engine_id: Some("E1".into()),
                replaced_by_host_id: None,
                tls_material: None,
                created_by: Some("admin".into()),
                created_at: Utc::now(),
            })
            .unwrap();
        coordinator
            .store
            .upsert_container_setting(&dm_store::models::ContainerSetting {
                container_id: "old-host:abc123def456".into(),
                host_id: "old-host".into(),
                auto_restart: true,
                auto_update: false,
                desired_state: None,
                tags: vec![],
            })
            .unwrap();

        let req = register_request(&coordinator.store, "E1", "1.0.0");
        let (agent, new_host) = coordinator.register(req).await.unwrap();

        assert_ne!(new_host.id, "old-host");
        assert_eq!(new_host.name, "build-box");
        assert_eq!(agent.host_id, new_host.id);

        let old = coordinator.store.get_host("old-host").unwrap().unwrap();
        assert_eq!(old.replaced_by_host_id.as_deref(), Some(new_host.id.as_str()));

        // Container settings continue to resolve under the new host
        let setting = coordinator
            .store
            .get_container_setting(&format!("{}:abc123def456", new_host.id))
            .unwrap();
        assert!(setting.is_some());

        // One agent row, keyed by engine id
        assert_eq!(coordinator.store.list_agents().unwrap().len(), 1);

        // host_migrated landed in the event log
        let events = coordinator.store.list_recent_events(10).unwrap();
        assert!(events.iter().any(|e| e.event_type == "host_migrated"));
    }

    #[tokio::test]
    async fn test_execute_command_round_trip() {
        let coordinator = coordinator();
        let req = register_request(&coordinator.store, "E1", "1.0.0");
        let (agent, host) = coordinator.register(req).await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        coordinator.attach_session(&agent.id, tx).await;

        // Simulated agent: respond to the first command frame
        let responder = Arc::clone(&coordinator);
        let agent_id = agent.id.clone();
        let host_id = host.id.clone();
        tokio::spawn(async move {
            if let Some(ServerFrame::Command { correlation_id, .. }) = rx.recv().await {
                responder
                    .handle_frame(
                        &agent_id,
                        &host_id,
                        "edge-1",
                        AgentFrame::CommandResponse {
                            correlation_id,
                            success: true,
                            payload: Some(serde_json::json!({"ok": true})),
                            error: None,
                        },
                    )
                    .await;
            }
        });

        let result = coordinator
            .execute_command(
                &agent.id,
                "container_action",
                serde_json::json!({"action": "restart"}),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(result.ok());
        assert!(coordinator.pending.is_empty());
    }

    #[tokio::test]
    async fn test_execute_command_timeout() {
        let coordinator = coordinator();
        let req = register_request(&coordinator.store, "E1", "1.0.0");
        let (agent, _) = coordinator.register(req).await.unwrap();

        let (tx, _rx) = mpsc::channel(8);
        coordinator.attach_session(&agent.id, tx).await;

        let result = coordinator
            .execute_command(
                &agent.id,
                "container_action",
                serde_json::json!({}),
                Duration::from_millis(50),
            )
            .await
            .unwrap();
        assert_eq!(result.status, CommandStatus::Timeout);
        assert!(coordinator.pending.is_empty());
    }

    #[tokio::test]
    async fn test_offline_agent_rejected_immediately() {
        let coordinator = coordinator();
        let req = register_request(&coordinator.store, "E1", "1.0.0");
        let (agent, _) = coordinator.register(req).await.unwrap();
        coordinator
            .store
            .set_agent_status(&agent.id, AgentStatus::Offline)
            .unwrap();

        let err = coordinator
            .execute_command(&agent.id, "x", Value::Null, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DmError::AgentUnavailable(_)));
    }

    #[tokio::test]
    async fn test_detach_fails_pending_and_marks_offline() {
        let coordinator = coordinator();
        let req = register_request(&coordinator.store, "E1", "1.0.0");
        let (agent, _) = coordinator.register(req).await.unwrap();

        let (tx, _rx) = mpsc::channel(8);
        coordinator.attach_session(&agent.id, tx).await;
        let (_, pending_rx) = coordinator.pending.register(&agent.id);

        coordinator.detach_session(&agent.id).await;
        assert_eq!(pending_rx.await.unwrap().status, CommandStatus::Disconnected);

        // After the grace window the agent is offline
        tokio::time::sleep(Duration::from_millis(150)).await;
        let reloaded = coordinator.store.get_agent(&agent.id).unwrap().unwrap();
        assert_eq!(reloaded.status, AgentStatus::Offline);
    }

    #[tokio::test]
    async fn test_self_update_reconnection_wait() {
        let coordinator = coordinator();
        let req = register_request(&coordinator.store, "E1", "1.0.0");
        let (agent, _) = coordinator.register(req).await.unwrap();

        let waiter = Arc::clone(&coordinator);
        let wait = tokio::spawn(async move {
            waiter
                .wait_for_reconnection("E1", Duration::from_secs(5))
                .await
        });

        // Give the waiter time to park, then simulate the post-update register
        tokio::time::sleep(Duration::from_millis(20)).await;
        let req2 = register_request(&coordinator.store, "E1", "1.1.0");
        let (agent2, _) = coordinator.register(req2).await.unwrap();

        let version = wait.await.unwrap().unwrap();
        assert_eq!(version, "1.1.0");
        // Same agent identity across the update
        assert_eq!(agent.id, agent2.id);
    }
}

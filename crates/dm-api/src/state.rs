use std::sync::Arc;

use dm_agent::AgentCoordinator;
use dm_alerts::AlertEngine;
use dm_batch::BatchManager;
use dm_common::config::EnvConfig;
use dm_deploy::DeploymentExecutor;
use dm_engine::Monitor;
use dm_events::EventBus;
use dm_notify::{Dispatcher, HttpTransport};
use dm_store::{Store, Vault};
use dm_updates::{UpdateChecker, UpdateExecutor};

use crate::auth::SessionStore;

/// Shared application state for all API routes.
#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub monitor: Monitor,
    pub coordinator: Arc<AgentCoordinator>,
    pub bus: Arc<EventBus>,
    pub alerts: Arc<AlertEngine>,
    pub updates: Arc<UpdateExecutor>,
    pub checker: Arc<UpdateChecker>,
    pub deployments: Arc<DeploymentExecutor>,
    pub batch: Arc<BatchManager>,
    pub dispatcher: Arc<Dispatcher<HttpTransport>>,
    pub vault: Option<Arc<Vault>>,
    pub sessions: Arc<SessionStore>,
    pub env: Arc<EnvConfig>,
}

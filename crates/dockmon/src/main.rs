mod watcher;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use dm_agent::AgentCoordinator;
use dm_batch::BatchManager;
use dm_common::config::EnvConfig;
use dm_common::event::{Event, EventScope, EventType};
use dm_deploy::DeploymentExecutor;
use dm_engine::Monitor;
use dm_notify::{Dispatcher, HttpTransport};
use dm_scheduler::{Scheduler, SystemClock};
use dm_store::models::ConnectionType;
use dm_store::{Store, Vault};
use dm_updates::{UpdateChecker, UpdateExecutor};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use tokio_stream::StreamExt;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,dockmon=debug".parse().unwrap()),
        )
        .init();

    info!("DockMon starting...");

    let env = Arc::new(EnvConfig::load(None));
    let store = Store::open(&env.db_path())?;

    // Vault key: configured, persisted, or freshly generated
    let vault = match load_vault_key(&env) {
        Ok(key_hex) => Some(Arc::new(Vault::from_hex(&key_hex)?)),
        Err(e) => {
            warn!("Credential vault disabled: {e}");
            None
        }
    };

    // Monitor: one engine client per direct host
    let monitor = Monitor::new();
    for host in store.list_hosts()? {
        if host.replaced_by_host_id.is_some() || host.connection_type == ConnectionType::Agent {
            continue;
        }
        if let Err(e) = monitor.add_host(&host.id, &host.name, &host.url, false).await {
            warn!(host = host.name, "Failed to register host with monitor: {e}");
        }
    }

    // Notification dispatcher feeds from the alert engine's queue
    let (notify_tx, notify_rx) = Dispatcher::<HttpTransport>::channel();
    let dispatcher = Arc::new(Dispatcher::new(store.clone(), HttpTransport::default()));
    {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            dispatcher.run(notify_rx).await;
        });
    }

    // Alert engine + the process-wide event bus
    let alerts = Arc::new(dm_alerts::AlertEngine::new(store.clone(), Some(notify_tx)));
    let bus = dm_events::init(store.clone(), Arc::clone(&alerts));

    // Agent coordinator and its background tasks
    let coordinator = AgentCoordinator::new(
        store.clone(),
        Arc::clone(&bus),
        monitor.clone(),
        Duration::from_secs(env.agent_heartbeat_secs),
        Duration::from_secs(env.agent_offline_grace_secs),
        Duration::from_secs(env.pending_command_max_age_secs),
    );
    tokio::spawn(Arc::clone(&coordinator).run_heartbeat_monitor());
    tokio::spawn(Arc::clone(&coordinator).run_pending_sweeper());

    // Executors
    let updates = UpdateExecutor::new(
        store.clone(),
        monitor.clone(),
        Arc::clone(&coordinator),
        Arc::clone(&bus),
        vault.clone(),
        Duration::from_secs(env.default_health_timeout_secs),
        Duration::from_secs(env.self_update_reconnect_secs),
        env.agent_release_base_url.clone(),
    );
    updates.spawn_domain_event_listener();

    let checker = Arc::new(UpdateChecker::new(
        store.clone(),
        monitor.clone(),
        Arc::clone(&bus),
        vault.clone(),
    ));

    let deployments = DeploymentExecutor::new(
        store.clone(),
        monitor.clone(),
        Arc::clone(&coordinator),
        Arc::clone(&bus),
        Duration::from_secs(env.default_health_timeout_secs),
    );

    let batch = BatchManager::new(
        store.clone(),
        monitor.clone(),
        Arc::clone(&coordinator),
        Arc::clone(&bus),
        Arc::clone(&updates),
        Arc::clone(&checker),
    );

    // Scheduler: update sweep and retention purges
    let scheduler = Scheduler::new(
        store.clone(),
        Arc::clone(&checker),
        Arc::new(SystemClock),
        Duration::from_secs(60),
        env.resolved_alert_retention_days,
        env.event_retention_days,
    );
    tokio::spawn(scheduler.run());

    // Engine-side container events for directly-connected hosts
    tokio::spawn(watcher::FleetWatcher::new(monitor.clone(), Arc::clone(&bus)).run());

    ensure_admin_user(&store)?;

    bus.emit(Event::new(
        EventType::SystemStartup,
        EventScope::System,
        "system",
        "dockmon",
    ))
    .await;

    let api_state = dm_api::state::ApiState {
        store: store.clone(),
        monitor,
        coordinator,
        bus: Arc::clone(&bus),
        alerts,
        updates,
        checker,
        deployments,
        batch,
        dispatcher,
        vault,
        sessions: Arc::new(dm_api::auth::SessionStore::new()),
        env: Arc::clone(&env),
    };
    let router = dm_api::build_router(api_state);

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, env.api_port));
    info!("API listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let mut signals = Signals::new([SIGTERM, SIGINT])?;
    let shutdown = async move {
        signals.next().await;
        info!("Shutdown signal received");
    };

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    bus.emit(Event::new(
        EventType::SystemShutdown,
        EventScope::System,
        "system",
        "dockmon",
    ))
    .await;
    dm_events::shutdown();
    info!("DockMon stopped");
    Ok(())
}

/// Read the vault key from config, from disk, or generate and persist one.
fn load_vault_key(env: &EnvConfig) -> anyhow::Result<String> {
    if let Some(key) = &env.vault_key_hex {
        return Ok(key.clone());
    }
    let key_path = env.data_dir.join("vault.key");
    if key_path.exists() {
        return Ok(std::fs::read_to_string(&key_path)?.trim().to_string());
    }
    std::fs::create_dir_all(&env.data_dir)?;
    let key = Vault::generate_key_hex();
    std::fs::write(&key_path, &key)?;
    info!("Generated new vault key at {}", key_path.display());
    Ok(key)
}

/// First start: create an admin account with a generated password.
fn ensure_admin_user(store: &Store) -> anyhow::Result<()> {
    if store.count_users()? > 0 {
        return Ok(());
    }

    use argon2::password_hash::SaltString;
    use argon2::{Argon2, PasswordHasher};
    use rand::Rng;
    use rand_core::OsRng;

    let mut bytes = [0u8; 12];
    rand::rng().fill(&mut bytes);
    let password = hex::encode(bytes);

    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("hash failed: {e}"))?;
    store.create_user("admin", &hash.to_string(), "admin")?;

    info!("Created initial admin user; password: {password}");
    Ok(())
}

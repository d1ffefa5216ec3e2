//! Durable state for the control plane: one SQLite database holding hosts,
//! agents, rules, alerts, updates, deployments, auth entities and the
//! audit/event logs.

pub mod models;
pub mod vault;

mod alerts;
mod auth;
mod batch;
mod deployments;
mod events_log;
mod hosts;
mod updates;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use dm_common::DmError;
use rusqlite::Connection;
use tracing::info;

pub use vault::Vault;

/// Shared handle to the control-plane database.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database, enable WAL mode and create all tables.
    pub fn open(path: &Path) -> Result<Self, DmError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        Self::init(conn)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self, DmError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, DmError> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(db_err)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(db_err)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(db_err)?;

        conn.execute_batch(SCHEMA).map_err(db_err)?;
        info!("Store opened and schema ensured");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run a closure against the connection, mapping rusqlite errors once.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, DmError> {
        let conn = self.lock();
        f(&conn).map_err(db_err)
    }
}

pub(crate) fn db_err(e: rusqlite::Error) -> DmError {
    DmError::Database(e.to_string())
}

/// RFC 3339 text used for all timestamp columns.
pub(crate) fn ts_to_sql(t: DateTime<Utc>) -> String {
    t.to_rfc3339()
}

pub(crate) fn ts_from_sql(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn opt_ts_from_sql(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(ts_from_sql)
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS docker_hosts (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    url TEXT NOT NULL,
    connection_type TEXT NOT NULL,
    engine_id TEXT,
    replaced_by_host_id TEXT,
    tls_material TEXT,
    created_by TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_hosts_engine_id ON docker_hosts(engine_id);

CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    host_id TEXT NOT NULL UNIQUE REFERENCES docker_hosts(id),
    engine_id TEXT NOT NULL UNIQUE,
    version TEXT NOT NULL,
    proto_version INTEGER NOT NULL DEFAULT 1,
    capabilities TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'offline',
    last_seen_at TEXT,
    agent_os TEXT,
    agent_arch TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS registration_tokens (
    token TEXT PRIMARY KEY,
    created_by_user TEXT,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    used INTEGER NOT NULL DEFAULT 0,
    used_at TEXT
);

CREATE TABLE IF NOT EXISTS container_settings (
    container_id TEXT PRIMARY KEY,
    host_id TEXT NOT NULL,
    auto_restart INTEGER NOT NULL DEFAULT 0,
    auto_update INTEGER NOT NULL DEFAULT 0,
    desired_state TEXT,
    tags TEXT NOT NULL DEFAULT '[]'
);
CREATE INDEX IF NOT EXISTS idx_container_settings_host ON container_settings(host_id);

CREATE TABLE IF NOT EXISTS alert_rules (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    scope TEXT NOT NULL,
    kind TEXT NOT NULL,
    severity TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    metric TEXT,
    operator TEXT,
    threshold REAL,
    clear_threshold REAL,
    duration_seconds INTEGER,
    clear_duration_seconds INTEGER,
    occurrences INTEGER,
    grace_seconds INTEGER,
    cooldown_seconds INTEGER,
    notification_cooldown_seconds INTEGER,
    host_selector TEXT,
    container_selector TEXT,
    labels TEXT,
    notify_channels TEXT,
    depends_on TEXT,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS alerts (
    id TEXT PRIMARY KEY,
    dedup_key TEXT NOT NULL,
    rule_id TEXT NOT NULL,
    rule_version INTEGER NOT NULL,
    scope_type TEXT NOT NULL,
    scope_id TEXT NOT NULL,
    host_id TEXT,
    kind TEXT NOT NULL,
    severity TEXT NOT NULL,
    state TEXT NOT NULL,
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    occurrences INTEGER NOT NULL DEFAULT 1,
    current_value REAL,
    threshold REAL,
    last_notified_at TEXT,
    resolved_at TEXT,
    resolved_reason TEXT,
    rule_snapshot TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_alerts_dedup ON alerts(dedup_key, state);

CREATE TABLE IF NOT EXISTS rule_runtime (
    runtime_key TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rule_evaluations (
    id INTEGER PRIMARY KEY,
    rule_id TEXT NOT NULL,
    scope_id TEXT NOT NULL,
    value REAL NOT NULL,
    breached INTEGER NOT NULL,
    at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rule_evaluations_rule ON rule_evaluations(rule_id, at);

CREATE TABLE IF NOT EXISTS container_updates (
    container_id TEXT PRIMARY KEY,
    host_id TEXT NOT NULL,
    current_image TEXT NOT NULL,
    current_digest TEXT,
    latest_image TEXT,
    latest_digest TEXT,
    update_available INTEGER NOT NULL DEFAULT 0,
    floating_tag_mode TEXT NOT NULL DEFAULT 'exact',
    registry_url TEXT,
    platform TEXT,
    last_checked_at TEXT,
    last_updated_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_container_updates_host ON container_updates(host_id);

CREATE TABLE IF NOT EXISTS deployments (
    id TEXT PRIMARY KEY,
    host_id TEXT NOT NULL,
    deployment_type TEXT NOT NULL,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    definition TEXT NOT NULL,
    progress_percent INTEGER NOT NULL DEFAULT 0,
    current_stage TEXT,
    error_message TEXT,
    started_at TEXT,
    completed_at TEXT,
    committed INTEGER NOT NULL DEFAULT 0,
    rollback_on_failure INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_deployments_host ON deployments(host_id);

CREATE TABLE IF NOT EXISTS notification_channels (
    id INTEGER PRIMARY KEY,
    channel_type TEXT NOT NULL,
    name TEXT NOT NULL UNIQUE,
    config TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS api_keys (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    prefix TEXT NOT NULL,
    key_hash TEXT NOT NULL UNIQUE,
    user_id INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    last_used_at TEXT,
    revoked INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_api_keys_prefix ON api_keys(prefix);

CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'user',
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS custom_groups (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT
);

CREATE TABLE IF NOT EXISTS group_permissions (
    group_id INTEGER NOT NULL REFERENCES custom_groups(id),
    capability TEXT NOT NULL,
    allowed INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (group_id, capability)
);

CREATE TABLE IF NOT EXISTS user_groups (
    user_id INTEGER NOT NULL REFERENCES users(id),
    group_id INTEGER NOT NULL REFERENCES custom_groups(id),
    PRIMARY KEY (user_id, group_id)
);

CREATE TABLE IF NOT EXISTS api_key_groups (
    api_key_id TEXT NOT NULL REFERENCES api_keys(id),
    group_id INTEGER NOT NULL REFERENCES custom_groups(id),
    PRIMARY KEY (api_key_id, group_id)
);

CREATE TABLE IF NOT EXISTS oidc_group_mappings (
    id INTEGER PRIMARY KEY,
    claim_value TEXT NOT NULL,
    group_id INTEGER NOT NULL REFERENCES custom_groups(id)
);

CREATE TABLE IF NOT EXISTS oidc_config (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    issuer TEXT,
    client_id TEXT,
    client_secret_encrypted TEXT,
    enabled INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS registry_credentials (
    registry_url TEXT PRIMARY KEY,
    username TEXT NOT NULL,
    password_encrypted TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY,
    who TEXT NOT NULL,
    at TEXT NOT NULL,
    action TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT,
    details TEXT,
    ip TEXT,
    user_agent TEXT
);
CREATE INDEX IF NOT EXISTS idx_audit_log_at ON audit_log(at);

CREATE TABLE IF NOT EXISTS event_log (
    id INTEGER PRIMARY KEY,
    event_type TEXT NOT NULL,
    category TEXT NOT NULL,
    severity TEXT NOT NULL,
    title TEXT NOT NULL,
    message TEXT NOT NULL,
    scope_type TEXT NOT NULL,
    scope_id TEXT NOT NULL,
    scope_name TEXT NOT NULL,
    host_id TEXT,
    host_name TEXT,
    old_state TEXT,
    new_state TEXT,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_event_log_ts ON event_log(timestamp);

CREATE TABLE IF NOT EXISTS global_settings (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    settings TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS batch_jobs (
    id TEXT PRIMARY KEY,
    user_id INTEGER,
    scope TEXT NOT NULL,
    action TEXT NOT NULL,
    params TEXT,
    status TEXT NOT NULL,
    total_items INTEGER NOT NULL DEFAULT 0,
    completed_items INTEGER NOT NULL DEFAULT 0,
    success_items INTEGER NOT NULL DEFAULT 0,
    error_items INTEGER NOT NULL DEFAULT 0,
    skipped_items INTEGER NOT NULL DEFAULT 0,
    started_at TEXT,
    completed_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS batch_job_items (
    id INTEGER PRIMARY KEY,
    job_id TEXT NOT NULL REFERENCES batch_jobs(id),
    container_id TEXT NOT NULL,
    container_name TEXT NOT NULL,
    host_id TEXT NOT NULL,
    status TEXT NOT NULL,
    error TEXT,
    started_at TEXT,
    completed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_batch_job_items_job ON batch_job_items(job_id);
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_creates_schema() {
        let store = Store::open_in_memory().unwrap();
        // A second schema pass must be a no-op.
        store
            .with_conn(|conn| conn.execute_batch(SCHEMA))
            .unwrap();
    }

    #[test]
    fn test_on_disk_store_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dockmon.db");
        {
            let store = Store::open(&path).unwrap();
            store
                .append_audit("admin", "host.create", "host", Some("h1"), None, None, None)
                .unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.list_audit_entries(10).unwrap().len(), 1);
    }
}

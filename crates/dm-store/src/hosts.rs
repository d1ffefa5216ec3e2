//! Hosts, agents, registration tokens and per-container settings.

use chrono::{Duration, Utc};
use dm_common::DmError;
use rusqlite::{OptionalExtension, Row, params};

use crate::models::{Agent, AgentStatus, ConnectionType, ContainerSetting, Host, RegistrationToken};
use crate::{Store, opt_ts_from_sql, ts_from_sql, ts_to_sql};

/// Registration tokens are single-use and expire 15 minutes after creation.
const TOKEN_TTL_MINUTES: i64 = 15;

fn host_from_row(row: &Row<'_>) -> rusqlite::Result<Host> {
    Ok(Host {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        connection_type: ConnectionType::parse(&row.get::<_, String>(3)?)
            .unwrap_or(ConnectionType::Remote),
        engine_id: row.get(4)?,
        replaced_by_host_id: row.get(5)?,
        tls_material: row.get(6)?,
        created_by: row.get(7)?,
        created_at: ts_from_sql(&row.get::<_, String>(8)?),
    })
}

const HOST_COLS: &str =
    "id, name, url, connection_type, engine_id, replaced_by_host_id, tls_material, created_by, created_at";

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<Agent> {
    let caps: String = row.get(5)?;
    Ok(Agent {
        id: row.get(0)?,
        host_id: row.get(1)?,
        engine_id: row.get(2)?,
        version: row.get(3)?,
        proto_version: row.get(4)?,
        capabilities: serde_json::from_str(&caps).unwrap_or_default(),
        status: AgentStatus::parse(&row.get::<_, String>(6)?).unwrap_or(AgentStatus::Offline),
        last_seen_at: opt_ts_from_sql(row.get(7)?),
        agent_os: row.get(8)?,
        agent_arch: row.get(9)?,
        created_at: ts_from_sql(&row.get::<_, String>(10)?),
    })
}

const AGENT_COLS: &str = "id, host_id, engine_id, version, proto_version, capabilities, status, \
                          last_seen_at, agent_os, agent_arch, created_at";

impl Store {
    // ── Hosts ───────────────────────────────────────────────────

    pub fn create_host(&self, host: &Host) -> Result<(), DmError> {
        // engine_id must be unique among live (non-replaced) hosts
        if let Some(engine_id) = &host.engine_id {
            if self.find_live_host_by_engine_id(engine_id)?.is_some() {
                return Err(DmError::Conflict(format!(
                    "A host with engine id {engine_id} already exists"
                )));
            }
        }
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO docker_hosts (id, name, url, connection_type, engine_id, \
                 replaced_by_host_id, tls_material, created_by, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    host.id,
                    host.name,
                    host.url,
                    host.connection_type.as_str(),
                    host.engine_id,
                    host.replaced_by_host_id,
                    host.tls_material,
                    host.created_by,
                    ts_to_sql(host.created_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_host(&self, id: &str) -> Result<Option<Host>, DmError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {HOST_COLS} FROM docker_hosts WHERE id = ?1"),
                params![id],
                host_from_row,
            )
            .optional()
        })
    }

    pub fn list_hosts(&self) -> Result<Vec<Host>, DmError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {HOST_COLS} FROM docker_hosts ORDER BY name"))?;
            let rows = stmt.query_map([], host_from_row)?;
            rows.collect()
        })
    }

    /// A live host is one not superseded by a migration.
    pub fn find_live_host_by_engine_id(&self, engine_id: &str) -> Result<Option<Host>, DmError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {HOST_COLS} FROM docker_hosts \
                     WHERE engine_id = ?1 AND replaced_by_host_id IS NULL"
                ),
                params![engine_id],
                host_from_row,
            )
            .optional()
        })
    }

    /// Claim an engine id for a host after a migration freed it.
    pub fn set_host_engine_id(&self, id: &str, engine_id: &str) -> Result<(), DmError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE docker_hosts SET engine_id = ?1 WHERE id = ?2",
                params![engine_id, id],
            )?;
            Ok(())
        })
    }

    pub fn delete_host(&self, id: &str) -> Result<bool, DmError> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM docker_hosts WHERE id = ?1", params![id])?;
            Ok(n > 0)
        })
    }

    /// Migrate `old_host_id` to `new_host_id`: mark the old row replaced and
    /// re-key everything that referenced it. Runs in one transaction.
    pub fn migrate_host(&self, old_host_id: &str, new_host_id: &str) -> Result<(), DmError> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction().map_err(crate::db_err)?;
        let result: rusqlite::Result<()> = (|| {
            tx.execute(
                "UPDATE docker_hosts SET replaced_by_host_id = ?1 WHERE id = ?2",
                params![new_host_id, old_host_id],
            )?;
            // Composite keys embed the host id: rewrite the prefix.
            for table in ["container_settings", "container_updates"] {
                tx.execute(
                    &format!(
                        "UPDATE {table} SET host_id = ?1, \
                         container_id = ?1 || substr(container_id, length(?2) + 1) \
                         WHERE host_id = ?2"
                    ),
                    params![new_host_id, old_host_id],
                )?;
            }
            Ok(())
        })();
        result.map_err(crate::db_err)?;
        tx.commit().map_err(crate::db_err)
    }

    // ── Agents ──────────────────────────────────────────────────

    pub fn upsert_agent(&self, agent: &Agent) -> Result<(), DmError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO agents (id, host_id, engine_id, version, proto_version, capabilities, \
                 status, last_seen_at, agent_os, agent_arch, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                 ON CONFLICT(engine_id) DO UPDATE SET \
                 host_id = excluded.host_id, version = excluded.version, \
                 proto_version = excluded.proto_version, capabilities = excluded.capabilities, \
                 status = excluded.status, last_seen_at = excluded.last_seen_at, \
                 agent_os = excluded.agent_os, agent_arch = excluded.agent_arch",
                params![
                    agent.id,
                    agent.host_id,
                    agent.engine_id,
                    agent.version,
                    agent.proto_version,
                    serde_json::to_string(&agent.capabilities).unwrap_or_else(|_| "[]".into()),
                    agent.status.as_str(),
                    agent.last_seen_at.map(ts_to_sql),
                    agent.agent_os,
                    agent.agent_arch,
                    ts_to_sql(agent.created_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_agent(&self, id: &str) -> Result<Option<Agent>, DmError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {AGENT_COLS} FROM agents WHERE id = ?1"),
                params![id],
                agent_from_row,
            )
            .optional()
        })
    }

    pub fn get_agent_by_engine_id(&self, engine_id: &str) -> Result<Option<Agent>, DmError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {AGENT_COLS} FROM agents WHERE engine_id = ?1"),
                params![engine_id],
                agent_from_row,
            )
            .optional()
        })
    }

    pub fn get_agent_for_host(&self, host_id: &str) -> Result<Option<Agent>, DmError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {AGENT_COLS} FROM agents WHERE host_id = ?1"),
                params![host_id],
                agent_from_row,
            )
            .optional()
        })
    }

    pub fn list_agents(&self) -> Result<Vec<Agent>, DmError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {AGENT_COLS} FROM agents"))?;
            let rows = stmt.query_map([], agent_from_row)?;
            rows.collect()
        })
    }

    pub fn set_agent_status(&self, id: &str, status: AgentStatus) -> Result<(), DmError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE agents SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )?;
            Ok(())
        })
    }

    /// Refresh `last_seen_at` (and mark online) on heartbeat.
    pub fn touch_agent(&self, id: &str) -> Result<(), DmError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE agents SET last_seen_at = ?1, status = 'online' WHERE id = ?2",
                params![ts_to_sql(Utc::now()), id],
            )?;
            Ok(())
        })
    }

    // ── Registration tokens ─────────────────────────────────────

    pub fn create_registration_token(
        &self,
        created_by_user: Option<&str>,
    ) -> Result<RegistrationToken, DmError> {
        let token = generate_token();
        let now = Utc::now();
        let record = RegistrationToken {
            token,
            created_by_user: created_by_user.map(String::from),
            created_at: now,
            expires_at: now + Duration::minutes(TOKEN_TTL_MINUTES),
            used: false,
            used_at: None,
        };
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO registration_tokens (token, created_by_user, created_at, expires_at, used) \
                 VALUES (?1, ?2, ?3, ?4, 0)",
                params![
                    record.token,
                    record.created_by_user,
                    ts_to_sql(record.created_at),
                    ts_to_sql(record.expires_at),
                ],
            )?;
            Ok(())
        })?;
        Ok(record)
    }

    /// Atomically consume a single-use token. Fails with Conflict when the
    /// token was already used and Auth when it is unknown or expired.
    pub fn consume_registration_token(&self, token: &str) -> Result<(), DmError> {
        let conn = self.lock();
        let row: Option<(bool, String)> = conn
            .query_row(
                "SELECT used, expires_at FROM registration_tokens WHERE token = ?1",
                params![token],
                |row| Ok((row.get::<_, i64>(0)? != 0, row.get(1)?)),
            )
            .optional()
            .map_err(crate::db_err)?;

        let (used, expires_at) = match row {
            Some(r) => r,
            None => return Err(DmError::Auth("Unknown registration token".into())),
        };
        if used {
            return Err(DmError::Conflict("Registration token already used".into()));
        }
        if ts_from_sql(&expires_at) < Utc::now() {
            return Err(DmError::Auth("Registration token expired".into()));
        }

        conn.execute(
            "UPDATE registration_tokens SET used = 1, used_at = ?1 WHERE token = ?2 AND used = 0",
            params![ts_to_sql(Utc::now()), token],
        )
        .map_err(crate::db_err)?;
        Ok(())
    }

    pub fn purge_expired_tokens(&self) -> Result<usize, DmError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM registration_tokens WHERE expires_at < ?1",
                params![ts_to_sql(Utc::now())],
            )
        })
    }

    // ── Container settings ──────────────────────────────────────

    pub fn get_container_setting(
        &self,
        container_id: &str,
    ) -> Result<Option<ContainerSetting>, DmError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT container_id, host_id, auto_restart, auto_update, desired_state, tags \
                 FROM container_settings WHERE container_id = ?1",
                params![container_id],
                |row| {
                    let tags: String = row.get(5)?;
                    Ok(ContainerSetting {
                        container_id: row.get(0)?,
                        host_id: row.get(1)?,
                        auto_restart: row.get::<_, i64>(2)? != 0,
                        auto_update: row.get::<_, i64>(3)? != 0,
                        desired_state: row.get(4)?,
                        tags: serde_json::from_str(&tags).unwrap_or_default(),
                    })
                },
            )
            .optional()
        })
    }

    pub fn upsert_container_setting(&self, setting: &ContainerSetting) -> Result<(), DmError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO container_settings \
                 (container_id, host_id, auto_restart, auto_update, desired_state, tags) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(container_id) DO UPDATE SET \
                 auto_restart = excluded.auto_restart, auto_update = excluded.auto_update, \
                 desired_state = excluded.desired_state, tags = excluded.tags",
                params![
                    setting.container_id,
                    setting.host_id,
                    setting.auto_restart as i64,
                    setting.auto_update as i64,
                    setting.desired_state,
                    serde_json::to_string(&setting.tags).unwrap_or_else(|_| "[]".into()),
                ],
            )?;
            Ok(())
        })
    }
}

fn generate_token() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(id: &str, engine_id: Option<&str>, connection_type: ConnectionType) -> Host {
        Host {
            id: id.into(),
            name: format!("host-{id}"),
            url: "tcp://10.0.0.2:2376".into(),
            connection_type,
            engine_id: engine_id.map(String::from),
            replaced_by_host_id: None,
            tls_material: None,
            created_by: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_engine_id_unique_among_live_hosts() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_host(&host("h1", Some("E1"), ConnectionType::Remote))
            .unwrap();
        let err = store
            .create_host(&host("h2", Some("E1"), ConnectionType::Remote))
            .unwrap_err();
        assert!(matches!(err, DmError::Conflict(_)));
    }

    #[test]
    fn test_migrate_host_rekeys_settings() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_host(&host("old", Some("E1"), ConnectionType::Remote))
            .unwrap();
        store
            .upsert_container_setting(&ContainerSetting {
                container_id: "old:abc123def456".into(),
                host_id: "old".into(),
                auto_restart: true,
                auto_update: false,
                desired_state: Some("running".into()),
                tags: vec!["prod".into()],
            })
            .unwrap();

        store.create_host(&host("new", None, ConnectionType::Agent)).unwrap();
        store.migrate_host("old", "new").unwrap();

        let migrated = store.get_host("old").unwrap().unwrap();
        assert_eq!(migrated.replaced_by_host_id.as_deref(), Some("new"));

        // Old engine id is free again for the new host
        assert!(store.find_live_host_by_engine_id("E1").unwrap().is_none());

        let setting = store
            .get_container_setting("new:abc123def456")
            .unwrap()
            .expect("setting re-keyed to new host");
        assert!(setting.auto_restart);
        assert_eq!(setting.host_id, "new");
    }

    #[test]
    fn test_registration_token_single_use() {
        let store = Store::open_in_memory().unwrap();
        let token = store.create_registration_token(Some("admin")).unwrap();

        store.consume_registration_token(&token.token).unwrap();
        let err = store.consume_registration_token(&token.token).unwrap_err();
        assert!(matches!(err, DmError::Conflict(_)));

        let err = store.consume_registration_token("nope").unwrap_err();
        assert!(matches!(err, DmError::Auth(_)));
    }

    #[test]
    fn test_touch_agent_marks_online() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_host(&host("h1", Some("E1"), ConnectionType::Agent))
            .unwrap();
        store
            .upsert_agent(&Agent {
                id: "a1".into(),
                host_id: "h1".into(),
                engine_id: "E1".into(),
                version: "1.0.0".into(),
                proto_version: 1,
                capabilities: vec!["deploy".into()],
                status: AgentStatus::Offline,
                last_seen_at: None,
                agent_os: Some("linux".into()),
                agent_arch: Some("amd64".into()),
                created_at: Utc::now(),
            })
            .unwrap();

        store.touch_agent("a1").unwrap();
        let agent = store.get_agent("a1").unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Online);
        assert!(agent.last_seen_at.is_some());
    }
}

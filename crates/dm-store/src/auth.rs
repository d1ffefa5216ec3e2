//! Users, groups, capabilities, API keys and notification channels.

use chrono::Utc;
use dm_common::DmError;
use rusqlite::{OptionalExtension, Row, params};
use serde_json::Value;

use crate::models::{ApiKey, Group, GroupPermission, NotificationChannelRow, User};
use crate::{Store, opt_ts_from_sql, ts_from_sql, ts_to_sql};

fn api_key_from_row(row: &Row<'_>) -> rusqlite::Result<ApiKey> {
    Ok(ApiKey {
        id: row.get(0)?,
        name: row.get(1)?,
        prefix: row.get(2)?,
        key_hash: row.get(3)?,
        user_id: row.get(4)?,
        created_at: ts_from_sql(&row.get::<_, String>(5)?),
        last_used_at: opt_ts_from_sql(row.get(6)?),
        revoked: row.get::<_, i64>(7)? != 0,
    })
}

const API_KEY_COLS: &str = "id, name, prefix, key_hash, user_id, created_at, last_used_at, revoked";

impl Store {
    // ── Users ───────────────────────────────────────────────────

    pub fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        role: &str,
    ) -> Result<i64, DmError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (username, password_hash, role, enabled, created_at) \
                 VALUES (?1, ?2, ?3, 1, ?4)",
                params![username, password_hash, role, ts_to_sql(Utc::now())],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<User>, DmError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, username, password_hash, role, enabled, created_at \
                 FROM users WHERE username = ?1",
                params![username],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        password_hash: row.get(2)?,
                        role: row.get(3)?,
                        enabled: row.get::<_, i64>(4)? != 0,
                        created_at: ts_from_sql(&row.get::<_, String>(5)?),
                    })
                },
            )
            .optional()
        })
    }

    pub fn count_users(&self) -> Result<i64, DmError> {
        self.with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0)))
    }

    // ── Groups & capabilities ───────────────────────────────────

    pub fn create_group(&self, name: &str, description: Option<&str>) -> Result<i64, DmError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO custom_groups (name, description) VALUES (?1, ?2)",
                params![name, description],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn list_groups(&self) -> Result<Vec<Group>, DmError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, name, description FROM custom_groups ORDER BY name")?;
            let rows = stmt.query_map([], |row| {
                Ok(Group {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                })
            })?;
            rows.collect()
        })
    }

    pub fn set_group_permission(
        &self,
        group_id: i64,
        capability: &str,
        allowed: bool,
    ) -> Result<(), DmError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO group_permissions (group_id, capability, allowed) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT(group_id, capability) DO UPDATE SET allowed = excluded.allowed",
                params![group_id, capability, allowed as i64],
            )?;
            Ok(())
        })
    }

    pub fn list_group_permissions(&self, group_id: i64) -> Result<Vec<GroupPermission>, DmError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT group_id, capability, allowed FROM group_permissions WHERE group_id = ?1",
            )?;
            let rows = stmt.query_map(params![group_id], |row| {
                Ok(GroupPermission {
                    group_id: row.get(0)?,
                    capability: row.get(1)?,
                    allowed: row.get::<_, i64>(2)? != 0,
                })
            })?;
            rows.collect()
        })
    }

    pub fn add_user_to_group(&self, user_id: i64, group_id: i64) -> Result<(), DmError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO user_groups (user_id, group_id) VALUES (?1, ?2)",
                params![user_id, group_id],
            )?;
            Ok(())
        })
    }

    /// Capabilities granted to a user through any of their groups. A
    /// capability is allowed when at least one group allows it and none denies.
    pub fn user_capabilities(&self, user_id: i64) -> Result<Vec<String>, DmError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT gp.capability, MIN(gp.allowed) FROM group_permissions gp \
                 JOIN user_groups ug ON ug.group_id = gp.group_id \
                 WHERE ug.user_id = ?1 GROUP BY gp.capability",
            )?;
            let rows = stmt.query_map(params![user_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? != 0))
            })?;
            let mut caps = Vec::new();
            for row in rows {
                let (cap, allowed) = row?;
                if allowed {
                    caps.push(cap);
                }
            }
            Ok(caps)
        })
    }

    // ── API keys ────────────────────────────────────────────────

    pub fn insert_api_key(&self, key: &ApiKey) -> Result<(), DmError> {
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO api_keys ({API_KEY_COLS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    key.id,
                    key.name,
                    key.prefix,
                    key.key_hash,
                    key.user_id,
                    ts_to_sql(key.created_at),
                    key.last_used_at.map(ts_to_sql),
                    key.revoked as i64,
                ],
            )?;
            Ok(())
        })
    }

    pub fn find_api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, DmError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {API_KEY_COLS} FROM api_keys WHERE key_hash = ?1"),
                params![key_hash],
                api_key_from_row,
            )
            .optional()
        })
    }

    pub fn list_api_keys(&self, user_id: i64) -> Result<Vec<ApiKey>, DmError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {API_KEY_COLS} FROM api_keys WHERE user_id = ?1 ORDER BY created_at DESC"
            ))?;
            let rows = stmt.query_map(params![user_id], api_key_from_row)?;
            rows.collect()
        })
    }

    /// Revoke an API key. Returns true when the row changed state (already
    /// revoked keys report false so audit entries are not duplicated).
    pub fn revoke_api_key(&self, id: &str) -> Result<bool, DmError> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE api_keys SET revoked = 1 WHERE id = ?1 AND revoked = 0",
                params![id],
            )?;
            Ok(n > 0)
        })
    }

    pub fn touch_api_key(&self, id: &str) -> Result<(), DmError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE api_keys SET last_used_at = ?1 WHERE id = ?2",
                params![ts_to_sql(Utc::now()), id],
            )?;
            Ok(())
        })
    }

    // ── Notification channels ───────────────────────────────────

    pub fn create_notification_channel(
        &self,
        channel_type: &str,
        name: &str,
        config: &Value,
        enabled: bool,
    ) -> Result<i64, DmError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO notification_channels (channel_type, name, config, enabled) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![channel_type, name, config.to_string(), enabled as i64],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn list_notification_channels(&self) -> Result<Vec<NotificationChannelRow>, DmError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, channel_type, name, config, enabled FROM notification_channels",
            )?;
            let rows = stmt.query_map([], |row| {
                let config: String = row.get(3)?;
                Ok(NotificationChannelRow {
                    id: row.get(0)?,
                    channel_type: row.get(1)?,
                    name: row.get(2)?,
                    config: serde_json::from_str(&config).unwrap_or(Value::Null),
                    enabled: row.get::<_, i64>(4)? != 0,
                })
            })?;
            rows.collect()
        })
    }

    pub fn get_notification_channels_by_type(
        &self,
        types: &[String],
    ) -> Result<Vec<NotificationChannelRow>, DmError> {
        let all = self.list_notification_channels()?;
        Ok(all
            .into_iter()
            .filter(|c| c.enabled && types.contains(&c.channel_type))
            .collect())
    }

    pub fn delete_notification_channel(&self, id: i64) -> Result<bool, DmError> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM notification_channels WHERE id = ?1", params![id])?;
            Ok(n > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revoke_api_key_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let uid = store.create_user("admin", "x", "admin").unwrap();
        store
            .insert_api_key(&ApiKey {
                id: "k1".into(),
                name: "ci".into(),
                prefix: "dockmon_abcdef012345".into(),
                key_hash: "deadbeef".into(),
                user_id: uid,
                created_at: Utc::now(),
                last_used_at: None,
                revoked: false,
            })
            .unwrap();

        assert!(store.revoke_api_key("k1").unwrap());
        // Second revocation succeeds but reports no state change
        assert!(!store.revoke_api_key("k1").unwrap());
    }

    #[test]
    fn test_user_capabilities_deny_wins() {
        let store = Store::open_in_memory().unwrap();
        let uid = store.create_user("bob", "x", "user").unwrap();
        let ops = store.create_group("ops", None).unwrap();
        let restricted = store.create_group("restricted", None).unwrap();
        store.add_user_to_group(uid, ops).unwrap();
        store.add_user_to_group(uid, restricted).unwrap();

        store.set_group_permission(ops, "containers:restart", true).unwrap();
        store.set_group_permission(ops, "deployments:create", true).unwrap();
        store
            .set_group_permission(restricted, "deployments:create", false)
            .unwrap();

        let caps = store.user_capabilities(uid).unwrap();
        assert!(caps.contains(&"containers:restart".to_string()));
        assert!(!caps.contains(&"deployments:create".to_string()));
    }
}

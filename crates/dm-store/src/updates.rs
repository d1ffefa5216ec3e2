//! Container update tracking and registry credentials.

use chrono::Utc;
use dm_common::DmError;
use rusqlite::{OptionalExtension, Row, params};

use crate::models::{ContainerUpdate, FloatingTagMode, RegistryCredential};
use crate::{Store, opt_ts_from_sql, ts_to_sql};

fn update_from_row(row: &Row<'_>) -> rusqlite::Result<ContainerUpdate> {
    Ok(ContainerUpdate {
        container_id: row.get(0)?,
        host_id: row.get(1)?,
        current_image: row.get(2)?,
        current_digest: row.get(3)?,
        latest_image: row.get(4)?,
        latest_digest: row.get(5)?,
        update_available: row.get::<_, i64>(6)? != 0,
        floating_tag_mode: FloatingTagMode::parse(&row.get::<_, String>(7)?)
            .unwrap_or(FloatingTagMode::Exact),
        registry_url: row.get(8)?,
        platform: row.get(9)?,
        last_checked_at: opt_ts_from_sql(row.get(10)?),
        last_updated_at: opt_ts_from_sql(row.get(11)?),
    })
}

const UPDATE_COLS: &str = "container_id, host_id, current_image, current_digest, latest_image, \
                           latest_digest, update_available, floating_tag_mode, registry_url, \
                           platform, last_checked_at, last_updated_at";

impl Store {
    pub fn upsert_container_update(&self, record: &ContainerUpdate) -> Result<(), DmError> {
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO container_updates ({UPDATE_COLS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
                     ON CONFLICT(container_id) DO UPDATE SET \
                     current_image = excluded.current_image, \
                     current_digest = excluded.current_digest, \
                     latest_image = excluded.latest_image, \
                     latest_digest = excluded.latest_digest, \
                     update_available = excluded.update_available, \
                     registry_url = excluded.registry_url, platform = excluded.platform, \
                     last_checked_at = excluded.last_checked_at"
                ),
                params![
                    record.container_id,
                    record.host_id,
                    record.current_image,
                    record.current_digest,
                    record.latest_image,
                    record.latest_digest,
                    record.update_available as i64,
                    record.floating_tag_mode.as_str(),
                    record.registry_url,
                    record.platform,
                    record.last_checked_at.map(ts_to_sql),
                    record.last_updated_at.map(ts_to_sql),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_container_update(
        &self,
        container_id: &str,
    ) -> Result<Option<ContainerUpdate>, DmError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {UPDATE_COLS} FROM container_updates WHERE container_id = ?1"),
                params![container_id],
                update_from_row,
            )
            .optional()
        })
    }

    pub fn list_container_updates(&self) -> Result<Vec<ContainerUpdate>, DmError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {UPDATE_COLS} FROM container_updates"))?;
            let rows = stmt.query_map([], update_from_row)?;
            rows.collect()
        })
    }

    pub fn set_floating_tag_mode(
        &self,
        container_id: &str,
        mode: FloatingTagMode,
    ) -> Result<(), DmError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE container_updates SET floating_tag_mode = ?1 WHERE container_id = ?2",
                params![mode.as_str(), container_id],
            )?;
            Ok(())
        })
    }

    /// Re-key an update row after the container was recreated with a new id,
    /// and record the image that is now running.
    pub fn finish_container_update(
        &self,
        old_container_id: &str,
        new_container_id: &str,
        new_image: &str,
        new_digest: Option<&str>,
    ) -> Result<(), DmError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE container_updates SET container_id = ?1, current_image = ?2, \
                 current_digest = ?3, update_available = 0, last_updated_at = ?4 \
                 WHERE container_id = ?5",
                params![
                    new_container_id,
                    new_image,
                    new_digest,
                    ts_to_sql(Utc::now()),
                    old_container_id,
                ],
            )?;
            Ok(())
        })
    }

    // ── Registry credentials ────────────────────────────────────

    pub fn upsert_registry_credential(&self, cred: &RegistryCredential) -> Result<(), DmError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO registry_credentials (registry_url, username, password_encrypted) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT(registry_url) DO UPDATE SET username = excluded.username, \
                 password_encrypted = excluded.password_encrypted",
                params![cred.registry_url, cred.username, cred.password_encrypted],
            )?;
            Ok(())
        })
    }

    pub fn get_registry_credential(
        &self,
        registry_url: &str,
    ) -> Result<Option<RegistryCredential>, DmError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT registry_url, username, password_encrypted \
                 FROM registry_credentials WHERE registry_url = ?1",
                params![registry_url.to_lowercase()],
                |row| {
                    Ok(RegistryCredential {
                        registry_url: row.get(0)?,
                        username: row.get(1)?,
                        password_encrypted: row.get(2)?,
                    })
                },
            )
            .optional()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_row_per_composite_id() {
        let store = Store::open_in_memory().unwrap();
        let record = ContainerUpdate {
            container_id: "h1:abc123def456".into(),
            host_id: "h1".into(),
            current_image: "nginx:1.24".into(),
            current_digest: Some("sha256:aaa".into()),
            latest_image: Some("nginx:1.25".into()),
            latest_digest: Some("sha256:bbb".into()),
            update_available: true,
            floating_tag_mode: FloatingTagMode::Minor,
            registry_url: Some("docker.io".into()),
            platform: Some("linux/amd64".into()),
            last_checked_at: Some(Utc::now()),
            last_updated_at: None,
        };
        store.upsert_container_update(&record).unwrap();
        store.upsert_container_update(&record).unwrap();

        let all = store.list_container_updates().unwrap();
        assert_eq!(all.len(), 1);
        // Tracking mode survives re-checks (upsert does not overwrite it)
        assert_eq!(all[0].floating_tag_mode, FloatingTagMode::Minor);
    }

    #[test]
    fn test_finish_update_rekeys_row() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_container_update(&ContainerUpdate {
                container_id: "h1:oldid1234567".into(),
                host_id: "h1".into(),
                current_image: "nginx:1.24".into(),
                current_digest: None,
                latest_image: Some("nginx:1.25".into()),
                latest_digest: Some("sha256:bbb".into()),
                update_available: true,
                floating_tag_mode: FloatingTagMode::Exact,
                registry_url: None,
                platform: None,
                last_checked_at: None,
                last_updated_at: None,
            })
            .unwrap();

        store
            .finish_container_update("h1:oldid1234567", "h1:newid7654321", "nginx:1.25", Some("sha256:bbb"))
            .unwrap();

        assert!(store.get_container_update("h1:oldid1234567").unwrap().is_none());
        let moved = store.get_container_update("h1:newid7654321").unwrap().unwrap();
        assert_eq!(moved.current_image, "nginx:1.25");
        assert!(!moved.update_available);
    }
}

//! Event log, audit log and the global settings singleton.

use chrono::{Duration, Utc};
use dm_common::DmError;
use rusqlite::{OptionalExtension, params};
use serde_json::Value;

use crate::models::{AuditLogEntry, EventLogRow, GlobalSettings};
use crate::{Store, ts_from_sql, ts_to_sql};

impl Store {
    // ── Event log ───────────────────────────────────────────────

    pub fn insert_event_log(&self, row: &EventLogRow) -> Result<(), DmError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO event_log (event_type, category, severity, title, message, \
                 scope_type, scope_id, scope_name, host_id, host_name, old_state, new_state, \
                 timestamp) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    row.event_type,
                    row.category,
                    row.severity,
                    row.title,
                    row.message,
                    row.scope_type,
                    row.scope_id,
                    row.scope_name,
                    row.host_id,
                    row.host_name,
                    row.old_state,
                    row.new_state,
                    ts_to_sql(row.timestamp),
                ],
            )?;
            Ok(())
        })
    }

    pub fn list_recent_events(&self, limit: i64) -> Result<Vec<EventLogRow>, DmError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, event_type, category, severity, title, message, scope_type, \
                 scope_id, scope_name, host_id, host_name, old_state, new_state, timestamp \
                 FROM event_log ORDER BY timestamp DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |row| {
                Ok(EventLogRow {
                    id: row.get(0)?,
                    event_type: row.get(1)?,
                    category: row.get(2)?,
                    severity: row.get(3)?,
                    title: row.get(4)?,
                    message: row.get(5)?,
                    scope_type: row.get(6)?,
                    scope_id: row.get(7)?,
                    scope_name: row.get(8)?,
                    host_id: row.get(9)?,
                    host_name: row.get(10)?,
                    old_state: row.get(11)?,
                    new_state: row.get(12)?,
                    timestamp: ts_from_sql(&row.get::<_, String>(13)?),
                })
            })?;
            rows.collect()
        })
    }

    pub fn purge_events_older_than(&self, days: i64) -> Result<usize, DmError> {
        let cutoff = Utc::now() - Duration::days(days);
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM event_log WHERE timestamp < ?1",
                params![ts_to_sql(cutoff)],
            )
        })
    }

    // ── Audit log ───────────────────────────────────────────────

    pub fn append_audit(
        &self,
        who: &str,
        action: &str,
        entity_type: &str,
        entity_id: Option<&str>,
        details: Option<&Value>,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<(), DmError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit_log (who, at, action, entity_type, entity_id, details, ip, \
                 user_agent) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    who,
                    ts_to_sql(Utc::now()),
                    action,
                    entity_type,
                    entity_id,
                    details.map(|v| v.to_string()),
                    ip,
                    user_agent,
                ],
            )?;
            Ok(())
        })
    }

    pub fn list_audit_entries(&self, limit: i64) -> Result<Vec<AuditLogEntry>, DmError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, who, at, action, entity_type, entity_id, details, ip, user_agent \
                 FROM audit_log ORDER BY at DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |row| {
                let details: Option<String> = row.get(6)?;
                Ok(AuditLogEntry {
                    id: row.get(0)?,
                    who: row.get(1)?,
                    when: ts_from_sql(&row.get::<_, String>(2)?),
                    action: row.get(3)?,
                    entity_type: row.get(4)?,
                    entity_id: row.get(5)?,
                    details: details.and_then(|s| serde_json::from_str(&s).ok()),
                    ip: row.get(7)?,
                    user_agent: row.get(8)?,
                })
            })?;
            rows.collect()
        })
    }

    // ── Global settings ─────────────────────────────────────────

    pub fn global_settings(&self) -> Result<GlobalSettings, DmError> {
        let existing: Option<GlobalSettings> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT settings FROM global_settings WHERE id = 1",
                [],
                |row| {
                    let raw: String = row.get(0)?;
                    Ok(serde_json::from_str(&raw).unwrap_or_default())
                },
            )
            .optional()
        })?;

        match existing {
            Some(settings) => Ok(settings),
            None => {
                let settings = GlobalSettings::default();
                self.save_global_settings(&settings)?;
                Ok(settings)
            }
        }
    }

    pub fn save_global_settings(&self, settings: &GlobalSettings) -> Result<(), DmError> {
        let json = serde_json::to_string(settings)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO global_settings (id, settings) VALUES (1, ?1) \
                 ON CONFLICT(id) DO UPDATE SET settings = excluded.settings",
                params![json],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_settings_singleton() {
        let store = Store::open_in_memory().unwrap();
        let defaults = store.global_settings().unwrap();
        assert!(defaults.skip_compose_containers);

        let mut updated = defaults;
        updated.update_check_time = "08:00".into();
        updated.timezone_offset_minutes = 60;
        store.save_global_settings(&updated).unwrap();

        let reloaded = store.global_settings().unwrap();
        assert_eq!(reloaded.update_check_time, "08:00");
        assert_eq!(reloaded.timezone_offset_minutes, 60);
    }

    #[test]
    fn test_audit_append_and_list() {
        let store = Store::open_in_memory().unwrap();
        store
            .append_audit("admin", "host.create", "host", Some("h1"), None, Some("10.0.0.1"), None)
            .unwrap();
        let entries = store.list_audit_entries(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "host.create");
    }
}

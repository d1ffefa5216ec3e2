//! Deployment rows. Status transitions are driven by the deployment
//! executor; deletion gating lives here so every caller enforces it.

use chrono::Utc;
use dm_common::DmError;
use rusqlite::{OptionalExtension, Row, params};
use serde_json::Value;

use crate::models::{Deployment, DeploymentStatus};
use crate::{Store, opt_ts_from_sql, ts_from_sql, ts_to_sql};

fn deployment_from_row(row: &Row<'_>) -> rusqlite::Result<Deployment> {
    let definition: String = row.get(5)?;
    Ok(Deployment {
        id: row.get(0)?,
        host_id: row.get(1)?,
        deployment_type: row.get(2)?,
        name: row.get(3)?,
        status: DeploymentStatus::parse(&row.get::<_, String>(4)?)
            .unwrap_or(DeploymentStatus::Failed),
        definition: serde_json::from_str(&definition).unwrap_or(Value::Null),
        progress_percent: row.get(6)?,
        current_stage: row.get(7)?,
        error_message: row.get(8)?,
        started_at: opt_ts_from_sql(row.get(9)?),
        completed_at: opt_ts_from_sql(row.get(10)?),
        committed: row.get::<_, i64>(11)? != 0,
        rollback_on_failure: row.get::<_, i64>(12)? != 0,
        created_at: ts_from_sql(&row.get::<_, String>(13)?),
    })
}

const DEPLOYMENT_COLS: &str = "id, host_id, deployment_type, name, status, definition, \
                               progress_percent, current_stage, error_message, started_at, \
                               completed_at, committed, rollback_on_failure, created_at";

impl Store {
    pub fn create_deployment(&self, deployment: &Deployment) -> Result<(), DmError> {
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO deployments ({DEPLOYMENT_COLS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    deployment.id,
                    deployment.host_id,
                    deployment.deployment_type,
                    deployment.name,
                    deployment.status.as_str(),
                    deployment.definition.to_string(),
                    deployment.progress_percent,
                    deployment.current_stage,
                    deployment.error_message,
                    deployment.started_at.map(ts_to_sql),
                    deployment.completed_at.map(ts_to_sql),
                    deployment.committed as i64,
                    deployment.rollback_on_failure as i64,
                    ts_to_sql(deployment.created_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_deployment(&self, id: &str) -> Result<Option<Deployment>, DmError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {DEPLOYMENT_COLS} FROM deployments WHERE id = ?1"),
                params![id],
                deployment_from_row,
            )
            .optional()
        })
    }

    pub fn list_deployments(&self, host_id: Option<&str>) -> Result<Vec<Deployment>, DmError> {
        self.with_conn(|conn| match host_id {
            Some(host) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {DEPLOYMENT_COLS} FROM deployments WHERE host_id = ?1 \
                     ORDER BY created_at DESC"
                ))?;
                let rows = stmt.query_map(params![host], deployment_from_row)?;
                rows.collect()
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {DEPLOYMENT_COLS} FROM deployments ORDER BY created_at DESC"
                ))?;
                let rows = stmt.query_map([], deployment_from_row)?;
                rows.collect()
            }
        })
    }

    pub fn set_deployment_progress(
        &self,
        id: &str,
        status: DeploymentStatus,
        progress_percent: i64,
        stage: Option<&str>,
    ) -> Result<(), DmError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE deployments SET status = ?1, progress_percent = ?2, current_stage = ?3 \
                 WHERE id = ?4",
                params![status.as_str(), progress_percent, stage, id],
            )?;
            Ok(())
        })
    }

    pub fn mark_deployment_started(&self, id: &str) -> Result<(), DmError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE deployments SET status = 'executing', started_at = ?1 WHERE id = ?2",
                params![ts_to_sql(Utc::now()), id],
            )?;
            Ok(())
        })
    }

    pub fn finish_deployment(
        &self,
        id: &str,
        status: DeploymentStatus,
        error_message: Option<&str>,
    ) -> Result<(), DmError> {
        let committed = status == DeploymentStatus::Completed;
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE deployments SET status = ?1, error_message = ?2, completed_at = ?3, \
                 committed = ?4, progress_percent = CASE WHEN ?1 = 'completed' THEN 100 \
                 ELSE progress_percent END WHERE id = ?5",
                params![
                    status.as_str(),
                    error_message,
                    ts_to_sql(Utc::now()),
                    committed as i64,
                    id,
                ],
            )?;
            Ok(())
        })
    }

    /// Delete a deployment row, enforcing the state gate: terminal states
    /// plus `planning` only.
    pub fn delete_deployment(&self, id: &str) -> Result<(), DmError> {
        let deployment = self
            .get_deployment(id)?
            .ok_or_else(|| DmError::NotFound(format!("Deployment {id} not found")))?;
        if !deployment.status.is_deletable() {
            return Err(DmError::Conflict(format!(
                "Cannot delete deployment in state {}",
                deployment.status.as_str()
            )));
        }
        self.with_conn(|conn| {
            conn.execute("DELETE FROM deployments WHERE id = ?1", params![id])?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(id: &str, status: DeploymentStatus) -> Deployment {
        Deployment {
            id: id.into(),
            host_id: "h1".into(),
            deployment_type: "stack".into(),
            name: "web".into(),
            status,
            definition: serde_json::json!({"services": {}}),
            progress_percent: 0,
            current_stage: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            committed: false,
            rollback_on_failure: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_delete_gating() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_deployment(&deployment("h1:dep1", DeploymentStatus::Executing))
            .unwrap();

        let err = store.delete_deployment("h1:dep1").unwrap_err();
        assert!(matches!(err, DmError::Conflict(_)));
        assert!(err.to_string().contains("executing"));

        store
            .finish_deployment("h1:dep1", DeploymentStatus::Failed, Some("pull failed"))
            .unwrap();
        store.delete_deployment("h1:dep1").unwrap();
        assert!(store.get_deployment("h1:dep1").unwrap().is_none());
    }

    #[test]
    fn test_planning_is_deletable() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_deployment(&deployment("h1:dep2", DeploymentStatus::Planning))
            .unwrap();
        store.delete_deployment("h1:dep2").unwrap();
    }

    #[test]
    fn test_finish_completed_sets_progress() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_deployment(&deployment("h1:dep3", DeploymentStatus::Executing))
            .unwrap();
        store
            .finish_deployment("h1:dep3", DeploymentStatus::Completed, None)
            .unwrap();
        let done = store.get_deployment("h1:dep3").unwrap().unwrap();
        assert_eq!(done.progress_percent, 100);
        assert!(done.committed);
    }
}

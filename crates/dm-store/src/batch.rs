//! Batch job and item rows.

use chrono::Utc;
use dm_common::DmError;
use rusqlite::{OptionalExtension, Row, params};
use serde_json::Value;

use crate::models::{BatchJob, BatchJobItem};
use crate::{Store, opt_ts_from_sql, ts_from_sql, ts_to_sql};

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<BatchJob> {
    let params_json: Option<String> = row.get(4)?;
    Ok(BatchJob {
        id: row.get(0)?,
        user_id: row.get(1)?,
        scope: row.get(2)?,
        action: row.get(3)?,
        params: params_json.and_then(|s| serde_json::from_str(&s).ok()),
        status: row.get(5)?,
        total_items: row.get(6)?,
        completed_items: row.get(7)?,
        success_items: row.get(8)?,
        error_items: row.get(9)?,
        skipped_items: row.get(10)?,
        started_at: opt_ts_from_sql(row.get(11)?),
        completed_at: opt_ts_from_sql(row.get(12)?),
        created_at: ts_from_sql(&row.get::<_, String>(13)?),
    })
}

const JOB_COLS: &str = "id, user_id, scope, action, params, status, total_items, \
                        completed_items, success_items, error_items, skipped_items, \
                        started_at, completed_at, created_at";

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<BatchJobItem> {
    Ok(BatchJobItem {
        id: row.get(0)?,
        job_id: row.get(1)?,
        container_id: row.get(2)?,
        container_name: row.get(3)?,
        host_id: row.get(4)?,
        status: row.get(5)?,
        error: row.get(6)?,
        started_at: opt_ts_from_sql(row.get(7)?),
        completed_at: opt_ts_from_sql(row.get(8)?),
    })
}

const ITEM_COLS: &str =
    "id, job_id, container_id, container_name, host_id, status, error, started_at, completed_at";

impl Store {
    pub fn create_batch_job(
        &self,
        job: &BatchJob,
        items: &[(String, String, String)],
    ) -> Result<(), DmError> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction().map_err(crate::db_err)?;
        let result: rusqlite::Result<()> = (|| {
            tx.execute(
                &format!(
                    "INSERT INTO batch_jobs ({JOB_COLS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    job.id,
                    job.user_id,
                    job.scope,
                    job.action,
                    job.params.as_ref().map(Value::to_string),
                    job.status,
                    job.total_items,
                    job.completed_items,
                    job.success_items,
                    job.error_items,
                    job.skipped_items,
                    job.started_at.map(ts_to_sql),
                    job.completed_at.map(ts_to_sql),
                    ts_to_sql(job.created_at),
                ],
            )?;
            for (container_id, container_name, host_id) in items {
                tx.execute(
                    "INSERT INTO batch_job_items (job_id, container_id, container_name, host_id, \
                     status) VALUES (?1, ?2, ?3, ?4, 'queued')",
                    params![job.id, container_id, container_name, host_id],
                )?;
            }
            Ok(())
        })();
        result.map_err(crate::db_err)?;
        tx.commit().map_err(crate::db_err)
    }

    pub fn get_batch_job(&self, id: &str) -> Result<Option<BatchJob>, DmError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {JOB_COLS} FROM batch_jobs WHERE id = ?1"),
                params![id],
                job_from_row,
            )
            .optional()
        })
    }

    pub fn list_batch_job_items(&self, job_id: &str) -> Result<Vec<BatchJobItem>, DmError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ITEM_COLS} FROM batch_job_items WHERE job_id = ?1"
            ))?;
            let rows = stmt.query_map(params![job_id], item_from_row)?;
            rows.collect()
        })
    }

    pub fn mark_batch_job_running(&self, id: &str) -> Result<(), DmError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE batch_jobs SET status = 'running', started_at = ?1 WHERE id = ?2",
                params![ts_to_sql(Utc::now()), id],
            )?;
            Ok(())
        })
    }

    pub fn mark_batch_item_running(&self, item_id: i64) -> Result<(), DmError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE batch_job_items SET status = 'running', started_at = ?1 WHERE id = ?2",
                params![ts_to_sql(Utc::now()), item_id],
            )?;
            Ok(())
        })
    }

    /// Record an item outcome and bump the job counters in one transaction.
    pub fn finish_batch_item(
        &self,
        item_id: i64,
        job_id: &str,
        status: &str,
        error: Option<&str>,
    ) -> Result<(), DmError> {
        let counter = match status {
            "success" => "success_items",
            "skipped" => "skipped_items",
            _ => "error_items",
        };
        let conn = self.lock();
        let tx = conn.unchecked_transaction().map_err(crate::db_err)?;
        let result: rusqlite::Result<()> = (|| {
            tx.execute(
                "UPDATE batch_job_items SET status = ?1, error = ?2, completed_at = ?3 \
                 WHERE id = ?4",
                params![status, error, ts_to_sql(Utc::now()), item_id],
            )?;
            tx.execute(
                &format!(
                    "UPDATE batch_jobs SET completed_items = completed_items + 1, \
                     {counter} = {counter} + 1 WHERE id = ?1"
                ),
                params![job_id],
            )?;
            Ok(())
        })();
        result.map_err(crate::db_err)?;
        tx.commit().map_err(crate::db_err)
    }

    pub fn finish_batch_job(&self, id: &str, status: &str) -> Result<(), DmError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE batch_jobs SET status = ?1, completed_at = ?2 WHERE id = ?3",
                params![status, ts_to_sql(Utc::now()), id],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_counters() {
        let store = Store::open_in_memory().unwrap();
        let job = BatchJob {
            id: "job_abc123def456".into(),
            user_id: None,
            scope: "container".into(),
            action: "stop".into(),
            params: None,
            status: "queued".into(),
            total_items: 2,
            completed_items: 0,
            success_items: 0,
            error_items: 0,
            skipped_items: 0,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        };
        store
            .create_batch_job(
                &job,
                &[
                    ("abc123def456".into(), "web".into(), "h1".into()),
                    ("def456abc123".into(), "db".into(), "h1".into()),
                ],
            )
            .unwrap();

        let items = store.list_batch_job_items("job_abc123def456").unwrap();
        assert_eq!(items.len(), 2);

        store
            .finish_batch_item(items[0].id, "job_abc123def456", "success", None)
            .unwrap();
        store
            .finish_batch_item(items[1].id, "job_abc123def456", "skipped", None)
            .unwrap();

        let job = store.get_batch_job("job_abc123def456").unwrap().unwrap();
        assert_eq!(job.completed_items, 2);
        assert_eq!(job.success_items, 1);
        assert_eq!(job.skipped_items, 1);
        assert_eq!(job.error_items, 0);
    }
}

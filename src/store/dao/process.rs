use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::store::models::ProcessStatus;

pub(crate) struct ProcessQueries;

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl ProcessQueries {
    pub async fn upsert(pool: &SqlitePool, status: &ProcessStatus) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO process_status (pid, work_id, description, current, total, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (pid) DO UPDATE SET
                work_id = excluded.work_id,
                description = excluded.description,
                current = excluded.current,
                total = excluded.total,
                updated_at = excluded.updated_at
            ",
        )
        .bind(i64::from(status.pid))
        .bind(status.work_id)
        .bind(&status.description)
        .bind(to_i64(status.current))
        .bind(to_i64(status.total))
        .bind(status.updated_at)
        .execute(pool)
        .await
        .context("failed to upsert process status")?;

        Ok(())
    }

    pub async fn delete(pool: &SqlitePool, pid: u32) -> Result<()> {
        sqlx::query("DELETE FROM process_status WHERE pid = ?")
            .bind(i64::from(pid))
            .execute(pool)
            .await
            .context("failed to delete process status")?;
        Ok(())
    }

    pub async fn list_for_work(pool: &SqlitePool, work_id: Uuid) -> Result<Vec<ProcessStatus>> {
        let rows = sqlx::query(
            r"
            SELECT pid, work_id, description, current, total, updated_at
            FROM process_status
            WHERE work_id = ?
            ORDER BY pid
            ",
        )
        .bind(work_id)
        .fetch_all(pool)
        .await
        .context("failed to list process status")?;

        rows.iter()
            .map(|row| {
                let pid: i64 = row.try_get("pid")?;
                let current: i64 = row.try_get("current")?;
                let total: i64 = row.try_get("total")?;
                Ok(ProcessStatus {
                    pid: u32::try_from(pid).context("pid out of range")?,
                    work_id: row.try_get("work_id")?,
                    description: row.try_get("description")?,
                    current: u64::try_from(current).unwrap_or_default(),
                    total: u64::try_from(total).unwrap_or_default(),
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }
}

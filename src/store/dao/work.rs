use std::collections::BTreeSet;

use anyhow::{Context, Result, anyhow, ensure};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::dao_trait::WorkMutation;
use super::types::WorkStatus;
use crate::store::models::{NewWork, Work, WorkFilter};
use crate::util::error::WorkError;

const WORK_COLUMNS: &str = "id, name, created_at, updated_at, submitted_at, dataset_fingerprint, \
     status, submission_config, resume_info, undone_job_ids, done_job_ids, pid";

pub(crate) struct WorkQueries;

fn encode_ids(ids: &BTreeSet<String>) -> Result<String> {
    serde_json::to_string(ids).context("failed to encode job id set")
}

fn decode_ids(raw: &str) -> Result<BTreeSet<String>> {
    serde_json::from_str(raw).context("failed to decode job id set")
}

fn row_to_work(row: &SqliteRow) -> Result<Work> {
    let status: String = row.try_get("status")?;
    let config: String = row.try_get("submission_config")?;
    let resume: String = row.try_get("resume_info")?;
    let undone: String = row.try_get("undone_job_ids")?;
    let done: String = row.try_get("done_job_ids")?;
    let pid: Option<i64> = row.try_get("pid")?;

    Ok(Work {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        submitted_at: row.try_get("submitted_at")?,
        dataset_fingerprint: row.try_get("dataset_fingerprint")?,
        status: status.parse::<WorkStatus>()?,
        config: serde_json::from_str(&config).context("failed to decode submission config")?,
        resume: serde_json::from_str(&resume).context("failed to decode resume info")?,
        undone_job_ids: decode_ids(&undone)?,
        done_job_ids: decode_ids(&done)?,
        pid: pid.and_then(|p| u32::try_from(p).ok()),
    })
}

async fn fetch_in(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<Work>> {
    let row = sqlx::query(&format!("SELECT {WORK_COLUMNS} FROM works WHERE id = ?"))
        .bind(id)
        .fetch_optional(conn)
        .await
        .context("failed to load work")?;

    row.as_ref().map(row_to_work).transpose()
}

async fn write_back(conn: &mut SqliteConnection, id: Uuid, work: &Work) -> Result<()> {
    ensure!(
        work.undone_job_ids.is_disjoint(&work.done_job_ids),
        "work {id}: undone and done job ids overlap"
    );

    sqlx::query(
        r"
        UPDATE works
        SET name = ?,
            updated_at = ?,
            submitted_at = ?,
            dataset_fingerprint = ?,
            status = ?,
            submission_config = ?,
            resume_info = ?,
            undone_job_ids = ?,
            done_job_ids = ?,
            pid = ?
        WHERE id = ?
        ",
    )
    .bind(&work.name)
    .bind(work.updated_at)
    .bind(work.submitted_at)
    .bind(&work.dataset_fingerprint)
    .bind(work.status.as_ref())
    .bind(serde_json::to_string(&work.config).context("failed to encode submission config")?)
    .bind(serde_json::to_string(&work.resume).context("failed to encode resume info")?)
    .bind(encode_ids(&work.undone_job_ids)?)
    .bind(encode_ids(&work.done_job_ids)?)
    .bind(work.pid.map(i64::from))
    .bind(id)
    .execute(conn)
    .await
    .context("failed to write work")?;

    Ok(())
}

impl WorkQueries {
    pub async fn create(pool: &SqlitePool, new_work: NewWork) -> Result<Work> {
        let now = Utc::now();
        let work = Work {
            id: Uuid::now_v7(),
            name: new_work.config.name.clone(),
            created_at: now,
            updated_at: now,
            submitted_at: None,
            dataset_fingerprint: None,
            status: WorkStatus::Created,
            config: new_work.config,
            resume: new_work.resume,
            undone_job_ids: BTreeSet::new(),
            done_job_ids: BTreeSet::new(),
            pid: None,
        };

        sqlx::query(
            r"
            INSERT INTO works (
                id, name, created_at, updated_at, status,
                submission_config, resume_info, undone_job_ids, done_job_ids
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, '[]', '[]')
            ",
        )
        .bind(work.id)
        .bind(&work.name)
        .bind(work.created_at)
        .bind(work.updated_at)
        .bind(work.status.as_ref())
        .bind(serde_json::to_string(&work.config).context("failed to encode submission config")?)
        .bind(serde_json::to_string(&work.resume).context("failed to encode resume info")?)
        .execute(pool)
        .await
        .context("failed to insert work")?;

        Ok(work)
    }

    pub async fn get(pool: &SqlitePool, id: Uuid) -> Result<Option<Work>> {
        let mut conn = pool.acquire().await.context("failed to acquire connection")?;
        fetch_in(&mut conn, id).await
    }

    /// 管理用の一覧取得。空のフィルタ条件はすべてにマッチする。
    pub async fn list(pool: &SqlitePool, filter: &WorkFilter) -> Result<Vec<Work>> {
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new(format!("SELECT {WORK_COLUMNS} FROM works WHERE 1 = 1"));

        if !filter.ids.is_empty() {
            qb.push(" AND id IN (");
            let mut sep = qb.separated(", ");
            for id in &filter.ids {
                sep.push_bind(*id);
            }
            sep.push_unseparated(")");
        }
        if !filter.statuses.is_empty() {
            qb.push(" AND status IN (");
            let mut sep = qb.separated(", ");
            for status in &filter.statuses {
                sep.push_bind(status.as_ref().to_string());
            }
            sep.push_unseparated(")");
        }
        if !filter.names.is_empty() {
            qb.push(" AND name IN (");
            let mut sep = qb.separated(", ");
            for name in &filter.names {
                sep.push_bind(name.clone());
            }
            sep.push_unseparated(")");
        }
        if let Some(after) = filter.created_after {
            qb.push(" AND created_at > ").push_bind(after);
        }
        qb.push(" ORDER BY created_at DESC");

        let rows = qb
            .build()
            .fetch_all(pool)
            .await
            .context("failed to list works")?;

        rows.iter().map(row_to_work).collect()
    }

    pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<Option<Work>> {
        let mut tx = pool.begin().await.context("failed to begin transaction")?;

        let existing = fetch_in(&mut *tx, id).await?;
        if existing.is_some() {
            sqlx::query("DELETE FROM works WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .context("failed to delete work")?;
        }

        tx.commit().await.context("failed to commit transaction")?;
        Ok(existing)
    }

    /// 読み込み・変更・書き戻しを1トランザクションで行う。
    ///
    /// 最初の文を書き込みにすることで、トランザクション開始時点でSQLiteの
    /// 書き込みロックを確保し、並行する更新を直列化する。
    pub async fn modify(pool: &SqlitePool, id: Uuid, mutation: WorkMutation) -> Result<Work> {
        let mut tx = pool.begin().await.context("failed to begin transaction")?;
        let now = Utc::now();

        let touched = sqlx::query("UPDATE works SET updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("failed to lock work row")?;
        if touched.rows_affected() == 0 {
            tx.rollback()
                .await
                .context("failed to rollback transaction")?;
            return Err(WorkError::WorkNotFound(id).into());
        }

        let mut work = fetch_in(&mut *tx, id)
            .await?
            .ok_or_else(|| anyhow!("work {id} vanished inside its own transaction"))?;

        mutation(&mut work);
        work.id = id;
        work.updated_at = now;

        write_back(&mut tx, id, &work).await?;
        tx.commit().await.context("failed to commit transaction")?;

        Ok(work)
    }

    pub async fn claim_fingerprint(
        pool: &SqlitePool,
        id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<Uuid>> {
        let result = sqlx::query(
            "UPDATE works SET dataset_fingerprint = ?, updated_at = ? WHERE id = ?",
        )
        .bind(fingerprint)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => Err(WorkError::WorkNotFound(id).into()),
            Ok(_) => Ok(None),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                let owner = Self::find_by_fingerprint(pool, fingerprint)
                    .await?
                    .ok_or_else(|| {
                        anyhow!("fingerprint {fingerprint} conflicted but no owner was found")
                    })?;
                Ok(Some(owner))
            }
            Err(err) => Err(err).context("failed to record dataset fingerprint"),
        }
    }

    pub async fn find_by_fingerprint(pool: &SqlitePool, fingerprint: &str) -> Result<Option<Uuid>> {
        let row = sqlx::query("SELECT id FROM works WHERE dataset_fingerprint = ?")
            .bind(fingerprint)
            .fetch_optional(pool)
            .await
            .context("failed to look up dataset fingerprint")?;

        row.map(|r| r.try_get::<Uuid, _>("id"))
            .transpose()
            .context("failed to decode work id")
    }
}

//! Administrative operations behind the `batchwork` binary.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use uuid::Uuid;

use crate::pipeline::StageEngine;
use crate::scheduler::Rescheduler;
use crate::store::dao::{WorkDao, WorkStatus};
use crate::store::models::{ProcessStatus, Work, WorkFilter};
use crate::util::error::WorkError;
use crate::util::lock::{self, WorkLock};

/// Result of a cancel request.
#[derive(Debug)]
pub enum CancelOutcome {
    /// A live invocation holds the work; it was asked to wind down.
    Signalled { pid: u32 },
    /// Nobody held the work, so it was moved to `Canceled` here.
    Canceled(Work),
}

pub struct Admin {
    dao: Arc<dyn WorkDao>,
    rescheduler: Arc<dyn Rescheduler>,
    lock_dir: PathBuf,
}

impl Admin {
    pub fn new(dao: Arc<dyn WorkDao>, rescheduler: Arc<dyn Rescheduler>, lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            dao,
            rescheduler,
            lock_dir: lock_dir.into(),
        }
    }

    /// # Errors
    /// `WorkError::WorkNotFound` for unknown ids.
    pub async fn get(&self, id: Uuid) -> Result<Work, WorkError> {
        self.dao
            .get_work(id)
            .await
            .map_err(WorkError::from_anyhow)?
            .ok_or(WorkError::WorkNotFound(id))
    }

    /// Progress rows of uploads or downloads currently running for `id`.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn progress(&self, id: Uuid) -> anyhow::Result<Vec<ProcessStatus>> {
        self.dao.list_process_status(id).await
    }

    /// # Errors
    /// Propagates store failures.
    pub async fn list(&self, filter: &WorkFilter) -> anyhow::Result<Vec<Work>> {
        self.dao.list_works(filter).await
    }

    /// Kills the invocation holding the work (if any), removes its periodic
    /// entry and deletes the record.
    ///
    /// # Errors
    /// `WorkError::WorkNotFound` when there is nothing to delete.
    pub async fn delete(&self, id: Uuid) -> Result<Work, WorkError> {
        let work = self.get(id).await?;

        if let Some(pid) = lock::holder_pid(&self.lock_dir, id)? {
            match lock::send_signal(pid, libc::SIGKILL) {
                Ok(()) => info!(work_id = %id, pid, "killed running invocation"),
                Err(err) => warn!(work_id = %id, pid, error = %err, "could not kill running invocation"),
            }
        }

        self.rescheduler
            .unregister(id)
            .await
            .context("failed to unregister periodic re-invocation")?;

        let deleted = self
            .dao
            .delete_work(id)
            .await
            .map_err(WorkError::from_anyhow)?
            .ok_or(WorkError::WorkNotFound(id))?;
        info!(work_id = %id, status = %work.status, "work deleted");
        Ok(deleted)
    }

    /// Asks a live holder to stop (SIGTERM), or drives an idle work to `Canceled`.
    ///
    /// # Errors
    /// `WorkError::InvalidTransition` for finished works, `WorkError::AlreadyRunning`
    /// if another invocation grabbed the work between the probe and the lock.
    pub async fn cancel(&self, engine: &StageEngine, id: Uuid) -> Result<CancelOutcome, WorkError> {
        let work = self.get(id).await?;
        if work.status.is_terminal() {
            return Err(WorkError::InvalidTransition {
                from: work.status,
                to: WorkStatus::Canceled,
            });
        }

        if let Some(pid) = lock::holder_pid(&self.lock_dir, id)? {
            lock::send_signal(pid, libc::SIGTERM)
                .with_context(|| format!("failed to signal pid {pid}"))?;
            info!(work_id = %id, pid, "asked running invocation to cancel");
            return Ok(CancelOutcome::Signalled { pid });
        }

        let _lock = WorkLock::try_acquire(&self.lock_dir, id)?;
        let work = engine.drive(id, WorkStatus::Canceled, None).await?;
        Ok(CancelOutcome::Canceled(work))
    }
}

fn short_time(at: chrono::DateTime<chrono::Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Plain aligned table, one work per row.
#[must_use]
pub fn render_table(works: &[Work]) -> String {
    const HEADER: [&str; 7] = ["ID", "NAME", "STATUS", "UNDONE", "DONE", "CREATED", "UPDATED"];

    let rows: Vec<[String; 7]> = works
        .iter()
        .map(|work| {
            [
                work.id.to_string(),
                work.name.clone().unwrap_or_else(|| "-".to_string()),
                work.status.to_string(),
                work.undone_job_ids.len().to_string(),
                work.done_job_ids.len().to_string(),
                short_time(work.created_at),
                short_time(work.updated_at),
            ]
        })
        .collect();

    let mut widths = HEADER.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let mut push_row = |cells: &[&str]| {
        let line = cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ");
        let _ = writeln!(out, "{}", line.trim_end());
    };

    push_row(&HEADER);
    for row in &rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        push_row(&cells);
    }
    out
}

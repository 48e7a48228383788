use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use super::Rescheduler;
use crate::app::WORK_ID_ENV;
use crate::store::models::Work;

/// crontab(1) backed rescheduler. Entries are tagged with the work id so
/// they can be found and removed again.
#[derive(Debug, Clone)]
pub struct CrontabRescheduler {
    program: PathBuf,
    log_dir: PathBuf,
}

impl CrontabRescheduler {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: PathBuf::from("crontab"),
            log_dir: log_dir.into(),
        }
    }

    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    async fn read_table(&self) -> anyhow::Result<String> {
        let output = Command::new(&self.program)
            .arg("-l")
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to run {} -l", self.program.display()))?;

        if output.status.success() {
            return String::from_utf8(output.stdout).context("crontab is not valid UTF-8");
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        // "no crontab for <user>"
        if stderr.contains("no crontab") {
            return Ok(String::new());
        }
        bail!("crontab -l exited with {}: {}", output.status, stderr.trim());
    }

    async fn write_table(&self, table: &str) -> anyhow::Result<()> {
        let mut child = Command::new(&self.program)
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to run {} -", self.program.display()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(table.as_bytes())
                .await
                .context("failed to write crontab")?;
            stdin.shutdown().await.context("failed to close crontab stdin")?;
        }

        let output = child
            .wait_with_output()
            .await
            .context("failed to wait for crontab")?;
        if !output.status.success() {
            bail!(
                "crontab - exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Rescheduler for CrontabRescheduler {
    async fn register(&self, work: &Work) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.log_dir)
            .await
            .with_context(|| format!("failed to create {}", self.log_dir.display()))?;

        let current = self.read_table().await?;
        let mut table = strip_entries(&current, work.id);
        table.push_str(&render_entry(work, &self.log_dir));
        table.push('\n');
        self.write_table(&table).await?;

        info!(
            work_id = %work.id,
            cadence = %cadence(work.config.check_interval),
            "registered periodic re-invocation"
        );
        Ok(())
    }

    async fn unregister(&self, work_id: Uuid) -> anyhow::Result<()> {
        let current = self.read_table().await?;
        let table = strip_entries(&current, work_id);
        if table.len() == current.len() {
            debug!(work_id = %work_id, "no crontab entry to remove");
            return Ok(());
        }
        self.write_table(&table).await?;
        info!(work_id = %work_id, "unregistered periodic re-invocation");
        Ok(())
    }
}

fn tag(work_id: Uuid) -> String {
    format!("# batchwork:{work_id}")
}

/// Cron schedule firing roughly every `interval`, rounded up to what cron can express.
#[must_use]
pub fn cadence(interval: Duration) -> String {
    let minutes = interval.as_secs().div_ceil(60).max(1);
    if minutes < 60 {
        return format!("*/{minutes} * * * *");
    }
    let hours = minutes.div_ceil(60);
    if hours < 24 {
        format!("0 */{hours} * * *")
    } else {
        "0 0 * * *".to_string()
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// One crontab line re-running the persisted executable for `work`.
#[must_use]
pub fn render_entry(work: &Work, log_dir: &Path) -> String {
    let log = log_dir.join(format!("{}.log", work.id));
    format!(
        "{schedule} cd {dir} && {env}={id} {exe} >> {log} 2>&1 {tag}",
        schedule = cadence(work.config.check_interval),
        dir = shell_quote(&work.resume.work_dir.to_string_lossy()),
        env = WORK_ID_ENV,
        id = work.id,
        exe = shell_quote(&work.resume.executable.to_string_lossy()),
        log = shell_quote(&log.to_string_lossy()),
        tag = tag(work.id),
    )
}

/// Drops every line tagged for `work_id`, keeping the rest verbatim.
#[must_use]
pub fn strip_entries(table: &str, work_id: Uuid) -> String {
    let marker = tag(work_id);
    table
        .lines()
        .filter(|line| !line.trim_end().ends_with(&marker))
        .fold(String::new(), |mut out, line| {
            out.push_str(line);
            out.push('\n');
            out
        })
}

//! Invocation bootstrap: wires components together and resumes (or creates)
//! one work per process.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clients::{BatchApi, BatchApiClient, BatchApiConfig};
use crate::config::Config;
use crate::observability;
use crate::pipeline::transform::ChunkLimits;
use crate::pipeline::{StageEngine, default_target};
use crate::runner::RunnerRegistry;
use crate::scheduler::{CrontabRescheduler, Rescheduler};
use crate::store::dao::{SqliteWorkDao, WorkDao, WorkStatus, mutation};
use crate::store::models::{ResumeInfo, Work};
use crate::util::error::WorkError;
use crate::util::lock::WorkLock;

/// Work id handed to re-invocations by the periodic scheduler.
pub const WORK_ID_ENV: &str = "BATCHWORK_WORK_ID";
/// Optional target status override for re-invocations.
pub const TARGET_STATUS_ENV: &str = "BATCHWORK_TARGET_STATUS";

pub struct ComponentRegistry {
    config: Arc<Config>,
    dao: Arc<dyn WorkDao>,
    api: Arc<dyn BatchApi>,
    rescheduler: Arc<dyn Rescheduler>,
    runners: RunnerRegistry,
}

impl ComponentRegistry {
    /// 構成情報と依存をまとめて初期化する。
    ///
    /// # Errors
    /// データディレクトリやストアの準備、HTTP クライアント構築が失敗した場合はエラーを返す。
    pub async fn build(config: Config, runners: RunnerRegistry) -> Result<Self> {
        tokio::fs::create_dir_all(config.data_dir())
            .await
            .with_context(|| format!("failed to create {}", config.data_dir().display()))?;

        let dao = SqliteWorkDao::connect(&config.db_path())
            .await
            .context("failed to open work store")?;
        let api_config =
            BatchApiConfig::from_config(&config).context("failed to configure batch client")?;
        let api = BatchApiClient::new(api_config).context("failed to build batch client")?;
        let rescheduler = CrontabRescheduler::new(config.log_dir());

        Ok(Self::from_parts(
            config,
            Arc::new(dao),
            Arc::new(api),
            Arc::new(rescheduler),
            runners,
        ))
    }

    pub fn from_parts(
        config: Config,
        dao: Arc<dyn WorkDao>,
        api: Arc<dyn BatchApi>,
        rescheduler: Arc<dyn Rescheduler>,
        runners: RunnerRegistry,
    ) -> Self {
        Self {
            config: Arc::new(config),
            dao,
            api,
            rescheduler,
            runners,
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn dao(&self) -> Arc<dyn WorkDao> {
        Arc::clone(&self.dao)
    }

    #[must_use]
    pub fn rescheduler(&self) -> Arc<dyn Rescheduler> {
        Arc::clone(&self.rescheduler)
    }

    #[must_use]
    pub fn runners(&self) -> &RunnerRegistry {
        &self.runners
    }

    /// A stage engine observing `cancel`.
    #[must_use]
    pub fn engine(&self, cancel: CancellationToken) -> StageEngine {
        StageEngine::builder(
            Arc::clone(&self.dao),
            Arc::clone(&self.api),
            Arc::clone(&self.rescheduler),
        )
        .with_chunk_limits(ChunkLimits {
            max_bytes: self.config.max_chunk_bytes(),
            max_lines: self.config.max_chunk_lines(),
        })
        .with_page_size(self.config.list_page_size())
        .with_cancellation(cancel)
        .build()
    }
}

/// What the periodic scheduler (or the user) asked this process to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Invocation {
    /// Absent: create a new work.
    pub work_id: Option<Uuid>,
    pub target: Option<WorkStatus>,
}

impl Invocation {
    /// # Errors
    /// Fails when either variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let work_id = env::var(WORK_ID_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(|value| value.trim().parse::<Uuid>())
            .transpose()
            .with_context(|| format!("{WORK_ID_ENV} is not a valid work id"))?;
        let target = env::var(TARGET_STATUS_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(|value| value.trim().parse::<WorkStatus>())
            .transpose()
            .with_context(|| format!("{TARGET_STATUS_ENV} is not a valid status"))?;
        Ok(Self { work_id, target })
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    /// The invocation ran and left the work in this state.
    Finished(Work),
    /// Another process holds the work; nothing was touched.
    AlreadyRunning { work_id: Uuid, pid: Option<u32> },
}

/// Resumes the work named by `invocation`, or creates one with the runner
/// registered under `runner_key`.
///
/// # Errors
/// Caller errors from the stage engine, or store failures while preparing the run.
pub async fn run(
    registry: &ComponentRegistry,
    runner_key: &str,
    invocation: Invocation,
    cancel: CancellationToken,
) -> Result<RunOutcome, WorkError> {
    let engine = registry.engine(cancel.clone());

    let work_id = match invocation.work_id {
        Some(work_id) => work_id,
        None => {
            let runner = registry.runners.get(runner_key)?;
            engine
                .create_work(runner.work_config(), ResumeInfo::capture(runner_key)?)
                .await?
                .id
        }
    };

    // The record is read under the lock so a just-finished prior invocation is seen as finished.
    let lock = match WorkLock::try_acquire(&registry.config.lock_dir(), work_id) {
        Ok(lock) => lock,
        Err(WorkError::AlreadyRunning { id, pid }) => {
            info!(work_id = %id, pid = ?pid, "work is being processed by another invocation");
            return Ok(RunOutcome::AlreadyRunning { work_id: id, pid });
        }
        Err(err) => return Err(err),
    };

    let work = registry
        .dao
        .get_work(work_id)
        .await
        .map_err(WorkError::from_anyhow)?
        .ok_or(WorkError::WorkNotFound(work_id))?;
    if work.status.is_terminal() {
        info!(work_id = %work_id, status = %work.status, "work already finished");
        return Ok(RunOutcome::Finished(work));
    }
    if invocation.work_id.is_some() {
        if let Err(err) = env::set_current_dir(&work.resume.work_dir) {
            warn!(
                work_id = %work_id,
                dir = %work.resume.work_dir.display(),
                error = %err,
                "could not enter the work directory"
            );
        }
    }
    let runner = registry.runners.get(&work.resume.runner_key)?;
    let Some(target) = invocation.target.or_else(|| default_target(work.status)) else {
        return Ok(RunOutcome::Finished(work));
    };

    record_pid(registry.dao.as_ref(), work_id, Some(std::process::id())).await?;

    let mut outcome = engine.drive(work_id, target, Some(runner.as_ref())).await;
    if registry.config.resident() {
        while let Ok(work) = &outcome {
            if work.status.is_terminal() {
                break;
            }
            let interval = next_check_delay(work.config.check_interval);
            debug!(work_id = %work_id, ?interval, "waiting for next check cycle");
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(interval) => {}
            }
            outcome = engine
                .drive(work_id, WorkStatus::Checked, Some(runner.as_ref()))
                .await;
        }
    }

    let cleared = match record_pid(registry.dao.as_ref(), work_id, None).await {
        Ok(work) => Some(work),
        Err(err) => {
            warn!(work_id = %work_id, error = %err.report(), "failed to clear pid");
            None
        }
    };
    drop(lock);

    let work = outcome?;
    Ok(RunOutcome::Finished(cleared.unwrap_or(work)))
}

/// Shortest pause between resident check cycles.
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(1);

fn next_check_delay(check_interval: Duration) -> Duration {
    check_interval.max(MIN_CHECK_INTERVAL)
}

async fn record_pid(dao: &dyn WorkDao, work_id: Uuid, pid: Option<u32>) -> Result<Work, WorkError> {
    dao.modify_work(work_id, mutation(move |work| work.pid = pid))
        .await
        .map_err(WorkError::from_anyhow)
}

/// Cancels `token` on SIGTERM or SIGINT so the running transition can wind down.
///
/// # Errors
/// Fails when the signal handlers cannot be installed.
pub fn listen_for_shutdown(token: CancellationToken) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut int = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = term.recv() => info!("received SIGTERM"),
            _ = int.recv() => info!("received SIGINT"),
        }
        token.cancel();
    });
    Ok(())
}

/// Entry point for embedding programs: reads configuration from the
/// environment, runs one invocation and reports its outcome.
///
/// # Errors
/// Any configuration, bootstrap or engine failure.
pub async fn launch(runners: RunnerRegistry, runner_key: &str) -> Result<RunOutcome> {
    let config = Config::from_env().context("failed to load configuration")?;
    observability::init(config.log_format())?;
    observability::install_panic_hook();

    let invocation = Invocation::from_env()?;
    let registry = ComponentRegistry::build(config, runners)
        .await
        .context("failed to build component registry")?;

    let cancel = CancellationToken::new();
    listen_for_shutdown(cancel.clone())?;

    let outcome = run(&registry, runner_key, invocation, cancel).await?;
    match &outcome {
        RunOutcome::Finished(work) => info!(
            work_id = %work.id,
            status = %work.status,
            undone = work.undone_job_ids.len(),
            done = work.done_job_ids.len(),
            "invocation finished"
        ),
        RunOutcome::AlreadyRunning { work_id, pid } => {
            info!(work_id = %work_id, pid = ?pid, "skipped: already running");
        }
    }
    Ok(outcome)
}

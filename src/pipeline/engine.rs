//! Stage engine: drives one work through its state machine.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::poll::Poller;
use super::retrieve::Retriever;
use super::steps::StepExecutor;
use super::transform::ChunkLimits;
use super::transition::{StepOutcome, Transition};
use crate::clients::BatchApi;
use crate::runner::BatchRunner;
use crate::scheduler::Rescheduler;
use crate::store::dao::{WorkDao, WorkStatus, mutation};
use crate::store::models::{NewWork, ResumeInfo, Work, WorkConfig};
use crate::util::error::WorkError;
use crate::util::progress::MIN_PROGRESS_INTERVAL;

const DEFAULT_PAGE_SIZE: u32 = 100;
const DEFAULT_PROGRESS_EVERY: Duration = Duration::from_secs(5);

/// Core engine that owns every collaborator a transition needs.
pub struct StageEngine {
    pub(super) dao: Arc<dyn WorkDao>,
    pub(super) api: Arc<dyn BatchApi>,
    pub(super) rescheduler: Arc<dyn Rescheduler>,
    pub(super) poller: Poller,
    pub(super) retriever: Retriever,
    pub(super) limits: ChunkLimits,
    pub(super) progress_every: Duration,
    pub(super) cancel: CancellationToken,
}

/// Builder for [`StageEngine`].
pub struct StageEngineBuilder {
    dao: Arc<dyn WorkDao>,
    api: Arc<dyn BatchApi>,
    rescheduler: Arc<dyn Rescheduler>,
    limits: ChunkLimits,
    page_size: u32,
    progress_every: Duration,
    cancel: Option<CancellationToken>,
}

impl StageEngineBuilder {
    #[must_use]
    pub fn with_chunk_limits(mut self, limits: ChunkLimits) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Clamped to [`MIN_PROGRESS_INTERVAL`].
    #[must_use]
    pub fn with_progress_interval(mut self, every: Duration) -> Self {
        self.progress_every = every.max(MIN_PROGRESS_INTERVAL);
        self
    }

    /// Token observed between steps; once cancelled, the next non-terminal
    /// target becomes `Canceled`.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    #[must_use]
    pub fn build(self) -> StageEngine {
        StageEngine {
            poller: Poller::new(Arc::clone(&self.api), self.page_size),
            retriever: Retriever::new(
                Arc::clone(&self.api),
                Arc::clone(&self.dao),
                self.progress_every,
            ),
            dao: self.dao,
            api: self.api,
            rescheduler: self.rescheduler,
            limits: self.limits,
            progress_every: self.progress_every,
            cancel: self.cancel.unwrap_or_else(CancellationToken::new),
        }
    }
}

impl StageEngine {
    pub fn builder(
        dao: Arc<dyn WorkDao>,
        api: Arc<dyn BatchApi>,
        rescheduler: Arc<dyn Rescheduler>,
    ) -> StageEngineBuilder {
        StageEngineBuilder {
            dao,
            api,
            rescheduler,
            limits: ChunkLimits::default(),
            page_size: DEFAULT_PAGE_SIZE,
            progress_every: DEFAULT_PROGRESS_EVERY,
            cancel: None,
        }
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn dao(&self) -> &Arc<dyn WorkDao> {
        &self.dao
    }

    /// Creates a work in `Created`, freezing `config` into the record.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn create_work(&self, config: WorkConfig, resume: ResumeInfo) -> Result<Work, WorkError> {
        let work = self
            .dao
            .create_work(NewWork { config, resume })
            .await
            .map_err(WorkError::from_anyhow)?;
        info!(work_id = %work.id, name = ?work.name, runner = %work.resume.runner_key, "work created");
        Ok(work)
    }

    async fn load(&self, work_id: Uuid) -> Result<Work, WorkError> {
        self.dao
            .get_work(work_id)
            .await
            .map_err(WorkError::from_anyhow)?
            .ok_or(WorkError::WorkNotFound(work_id))
    }

    /// Runs transitions until `target` (or a status a step redirected to) is reached.
    ///
    /// Caller errors come back untouched and leave the persisted status as it
    /// was. Any other failure is redirected once to `Failed`; if that
    /// transition fails too, its error is returned.
    ///
    /// # Errors
    /// See above.
    pub async fn drive(
        &self,
        work_id: Uuid,
        target: WorkStatus,
        runner: Option<&dyn BatchRunner>,
    ) -> Result<Work, WorkError> {
        let mut target = target;
        let mut failure_redirected = false;

        loop {
            let work = self.load(work_id).await?;
            if self.cancel.is_cancelled() && !target.is_terminal() {
                info!(work_id = %work_id, "cancellation requested");
                target = WorkStatus::Canceled;
            }

            let transition = Transition::classify(work.status, target)?;
            debug!(work_id = %work_id, from = %work.status, to = %target, ?transition, "running transition");

            let executor = StepExecutor::new(self);
            let outcome = match transition {
                Transition::Submit => executor.submit(&work, runner).await,
                Transition::Check => executor.check(&work, runner).await,
                Transition::Finish(to) => executor.finish(&work, to).await,
            }
            .map_err(WorkError::from_anyhow);

            match outcome {
                Ok(StepOutcome::Continue)
                    if self.cancel.is_cancelled() && !transition.target().is_terminal() =>
                {
                    info!(work_id = %work_id, to = %transition.target(), "cancellation arrived during transition");
                    target = WorkStatus::Canceled;
                }
                Ok(StepOutcome::Continue) => return self.settle(work_id, transition.target()).await,
                Ok(StepOutcome::RedirectTo(next)) => {
                    info!(work_id = %work_id, from = %target, to = %next, "transition redirected");
                    target = next;
                }
                Err(err) if err.is_caller_error() => return Err(err),
                Err(err) if failure_redirected || target == WorkStatus::Failed => {
                    error!(work_id = %work_id, error = %err.report(), "failed transition could not complete");
                    return Err(err);
                }
                Err(err) => {
                    error!(
                        work_id = %work_id,
                        status = %work.status,
                        target = %target,
                        error = %err.report(),
                        "transition failed, moving work to failed"
                    );
                    failure_redirected = true;
                    target = WorkStatus::Failed;
                }
            }
        }
    }

    /// Persists the status reached by a completed transition.
    async fn settle(&self, work_id: Uuid, status: WorkStatus) -> Result<Work, WorkError> {
        let work = self
            .dao
            .modify_work(
                work_id,
                mutation(move |work| {
                    work.status = status;
                    // Nothing reached the service, so the dataset may be submitted again.
                    if matches!(status, WorkStatus::Failed | WorkStatus::Canceled)
                        && work.job_ids().is_empty()
                    {
                        work.dataset_fingerprint = None;
                    }
                }),
            )
            .await
            .map_err(WorkError::from_anyhow)?;

        info!(
            work_id = %work_id,
            status = %work.status,
            undone = work.undone_job_ids.len(),
            done = work.done_job_ids.len(),
            "work status persisted"
        );
        Ok(work)
    }
}

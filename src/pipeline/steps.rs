//! Transition bodies run by the stage engine.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::engine::StageEngine;
use super::poll::JobState;
use super::transform::{Chunk, DatasetTransformer};
use super::transition::StepOutcome;
use crate::clients::batch_api::models::CreateBatchRequest;
use crate::runner::BatchRunner;
use crate::store::dao::{WorkStatus, mutation};
use crate::store::models::Work;
use crate::util::error::{WorkError, is_retryable};
use crate::util::progress::{ProgressReporter, ProgressTracker};

/// Metadata key tying a remote batch back to its work.
pub(crate) const WORK_ID_METADATA: &str = "batchwork_work_id";

/// ステージ本体の実行ヘルパー
pub(super) struct StepExecutor<'a> {
    engine: &'a StageEngine,
}

impl<'a> StepExecutor<'a> {
    pub(super) fn new(engine: &'a StageEngine) -> Self {
        Self { engine }
    }

    fn require_runner<'r>(
        work: &Work,
        runner: Option<&'r dyn BatchRunner>,
    ) -> Result<&'r dyn BatchRunner, WorkError> {
        runner.ok_or_else(|| WorkError::RunnerNotRegistered(work.resume.runner_key.clone()))
    }

    /// `Created -> Checked`: transform, dedup, submit every chunk, then one check cycle.
    pub(super) async fn submit(
        &self,
        work: &Work,
        runner: Option<&dyn BatchRunner>,
    ) -> anyhow::Result<StepOutcome> {
        let runner = Self::require_runner(work, runner)?;
        let engine = self.engine;

        let transformer = DatasetTransformer::new(work.config.endpoint, engine.limits);
        let dataset = transformer.transform(runner.upload()).await?;

        if work.config.allow_same_dataset {
            debug!(work_id = %work.id, fingerprint = %dataset.fingerprint, "duplicate datasets allowed");
        } else if let Some(existing) = engine
            .dao
            .claim_fingerprint(work.id, &dataset.fingerprint)
            .await?
        {
            warn!(
                work_id = %work.id,
                existing = %existing,
                fingerprint = %dataset.fingerprint,
                "dataset was already submitted"
            );
            return Err(WorkError::DuplicateDataset {
                fingerprint: dataset.fingerprint,
                existing,
            }
            .into());
        }

        // A crash mid-submission leaves the first chunks' jobs recorded; chunking is deterministic.
        let already = work.job_ids().len();
        let total = dataset.chunks.len();
        if already > 0 {
            info!(work_id = %work.id, already, total, "resuming partial submission");
        }

        for (index, chunk) in dataset.chunks.into_iter().enumerate().skip(already) {
            if engine.cancel.is_cancelled() {
                return Ok(StepOutcome::RedirectTo(WorkStatus::Canceled));
            }

            let job_id = self.submit_chunk(work, index, total, chunk).await?;
            let job = job_id.clone();
            engine
                .dao
                .modify_work(
                    work.id,
                    mutation(move |work| {
                        work.undone_job_ids.insert(job);
                        work.submitted_at.get_or_insert_with(Utc::now);
                    }),
                )
                .await
                .with_context(|| format!("failed to record job {job_id}"))?;
            info!(work_id = %work.id, job_id = %job_id, chunk = index, total, "chunk submitted");
        }

        let submitted = engine
            .dao
            .modify_work(work.id, mutation(|work| work.status = WorkStatus::Checked))
            .await
            .context("failed to persist submitted work")?;
        engine
            .rescheduler
            .register(&submitted)
            .await
            .context("failed to register periodic re-invocation")?;
        info!(
            work_id = %work.id,
            jobs = submitted.undone_job_ids.len(),
            lines = dataset.total_lines,
            "work submitted"
        );

        self.check(&submitted, Some(runner)).await
    }

    async fn submit_chunk(
        &self,
        work: &Work,
        index: usize,
        total: usize,
        chunk: Chunk,
    ) -> anyhow::Result<String> {
        let engine = self.engine;
        let tracker = ProgressTracker::new(format!("uploading chunk {}/{total}", index + 1), 0);
        let reporter = ProgressReporter::spawn(
            Arc::clone(&engine.dao),
            work.id,
            Arc::clone(&tracker),
            engine.progress_every,
        );
        let filename = format!("batchwork-{}-{index:04}.jsonl", work.id);
        let uploaded = engine
            .api
            .upload_file(&chunk.file, &filename, Arc::clone(&tracker))
            .await;
        reporter.finish().await;
        let file = uploaded.with_context(|| format!("failed to upload chunk {index}"))?;
        debug!(work_id = %work.id, file_id = %file.id, bytes = chunk.bytes, lines = chunk.lines, "chunk uploaded");

        let request = CreateBatchRequest {
            input_file_id: file.id,
            endpoint: work.config.endpoint,
            completion_window: work.config.completion_window_param(),
            metadata: BTreeMap::from([
                (WORK_ID_METADATA.to_string(), work.id.to_string()),
                ("chunk".to_string(), index.to_string()),
            ]),
        };
        let batch = engine
            .api
            .create_batch(&request)
            .await
            .with_context(|| format!("failed to create batch for chunk {index}"))?;
        Ok(batch.id)
    }

    /// `Checked -> Checked`: poll undone jobs and hand finished ones to the runner.
    pub(super) async fn check(
        &self,
        work: &Work,
        runner: Option<&dyn BatchRunner>,
    ) -> anyhow::Result<StepOutcome> {
        let runner = Self::require_runner(work, runner)?;
        let engine = self.engine;

        if work.is_drained() {
            return Ok(StepOutcome::RedirectTo(WorkStatus::Completed));
        }

        let report = match engine.poller.poll(&work.undone_job_ids).await {
            Ok(report) => report,
            Err(err) if is_retryable(&err) => {
                warn!(work_id = %work.id, error = %format!("{err:#}"), "poll failed, retrying next cycle");
                return Ok(StepOutcome::Continue);
            }
            Err(err) => return Err(err),
        };
        if engine.cancel.is_cancelled() {
            return Ok(StepOutcome::RedirectTo(WorkStatus::Canceled));
        }

        let mut current = work.clone();
        for (job_id, state) in report.finished() {
            if engine.cancel.is_cancelled() {
                return Ok(StepOutcome::RedirectTo(WorkStatus::Canceled));
            }

            match self.collect(work.id, job_id, state, runner).await {
                Ok(()) => {}
                Err(err) if is_retryable(&err) => {
                    warn!(
                        work_id = %work.id,
                        job_id,
                        error = %format!("{err:#}"),
                        "result retrieval interrupted, job stays undone"
                    );
                    continue;
                }
                Err(err) => return Err(err),
            }

            let job = job_id.to_string();
            current = engine
                .dao
                .modify_work(work.id, mutation(move |work| {
                    work.mark_done(&job);
                }))
                .await
                .with_context(|| format!("failed to mark job {job_id} done"))?;
            info!(
                work_id = %work.id,
                job_id,
                remaining = current.undone_job_ids.len(),
                "job done"
            );
        }

        if current.is_drained() {
            return Ok(StepOutcome::RedirectTo(WorkStatus::Completed));
        }

        let missing: Vec<&str> = report.not_found().collect();
        if !missing.is_empty() {
            if let Some(deadline) = current.give_up_at() {
                if Utc::now() > deadline {
                    error!(
                        work_id = %work.id,
                        missing = ?missing,
                        deadline = %deadline,
                        "jobs never appeared in the batch listing before the completion window ended"
                    );
                    return Ok(StepOutcome::RedirectTo(WorkStatus::Failed));
                }
            }
        }

        Ok(StepOutcome::Continue)
    }

    async fn collect(
        &self,
        work_id: Uuid,
        job_id: &str,
        state: &JobState,
        runner: &dyn BatchRunner,
    ) -> anyhow::Result<()> {
        let retriever = &self.engine.retriever;
        match state {
            JobState::Success {
                output_file_id,
                error_file_id,
            } => {
                match output_file_id {
                    Some(file_id) => {
                        retriever
                            .dispatch_output(work_id, job_id, file_id, runner)
                            .await?;
                    }
                    None => warn!(work_id = %work_id, job_id, "completed job has no output file"),
                }
                if let Some(file_id) = error_file_id {
                    retriever
                        .dispatch_errors(work_id, job_id, file_id, runner)
                        .await?;
                }
            }
            JobState::Failed { error_file_id } => {
                warn!(work_id = %work_id, job_id, "job failed on the service");
                if let Some(file_id) = error_file_id {
                    retriever
                        .dispatch_errors(work_id, job_id, file_id, runner)
                        .await?;
                }
            }
            JobState::InProgress | JobState::NotFound => {}
        }
        Ok(())
    }

    /// Any non-terminal status to `to`: unregister, clean up, report leftovers.
    pub(super) async fn finish(&self, work: &Work, to: WorkStatus) -> anyhow::Result<StepOutcome> {
        let engine = self.engine;
        engine
            .rescheduler
            .unregister(work.id)
            .await
            .context("failed to unregister periodic re-invocation")?;

        if work.config.clean_up {
            self.clean_up(work).await?;
        }

        if !work.undone_job_ids.is_empty() {
            warn!(
                work_id = %work.id,
                status = %to,
                undone = ?work.undone_job_ids,
                "work finished with jobs still undone"
            );
        }
        Ok(StepOutcome::Continue)
    }

    async fn clean_up(&self, work: &Work) -> anyhow::Result<()> {
        let engine = self.engine;
        let job_ids = work.job_ids();
        if job_ids.is_empty() {
            return Ok(());
        }

        let report = engine
            .poller
            .poll(&job_ids)
            .await
            .context("failed to look up batches for clean-up")?;

        let mut deleted = 0usize;
        for (job_id, batch) in &report.batches {
            for file_id in batch.file_ids() {
                engine
                    .api
                    .delete_file(file_id)
                    .await
                    .with_context(|| format!("failed to delete file {file_id} of job {job_id}"))?;
                deleted += 1;
            }
        }
        info!(work_id = %work.id, deleted, "remote files cleaned up");
        Ok(())
    }
}

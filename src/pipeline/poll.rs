use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, warn};

use crate::clients::BatchApi;
use crate::clients::batch_api::models::{Batch, BatchState};

/// Classification of one outstanding job id after a listing scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Success {
        output_file_id: Option<String>,
        error_file_id: Option<String>,
    },
    Failed {
        error_file_id: Option<String>,
    },
    InProgress,
    /// Absent from every listing page.
    NotFound,
}

impl JobState {
    #[must_use]
    pub fn from_batch(batch: &Batch) -> Self {
        match batch.status {
            BatchState::Completed => JobState::Success {
                output_file_id: batch.output_file_id.clone(),
                error_file_id: batch.error_file_id.clone(),
            },
            BatchState::Failed | BatchState::Cancelled | BatchState::Expired => JobState::Failed {
                error_file_id: batch.error_file_id.clone(),
            },
            BatchState::Validating
            | BatchState::InProgress
            | BatchState::Finalizing
            | BatchState::Cancelling
            | BatchState::Unknown => JobState::InProgress,
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Success { .. } | JobState::Failed { .. })
    }
}

#[derive(Debug, Default)]
pub struct PollReport {
    pub states: BTreeMap<String, JobState>,
    /// Raw batch objects for every id that was found.
    pub batches: BTreeMap<String, Batch>,
}

impl PollReport {
    pub fn not_found(&self) -> impl Iterator<Item = &str> {
        self.states
            .iter()
            .filter(|(_, state)| **state == JobState::NotFound)
            .map(|(id, _)| id.as_str())
    }

    pub fn finished(&self) -> impl Iterator<Item = (&str, &JobState)> {
        self.states
            .iter()
            .filter(|(_, state)| state.is_finished())
            .map(|(id, state)| (id.as_str(), state))
    }
}

#[derive(Clone)]
pub struct Poller {
    api: Arc<dyn BatchApi>,
    page_size: u32,
}

impl Poller {
    pub fn new(api: Arc<dyn BatchApi>, page_size: u32) -> Self {
        Self {
            api,
            page_size: page_size.clamp(1, 100),
        }
    }

    /// Walks the batch listing until every id is found or the listing ends.
    ///
    /// # Errors
    /// Propagates listing failures; callers decide whether they are transient.
    pub async fn poll(&self, outstanding: &BTreeSet<String>) -> anyhow::Result<PollReport> {
        let mut report = PollReport::default();
        if outstanding.is_empty() {
            return Ok(report);
        }

        let mut cursor: Option<String> = None;
        let mut pages = 0usize;
        loop {
            pages += 1;
            let page = self
                .api
                .list_batches(cursor.as_deref(), self.page_size)
                .await
                .with_context(|| format!("failed to list batches (page {pages})"))?;

            for batch in page.data.iter().filter(|b| outstanding.contains(&b.id)) {
                report
                    .states
                    .insert(batch.id.clone(), JobState::from_batch(batch));
                report.batches.insert(batch.id.clone(), batch.clone());
            }

            if report.batches.len() == outstanding.len() || !page.has_more {
                break;
            }

            let next = page
                .last_id
                .clone()
                .or_else(|| page.data.last().map(|b| b.id.clone()));
            if next.is_none() || next == cursor {
                warn!(pages, "batch listing stopped advancing");
                break;
            }
            cursor = next;
        }

        for id in outstanding {
            if !report.states.contains_key(id) {
                warn!(job_id = %id, "job not found in batch listing");
                report.states.insert(id.clone(), JobState::NotFound);
            }
        }

        debug!(
            pages,
            outstanding = outstanding.len(),
            found = report.batches.len(),
            "poll finished"
        );
        Ok(report)
    }
}

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::dao::types::WorkStatus;

/// Batch API endpoint a work submits its requests to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Endpoint {
    #[default]
    #[serde(rename = "/v1/chat/completions")]
    ChatCompletions,
    #[serde(rename = "/v1/embeddings")]
    Embeddings,
    #[serde(rename = "/v1/completions")]
    Completions,
    #[serde(rename = "/v1/responses")]
    Responses,
}

impl AsRef<str> for Endpoint {
    fn as_ref(&self) -> &str {
        match self {
            Endpoint::ChatCompletions => "/v1/chat/completions",
            Endpoint::Embeddings => "/v1/embeddings",
            Endpoint::Completions => "/v1/completions",
            Endpoint::Responses => "/v1/responses",
        }
    }
}

/// Submission settings declared by a runner and frozen into the work at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkConfig {
    pub name: Option<String>,
    #[serde(with = "duration_secs")]
    pub completion_window: Duration,
    #[serde(with = "duration_secs")]
    pub check_interval: Duration,
    pub endpoint: Endpoint,
    pub allow_same_dataset: bool,
    pub clean_up: bool,
}

impl Default for WorkConfig {
    fn default() -> Self {
        Self {
            name: None,
            completion_window: Duration::from_secs(24 * 60 * 60),
            check_interval: Duration::from_secs(4 * 60 * 60),
            endpoint: Endpoint::ChatCompletions,
            allow_same_dataset: false,
            clean_up: true,
        }
    }
}

impl WorkConfig {
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    #[must_use]
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    #[must_use]
    pub fn with_completion_window(mut self, window: Duration) -> Self {
        self.completion_window = window;
        self
    }

    #[must_use]
    pub fn allow_same_dataset(mut self, allow: bool) -> Self {
        self.allow_same_dataset = allow;
        self
    }

    #[must_use]
    pub fn clean_up(mut self, clean_up: bool) -> Self {
        self.clean_up = clean_up;
        self
    }

    /// Completion window in the `<n>h` form the Batch API expects.
    #[must_use]
    pub fn completion_window_param(&self) -> String {
        let hours = self.completion_window.as_secs().div_ceil(3600).max(1);
        format!("{hours}h")
    }
}

/// Everything a fresh process needs to pick a work back up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeInfo {
    /// Program re-executed by the periodic scheduler.
    pub executable: PathBuf,
    pub work_dir: PathBuf,
    /// Key under which the embedding program registers its runner.
    pub runner_key: String,
    pub runtime: String,
}

impl ResumeInfo {
    /// Captures the current executable and working directory.
    ///
    /// # Errors
    /// Returns an error when either path cannot be resolved.
    pub fn capture(runner_key: impl Into<String>) -> anyhow::Result<Self> {
        use anyhow::Context;

        Ok(Self {
            executable: std::env::current_exe().context("failed to resolve current executable")?,
            work_dir: std::env::current_dir().context("failed to resolve working directory")?,
            runner_key: runner_key.into(),
            runtime: concat!("batchwork/", env!("CARGO_PKG_VERSION")).to_string(),
        })
    }
}

/// Durable record of one unit of batch processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Work {
    pub id: Uuid,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub dataset_fingerprint: Option<String>,
    pub status: WorkStatus,
    pub config: WorkConfig,
    pub resume: ResumeInfo,
    pub undone_job_ids: BTreeSet<String>,
    pub done_job_ids: BTreeSet<String>,
    pub pid: Option<u32>,
}

impl Work {
    /// All job ids ever assigned to this work.
    #[must_use]
    pub fn job_ids(&self) -> BTreeSet<String> {
        self.undone_job_ids
            .union(&self.done_job_ids)
            .cloned()
            .collect()
    }

    /// Moves `job_id` from undone to done. Returns false for unknown or already-done ids.
    pub fn mark_done(&mut self, job_id: &str) -> bool {
        if self.undone_job_ids.remove(job_id) {
            self.done_job_ids.insert(job_id.to_string());
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.undone_job_ids.is_empty()
    }

    /// Deadline after which ids the service never reports are given up on.
    #[must_use]
    pub fn give_up_at(&self) -> Option<DateTime<Utc>> {
        let start = self.submitted_at?;
        let grace = chrono::Duration::from_std(
            self.config.completion_window + self.config.check_interval,
        )
        .ok()?;
        start.checked_add_signed(grace)
    }
}

#[derive(Debug, Clone)]
pub struct NewWork {
    pub config: WorkConfig,
    pub resume: ResumeInfo,
}

/// Filters for the administrative listing; empty vectors match everything.
#[derive(Debug, Clone, Default)]
pub struct WorkFilter {
    pub ids: Vec<Uuid>,
    pub statuses: Vec<WorkStatus>,
    pub names: Vec<String>,
    pub created_after: Option<DateTime<Utc>>,
}

/// Observability row for a long streaming upload or download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStatus {
    pub pid: u32,
    pub work_id: Uuid,
    pub description: String,
    pub current: u64,
    pub total: u64,
    pub updated_at: DateTime<Utc>,
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

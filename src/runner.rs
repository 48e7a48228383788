//! Capability set supplied by the embedding program, and the registry that
//! lets a fresh process find it again from the key persisted in `ResumeInfo`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use futures::stream::BoxStream;

use crate::clients::batch_api::models::{BatchErrorItem, BatchInputItem, BatchOutputItem};
use crate::store::models::WorkConfig;
use crate::util::error::WorkError;

pub type InputStream<'a> = BoxStream<'a, anyhow::Result<BatchInputItem>>;
pub type OutputStream<'a> = BoxStream<'a, anyhow::Result<BatchOutputItem>>;
pub type ErrorStream<'a> = BoxStream<'a, anyhow::Result<BatchErrorItem>>;

/// User-defined transform into and out of batch request items.
///
/// `download` and `download_error` are called at least once per job and may
/// see the same items again after a crash, so they must be idempotent with
/// respect to `(job_id, custom_id)`.
#[async_trait]
pub trait BatchRunner: Send + Sync {
    /// Submission settings; read once when a work is created.
    fn work_config(&self) -> WorkConfig;

    /// Input items in submission order. Must be deterministic for the same dataset.
    fn upload(&self) -> InputStream<'_>;

    async fn download(&self, items: OutputStream<'_>) -> anyhow::Result<()>;

    async fn download_error(&self, items: ErrorStream<'_>) -> anyhow::Result<()> {
        items.try_for_each(|_| async { Ok(()) }).await
    }
}

#[derive(Clone, Default)]
pub struct RunnerRegistry {
    runners: HashMap<String, Arc<dyn BatchRunner>>,
}

impl fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.runners.keys().collect();
        keys.sort();
        f.debug_struct("RunnerRegistry").field("keys", &keys).finish()
    }
}

impl RunnerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_runner(mut self, key: impl Into<String>, runner: Arc<dyn BatchRunner>) -> Self {
        self.register(key, runner);
        self
    }

    pub fn register(&mut self, key: impl Into<String>, runner: Arc<dyn BatchRunner>) {
        self.runners.insert(key.into(), runner);
    }

    /// # Errors
    /// `WorkError::RunnerNotRegistered` when nothing was registered under `key`.
    pub fn get(&self, key: &str) -> Result<Arc<dyn BatchRunner>, WorkError> {
        self.runners
            .get(key)
            .cloned()
            .ok_or_else(|| WorkError::RunnerNotRegistered(key.to_string()))
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.runners.contains_key(key)
    }
}

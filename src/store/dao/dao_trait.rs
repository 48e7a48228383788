/// WorkDaoトレイト - ワークストアの抽象化
use async_trait::async_trait;
use uuid::Uuid;

use crate::store::models::{NewWork, ProcessStatus, Work, WorkFilter};

/// Mutation applied to a work inside a single read-modify-write transaction.
pub type WorkMutation = Box<dyn FnOnce(&mut Work) + Send>;

#[async_trait]
pub trait WorkDao: Send + Sync {
    // Work records
    async fn create_work(&self, new_work: NewWork) -> anyhow::Result<Work>;

    async fn get_work(&self, id: Uuid) -> anyhow::Result<Option<Work>>;

    async fn list_works(&self, filter: &WorkFilter) -> anyhow::Result<Vec<Work>>;

    /// Removes the record and returns what was deleted.
    async fn delete_work(&self, id: Uuid) -> anyhow::Result<Option<Work>>;

    /// Atomically loads the work, applies `mutation` and writes it back.
    ///
    /// Concurrent callers are serialised; no update is lost. Fails with
    /// `WorkError::WorkNotFound` when the record does not exist.
    async fn modify_work(&self, id: Uuid, mutation: WorkMutation) -> anyhow::Result<Work>;

    /// Records `fingerprint` on the work unless another work already owns it.
    ///
    /// Returns `Some(existing_id)` on conflict; the check and the write are one
    /// atomic step so two racing submitters cannot both win.
    async fn claim_fingerprint(&self, id: Uuid, fingerprint: &str) -> anyhow::Result<Option<Uuid>>;

    async fn find_by_fingerprint(&self, fingerprint: &str) -> anyhow::Result<Option<Uuid>>;

    // Process status
    async fn upsert_process_status(&self, status: &ProcessStatus) -> anyhow::Result<()>;

    async fn delete_process_status(&self, pid: u32) -> anyhow::Result<()>;

    async fn list_process_status(&self, work_id: Uuid) -> anyhow::Result<Vec<ProcessStatus>>;
}

/// Boxes a closure as a [`WorkMutation`].
pub fn mutation<F>(f: F) -> WorkMutation
where
    F: FnOnce(&mut Work) + Send + 'static,
{
    Box::new(f)
}

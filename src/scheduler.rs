//! Periodic re-invocation of the bootstrap for works that are still in flight.

pub mod cron;

use async_trait::async_trait;
use uuid::Uuid;

use crate::store::models::Work;

pub use cron::CrontabRescheduler;

/// Host facility that re-enters the orchestrator for a work every `check_interval`.
#[async_trait]
pub trait Rescheduler: Send + Sync {
    /// Installs (or replaces) the periodic entry for `work`. Must be idempotent.
    async fn register(&self, work: &Work) -> anyhow::Result<()>;

    /// Removes the entry; a missing entry is not an error.
    async fn unregister(&self, work_id: Uuid) -> anyhow::Result<()>;
}

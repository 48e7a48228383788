// Lock-free progress counters for streaming uploads and downloads, plus a
// background task that mirrors them into the process_status table.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::dao::WorkDao;
use crate::store::models::ProcessStatus;

/// Shortest period between progress writes; `tokio::time::interval` rejects zero.
pub const MIN_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct ProgressTracker {
    description: String,
    current: AtomicU64,
    total: AtomicU64,
}

impl ProgressTracker {
    #[must_use]
    pub fn new(description: impl Into<String>, total: u64) -> Arc<Self> {
        Arc::new(Self {
            description: description.into(),
            current: AtomicU64::new(0),
            total: AtomicU64::new(total),
        })
    }

    pub fn advance(&self, amount: u64) {
        self.current.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn add_total(&self, amount: u64) {
        self.total.fetch_add(amount, Ordering::Relaxed);
    }

    #[must_use]
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    fn snapshot(&self, work_id: Uuid) -> ProcessStatus {
        ProcessStatus {
            pid: std::process::id(),
            work_id,
            description: self.description.clone(),
            current: self.current(),
            total: self.total(),
            updated_at: Utc::now(),
        }
    }
}

/// Handle to the reporter task; `finish` stops it and removes the row.
pub struct ProgressReporter {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ProgressReporter {
    pub fn spawn(
        dao: Arc<dyn WorkDao>,
        work_id: Uuid,
        tracker: Arc<ProgressTracker>,
        every: Duration,
    ) -> Self {
        let token = CancellationToken::new();
        let child = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(MIN_PROGRESS_INTERVAL));
            loop {
                tokio::select! {
                    () = child.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = dao.upsert_process_status(&tracker.snapshot(work_id)).await {
                            warn!(work_id = %work_id, error = %err, "failed to record progress");
                        }
                    }
                }
            }

            debug!(
                work_id = %work_id,
                description = tracker.description(),
                current = tracker.current(),
                total = tracker.total(),
                "progress finished"
            );
            if let Err(err) = dao.delete_process_status(std::process::id()).await {
                warn!(work_id = %work_id, error = %err, "failed to clear progress row");
            }
        });

        Self { token, handle }
    }

    pub async fn finish(self) {
        self.token.cancel();
        if let Err(err) = self.handle.await {
            warn!(error = %err, "progress reporter task panicked");
        }
    }
}

pub mod batch_api;

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

pub use batch_api::{BatchApiClient, BatchApiConfig, BatchApiError};

use self::batch_api::models::{Batch, BatchPage, CreateBatchRequest, FileObject};
use crate::util::progress::ProgressTracker;

/// Raw file body as it arrives from the service.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// External batch-processing service.
#[async_trait]
pub trait BatchApi: Send + Sync {
    /// Uploads one chunk file (read from its start) with purpose `batch`.
    async fn upload_file(
        &self,
        file: &std::fs::File,
        filename: &str,
        progress: Arc<ProgressTracker>,
    ) -> anyhow::Result<FileObject>;

    async fn create_batch(&self, request: &CreateBatchRequest) -> anyhow::Result<Batch>;

    /// One page of the batch listing, newest first.
    async fn list_batches(&self, after: Option<&str>, limit: u32) -> anyhow::Result<BatchPage>;

    async fn file_content(&self, file_id: &str) -> anyhow::Result<ByteStream>;

    async fn delete_file(&self, file_id: &str) -> anyhow::Result<()>;
}

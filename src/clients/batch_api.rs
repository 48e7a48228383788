/// OpenAI互換 Batch API クライアント。
///
/// ファイルのストリーミングアップロード、バッチ作成、ページング付き一覧取得、
/// 結果ファイルのストリーミング取得と削除をサポートします。
pub mod models;

use std::io::{Seek, SeekFrom};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use self::models::{Batch, BatchPage, CreateBatchRequest, FileObject};
use super::{BatchApi, ByteStream};
use crate::config::{Config, ConfigError};
use crate::util::progress::ProgressTracker;
use crate::util::retry::{RetryConfig, is_retryable_error, is_retryable_status};

#[derive(Debug, thiserror::Error)]
pub enum BatchApiError {
    #[error("batch API returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("batch API request failed")]
    Transport(#[from] reqwest::Error),
    #[error("failed to decode batch API response")]
    Decode(#[from] serde_json::Error),
    #[error("failed to prepare upload body")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct BatchApiConfig {
    pub base_url: String,
    pub api_key: String,
    pub connect_timeout: Duration,
    pub total_timeout: Duration,
    /// Attempts per request, the first one included.
    pub max_attempts: usize,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl BatchApiConfig {
    /// # Errors
    /// Returns `ConfigError::Missing` when no API key is configured.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let api_key = config
            .api_key()
            .ok_or(ConfigError::Missing("OPENAI_API_KEY"))?
            .to_string();

        Ok(Self {
            base_url: config.api_base_url().to_string(),
            api_key,
            connect_timeout: config.connect_timeout(),
            total_timeout: config.total_timeout(),
            max_attempts: config.http_max_retries().saturating_add(1),
            backoff_base_ms: config.http_backoff_base_ms(),
            backoff_cap_ms: config.http_backoff_cap_ms(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct BatchApiClient {
    client: Client,
    base_url: Url,
    api_key: String,
    retry: RetryConfig,
}

impl BatchApiClient {
    /// # Errors
    /// URLのパースまたはHTTPクライアントの構築に失敗した場合はエラーを返します。
    pub fn new(config: BatchApiConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.total_timeout)
            .build()
            .context("failed to build batch API HTTP client")?;

        let mut raw = config.base_url;
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base_url = Url::parse(&raw).context("invalid batch API base URL")?;

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key,
            retry: RetryConfig::new(
                config.max_attempts.max(1),
                config.backoff_base_ms,
                config.backoff_cap_ms,
            ),
        })
    }

    fn url(&self, path: &str) -> Result<Url, BatchApiError> {
        self.base_url
            .join(path)
            .map_err(|err| BatchApiError::Io(std::io::Error::other(err)))
    }

    /// Sends the request built by `build`, retrying transient failures.
    ///
    /// Non-idempotent requests are only retried when the connection was never made.
    async fn send<F>(&self, what: &str, idempotent: bool, mut build: F) -> Result<Response, BatchApiError>
    where
        F: FnMut() -> Result<RequestBuilder, BatchApiError>,
    {
        let mut attempt = 0;
        loop {
            let delay = self.retry.delay_for_attempt(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;

            match build()?.bearer_auth(&self.api_key).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    if idempotent && is_retryable_status(status) && self.retry.can_retry(attempt) {
                        warn!(request = what, %status, attempt, "retrying batch API request");
                        continue;
                    }
                    return Err(BatchApiError::Status { status, body });
                }
                Err(err) => {
                    let retryable = if idempotent {
                        is_retryable_error(&err)
                    } else {
                        err.is_connect()
                    };
                    if retryable && self.retry.can_retry(attempt) {
                        warn!(request = what, error = %err, attempt, "retrying batch API request");
                        continue;
                    }
                    return Err(BatchApiError::Transport(err));
                }
            }
        }
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, BatchApiError> {
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl BatchApi for BatchApiClient {
    async fn upload_file(
        &self,
        file: &std::fs::File,
        filename: &str,
        progress: Arc<ProgressTracker>,
    ) -> anyhow::Result<FileObject> {
        let url = self.url("files")?;
        let length = file.metadata().context("failed to stat chunk file")?.len();
        progress.add_total(length);

        let response = self
            .send("upload_file", false, || {
                let mut handle = file.try_clone()?;
                handle.seek(SeekFrom::Start(0))?;

                let tracker = Arc::clone(&progress);
                let stream = ReaderStream::new(tokio::fs::File::from_std(handle)).inspect_ok(
                    move |chunk| {
                        tracker.advance(chunk.len() as u64);
                    },
                );
                let part = Part::stream_with_length(reqwest::Body::wrap_stream(stream), length)
                    .file_name(filename.to_string())
                    .mime_str("application/jsonl")?;
                let form = Form::new().text("purpose", "batch").part("file", part);

                Ok(self.client.post(url.clone()).multipart(form))
            })
            .await
            .with_context(|| format!("failed to upload {filename}"))?;

        let uploaded: FileObject = Self::decode(response)
            .await
            .context("failed to decode uploaded file object")?;
        debug!(file_id = %uploaded.id, bytes = length, "uploaded batch input file");
        Ok(uploaded)
    }

    async fn create_batch(&self, request: &CreateBatchRequest) -> anyhow::Result<Batch> {
        let url = self.url("batches")?;
        let response = self
            .send("create_batch", false, || {
                Ok(self.client.post(url.clone()).json(request))
            })
            .await
            .with_context(|| format!("failed to create batch for {}", request.input_file_id))?;

        Self::decode(response)
            .await
            .context("failed to decode created batch")
    }

    async fn list_batches(&self, after: Option<&str>, limit: u32) -> anyhow::Result<BatchPage> {
        let mut url = self.url("batches")?;
        {
            let mut query_pairs = url.query_pairs_mut();
            query_pairs.append_pair("limit", &limit.to_string());
            if let Some(cursor) = after {
                query_pairs.append_pair("after", cursor);
            }
        }

        let response = self
            .send("list_batches", true, || Ok(self.client.get(url.clone())))
            .await
            .context("failed to list batches")?;

        Self::decode(response)
            .await
            .context("failed to decode batch page")
    }

    async fn file_content(&self, file_id: &str) -> anyhow::Result<ByteStream> {
        let url = self.url(&format!("files/{file_id}/content"))?;
        let response = self
            .send("file_content", true, || Ok(self.client.get(url.clone())))
            .await
            .with_context(|| format!("failed to fetch file {file_id}"))?;

        Ok(response
            .bytes_stream()
            .map_err(std::io::Error::other)
            .boxed())
    }

    async fn delete_file(&self, file_id: &str) -> anyhow::Result<()> {
        let url = self.url(&format!("files/{file_id}"))?;
        match self
            .send("delete_file", true, || Ok(self.client.delete(url.clone())))
            .await
        {
            Ok(_) => Ok(()),
            Err(BatchApiError::Status { status, .. }) if status == StatusCode::NOT_FOUND => {
                debug!(file_id, "file already deleted");
                Ok(())
            }
            Err(err) => Err(err).with_context(|| format!("failed to delete file {file_id}")),
        }
    }
}

//! In-memory doubles for the batch service, the runner and the rescheduler.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream};
use reqwest::StatusCode;
use serde_json::{Value, json};
use uuid::Uuid;

use batchwork::clients::batch_api::models::{
    Batch, BatchErrorItem, BatchInputItem, BatchOutputItem, BatchPage, BatchState,
    CreateBatchRequest, FileObject,
};
use batchwork::clients::{BatchApi, BatchApiError, ByteStream};
use batchwork::pipeline::StageEngine;
use batchwork::pipeline::transform::ChunkLimits;
use batchwork::runner::{BatchRunner, ErrorStream, InputStream, OutputStream};
use batchwork::scheduler::Rescheduler;
use batchwork::store::dao::{SqliteWorkDao, WorkDao};
use batchwork::store::models::{ResumeInfo, Work, WorkConfig};
use batchwork::util::progress::ProgressTracker;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct FakeState {
    next_id: usize,
    files: HashMap<String, Vec<u8>>,
    /// Creation order; the listing serves them newest first.
    batches: Vec<Batch>,
    requests: Vec<CreateBatchRequest>,
    hidden: HashSet<String>,
    broken_files: HashSet<String>,
    deleted: Vec<String>,
    list_failures: usize,
    uploads: usize,
    cancel_on_listing: Option<CancellationToken>,
    cancel_on_content: Option<CancellationToken>,
}

impl FakeState {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}_{}", self.next_id)
    }

    fn batch_mut(&mut self, job_id: &str) -> &mut Batch {
        self.batches
            .iter_mut()
            .find(|b| b.id == job_id)
            .unwrap_or_else(|| panic!("unknown batch {job_id}"))
    }
}

/// Batch service kept entirely in memory.
#[derive(Default)]
pub struct FakeBatchApi {
    state: Mutex<FakeState>,
}

pub fn success_line(custom_id: &str, content: &str) -> String {
    json!({
        "id": format!("resp-{custom_id}"),
        "custom_id": custom_id,
        "response": {
            "status_code": 200,
            "request_id": format!("req-{custom_id}"),
            "body": {"choices": [{"message": {"role": "assistant", "content": content}}]}
        }
    })
    .to_string()
}

pub fn error_line(custom_id: &str, code: &str, message: &str) -> String {
    json!({
        "id": format!("resp-{custom_id}"),
        "custom_id": custom_id,
        "error": {"code": code, "message": message}
    })
    .to_string()
}

impl FakeBatchApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn batch_ids(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.batches.iter().map(|b| b.id.clone()).collect()
    }

    pub fn requests(&self) -> Vec<CreateBatchRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn uploads(&self) -> usize {
        self.state.lock().unwrap().uploads
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    /// Request lines of the input file behind `job_id`.
    pub fn input_lines(&self, job_id: &str) -> Vec<Value> {
        let mut state = self.state.lock().unwrap();
        let file_id = state.batch_mut(job_id).input_file_id.clone().unwrap();
        let bytes = state.files.get(&file_id).cloned().unwrap_or_default();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn store_file(state: &mut FakeState, lines: &[String]) -> String {
        let id = state.next("file");
        let mut body = lines.join("\n");
        body.push('\n');
        state.files.insert(id.clone(), body.into_bytes());
        id
    }

    /// Marks `job_id` completed with the given output (and optional error) lines.
    pub fn complete(&self, job_id: &str, output: &[String], errors: &[String]) {
        let mut state = self.state.lock().unwrap();
        let output_id = Self::store_file(&mut state, output);
        let error_id = (!errors.is_empty()).then(|| Self::store_file(&mut state, errors));
        let batch = state.batch_mut(job_id);
        batch.status = BatchState::Completed;
        batch.output_file_id = Some(output_id);
        batch.error_file_id = error_id;
    }

    /// Marks `job_id` failed, optionally with an error file.
    pub fn fail(&self, job_id: &str, errors: &[String]) {
        let mut state = self.state.lock().unwrap();
        let error_id = (!errors.is_empty()).then(|| Self::store_file(&mut state, errors));
        let batch = state.batch_mut(job_id);
        batch.status = BatchState::Failed;
        batch.error_file_id = error_id;
    }

    pub fn output_file(&self, job_id: &str) -> Option<String> {
        self.state.lock().unwrap().batch_mut(job_id).output_file_id.clone()
    }

    /// Removes `job_id` from every listing page.
    pub fn hide(&self, job_id: &str) {
        self.state.lock().unwrap().hidden.insert(job_id.to_string());
    }

    /// Makes the content stream of `file_id` break off halfway.
    pub fn break_file(&self, file_id: &str, broken: bool) {
        let mut state = self.state.lock().unwrap();
        if broken {
            state.broken_files.insert(file_id.to_string());
        } else {
            state.broken_files.remove(file_id);
        }
    }

    /// The next `n` listing calls answer 503.
    pub fn fail_next_listings(&self, n: usize) {
        self.state.lock().unwrap().list_failures = n;
    }

    /// Cancels `token` while serving the next listing page, as a SIGTERM would.
    pub fn cancel_during_listing(&self, token: &CancellationToken) {
        self.state.lock().unwrap().cancel_on_listing = Some(token.clone());
    }

    /// Cancels `token` while serving the next file body.
    pub fn cancel_during_download(&self, token: &CancellationToken) {
        self.state.lock().unwrap().cancel_on_content = Some(token.clone());
    }

    /// Batches owned by somebody else, created after everything so far.
    pub fn add_foreign_batches(&self, n: usize) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..n {
            let id = state.next("foreign");
            state.batches.push(Batch {
                id,
                status: BatchState::Completed,
                endpoint: None,
                input_file_id: None,
                output_file_id: None,
                error_file_id: None,
                completion_window: None,
                created_at: None,
                request_counts: None,
            });
        }
    }
}

#[async_trait]
impl BatchApi for FakeBatchApi {
    async fn upload_file(
        &self,
        file: &std::fs::File,
        filename: &str,
        progress: Arc<ProgressTracker>,
    ) -> anyhow::Result<FileObject> {
        let mut reader: &std::fs::File = file;
        let mut body = Vec::new();
        reader.read_to_end(&mut body)?;
        progress.add_total(body.len() as u64);
        progress.advance(body.len() as u64);

        let mut state = self.state.lock().unwrap();
        state.uploads += 1;
        let id = state.next("file");
        let bytes = body.len() as u64;
        state.files.insert(id.clone(), body);
        Ok(FileObject {
            id,
            bytes: Some(bytes),
            filename: Some(filename.to_string()),
            purpose: Some("batch".to_string()),
        })
    }

    async fn create_batch(&self, request: &CreateBatchRequest) -> anyhow::Result<Batch> {
        let mut state = self.state.lock().unwrap();
        let batch = Batch {
            id: state.next("batch"),
            status: BatchState::InProgress,
            endpoint: Some(request.endpoint.as_ref().to_string()),
            input_file_id: Some(request.input_file_id.clone()),
            output_file_id: None,
            error_file_id: None,
            completion_window: Some(request.completion_window.clone()),
            created_at: None,
            request_counts: None,
        };
        state.batches.push(batch.clone());
        state.requests.push(request.clone());
        Ok(batch)
    }

    async fn list_batches(&self, after: Option<&str>, limit: u32) -> anyhow::Result<BatchPage> {
        let mut state = self.state.lock().unwrap();
        if let Some(token) = state.cancel_on_listing.take() {
            token.cancel();
        }
        if state.list_failures > 0 {
            state.list_failures -= 1;
            return Err(BatchApiError::Status {
                status: StatusCode::SERVICE_UNAVAILABLE,
                body: "try again later".to_string(),
            }
            .into());
        }

        let visible: Vec<&Batch> = state
            .batches
            .iter()
            .rev()
            .filter(|b| !state.hidden.contains(&b.id))
            .collect();
        let start = after
            .and_then(|cursor| visible.iter().position(|b| b.id == cursor))
            .map_or(0, |index| index + 1);
        let end = (start + limit as usize).min(visible.len());
        let data: Vec<Batch> = visible[start..end].iter().map(|b| (*b).clone()).collect();

        Ok(BatchPage {
            has_more: end < visible.len(),
            last_id: data.last().map(|b| b.id.clone()),
            data,
        })
    }

    async fn file_content(&self, file_id: &str) -> anyhow::Result<ByteStream> {
        let mut state = self.state.lock().unwrap();
        if let Some(token) = state.cancel_on_content.take() {
            token.cancel();
        }
        let body = state
            .files
            .get(file_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no file {file_id}"))?;

        if state.broken_files.contains(file_id) {
            let half = Bytes::from(body[..body.len() / 2].to_vec());
            let parts: Vec<io::Result<Bytes>> = vec![
                Ok(half),
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset")),
            ];
            return Ok(stream::iter(parts).boxed());
        }

        // Deliver in small pieces so lines straddle chunk boundaries.
        let pieces: Vec<io::Result<Bytes>> = body
            .chunks(7)
            .map(|piece| Ok(Bytes::from(piece.to_vec())))
            .collect();
        Ok(stream::iter(pieces).boxed())
    }

    async fn delete_file(&self, file_id: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.files.remove(file_id);
        state.deleted.push(file_id.to_string());
        Ok(())
    }
}

/// Runner with a fixed dataset that records everything it is handed.
pub struct RecordingRunner {
    config: WorkConfig,
    items: Vec<BatchInputItem>,
    fail_downloads: bool,
    pub outputs: Mutex<Vec<BatchOutputItem>>,
    pub errors: Mutex<Vec<BatchErrorItem>>,
}

impl RecordingRunner {
    pub fn new(config: WorkConfig, count: usize) -> Self {
        let items = (0..count)
            .map(|i| {
                BatchInputItem::new(
                    format!("item-{i}"),
                    json!({"model": "gpt-4o-mini", "messages": [{"role": "user", "content": format!("question {i}")}]}),
                )
            })
            .collect();
        Self {
            config,
            items,
            fail_downloads: false,
            outputs: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn failing_downloads(mut self) -> Self {
        self.fail_downloads = true;
        self
    }

    pub fn output_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .outputs
            .lock()
            .unwrap()
            .iter()
            .map(|item| item.custom_id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl BatchRunner for RecordingRunner {
    fn work_config(&self) -> WorkConfig {
        self.config.clone()
    }

    fn upload(&self) -> InputStream<'_> {
        stream::iter(self.items.clone().into_iter().map(Ok)).boxed()
    }

    async fn download(&self, items: OutputStream<'_>) -> anyhow::Result<()> {
        if self.fail_downloads {
            anyhow::bail!("downstream store rejected results");
        }
        let items: Vec<BatchOutputItem> = items.try_collect().await?;
        self.outputs.lock().unwrap().extend(items);
        Ok(())
    }

    async fn download_error(&self, items: ErrorStream<'_>) -> anyhow::Result<()> {
        let items: Vec<BatchErrorItem> = items.try_collect().await?;
        self.errors.lock().unwrap().extend(items);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CronEvent {
    Registered(Uuid),
    Unregistered(Uuid),
}

#[derive(Default)]
pub struct RecordingRescheduler {
    events: Mutex<Vec<CronEvent>>,
    fail_unregister: bool,
}

impl RecordingRescheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_unregister() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::default(),
            fail_unregister: true,
        })
    }

    pub fn events(&self) -> Vec<CronEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Whether the last event for `id` left it registered.
    pub fn is_registered(&self, id: Uuid) -> bool {
        self.events
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|event| match event {
                CronEvent::Registered(x) if *x == id => Some(true),
                CronEvent::Unregistered(x) if *x == id => Some(false),
                _ => None,
            })
            .unwrap_or(false)
    }
}

#[async_trait]
impl Rescheduler for RecordingRescheduler {
    async fn register(&self, work: &Work) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(CronEvent::Registered(work.id));
        Ok(())
    }

    async fn unregister(&self, work_id: Uuid) -> anyhow::Result<()> {
        if self.fail_unregister {
            anyhow::bail!("crontab is not writable");
        }
        self.events
            .lock()
            .unwrap()
            .push(CronEvent::Unregistered(work_id));
        Ok(())
    }
}

pub fn resume_info(runner_key: &str) -> ResumeInfo {
    ResumeInfo {
        executable: PathBuf::from("/usr/bin/true"),
        work_dir: std::env::temp_dir(),
        runner_key: runner_key.to_string(),
        runtime: "batchwork/test".to_string(),
    }
}

pub struct Harness {
    pub dao: Arc<SqliteWorkDao>,
    pub api: Arc<FakeBatchApi>,
    pub rescheduler: Arc<RecordingRescheduler>,
    pub engine: StageEngine,
}

pub struct HarnessOptions {
    pub limits: ChunkLimits,
    pub page_size: u32,
    pub cancel: CancellationToken,
    pub rescheduler: Arc<RecordingRescheduler>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            limits: ChunkLimits {
                max_bytes: 1 << 20,
                max_lines: 2,
            },
            page_size: 100,
            cancel: CancellationToken::new(),
            rescheduler: RecordingRescheduler::new(),
        }
    }
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_options(HarnessOptions::default()).await
    }

    pub async fn with_options(options: HarnessOptions) -> Self {
        let dao = Arc::new(SqliteWorkDao::in_memory().await.unwrap());
        let api = FakeBatchApi::new();
        let engine = StageEngine::builder(
            Arc::clone(&dao) as Arc<dyn WorkDao>,
            Arc::clone(&api) as Arc<dyn BatchApi>,
            Arc::clone(&options.rescheduler) as Arc<dyn Rescheduler>,
        )
        .with_chunk_limits(options.limits)
        .with_page_size(options.page_size)
        .with_cancellation(options.cancel)
        .build();

        Self {
            dao,
            api,
            rescheduler: options.rescheduler,
            engine,
        }
    }

    pub async fn create(&self, runner: &RecordingRunner) -> Work {
        self.engine
            .create_work(runner.work_config(), resume_info("recording"))
            .await
            .unwrap()
    }

    pub async fn work(&self, id: Uuid) -> Work {
        self.dao.get_work(id).await.unwrap().unwrap()
    }

    /// Job ids of `work` in submission order.
    pub fn jobs_of(&self, work: &Work) -> Vec<String> {
        let ids = work.job_ids();
        self.api
            .batch_ids()
            .into_iter()
            .filter(|id| ids.contains(id))
            .collect()
    }

    pub fn metadata_of(&self, job_index: usize) -> BTreeMap<String, String> {
        self.api.requests()[job_index].metadata.clone()
    }
}

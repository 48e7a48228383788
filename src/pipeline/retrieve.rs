//! Result retriever: streams an output or error file, decodes each line and
//! hands the lazy item sequence to the runner.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, anyhow};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use tokio::io::AsyncBufReadExt;
use tokio_util::io::StreamReader;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clients::batch_api::models::BatchRequestOutputItem;
use crate::clients::{BatchApi, ByteStream};
use crate::runner::BatchRunner;
use crate::store::dao::WorkDao;
use crate::util::progress::{ProgressReporter, ProgressTracker};

/// Splits a byte stream into decoded result lines; blank lines are skipped.
pub fn decode_lines(
    stream: ByteStream,
    tracker: Arc<ProgressTracker>,
) -> BoxStream<'static, anyhow::Result<BatchRequestOutputItem>> {
    let counted = stream.inspect_ok(move |bytes| tracker.advance(bytes.len() as u64));
    let lines = StreamReader::new(counted).lines();

    futures::stream::try_unfold((lines, 0usize), |(mut lines, mut line_no)| async move {
        loop {
            let Some(line) = lines
                .next_line()
                .await
                .context("result stream broke off")?
            else {
                return Ok(None);
            };
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let item: BatchRequestOutputItem = serde_json::from_str(&line)
                .with_context(|| format!("invalid result line {line_no}"))?;
            return Ok(Some((item, (lines, line_no))));
        }
    })
    .boxed()
}

#[derive(Clone)]
pub struct Retriever {
    api: Arc<dyn BatchApi>,
    dao: Arc<dyn WorkDao>,
    progress_every: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Output,
    Error,
}

impl Retriever {
    pub fn new(api: Arc<dyn BatchApi>, dao: Arc<dyn WorkDao>, progress_every: Duration) -> Self {
        Self {
            api,
            dao,
            progress_every,
        }
    }

    /// Streams `file_id` of `job_id` into `runner.download`.
    ///
    /// # Errors
    /// Fails when the file cannot be read to its end or the runner fails; the
    /// job must then stay undone.
    pub async fn dispatch_output(
        &self,
        work_id: Uuid,
        job_id: &str,
        file_id: &str,
        runner: &dyn BatchRunner,
    ) -> anyhow::Result<()> {
        self.dispatch(work_id, job_id, file_id, runner, FileKind::Output)
            .await
    }

    /// Streams the error file `file_id` of `job_id` into `runner.download_error`.
    ///
    /// # Errors
    /// Same as [`Retriever::dispatch_output`].
    pub async fn dispatch_errors(
        &self,
        work_id: Uuid,
        job_id: &str,
        file_id: &str,
        runner: &dyn BatchRunner,
    ) -> anyhow::Result<()> {
        self.dispatch(work_id, job_id, file_id, runner, FileKind::Error)
            .await
    }

    async fn dispatch(
        &self,
        work_id: Uuid,
        job_id: &str,
        file_id: &str,
        runner: &dyn BatchRunner,
        kind: FileKind,
    ) -> anyhow::Result<()> {
        debug!(work_id = %work_id, job_id, file_id, ?kind, "retrieving result file");
        let bytes = self.api.file_content(file_id).await?;

        let tracker = ProgressTracker::new(format!("downloading {file_id}"), 0);
        let reporter = ProgressReporter::spawn(
            Arc::clone(&self.dao),
            work_id,
            Arc::clone(&tracker),
            self.progress_every,
        );

        // The runner may swallow stream errors; keep the first one so the job stays undone.
        let first_error: Arc<Mutex<Option<anyhow::Error>>> = Arc::default();
        let sink = Arc::clone(&first_error);
        let lines = decode_lines(bytes, Arc::clone(&tracker)).map_err(move |err| {
            let shown = anyhow!("{err:#}");
            if let Ok(mut slot) = sink.lock() {
                slot.get_or_insert(err);
            }
            shown
        });

        let job = job_id.to_string();
        let outcome = match kind {
            FileKind::Output => {
                runner
                    .download(lines.map_ok(move |item| item.into_output(&job)).boxed())
                    .await
            }
            FileKind::Error => {
                runner
                    .download_error(lines.map_ok(move |item| item.into_error(&job)).boxed())
                    .await
            }
        };
        reporter.finish().await;

        let stream_error = first_error.lock().ok().and_then(|mut slot| slot.take());
        if let Some(err) = stream_error {
            return Err(err.context(format!(
                "result file {file_id} of job {job_id} could not be read completely"
            )));
        }
        outcome.with_context(|| format!("runner failed to consume {file_id} of job {job_id}"))?;

        info!(
            work_id = %work_id,
            job_id,
            file_id,
            bytes = tracker.current(),
            ?kind,
            "result file dispatched"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;
    use std::io;

    fn byte_stream(parts: Vec<io::Result<&'static str>>) -> ByteStream {
        stream::iter(
            parts
                .into_iter()
                .map(|p| p.map(|s| Bytes::from_static(s.as_bytes()))),
        )
        .boxed()
    }

    #[tokio::test]
    async fn lines_split_across_network_chunks_are_reassembled() {
        let tracker = ProgressTracker::new("downloading", 0);
        let stream = byte_stream(vec![
            Ok(r#"{"id":"r1","custom_id":"a","response":{"status_code":200,"body":{}}}"#),
            Ok("\n\n"),
            Ok(r#"{"id":"r2","custom_id":"b","#),
            Ok(r#""error":{"code":"x","message":"y"}}"#),
            Ok("\n"),
        ]);

        let items: Vec<_> = decode_lines(stream, Arc::clone(&tracker))
            .try_collect()
            .await
            .unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].custom_id, "a");
        assert_eq!(items[1].error.as_ref().and_then(|e| e.code.as_deref()), Some("x"));
        assert!(tracker.current() > 0);
    }

    #[tokio::test]
    async fn broken_stream_surfaces_an_error() {
        let tracker = ProgressTracker::new("downloading", 0);
        let stream = byte_stream(vec![
            Ok("{\"id\":\"r1\",\"custom_id\":\"a\"}\n"),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ]);

        let results: Vec<_> = decode_lines(stream, tracker).collect().await;
        assert!(results[0].is_ok());
        assert!(results.iter().any(Result::is_err));
    }
}

//! Dataset transformer: renders runner input into request lines, splits them
//! into size-bounded chunk files and fingerprints the whole stream.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};

use anyhow::Context;
use futures::TryStreamExt;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::clients::batch_api::models::{BatchInputItem, BatchRequestInputItem};
use crate::config::{DEFAULT_MAX_CHUNK_BYTES, DEFAULT_MAX_CHUNK_LINES};
use crate::runner::InputStream;
use crate::store::models::Endpoint;
use crate::util::error::WorkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLimits {
    pub max_bytes: u64,
    pub max_lines: usize,
}

impl Default for ChunkLimits {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_CHUNK_BYTES,
            max_lines: DEFAULT_MAX_CHUNK_LINES,
        }
    }
}

/// A finalized chunk file, rewound to its start.
#[derive(Debug)]
pub struct Chunk {
    pub file: File,
    pub bytes: u64,
    pub lines: usize,
}

#[derive(Debug)]
pub struct TransformedDataset {
    /// Hex SHA-256 over every rendered line, newline included, in order.
    pub fingerprint: String,
    pub chunks: Vec<Chunk>,
    pub total_lines: usize,
}

struct OpenChunk {
    writer: BufWriter<File>,
    bytes: u64,
    lines: usize,
}

impl OpenChunk {
    fn create() -> anyhow::Result<Self> {
        let file = tempfile::tempfile().context("failed to create chunk file")?;
        Ok(Self {
            writer: BufWriter::new(file),
            bytes: 0,
            lines: 0,
        })
    }

    fn fits(&self, line_len: u64, limits: ChunkLimits) -> bool {
        self.lines < limits.max_lines && self.bytes + line_len <= limits.max_bytes
    }

    fn push(&mut self, line: &[u8]) -> anyhow::Result<()> {
        self.writer
            .write_all(line)
            .context("failed to write chunk line")?;
        self.bytes += line.len() as u64;
        self.lines += 1;
        Ok(())
    }

    fn finish(self) -> anyhow::Result<Chunk> {
        let mut file = self
            .writer
            .into_inner()
            .map_err(|err| err.into_error())
            .context("failed to flush chunk file")?;
        file.seek(SeekFrom::Start(0))
            .context("failed to rewind chunk file")?;
        Ok(Chunk {
            file,
            bytes: self.bytes,
            lines: self.lines,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DatasetTransformer {
    endpoint: Endpoint,
    limits: ChunkLimits,
}

impl DatasetTransformer {
    #[must_use]
    pub fn new(endpoint: Endpoint, limits: ChunkLimits) -> Self {
        Self { endpoint, limits }
    }

    /// Renders one input item into its request line, trailing newline included.
    ///
    /// Object keys inside `body` are emitted in sorted order, so identical
    /// logical input always renders to identical bytes.
    fn render(&self, item: BatchInputItem) -> anyhow::Result<Vec<u8>> {
        let custom_id = item.id.clone();
        let mut line = serde_json::to_vec(&BatchRequestInputItem::from_input(self.endpoint, item))
            .with_context(|| format!("failed to render request {custom_id}"))?;
        line.push(b'\n');
        Ok(line)
    }

    /// Consumes the whole input stream. Any item or rendering error aborts the
    /// transform and discards every chunk written so far.
    ///
    /// # Errors
    /// `WorkError::LineTooLarge` when one rendered line alone exceeds the byte cap.
    pub async fn transform(&self, mut items: InputStream<'_>) -> Result<TransformedDataset, WorkError> {
        let mut hasher = Sha256::new();
        let mut chunks = Vec::new();
        let mut current: Option<OpenChunk> = None;
        let mut total_lines = 0usize;

        while let Some(item) = items
            .try_next()
            .await
            .context("runner failed to produce input item")?
        {
            let line = self.render(item)?;
            let len = line.len() as u64;
            total_lines += 1;

            if len > self.limits.max_bytes {
                return Err(WorkError::LineTooLarge {
                    line: total_lines,
                    size: line.len(),
                    limit: usize::try_from(self.limits.max_bytes).unwrap_or(usize::MAX),
                });
            }

            hasher.update(&line);

            if current
                .as_ref()
                .is_some_and(|chunk| !chunk.fits(len, self.limits))
            {
                if let Some(full) = current.take() {
                    let chunk = full.finish()?;
                    debug!(index = chunks.len(), bytes = chunk.bytes, lines = chunk.lines, "chunk sealed");
                    chunks.push(chunk);
                }
            }

            if current.is_none() {
                current = Some(OpenChunk::create()?);
            }
            if let Some(chunk) = current.as_mut() {
                chunk.push(&line)?;
            }
        }

        if let Some(last) = current.take() {
            chunks.push(last.finish()?);
        }

        let fingerprint = format!("{:x}", hasher.finalize());
        info!(
            fingerprint = %fingerprint,
            chunks = chunks.len(),
            lines = total_lines,
            "dataset transformed"
        );

        Ok(TransformedDataset {
            fingerprint,
            chunks,
            total_lines,
        })
    }
}

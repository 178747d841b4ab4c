//! Data artifacts.
//!
//! Table rows are written as independently compressed chunks appended to
//! artifact files. A new artifact is started once the current one would
//! grow past the configured size. Chunks are addressed by the
//! [`DataRange`] recorded in the TOC.

use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

use crate::catalog::ModificationState;
use crate::compression::Codec;
use crate::manifest::ArtifactInfo;
use crate::storage::{artifact_key, StorageBackend};
use crate::toc::DataRange;
use crate::Result;

/// Appends compressed chunks to rotating artifact files
pub struct ArtifactWriter {
    storage: Arc<dyn StorageBackend>,
    backup_id: String,
    codec: Codec,
    max_bytes: u64,
    index: u32,
    buffer: Vec<u8>,
    chunks: u32,
    written: Vec<ArtifactInfo>,
}

impl ArtifactWriter {
    pub fn new(storage: Arc<dyn StorageBackend>, backup_id: impl Into<String>, codec: Codec, max_bytes: u64) -> Self {
        Self {
            storage,
            backup_id: backup_id.into(),
            codec,
            max_bytes: max_bytes.max(1),
            index: 0,
            buffer: Vec::new(),
            chunks: 0,
            written: Vec::new(),
        }
    }

    fn current_key(&self) -> String {
        artifact_key(&self.backup_id, self.index, self.codec.extension())
    }

    /// Codec chunks must be compressed with before
    /// [`ArtifactWriter::append_compressed`].
    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Append a chunk already compressed with [`ArtifactWriter::codec`].
    pub async fn append_compressed(
        &mut self,
        chunk: Bytes,
        row_count: u64,
        modification: Option<ModificationState>,
    ) -> Result<DataRange> {
        if !self.buffer.is_empty() && (self.buffer.len() + chunk.len()) as u64 > self.max_bytes {
            self.flush().await?;
        }

        let range = DataRange {
            artifact: self.current_key(),
            offset: self.buffer.len() as u64,
            length: chunk.len() as u64,
            rows: row_count,
            modification,
        };
        self.buffer.extend_from_slice(&chunk);
        self.chunks += 1;
        Ok(range)
    }

    /// Upload the current artifact and start the next one.
    async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let key = self.current_key();
        let data = Bytes::from(std::mem::take(&mut self.buffer));
        let size = data.len() as u64;
        self.storage.put(&key, data).await?;
        debug!("Wrote artifact {} ({} bytes, {} chunks)", key, size, self.chunks);

        self.written.push(ArtifactInfo {
            key,
            size,
            chunks: self.chunks,
        });
        self.index += 1;
        self.chunks = 0;
        Ok(())
    }

    /// Flush the last artifact and return every artifact written.
    pub async fn finish(mut self) -> Result<Vec<ArtifactInfo>> {
        self.flush().await?;
        Ok(self.written)
    }
}

/// Read and decompress one chunk.
pub async fn read_chunk(storage: &dyn StorageBackend, range: &DataRange) -> Result<Bytes> {
    let compressed = storage
        .get_range(&range.artifact, range.offset..range.offset + range.length)
        .await?;
    Codec::for_key(&range.artifact).decompress(&compressed)
}

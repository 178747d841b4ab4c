//! Compression of table data chunks.
//!
//! Each relation's rows are compressed as an independent frame so a
//! restore can decompress any chunk from its byte range alone.

use bytes::Bytes;
use std::io::{Read, Write};

use crate::config::CompressionType;
use crate::{Error, Result};

/// Default compression level for zstd
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Chunk codec: algorithm plus level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    pub kind: CompressionType,
    pub level: i32,
}

impl Codec {
    pub fn new(kind: CompressionType, level: i32) -> Self {
        Self { kind, level }
    }

    /// Codec used to read an artifact, chosen by its key's extension.
    pub fn for_key(key: &str) -> Self {
        Self::new(detect_from_extension(key), DEFAULT_ZSTD_LEVEL)
    }

    /// Artifact key suffix
    pub fn extension(&self) -> &'static str {
        extension(self.kind)
    }

    /// Start a chunk that is fed incrementally.
    pub fn encoder(&self) -> Result<ChunkEncoder> {
        let inner = match self.kind {
            CompressionType::None => EncoderInner::Plain(Vec::new()),
            CompressionType::Zstd => EncoderInner::Zstd(
                zstd::Encoder::new(Vec::new(), self.level)
                    .map_err(|e| Error::Compression(format!("Failed to create zstd encoder: {}", e)))?,
            ),
            CompressionType::Lz4 => EncoderInner::Lz4(lz4_flex::frame::FrameEncoder::new(Vec::new())),
        };
        Ok(ChunkEncoder {
            inner,
            input_bytes: 0,
        })
    }

    pub fn compress(&self, data: &[u8]) -> Result<Bytes> {
        let mut encoder = self.encoder()?;
        encoder.write(data)?;
        encoder.finish()
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Bytes> {
        let out = match self.kind {
            CompressionType::None => data.to_vec(),
            CompressionType::Zstd => decompress_zstd(data)?,
            CompressionType::Lz4 => decompress_lz4(data)?,
        };
        Ok(Bytes::from(out))
    }
}

enum EncoderInner {
    Plain(Vec<u8>),
    Zstd(zstd::Encoder<'static, Vec<u8>>),
    Lz4(lz4_flex::frame::FrameEncoder<Vec<u8>>),
}

/// One compressed frame built from a stream of pieces
pub struct ChunkEncoder {
    inner: EncoderInner,
    input_bytes: u64,
}

impl ChunkEncoder {
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let written = match &mut self.inner {
            EncoderInner::Plain(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            EncoderInner::Zstd(encoder) => encoder.write_all(data),
            EncoderInner::Lz4(encoder) => encoder.write_all(data),
        };
        written.map_err(|e| Error::Compression(format!("Failed to write to encoder: {}", e)))?;
        self.input_bytes += data.len() as u64;
        Ok(())
    }

    /// Uncompressed bytes written so far.
    pub fn input_bytes(&self) -> u64 {
        self.input_bytes
    }

    pub fn finish(self) -> Result<Bytes> {
        let out = match self.inner {
            EncoderInner::Plain(buf) => buf,
            EncoderInner::Zstd(encoder) => encoder
                .finish()
                .map_err(|e| Error::Compression(format!("Failed to finish zstd compression: {}", e)))?,
            EncoderInner::Lz4(encoder) => encoder
                .finish()
                .map_err(|e| Error::Compression(format!("Failed to finish lz4 compression: {}", e)))?,
        };
        Ok(Bytes::from(out))
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(CompressionType::Zstd, DEFAULT_ZSTD_LEVEL)
    }
}

/// Get file extension for compression type
pub fn extension(compression: CompressionType) -> &'static str {
    match compression {
        CompressionType::None => "",
        CompressionType::Zstd => ".zst",
        CompressionType::Lz4 => ".lz4",
    }
}

/// Detect compression type from file extension
pub fn detect_from_extension(key: &str) -> CompressionType {
    if key.ends_with(".zst") {
        CompressionType::Zstd
    } else if key.ends_with(".lz4") {
        CompressionType::Lz4
    } else {
        CompressionType::None
    }
}

fn decompress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = zstd::Decoder::new(data)
        .map_err(|e| Error::Compression(format!("Failed to create zstd decoder: {}", e)))?;

    let mut output = Vec::new();
    decoder
        .read_to_end(&mut output)
        .map_err(|e| Error::Compression(format!("Failed to decompress zstd chunk: {}", e)))?;

    Ok(output)
}

fn decompress_lz4(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = lz4_flex::frame::FrameDecoder::new(data);
    let mut output = Vec::new();
    decoder
        .read_to_end(&mut output)
        .map_err(|e| Error::Compression(format!("Failed to decompress lz4 chunk: {}", e)))?;
    Ok(output)
}

//! Compression unit tests.
//!
//! Tests for chunk codecs covering:
//! - All compression algorithms (zstd, lz4, none)
//! - Codec detection from artifact keys
//! - Error handling for corrupted chunks

use segbackup_core::compression::{detect_from_extension, Codec};
use segbackup_core::config::CompressionType;

fn copy_rows(rows: usize) -> Vec<u8> {
    (0..rows)
        .map(|i| format!("{}\tname-{}\t{}\n", i, i % 17, i * 3))
        .collect::<String>()
        .into_bytes()
}

#[test]
fn compression_every_codec_restores_copy_text() {
    let data = copy_rows(500);
    for kind in [CompressionType::None, CompressionType::Zstd, CompressionType::Lz4] {
        let codec = Codec::new(kind, 3);
        let compressed = codec.compress(&data).expect("Compression failed");
        let decompressed = codec.decompress(&compressed).expect("Decompression failed");
        assert_eq!(decompressed.as_ref(), data.as_slice(), "codec {:?}", kind);
    }
}

#[test]
fn compression_zstd_shrinks_repetitive_rows() {
    let data = copy_rows(5000);
    let compressed = Codec::default().compress(&data).expect("Compression failed");

    assert!(
        compressed.len() < data.len() / 4,
        "Expected compression ratio > 4:1, got {}:1",
        data.len() / compressed.len()
    );
}

#[test]
fn compression_empty_chunk() {
    for kind in [CompressionType::None, CompressionType::Zstd, CompressionType::Lz4] {
        let codec = Codec::new(kind, 1);
        let compressed = codec.compress(b"").expect("Compression failed");
        assert!(codec.decompress(&compressed).expect("Decompression failed").is_empty());
    }
}

#[test]
fn compression_detects_codec_from_artifact_key() {
    assert_eq!(detect_from_extension("b1/data/artifact-000000.dat.zst"), CompressionType::Zstd);
    assert_eq!(detect_from_extension("b1/data/artifact-000000.dat.lz4"), CompressionType::Lz4);
    assert_eq!(detect_from_extension("b1/data/artifact-000000.dat"), CompressionType::None);
    assert_eq!(Codec::for_key("x.dat.lz4").kind, CompressionType::Lz4);
}

#[test]
fn compression_corrupted_chunk_is_an_error() {
    let garbage = b"definitely not a compressed frame";
    assert!(Codec::new(CompressionType::Zstd, 3).decompress(garbage).is_err());
}

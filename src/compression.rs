// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! zstd compression for optimized envelopes.
//!
//! Plaintext is compressed *before* sealing (ciphertext does not compress).
//! Decompression detects the zstd magic bytes, so bytes that were never
//! compressed pass through unchanged. Serialized JSON can never start with
//! the magic (`0x28` is `(`), which makes the check unambiguous for
//! envelope payloads.
//!
//! # Example
//!
//! ```
//! use budget_sync::compression::{compress_bytes, decompress_bytes, is_compressed};
//!
//! let data = br#"{"transactions":[1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1]}"#;
//! let packed = compress_bytes(data).unwrap();
//! assert!(is_compressed(&packed));
//! assert_eq!(decompress_bytes(&packed).unwrap(), data.to_vec());
//!
//! // Legacy plain bytes pass through
//! assert_eq!(decompress_bytes(b"{}").unwrap(), b"{}".to_vec());
//! ```

/// Zstd magic bytes (little-endian): 0xFD2FB528
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Default compression level (3 is a good balance of speed/ratio)
const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Upper bound on decompressed payload size (64 MiB).
const MAX_DECOMPRESSED_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("compression failed: {0}")]
    CompressFailed(String),

    #[error("decompression failed: {0}")]
    DecompressFailed(String),
}

/// Check if data is zstd-compressed by checking magic bytes.
#[inline]
#[must_use]
pub fn is_compressed(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == ZSTD_MAGIC
}

/// Compress bytes at the default level.
pub fn compress_bytes(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    compress_bytes_with_level(data, DEFAULT_COMPRESSION_LEVEL)
}

/// Compress bytes with a custom level (1-22).
pub fn compress_bytes_with_level(data: &[u8], level: i32) -> Result<Vec<u8>, CompressionError> {
    zstd::encode_all(data, level).map_err(|e| CompressionError::CompressFailed(e.to_string()))
}

/// Decompress if the magic header is present, otherwise return the input.
pub fn decompress_bytes(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    if !is_compressed(data) {
        return Ok(data.to_vec());
    }
    zstd::bulk::decompress(data, MAX_DECOMPRESSED_BYTES)
        .map_err(|e| CompressionError::DecompressFailed(e.to_string()))
}

/// Compressed size as a fraction of the original (lower is better).
#[must_use]
pub fn compression_ratio(original: usize, compressed: usize) -> f64 {
    if original == 0 {
        return 1.0;
    }
    compressed as f64 / original as f64
}

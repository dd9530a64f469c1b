//! Chunk compression
//!
//! Chunks are compressed as a whole once sealed. The codec is chosen per
//! segment, but every on-disk frame records the codec actually used, since a
//! chunk that does not shrink enough is stored raw.

use crate::{Result, StoreError};
use serde::{Deserialize, Serialize};

/// Compression algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CompressionType {
    /// Stored as-is
    None = 0,
    /// LZ4 block format (size prepended)
    Lz4 = 1,
    /// Zstandard
    Zstd = 2,
}

impl TryFrom<u8> for CompressionType {
    type Error = StoreError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Lz4),
            2 => Ok(CompressionType::Zstd),
            _ => Err(StoreError::InvalidFormat(format!(
                "Invalid compression type: {}",
                value
            ))),
        }
    }
}

/// Compression configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Algorithm
    pub kind: CompressionType,
    /// Compression level (used by zstd)
    pub level: u8,
    /// Keep compressed output only if it is at most this percentage of the input
    pub threshold: u8,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            kind: CompressionType::Lz4,
            level: crate::config::COMPRESSION_LEVEL,
            threshold: crate::config::COMPRESSION_THRESHOLD,
        }
    }
}

impl CompressionConfig {
    pub fn new(kind: CompressionType, level: u8, threshold: u8) -> Self {
        Self {
            kind,
            level,
            threshold,
        }
    }

    /// Configuration that never compresses
    pub fn uncompressed() -> Self {
        Self::new(CompressionType::None, 0, 100)
    }

    pub fn validate(&self) -> Result<()> {
        if self.threshold == 0 || self.threshold > 100 {
            return Err(StoreError::Config(format!(
                "compression threshold must be within 1..=100, got {}",
                self.threshold
            )));
        }
        if self.kind == CompressionType::Zstd && self.level > 22 {
            return Err(StoreError::Config(format!(
                "zstd level must be at most 22, got {}",
                self.level
            )));
        }
        Ok(())
    }
}

/// Compress `input`, returning the codec actually used and the output bytes
pub fn compress(config: &CompressionConfig, input: &[u8]) -> Result<(CompressionType, Vec<u8>)> {
    let compressed = match config.kind {
        CompressionType::None => return Ok((CompressionType::None, input.to_vec())),
        CompressionType::Lz4 => lz4_flex::compress_prepend_size(input),
        CompressionType::Zstd => zstd::stream::encode_all(input, config.level as i32)
            .map_err(|e| StoreError::Compression(e.to_string()))?,
    };

    // Not worth it, store raw
    if compressed.len() * 100 > input.len() * config.threshold as usize {
        return Ok((CompressionType::None, input.to_vec()));
    }

    Ok((config.kind, compressed))
}

/// Decompress `input` produced by `compress` with codec `kind`
pub fn decompress(kind: CompressionType, input: &[u8], raw_len: usize) -> Result<Vec<u8>> {
    let output = match kind {
        CompressionType::None => input.to_vec(),
        CompressionType::Lz4 => lz4_flex::decompress_size_prepended(input)
            .map_err(|e| StoreError::Compression(e.to_string()))?,
        CompressionType::Zstd => zstd::stream::decode_all(input)
            .map_err(|e| StoreError::Compression(e.to_string()))?,
    };

    if output.len() != raw_len {
        return Err(StoreError::Corruption(format!(
            "decompressed {} bytes, expected {}",
            output.len(),
            raw_len
        )));
    }

    Ok(output)
}

//! Segment writer configuration

use crate::compression::CompressionConfig;
use crate::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// When a periodic durability push should actually fsync
///
/// A push is warranted once there is written-but-unsynced data covering the
/// requested serial number and either threshold is reached. With both at
/// zero every such push syncs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushPolicy {
    /// Unsynced bytes (data + index) that warrant an fsync
    pub max_unsynced_bytes: u64,
    /// Distance between the requested and the last durable serial number
    /// that warrants an fsync
    pub max_serial_lag: u64,
}

impl FlushPolicy {
    /// Sync whenever anything covered is pending
    pub fn eager() -> Self {
        Self::default()
    }

    pub fn should_flush(&self, unsynced_bytes: u64, serial_lag: u64) -> bool {
        unsynced_bytes >= self.max_unsynced_bytes || serial_lag >= self.max_serial_lag
    }
}

/// Segment writer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Chunk compression
    pub compression: CompressionConfig,
    /// Seal the active chunk when the next entry would push it past this size
    pub max_chunk_bytes: usize,
    /// Policy for `flush_pending_chunks`
    pub flush_policy: FlushPolicy,
    /// Verify chunk checksums when reading from disk
    pub verify_checksums: bool,
    /// Compression worker threads
    pub compression_threads: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            compression: CompressionConfig::default(),
            max_chunk_bytes: crate::config::MAX_CHUNK_BYTES,
            flush_policy: FlushPolicy::default(),
            verify_checksums: true,
            compression_threads: crate::config::COMPRESSION_THREADS,
        }
    }
}

impl WriterConfig {
    pub fn validate(&self) -> Result<()> {
        self.compression.validate()?;
        if self.max_chunk_bytes == 0 {
            return Err(StoreError::Config("max_chunk_bytes must be positive".into()));
        }
        if self.max_chunk_bytes > u32::MAX as usize {
            return Err(StoreError::Config(format!(
                "max_chunk_bytes {} does not fit a chunk frame",
                self.max_chunk_bytes
            )));
        }
        if self.compression_threads == 0 {
            return Err(StoreError::Config(
                "compression_threads must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Load from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        let config: Self =
            serde_json::from_slice(&data).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

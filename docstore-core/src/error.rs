//! Error types for DocStore

use thiserror::Error;

/// Result type alias for DocStore operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// DocStore error types
#[derive(Error, Debug)]
pub enum StoreError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation not allowed in the current state (e.g. append after freeze)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Chunk id was never assigned by this segment
    #[error("Unknown chunk: {0}")]
    UnknownChunk(u32),

    /// The segment hit a fatal writeback or compression failure
    #[error("Segment faulted: {0}")]
    Faulted(String),
}

impl StoreError {
    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::Corruption(_) | StoreError::ChecksumMismatch { .. }
        )
    }

    /// Check if error leaves the segment unusable for further writes
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::Io(_) | StoreError::Compression(_) | StoreError::Faulted(_)
        )
    }
}

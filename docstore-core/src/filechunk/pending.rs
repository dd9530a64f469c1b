//! Written-but-not-yet-durable chunk bookkeeping

use crate::{ChunkId, SerialNum};

/// Chunks handed to the OS by one writer pass, awaiting fsync
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChunk {
    /// First chunk id written by the pass
    pub first_chunk_id: ChunkId,
    /// Last chunk id written by the pass
    pub last_chunk_id: ChunkId,
    /// Index file byte extent
    pub idx_offset: u64,
    pub idx_len: u64,
    /// Data file byte extent
    pub dat_offset: u64,
    pub dat_len: u64,
    /// Highest serial number covered
    pub last_serial: SerialNum,
}

impl PendingChunk {
    pub fn dat_end(&self) -> u64 {
        self.dat_offset + self.dat_len
    }

    pub fn idx_end(&self) -> u64 {
        self.idx_offset + self.idx_len
    }
}

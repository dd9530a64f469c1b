//! Core types for DocStore

use serde::{Deserialize, Serialize};

/// Local document id
pub type Lid = u32;

/// Write-ahead log position of an entry
pub type SerialNum = u64;

/// Position of a chunk within its segment
pub type ChunkId = u32;

/// Handle returned by `append`, stored by the caller's lid map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LidInfo {
    /// Chunk holding the entry
    pub chunk_id: ChunkId,
    /// Byte offset of the entry within the uncompressed chunk body
    pub offset: u32,
    /// Payload size in bytes
    pub size: u32,
}

impl LidInfo {
    /// Create a new handle
    pub fn new(chunk_id: ChunkId, offset: u32, size: u32) -> Self {
        Self {
            chunk_id,
            offset,
            size,
        }
    }
}

/// A handle paired with the lid it was stored for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LidInfoWithLid {
    pub lid: Lid,
    pub info: LidInfo,
}

impl LidInfoWithLid {
    pub fn new(lid: Lid, info: LidInfo) -> Self {
        Self { lid, info }
    }
}

/// Per-entry metadata persisted in the index file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LidMeta {
    pub lid: Lid,
    pub size: u32,
}

impl LidMeta {
    /// Serialized size in bytes
    pub const SIZE: usize = 8;

    pub fn new(lid: Lid, size: u32) -> Self {
        Self { lid, size }
    }
}

/// Receives entries delivered by a batch read
pub trait BufferVisitor {
    fn visit(&mut self, lid: Lid, data: &[u8]);
}

impl<F> BufferVisitor for F
where
    F: FnMut(Lid, &[u8]),
{
    fn visit(&mut self, lid: Lid, data: &[u8]) {
        self(lid, data)
    }
}

/// Caller-side lid map updated when rebuilding from the index
pub trait SetLid {
    fn set_lid(&mut self, lid: Lid, info: LidInfo);
}

impl SetLid for std::collections::HashMap<Lid, LidInfo> {
    fn set_lid(&mut self, lid: Lid, info: LidInfo) {
        self.insert(lid, info);
    }
}

impl SetLid for std::collections::BTreeMap<Lid, LidInfo> {
    fn set_lid(&mut self, lid: Lid, info: LidInfo) {
        self.insert(lid, info);
    }
}

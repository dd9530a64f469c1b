//! Chunks: the unit of compression and writeback
//!
//! A [`Chunk`] accumulates entries in memory until it is sealed. A sealed
//! chunk is compressed into a [`ProcessedChunk`], whose frame is written to
//! the data file and described by a [`ChunkMeta`] record in the index file.

mod meta;
mod processed;

pub use meta::{ChunkMeta, ChunkMetaRecord, ChunkMetaVector};
pub use processed::{ChunkFrame, ProcessedChunk};

use crate::{ChunkId, Lid, LidInfo, LidMeta, Result, SerialNum, StoreError};
use bytes::{Buf, BufMut, BytesMut};

/// Per-entry header in a chunk body: lid u32 + len u32
pub const ENTRY_HEADER_SIZE: usize = 8;

/// Mutable in-memory accumulation buffer for one future on-disk chunk
///
/// Body format, repeated per entry:
/// - 4 bytes: lid
/// - 4 bytes: payload length
/// - N bytes: payload
#[derive(Debug)]
pub struct Chunk {
    id: ChunkId,
    data: BytesMut,
    lids: Vec<LidMeta>,
    last_serial: SerialNum,
}

impl Chunk {
    /// Create an empty chunk
    pub fn new(id: ChunkId, capacity: usize) -> Self {
        Self {
            id,
            data: BytesMut::with_capacity(capacity),
            lids: Vec::new(),
            last_serial: 0,
        }
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    /// Highest serial number covered by this chunk
    pub fn last_serial(&self) -> SerialNum {
        self.last_serial
    }

    /// Raise the covered serial number; never lowers it
    pub fn set_last_serial(&mut self, serial_num: SerialNum) {
        self.last_serial = self.last_serial.max(serial_num);
    }

    /// Check if an entry of `len` bytes fits under `max_bytes`
    ///
    /// An empty chunk always has room, so oversized entries get a chunk of
    /// their own.
    pub fn has_room(&self, len: usize, max_bytes: usize) -> bool {
        self.is_empty() || self.size() + ENTRY_HEADER_SIZE + len <= max_bytes
    }

    /// Append an entry, returning its handle
    pub fn append(&mut self, lid: Lid, payload: &[u8]) -> LidInfo {
        let offset = self.data.len() as u32;
        self.data.put_u32_le(lid);
        self.data.put_u32_le(payload.len() as u32);
        self.data.put_slice(payload);
        self.lids.push(LidMeta::new(lid, payload.len() as u32));
        LidInfo::new(self.id, offset, payload.len() as u32)
    }

    /// Payload stored for `lid` at body offset `offset`
    pub fn read(&self, lid: Lid, offset: u32) -> Option<&[u8]> {
        // Bodies built by `append` are always well formed
        lookup(&self.data, lid, offset).ok().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.lids.is_empty()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.lids.len()
    }

    /// Body size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn lids(&self) -> &[LidMeta] {
        &self.lids
    }

    /// Uncompressed body
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn memory_footprint(&self) -> usize {
        self.data.capacity() + self.lids.capacity() * std::mem::size_of::<LidMeta>()
    }
}

/// Iterate `(lid, payload)` pairs of a chunk body
pub fn entries(body: &[u8]) -> Entries<'_> {
    Entries { body, pos: 0 }
}

/// Find the latest payload for `lid` in a chunk body
pub fn find_entry(body: &[u8], lid: Lid) -> Result<Option<&[u8]>> {
    let mut found = None;
    for entry in entries(body) {
        let (entry_lid, payload) = entry?;
        if entry_lid == lid {
            found = Some(payload);
        }
    }
    Ok(found)
}

/// Entry starting at byte `offset` of a chunk body, if the offset is in range
pub fn entry_at(body: &[u8], offset: u32) -> Result<Option<(Lid, &[u8])>> {
    let offset = offset as usize;
    if offset >= body.len() {
        return Ok(None);
    }
    entries(&body[offset..]).next().transpose()
}

/// Payload for a handle: the entry at `offset` if it belongs to `lid`,
/// otherwise the latest entry for `lid`
pub fn lookup(body: &[u8], lid: Lid, offset: u32) -> Result<Option<&[u8]>> {
    if let Ok(Some((found, payload))) = entry_at(body, offset) {
        if found == lid {
            return Ok(Some(payload));
        }
    }
    find_entry(body, lid)
}

/// Iterator over the entries of a chunk body
pub struct Entries<'a> {
    body: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for Entries<'a> {
    type Item = Result<(Lid, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.body.len() {
            return None;
        }
        let rest = &self.body[self.pos..];
        if rest.len() < ENTRY_HEADER_SIZE {
            self.pos = self.body.len();
            return Some(Err(StoreError::InvalidFormat("Entry header truncated".into())));
        }

        let mut cursor = std::io::Cursor::new(rest);
        let lid = cursor.get_u32_le();
        let len = cursor.get_u32_le() as usize;
        if rest.len() < ENTRY_HEADER_SIZE + len {
            self.pos = self.body.len();
            return Some(Err(StoreError::InvalidFormat("Entry payload truncated".into())));
        }

        self.pos += ENTRY_HEADER_SIZE + len;
        Some(Ok((lid, &rest[ENTRY_HEADER_SIZE..ENTRY_HEADER_SIZE + len])))
    }
}

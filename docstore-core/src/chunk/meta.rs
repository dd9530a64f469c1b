//! Persisted per-chunk index records

use crate::{ChunkId, LidMeta, Result, SerialNum, StoreError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Location and coverage of one chunk in the data file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    /// Chunk id
    pub chunk_id: ChunkId,
    /// Byte offset of the chunk frame in the data file
    pub offset: u64,
    /// Frame length in bytes
    pub size: u32,
    /// Highest serial number covered by the chunk
    pub last_serial: SerialNum,
    /// Number of entries
    pub entry_count: u32,
}

impl ChunkMeta {
    /// First byte past this chunk in the data file
    pub fn end(&self) -> u64 {
        self.offset + self.size as u64
    }
}

/// Ordered sequence of chunk metadata, one per written chunk
pub type ChunkMetaVector = Vec<ChunkMeta>;

/// One index file record: a [`ChunkMeta`] and the lids it holds
///
/// Format:
/// - 4 bytes: chunk id
/// - 8 bytes: data file offset
/// - 4 bytes: frame size
/// - 8 bytes: last serial number
/// - 4 bytes: entry count
/// - 8 bytes per entry: lid, payload size
/// - 4 bytes: CRC32 checksum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMetaRecord {
    pub meta: ChunkMeta,
    pub lids: Vec<LidMeta>,
}

impl ChunkMetaRecord {
    /// Size of the fixed part, excluding lids and checksum
    pub const FIXED_SIZE: usize = 28;

    pub fn new(meta: ChunkMeta, lids: Vec<LidMeta>) -> Self {
        Self { meta, lids }
    }

    /// Serialized size in bytes
    pub fn encoded_len(&self) -> usize {
        Self::FIXED_SIZE + self.lids.len() * LidMeta::SIZE + 4
    }

    /// Serialize the record with trailing checksum
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32_le(self.meta.chunk_id);
        buf.put_u64_le(self.meta.offset);
        buf.put_u32_le(self.meta.size);
        buf.put_u64_le(self.meta.last_serial);
        buf.put_u32_le(self.meta.entry_count);
        for lid in &self.lids {
            buf.put_u32_le(lid.lid);
            buf.put_u32_le(lid.size);
        }

        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);
        buf.freeze()
    }

    /// Deserialize one record from the front of `data`
    ///
    /// Returns `Ok(None)` when `data` ends before the record does, which
    /// happens only for a torn final record.
    pub fn from_bytes(data: &[u8]) -> Result<Option<(Self, usize)>> {
        if data.len() < Self::FIXED_SIZE + 4 {
            return Ok(None);
        }

        let mut cursor = std::io::Cursor::new(data);
        let chunk_id = cursor.get_u32_le();
        let offset = cursor.get_u64_le();
        let size = cursor.get_u32_le();
        let last_serial = cursor.get_u64_le();
        let entry_count = cursor.get_u32_le();

        let len = Self::FIXED_SIZE + entry_count as usize * LidMeta::SIZE + 4;
        if data.len() < len {
            return Ok(None);
        }

        let expected = (&data[len - 4..len]).get_u32_le();
        let actual = crc32fast::hash(&data[..len - 4]);
        if expected != actual {
            return Err(StoreError::ChecksumMismatch { expected, actual });
        }

        let mut lids = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            let lid = cursor.get_u32_le();
            let size = cursor.get_u32_le();
            lids.push(LidMeta::new(lid, size));
        }

        let meta = ChunkMeta {
            chunk_id,
            offset,
            size,
            last_serial,
            entry_count,
        };
        Ok(Some((Self { meta, lids }, len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ChunkMetaRecord {
        ChunkMetaRecord::new(
            ChunkMeta {
                chunk_id: 2,
                offset: 4096,
                size: 311,
                last_serial: 77,
                entry_count: 2,
            },
            vec![LidMeta::new(10, 100), LidMeta::new(11, 120)],
        )
    }

    #[test]
    fn test_record_serialization() {
        let record = record();
        let bytes = record.to_bytes();
        assert_eq!(bytes.len(), record.encoded_len());

        let (decoded, len) = ChunkMetaRecord::from_bytes(&bytes).unwrap().unwrap();
        assert_eq!(len, bytes.len());
        assert_eq!(decoded, record);
        assert_eq!(decoded.meta.end(), 4407);
    }

    #[test]
    fn test_torn_record() {
        let bytes = record().to_bytes();
        assert!(ChunkMetaRecord::from_bytes(&bytes[..bytes.len() - 1])
            .unwrap()
            .is_none());
        assert!(ChunkMetaRecord::from_bytes(&bytes[..10]).unwrap().is_none());
    }

    #[test]
    fn test_checksum_validation() {
        let mut bytes = record().to_bytes().to_vec();
        bytes[5] ^= 0xFF;
        let result = ChunkMetaRecord::from_bytes(&bytes);
        assert!(matches!(result, Err(StoreError::ChecksumMismatch { .. })));
    }
}

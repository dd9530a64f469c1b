//! Compressed chunks and their on-disk frame

use super::Chunk;
use crate::compression::{self, CompressionConfig, CompressionType};
use crate::{ChunkId, LidMeta, Result, SerialNum, StoreError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame format version
pub const FRAME_VERSION: u8 = 1;

/// Self-describing on-disk chunk frame
///
/// Format:
/// - 1 byte: frame version
/// - 1 byte: compression type
/// - 4 bytes: entry count
/// - 4 bytes: uncompressed body length
/// - 4 bytes: payload length
/// - N bytes: payload
/// - 4 bytes: CRC32 over everything above
pub struct ChunkFrame;

impl ChunkFrame {
    /// Header size in bytes
    pub const HEADER_SIZE: usize = 14;

    /// Trailing checksum size
    pub const TRAILER_SIZE: usize = 4;

    /// Compress `body` and wrap it in a frame
    pub fn encode(config: &CompressionConfig, entry_count: u32, body: &[u8]) -> Result<Bytes> {
        let (kind, payload) = compression::compress(config, body)?;

        let mut buf =
            BytesMut::with_capacity(Self::HEADER_SIZE + payload.len() + Self::TRAILER_SIZE);
        buf.put_u8(FRAME_VERSION);
        buf.put_u8(kind as u8);
        buf.put_u32_le(entry_count);
        buf.put_u32_le(body.len() as u32);
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);

        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);

        Ok(buf.freeze())
    }

    /// Validate a frame and return the uncompressed body
    pub fn decode(data: &[u8], verify_checksum: bool) -> Result<Vec<u8>> {
        if data.len() < Self::HEADER_SIZE + Self::TRAILER_SIZE {
            return Err(StoreError::InvalidFormat("Chunk frame too short".into()));
        }

        let mut cursor = std::io::Cursor::new(data);
        let version = cursor.get_u8();
        if version != FRAME_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported chunk frame version: {}",
                version
            )));
        }
        let kind = CompressionType::try_from(cursor.get_u8())?;
        let _entry_count = cursor.get_u32_le();
        let raw_len = cursor.get_u32_le() as usize;
        let payload_len = cursor.get_u32_le() as usize;

        let checksum_pos = Self::HEADER_SIZE + payload_len;
        if checksum_pos + Self::TRAILER_SIZE != data.len() {
            return Err(StoreError::InvalidFormat(format!(
                "Chunk frame length {} does not match payload length {}",
                data.len(),
                payload_len
            )));
        }

        if verify_checksum {
            let expected = (&data[checksum_pos..]).get_u32_le();
            let actual = crc32fast::hash(&data[..checksum_pos]);
            if expected != actual {
                return Err(StoreError::ChecksumMismatch { expected, actual });
            }
        }

        compression::decompress(kind, &data[Self::HEADER_SIZE..checksum_pos], raw_len)
    }
}

/// Immutable result of compressing a sealed chunk
#[derive(Debug)]
pub struct ProcessedChunk {
    id: ChunkId,
    last_serial: SerialNum,
    lids: Vec<LidMeta>,
    frame: Bytes,
}

impl ProcessedChunk {
    /// Compress a sealed chunk
    pub fn compress(chunk: &Chunk, config: &CompressionConfig) -> Result<Self> {
        let frame = ChunkFrame::encode(config, chunk.len() as u32, chunk.data())?;
        Ok(Self {
            id: chunk.id(),
            last_serial: chunk.last_serial(),
            lids: chunk.lids().to_vec(),
            frame,
        })
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn last_serial(&self) -> SerialNum {
        self.last_serial
    }

    pub fn lids(&self) -> &[LidMeta] {
        &self.lids
    }

    pub fn entry_count(&self) -> u32 {
        self.lids.len() as u32
    }

    /// The bytes that land in the data file
    pub fn frame(&self) -> &Bytes {
        &self.frame
    }

    /// Frame size in bytes
    pub fn size(&self) -> usize {
        self.frame.len()
    }

    /// Decompress back to the chunk body
    pub fn decode(&self, verify_checksum: bool) -> Result<Vec<u8>> {
        ChunkFrame::decode(&self.frame, verify_checksum)
    }

    pub fn memory_footprint(&self) -> usize {
        self.frame.len() + self.lids.capacity() * std::mem::size_of::<LidMeta>()
    }
}

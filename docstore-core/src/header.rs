//! Index file header

use crate::{Result, StoreError};
use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use std::io::{Read, Write};

/// Index file magic
pub const IDX_MAGIC: &[u8; 4] = b"DSIX";

/// Index file format version
pub const FORMAT_VERSION: u32 = 1;

/// Fixed preamble of an index file
///
/// Format:
/// - 4 bytes: magic
/// - 4 bytes: format version
/// - 4 bytes: total header length, checksum included
/// - 8 bytes: creation time (unix millis)
/// - 2 bytes: description length
/// - N bytes: description (utf-8)
/// - 4 bytes: CRC32 checksum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u32,
    pub created: DateTime<Utc>,
    pub description: String,
}

impl FileHeader {
    const FIXED_SIZE: usize = 22;

    pub fn new(description: impl Into<String>) -> Self {
        Self {
            version: FORMAT_VERSION,
            created: Utc::now(),
            description: description.into(),
        }
    }

    /// Serialized length in bytes
    pub fn encoded_len(&self) -> usize {
        Self::FIXED_SIZE + self.description.len() + 4
    }

    /// Write the header, returning its length
    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<u64> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(IDX_MAGIC);
        buf.put_u32_le(self.version);
        buf.put_u32_le(self.encoded_len() as u32);
        buf.put_i64_le(self.created.timestamp_millis());
        buf.put_u16_le(self.description.len() as u16);
        buf.put_slice(self.description.as_bytes());

        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);

        out.write_all(&buf)?;
        Ok(buf.len() as u64)
    }

    /// Read and validate a header, returning it with its length
    pub fn read_from<R: Read>(input: &mut R) -> Result<(Self, u64)> {
        let mut fixed = [0u8; Self::FIXED_SIZE];
        input.read_exact(&mut fixed).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                StoreError::InvalidFormat("Index header too short".into())
            }
            _ => StoreError::Io(e),
        })?;

        if &fixed[..4] != IDX_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid index file magic".into()));
        }

        let mut cursor = std::io::Cursor::new(&fixed[4..]);
        let version = cursor.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported version: {}",
                version
            )));
        }
        let header_len = cursor.get_u32_le() as usize;
        let created_millis = cursor.get_i64_le();
        let desc_len = cursor.get_u16_le() as usize;

        if header_len != Self::FIXED_SIZE + desc_len + 4 {
            return Err(StoreError::InvalidFormat(format!(
                "Index header length {} inconsistent with description length {}",
                header_len, desc_len
            )));
        }

        let mut rest = vec![0u8; desc_len + 4];
        input.read_exact(&mut rest)?;

        let mut all = Vec::with_capacity(header_len);
        all.extend_from_slice(&fixed);
        all.extend_from_slice(&rest[..desc_len]);
        let expected = (&rest[desc_len..]).get_u32_le();
        let actual = crc32fast::hash(&all);
        if expected != actual {
            return Err(StoreError::ChecksumMismatch { expected, actual });
        }

        let description = String::from_utf8(rest[..desc_len].to_vec())
            .map_err(|e| StoreError::InvalidFormat(e.to_string()))?;
        let created = Utc
            .timestamp_millis_opt(created_millis)
            .single()
            .ok_or_else(|| StoreError::InvalidFormat("Invalid creation time".into()))?;

        Ok((
            Self {
                version,
                created,
                description,
            },
            header_len as u64,
        ))
    }
}

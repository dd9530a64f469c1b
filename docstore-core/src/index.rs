//! Index file reader

use crate::chunk::{ChunkMeta, ChunkMetaRecord, ChunkMetaVector};
use crate::header::FileHeader;
use crate::{Result, StoreError};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::warn;

/// Parsed contents of an index file
#[derive(Debug, Clone)]
pub struct IndexFile {
    /// File header
    pub header: FileHeader,
    /// Header length in bytes
    pub header_len: u64,
    /// Chunk records in file order
    pub records: Vec<ChunkMetaRecord>,
    /// Bytes covered by the header and complete records
    pub valid_len: u64,
    /// Actual file length
    pub file_len: u64,
}

impl IndexFile {
    /// Read an index file
    ///
    /// A torn final record is dropped with a warning; `valid_len` then falls
    /// short of `file_len`.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;

        let (header, header_len) = FileHeader::read_from(&mut data.as_slice())?;

        let mut records = Vec::new();
        let mut offset = header_len as usize;
        while offset < data.len() {
            match ChunkMetaRecord::from_bytes(&data[offset..])? {
                Some((record, len)) => {
                    records.push(record);
                    offset += len;
                }
                None => {
                    warn!(
                        path = %path.display(),
                        offset,
                        "index.torn_tail"
                    );
                    break;
                }
            }
        }

        Ok(Self {
            header,
            header_len,
            records,
            valid_len: offset as u64,
            file_len: data.len() as u64,
        })
    }

    /// The ChunkMeta sequence, in chunk id order
    pub fn chunk_metas(&self) -> ChunkMetaVector {
        self.records.iter().map(|r| r.meta).collect()
    }

    /// Check that chunk ids are dense from zero and data offsets contiguous
    pub fn validate(&self) -> Result<()> {
        let mut expected_offset = 0u64;
        for (i, record) in self.records.iter().enumerate() {
            let meta: &ChunkMeta = &record.meta;
            if meta.chunk_id as usize != i {
                return Err(StoreError::Corruption(format!(
                    "index record {} has chunk id {}",
                    i, meta.chunk_id
                )));
            }
            if meta.offset != expected_offset {
                return Err(StoreError::Corruption(format!(
                    "chunk {} at offset {}, expected {}",
                    meta.chunk_id, meta.offset, expected_offset
                )));
            }
            if meta.entry_count as usize != record.lids.len() {
                return Err(StoreError::Corruption(format!(
                    "chunk {} lists {} lids for {} entries",
                    meta.chunk_id,
                    record.lids.len(),
                    meta.entry_count
                )));
            }
            expected_offset = meta.end();
        }
        Ok(())
    }

    /// Data file length implied by the records
    pub fn data_len(&self) -> u64 {
        self.records.last().map(|r| r.meta.end()).unwrap_or(0)
    }
}

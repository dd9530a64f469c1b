//! Point and batch reads
//!
//! A chunk is found under the metadata lock; copying, decompression and
//! file reads happen after the lock is released.

use super::{Inner, Shared, WriteableFileChunk};
use crate::chunk::{lookup, Chunk, ChunkFrame, ChunkMeta, ProcessedChunk};
use crate::{BufferVisitor, ChunkId, Lid, LidInfo, LidInfoWithLid, Result, StoreError};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs::File;
use std::sync::Arc;

/// Where a non-active chunk currently lives
enum Source {
    /// Sealed, compression in progress
    Sealed(Arc<Chunk>),
    /// Compressed, waiting for or undergoing writeback
    Processed(Arc<ProcessedChunk>),
    /// Written to the data file
    Disk(ChunkMeta),
}

impl Shared {
    fn locate(&self, chunk_id: ChunkId) -> Result<Source> {
        if let Some(chunk) = self.chunk_map.get(&chunk_id) {
            return Ok(Source::Sealed(Arc::clone(chunk)));
        }
        if let Some(chunk) = self
            .ordered_chunks
            .get(&chunk_id)
            .or_else(|| self.write_q.iter().find(|c| c.id() == chunk_id))
        {
            return Ok(Source::Processed(Arc::clone(chunk)));
        }
        if chunk_id < self.first_chunk_id_to_be_written {
            if let Some(record) = self.chunk_info.get(chunk_id as usize) {
                return Ok(Source::Disk(record.meta));
            }
        }
        Err(StoreError::UnknownChunk(chunk_id))
    }
}

impl Inner {
    fn load_body<'a>(&self, source: &'a Source) -> Result<Cow<'a, [u8]>> {
        match source {
            Source::Sealed(chunk) => Ok(Cow::Borrowed(chunk.data())),
            Source::Processed(chunk) => Ok(Cow::Owned(chunk.decode(false)?)),
            Source::Disk(meta) => {
                let mut frame = vec![0u8; meta.size as usize];
                read_exact_at(&self.dat_file, &mut frame, meta.offset)?;
                Ok(Cow::Owned(ChunkFrame::decode(
                    &frame,
                    self.config.verify_checksums,
                )?))
            }
        }
    }
}

impl WriteableFileChunk {
    /// Read the payload behind handle `info` for `lid` into `buf`
    ///
    /// Returns the payload length, or `None` if the chunk has no entry for
    /// `lid`. The handle's offset selects the entry, so an older handle of a
    /// lid appended twice keeps reading the older payload. Works whatever
    /// state the chunk is in.
    pub fn read(&self, lid: Lid, info: LidInfo, buf: &mut Vec<u8>) -> Result<Option<usize>> {
        let source = {
            let shared = self.inner.lock.lock();
            if shared.active.id() == info.chunk_id {
                return Ok(shared
                    .active
                    .read(lid, info.offset)
                    .map(|data| copy_into(buf, data)));
            }
            shared.locate(info.chunk_id)?
        };

        let body = self.inner.load_body(&source)?;
        Ok(lookup(&body, lid, info.offset)?.map(|data| copy_into(buf, data)))
    }

    /// Read many entries, decoding each chunk once
    ///
    /// Handles are grouped by chunk and visited in chunk id order. Entries
    /// that are not found are skipped.
    pub fn read_batch(
        &self,
        lids: &[LidInfoWithLid],
        visitor: &mut dyn BufferVisitor,
    ) -> Result<()> {
        let mut by_chunk: BTreeMap<ChunkId, Vec<LidInfoWithLid>> = BTreeMap::new();
        for item in lids {
            by_chunk.entry(item.info.chunk_id).or_default().push(*item);
        }

        for (chunk_id, wanted) in by_chunk {
            let source = {
                let shared = self.inner.lock.lock();
                if shared.active.id() == chunk_id {
                    let copies: Vec<(Lid, Vec<u8>)> = wanted
                        .iter()
                        .filter_map(|w| {
                            let data = shared.active.read(w.lid, w.info.offset)?;
                            Some((w.lid, data.to_vec()))
                        })
                        .collect();
                    drop(shared);
                    for (lid, data) in &copies {
                        visitor.visit(*lid, data);
                    }
                    continue;
                }
                shared.locate(chunk_id)?
            };

            let body = self.inner.load_body(&source)?;
            for w in &wanted {
                if let Some(data) = lookup(&body, w.lid, w.info.offset)? {
                    visitor.visit(w.lid, data);
                }
            }
        }
        Ok(())
    }
}

fn copy_into(buf: &mut Vec<u8>, data: &[u8]) -> usize {
    buf.clear();
    buf.extend_from_slice(data);
    data.len()
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => return Err(std::io::ErrorKind::UnexpectedEof.into()),
            n => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

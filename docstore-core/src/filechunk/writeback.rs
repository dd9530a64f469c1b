//! Compression completion and in-order writeback

use super::{Inner, PendingChunk, Shared};
use crate::chunk::{Chunk, ChunkMeta, ChunkMetaRecord, ProcessedChunk};
use crate::{ChunkId, Result, StoreError};
use bytes::{BufMut, BytesMut};
use std::collections::BTreeMap;
use std::io::Write;
#[cfg(test)]
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error};

/// Output of one writer pass
struct WrittenRun {
    records: Vec<ChunkMetaRecord>,
    pending: PendingChunk,
}

impl Inner {
    /// Compression task body, run on an executor thread
    pub(super) fn compress_and_enqueue(&self, chunk: Arc<Chunk>) {
        match self.compress(&chunk) {
            Ok(processed) => self.enqueue(Arc::new(processed)),
            Err(e) => self.set_fault(format!("compression of chunk {} failed: {}", chunk.id(), e)),
        }
    }

    fn compress(&self, chunk: &Chunk) -> Result<ProcessedChunk> {
        #[cfg(test)]
        if self.failures.compression.load(Ordering::SeqCst) {
            return Err(StoreError::Compression("injected failure".into()));
        }
        ProcessedChunk::compress(chunk, &self.config.compression)
    }

    /// Move a compressed chunk into the reorder buffer and start the writer
    /// if the next chunk to write is now available
    fn enqueue(&self, processed: Arc<ProcessedChunk>) {
        let chunk_id = processed.id();
        {
            let mut shared = self.lock.lock();
            if shared.fault.is_some() {
                return;
            }
            debug_assert!(chunk_id >= shared.first_chunk_id_to_be_written);
            shared.chunk_map.remove(&chunk_id);
            shared.ordered_chunks.insert(chunk_id, processed);

            if shared.write_task_running
                || !shared
                    .ordered_chunks
                    .contains_key(&shared.first_chunk_id_to_be_written)
            {
                return;
            }
            shared.write_task_running = true;
        }
        self.file_writer();
    }

    /// Write contiguous runs until the next chunk id is not yet compressed
    ///
    /// Only one thread runs this at a time, guarded by `write_task_running`,
    /// which is cleared under the same lock that decides there is no more work.
    fn file_writer(&self) {
        loop {
            let (run, dat_offset, idx_offset) = {
                let mut shared = self.lock.lock();
                let first = shared.first_chunk_id_to_be_written;
                if shared.fault.is_some() || !shared.ordered_chunks.contains_key(&first) {
                    shared.write_task_running = false;
                    self.cond.notify_all();
                    return;
                }
                let run = fetch_next_chain(&mut shared.ordered_chunks, first);
                shared.write_q = run.clone();
                (run, shared.data_file_len, shared.idx_file_len)
            };

            match self.write_run(&run, dat_offset, idx_offset) {
                Ok(written) => self.update_chunk_info(written),
                Err(e) => {
                    let mut shared = self.lock.lock();
                    shared.write_task_running = false;
                    self.record_fault(
                        &mut shared,
                        format!("write of chunks from {} failed: {}", run[0].id(), e),
                    );
                    return;
                }
            }
        }
    }

    /// Append a run's frames to the data file, then its records to the index
    fn write_run(
        &self,
        run: &[Arc<ProcessedChunk>],
        dat_offset: u64,
        idx_offset: u64,
    ) -> Result<WrittenRun> {
        #[cfg(test)]
        if self.failures.write.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("injected failure")));
        }

        let mut data = BytesMut::with_capacity(run.iter().map(|c| c.size()).sum());
        let mut idx = BytesMut::new();
        let mut records = Vec::with_capacity(run.len());
        let mut offset = dat_offset;
        let mut last_serial = 0;

        for chunk in run {
            let meta = ChunkMeta {
                chunk_id: chunk.id(),
                offset,
                size: frame_size(chunk.id(), chunk.size())?,
                last_serial: chunk.last_serial(),
                entry_count: chunk.entry_count(),
            };
            let record = ChunkMetaRecord::new(meta, chunk.lids().to_vec());
            data.put_slice(chunk.frame());
            idx.put_slice(&record.to_bytes());
            offset = meta.end();
            last_serial = last_serial.max(meta.last_serial);
            records.push(record);
        }

        (&self.dat_file).write_all(&data)?;
        (&self.idx_file).write_all(&idx)?;

        let pending = PendingChunk {
            first_chunk_id: run[0].id(),
            last_chunk_id: run[run.len() - 1].id(),
            idx_offset,
            idx_len: idx.len() as u64,
            dat_offset,
            dat_len: data.len() as u64,
            last_serial,
        };
        Ok(WrittenRun { records, pending })
    }

    fn update_chunk_info(&self, written: WrittenRun) {
        let WrittenRun { records, pending } = written;
        let mut shared = self.lock.lock();

        debug_assert_eq!(shared.chunk_info.len() as ChunkId, pending.first_chunk_id);
        shared.data_file_len = pending.dat_end();
        shared.idx_file_len = pending.idx_end();
        shared.pending_dat += pending.dat_len;
        shared.pending_idx += pending.idx_len;
        shared.first_chunk_id_to_be_written = pending.last_chunk_id + 1;
        shared.chunk_info.extend(records);
        shared.write_q.clear();

        debug!(
            first_chunk_id = pending.first_chunk_id,
            last_chunk_id = pending.last_chunk_id,
            dat_offset = pending.dat_offset,
            dat_len = pending.dat_len,
            "chunks.written"
        );
        shared.pending_chunks.push_back(Arc::new(pending));
        self.cond.notify_all();
    }

    /// Put the segment into the faulted state; later operations fail
    pub(super) fn set_fault(&self, reason: String) {
        let mut shared = self.lock.lock();
        self.record_fault(&mut shared, reason);
    }

    pub(super) fn record_fault(&self, shared: &mut Shared, reason: String) {
        error!(path = %self.dat_path.display(), reason = %reason, "segment.faulted");
        if shared.fault.is_none() {
            shared.fault = Some(reason);
        }
        self.cond.notify_all();
    }

    pub(super) fn check_fault(shared: &Shared) -> Result<()> {
        match &shared.fault {
            Some(reason) => Err(StoreError::Faulted(reason.clone())),
            None => Ok(()),
        }
    }

    pub(super) fn check_fault_now(&self) -> Result<()> {
        Self::check_fault(&self.lock.lock())
    }
}

/// Frame length as recorded in the index
fn frame_size(chunk_id: ChunkId, len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        StoreError::InvalidState(format!(
            "frame of chunk {} is {} bytes, above the index limit",
            chunk_id, len
        ))
    })
}

/// Remove and return the contiguous run of entries starting at `first`
fn fetch_next_chain<V>(ordered: &mut BTreeMap<ChunkId, V>, first: ChunkId) -> Vec<V> {
    let mut run = Vec::new();
    let mut next = first;
    while let Some(chunk) = ordered.remove(&next) {
        run.push(chunk);
        next += 1;
    }
    run
}

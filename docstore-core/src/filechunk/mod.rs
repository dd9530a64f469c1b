//! Writeable segment file
//!
//! A segment is a pair of files: `<base>.dat` holds compressed chunk frames
//! back to back, `<base>.idx` holds a header followed by one
//! [`ChunkMetaRecord`] per chunk, in the same order.
//!
//! Entries are appended to the active [`Chunk`] and are readable at once.
//! When the active chunk is full (or a flush or freeze asks for it) it is
//! sealed and handed to the executor for compression. Compression finishes
//! in any order; finished chunks wait in a reorder buffer until every lower
//! chunk id is done, and are then written by a single writer pass, which
//! assigns data file offsets strictly in chunk id order. Written chunks are
//! tracked as [`PendingChunk`]s until an fsync confirms them durable.

mod config;
mod durability;
mod pending;
mod read;
mod writeback;

pub use config::{FlushPolicy, WriterConfig};
pub use pending::PendingChunk;

use crate::bucketizer::{BucketDensityComputer, Bucketizer};
use crate::chunk::{
    Chunk, ChunkFrame, ChunkMetaRecord, ChunkMetaVector, ProcessedChunk, ENTRY_HEADER_SIZE,
};
use crate::executor::Executor;
use crate::header::FileHeader;
use crate::index::IndexFile;
use crate::{ChunkId, Lid, LidInfo, Result, SerialNum, SetLid, StoreError};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Largest payload whose chunk frame still has a size the index can record
pub const MAX_ENTRY_BYTES: usize =
    u32::MAX as usize - ENTRY_HEADER_SIZE - ChunkFrame::HEADER_SIZE - ChunkFrame::TRAILER_SIZE;

/// Append-only segment writer with concurrent reads
pub struct WriteableFileChunk {
    inner: Arc<Inner>,
    executor: Arc<dyn Executor>,
}

/// State shared with compression tasks
struct Inner {
    config: WriterConfig,
    dat_path: PathBuf,
    idx_path: PathBuf,
    serial_num: AtomicU64,
    frozen: AtomicBool,
    // Lock order is write_lock, flush_lock, lock
    write_lock: Mutex<WriteState>,
    flush_lock: Mutex<SyncState>,
    lock: Mutex<Shared>,
    /// Signalled on writeback progress, durability progress and faults
    cond: Condvar,
    dat_file: File,
    idx_file: File,
    bucketizer: Option<Arc<dyn Bucketizer>>,
    #[cfg(test)]
    failures: FailureInjection,
}

/// Makes the compression or write step fail on demand
#[cfg(test)]
#[derive(Default)]
struct FailureInjection {
    compression: AtomicBool,
    write: AtomicBool,
}

/// Guarded by the outer append/seal lock
struct WriteState {
    next_chunk_id: ChunkId,
    bucket_map: BucketDensityComputer,
}

/// Guarded by the durability lock
#[derive(Debug, Default)]
struct SyncState {
    syncs: u64,
}

/// Guarded by the shared-metadata lock
struct Shared {
    active: Chunk,
    /// Sealed chunks being compressed
    chunk_map: BTreeMap<ChunkId, Arc<Chunk>>,
    /// Compressed chunks waiting for a lower id to complete
    ordered_chunks: BTreeMap<ChunkId, Arc<ProcessedChunk>>,
    /// Run currently being written
    write_q: Vec<Arc<ProcessedChunk>>,
    /// Index records of written chunks, indexed by chunk id
    chunk_info: Vec<ChunkMetaRecord>,
    first_chunk_id_to_be_written: ChunkId,
    write_task_running: bool,
    pending_chunks: VecDeque<Arc<PendingChunk>>,
    /// Written but unsynced bytes
    pending_dat: u64,
    pending_idx: u64,
    /// Bytes handed to the OS
    data_file_len: u64,
    idx_file_len: u64,
    last_persisted_serial: SerialNum,
    modification_time: DateTime<Utc>,
    fault: Option<String>,
}

/// Point-in-time segment statistics
#[derive(Debug, Clone, Serialize)]
pub struct SegmentStats {
    pub disk_footprint: u64,
    pub memory_footprint: usize,
    pub memory_meta_footprint: usize,
    pub chunks_written: usize,
    pub chunks_in_flight: usize,
    pub pending_chunks: usize,
    pub serial_num: SerialNum,
    pub last_persisted_serial: SerialNum,
    pub num_buckets: usize,
    pub bucket_spread: f64,
    pub frozen: bool,
    pub modification_time: DateTime<Utc>,
}

impl WriteableFileChunk {
    /// Create a segment at `base`, or resume the one already there
    ///
    /// Resuming validates the index header and records and requires the data
    /// file to end exactly where the last recorded chunk does.
    pub fn open(
        base: impl AsRef<Path>,
        initial_serial_num: SerialNum,
        config: WriterConfig,
        executor: Arc<dyn Executor>,
        bucketizer: Option<Arc<dyn Bucketizer>>,
    ) -> Result<Self> {
        config.validate()?;

        let base = base.as_ref();
        let dat_path = with_suffix(base, ".dat");
        let idx_path = with_suffix(base, ".idx");
        if let Some(parent) = base.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let dat_len = file_len(&dat_path)?;
        let resuming = file_len(&idx_path)? > 0;
        let records = if resuming {
            let index = IndexFile::read(&idx_path)?;
            if index.valid_len != index.file_len {
                return Err(StoreError::Corruption(format!(
                    "index {} has a torn record at {}",
                    idx_path.display(),
                    index.valid_len
                )));
            }
            index.validate()?;
            if dat_len != index.data_len() {
                return Err(StoreError::Corruption(format!(
                    "data file {} is {} bytes, index covers {}",
                    dat_path.display(),
                    dat_len,
                    index.data_len()
                )));
            }
            index.records
        } else {
            if dat_len > 0 {
                return Err(StoreError::Corruption(format!(
                    "data file {} exists without an index",
                    dat_path.display()
                )));
            }
            Vec::new()
        };

        let dat_file = open_append(&dat_path)?;
        let idx_file = open_append(&idx_path)?;
        if !resuming {
            let name = base
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            FileHeader::new(format!("docstore segment {}", name)).write_to(&mut &idx_file)?;
            idx_file.sync_all()?;
        }
        let idx_file_len = idx_file.metadata()?.len();

        let first_chunk_id = records.len() as ChunkId;
        let last_serial = records.last().map(|r| r.meta.last_serial).unwrap_or(0);
        let serial_num = initial_serial_num.max(last_serial);

        let shared = Shared {
            active: Chunk::new(first_chunk_id, crate::config::INITIAL_CHUNK_CAPACITY),
            chunk_map: BTreeMap::new(),
            ordered_chunks: BTreeMap::new(),
            write_q: Vec::new(),
            chunk_info: records,
            first_chunk_id_to_be_written: first_chunk_id,
            write_task_running: false,
            pending_chunks: VecDeque::new(),
            pending_dat: 0,
            pending_idx: 0,
            data_file_len: dat_len,
            idx_file_len,
            last_persisted_serial: last_serial,
            modification_time: Utc::now(),
            fault: None,
        };

        info!(
            path = %base.display(),
            chunks = first_chunk_id,
            serial_num,
            resumed = resuming,
            "segment.open"
        );

        let inner = Inner {
            config,
            dat_path,
            idx_path,
            serial_num: AtomicU64::new(serial_num),
            frozen: AtomicBool::new(false),
            write_lock: Mutex::new(WriteState {
                next_chunk_id: first_chunk_id + 1,
                bucket_map: BucketDensityComputer::new(),
            }),
            flush_lock: Mutex::new(SyncState::default()),
            lock: Mutex::new(shared),
            cond: Condvar::new(),
            dat_file,
            idx_file,
            bucketizer,
            #[cfg(test)]
            failures: FailureInjection::default(),
        };

        Ok(Self {
            inner: Arc::new(inner),
            executor,
        })
    }

    /// Append an entry, returning the handle to read it back with
    ///
    /// Never waits for compression or disk I/O.
    pub fn append(&self, serial_num: SerialNum, lid: Lid, payload: &[u8]) -> Result<LidInfo> {
        let mut ws = self.inner.write_lock.lock();
        if self.inner.is_frozen() {
            return Err(StoreError::InvalidState(format!(
                "append of lid {} to frozen segment",
                lid
            )));
        }
        check_entry_size(lid, payload.len())?;
        let current = self.inner.serial_num();
        if serial_num < current {
            return Err(StoreError::InvalidState(format!(
                "serial number {} is below current {}",
                serial_num, current
            )));
        }

        let needs_seal = {
            let shared = self.inner.lock.lock();
            Inner::check_fault(&shared)?;
            !shared
                .active
                .has_room(payload.len(), self.inner.config.max_chunk_bytes)
        };
        if needs_seal {
            self.seal_active(&mut ws, false);
        }

        self.inner.serial_num.fetch_max(serial_num, Ordering::SeqCst);
        let mut shared = self.inner.lock.lock();
        let info = shared.active.append(lid, payload);
        shared.active.set_last_serial(serial_num);
        Ok(info)
    }

    /// Make every entry with serial number up to `sync_token` durable
    ///
    /// The active chunk is sealed. If `sync_token` is ahead of the segment's
    /// serial number the serial number is raised and a chunk is sealed even
    /// when empty, so the token itself gets a durable sync point. With
    /// `block` the call returns only after everything sealed so far has
    /// been written and fsynced.
    pub fn flush(&self, block: bool, sync_token: SerialNum) -> Result<()> {
        let target = {
            let mut ws = self.inner.write_lock.lock();
            self.inner.check_fault_now()?;
            let force = !self.inner.is_frozen() && sync_token > self.inner.serial_num();
            if force {
                self.inner.serial_num.fetch_max(sync_token, Ordering::SeqCst);
            }
            self.seal_active(&mut ws, force);
            self.inner.last_sealed_chunk_id()
        };

        if block {
            if let Some(chunk_id) = target {
                self.inner.wait_for_chunk_written(chunk_id)?;
            }
        }
        self.inner.sync_pending_chunks()
    }

    /// Policy-driven durability push, called periodically by the log
    ///
    /// Returns whether an fsync was issued.
    pub fn flush_pending_chunks(&self, serial_num: SerialNum) -> Result<bool> {
        self.inner.flush_pending_chunks(serial_num)
    }

    /// Whether `flush_pending_chunks(serial_num)` would fsync, given the
    /// data file has `dat_file_len` bytes handed to the OS
    pub fn need_flush_pending_chunks(&self, serial_num: SerialNum, dat_file_len: u64) -> bool {
        let shared = self.inner.lock.lock();
        self.inner.need_flush_locked(&shared, serial_num, dat_file_len)
    }

    /// Block until every chunk sealed so far is written and durable
    pub fn wait_for_disk_to_catch_up_to_now(&self) -> Result<()> {
        if let Some(chunk_id) = self.inner.last_sealed_chunk_id() {
            self.inner.wait_for_chunk_written(chunk_id)?;
        }
        self.inner.sync_pending_chunks()
    }

    /// Seal the last chunk, wait for it to become durable and refuse
    /// further appends
    pub fn freeze(&self) -> Result<()> {
        let target = {
            let mut ws = self.inner.write_lock.lock();
            if self.inner.is_frozen() {
                return Ok(());
            }
            self.seal_active(&mut ws, false);
            self.inner.frozen.store(true, Ordering::SeqCst);
            self.inner.last_sealed_chunk_id()
        };

        if let Some(chunk_id) = target {
            self.inner.wait_for_chunk_written(chunk_id)?;
        }
        self.inner.sync_pending_chunks()?;

        info!(
            path = %self.inner.dat_path.display(),
            serial_num = self.serial_num(),
            disk_footprint = self.disk_footprint(),
            "segment.frozen"
        );
        Ok(())
    }

    pub fn serial_num(&self) -> SerialNum {
        self.inner.serial_num()
    }

    /// Raise the serial number; lower values are ignored
    pub fn set_serial_num(&self, serial_num: SerialNum) {
        self.inner.serial_num.fetch_max(serial_num, Ordering::SeqCst);
    }

    /// Highest serial number confirmed durable
    pub fn last_persisted_serial_num(&self) -> SerialNum {
        self.inner.lock.lock().last_persisted_serial
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.is_frozen()
    }

    /// Time of the last completed fsync, or of opening
    pub fn modification_time(&self) -> DateTime<Utc> {
        self.inner.lock.lock().modification_time
    }

    /// Bytes physically written to the data and index files
    pub fn disk_footprint(&self) -> u64 {
        let shared = self.inner.lock.lock();
        shared.data_file_len + shared.idx_file_len
    }

    /// Bytes held by unwritten chunks and bookkeeping
    pub fn memory_footprint(&self) -> usize {
        let chunks = {
            let shared = self.inner.lock.lock();
            shared.active.memory_footprint()
                + shared
                    .chunk_map
                    .values()
                    .map(|c| c.memory_footprint())
                    .sum::<usize>()
                + shared
                    .ordered_chunks
                    .values()
                    .chain(shared.write_q.iter())
                    .map(|c| c.memory_footprint())
                    .sum::<usize>()
        };
        chunks + self.memory_meta_footprint()
    }

    /// Bytes held by chunk metadata, pending-chunk bookkeeping and the
    /// bucket density map
    pub fn memory_meta_footprint(&self) -> usize {
        let ws = self.inner.write_lock.lock();
        let shared = self.inner.lock.lock();
        ws.bucket_map.memory_footprint() + shared.meta_footprint()
    }

    /// ChunkMeta records of every written chunk
    pub fn chunk_metas(&self) -> ChunkMetaVector {
        let shared = self.inner.lock.lock();
        shared.chunk_info.iter().map(|r| r.meta).collect()
    }

    /// Report the handle of every entry in written chunks whose last serial
    /// number is above `serial_num`, returning the number reported
    pub fn update_lid_map(&self, lid_map: &mut dyn SetLid, serial_num: SerialNum) -> usize {
        let records: Vec<ChunkMetaRecord> = {
            let shared = self.inner.lock.lock();
            shared
                .chunk_info
                .iter()
                .filter(|r| r.meta.last_serial > serial_num)
                .cloned()
                .collect()
        };

        let mut count = 0;
        for record in &records {
            let mut offset = 0u32;
            for lid in &record.lids {
                lid_map.set_lid(lid.lid, LidInfo::new(record.meta.chunk_id, offset, lid.size));
                offset += ENTRY_HEADER_SIZE as u32 + lid.size;
                count += 1;
            }
        }
        count
    }

    pub fn stats(&self) -> SegmentStats {
        let (num_buckets, bucket_spread, bucket_bytes) = {
            let ws = self.inner.write_lock.lock();
            let bucket_map = &ws.bucket_map;
            (
                bucket_map.num_buckets(),
                bucket_map.bucket_spread(),
                bucket_map.memory_footprint(),
            )
        };
        let memory_footprint = self.memory_footprint();

        let shared = self.inner.lock.lock();
        SegmentStats {
            disk_footprint: shared.data_file_len + shared.idx_file_len,
            memory_footprint,
            memory_meta_footprint: bucket_bytes + shared.meta_footprint(),
            chunks_written: shared.chunk_info.len(),
            chunks_in_flight: shared.chunk_map.len()
                + shared.ordered_chunks.len()
                + shared.write_q.len(),
            pending_chunks: shared.pending_chunks.len(),
            serial_num: self.inner.serial_num(),
            last_persisted_serial: shared.last_persisted_serial,
            num_buckets,
            bucket_spread,
            frozen: self.inner.is_frozen(),
            modification_time: shared.modification_time,
        }
    }

    pub fn data_path(&self) -> &Path {
        &self.inner.dat_path
    }

    pub fn idx_path(&self) -> &Path {
        &self.inner.idx_path
    }

    /// Seal the active chunk and dispatch it for compression
    ///
    /// An empty active chunk is only sealed when `force` is set. Returns the
    /// sealed chunk id.
    fn seal_active(&self, ws: &mut WriteState, force: bool) -> Option<ChunkId> {
        let sealed = {
            let mut shared = self.inner.lock.lock();
            if shared.active.is_empty() && !force {
                return None;
            }
            let fresh = Chunk::new(ws.next_chunk_id, crate::config::INITIAL_CHUNK_CAPACITY);
            ws.next_chunk_id += 1;
            let mut sealed = std::mem::replace(&mut shared.active, fresh);
            if force {
                sealed.set_last_serial(self.inner.serial_num());
            }
            let sealed = Arc::new(sealed);
            shared.chunk_map.insert(sealed.id(), Arc::clone(&sealed));
            sealed
        };

        if let Some(bucketizer) = &self.inner.bucketizer {
            ws.bucket_map.record_chunk(bucketizer.as_ref(), sealed.lids());
        }

        let chunk_id = sealed.id();
        debug!(
            chunk_id,
            entries = sealed.len(),
            bytes = sealed.size(),
            last_serial = sealed.last_serial(),
            "chunk.sealed"
        );

        let inner = Arc::clone(&self.inner);
        self.executor
            .execute(Box::new(move || inner.compress_and_enqueue(sealed)));
        Some(chunk_id)
    }
}

impl Drop for WriteableFileChunk {
    fn drop(&mut self) {
        let shared = self.inner.lock.lock();
        let unwritten = shared.chunk_map.len()
            + shared.ordered_chunks.len()
            + shared.write_q.len()
            + usize::from(!shared.active.is_empty());
        if unwritten > 0 || !shared.pending_chunks.is_empty() {
            warn!(
                path = %self.inner.dat_path.display(),
                unwritten,
                pending = shared.pending_chunks.len(),
                "segment dropped before all chunks were durable"
            );
        }
    }
}

impl Inner {
    fn serial_num(&self) -> SerialNum {
        self.serial_num.load(Ordering::SeqCst)
    }

    fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Id of the most recently sealed chunk
    fn last_sealed_chunk_id(&self) -> Option<ChunkId> {
        self.lock.lock().active.id().checked_sub(1)
    }
}

impl Shared {
    fn meta_footprint(&self) -> usize {
        self.chunk_info
            .iter()
            .map(|r| {
                std::mem::size_of::<ChunkMetaRecord>()
                    + r.lids.capacity() * std::mem::size_of::<crate::LidMeta>()
            })
            .sum::<usize>()
            + self.pending_chunks.len() * std::mem::size_of::<PendingChunk>()
    }
}

fn check_entry_size(lid: Lid, len: usize) -> Result<()> {
    if len > MAX_ENTRY_BYTES {
        return Err(StoreError::InvalidState(format!(
            "entry of {} bytes for lid {} is too large",
            len, lid
        )));
    }
    Ok(())
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut path: OsString = base.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}

fn file_len(path: &Path) -> Result<u64> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)
        .map_err(StoreError::Io)
}

#[cfg(test)]
mod tests;

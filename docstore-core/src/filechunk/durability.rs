//! Fsync tracking for written chunks

use super::{Inner, Shared, SyncState};
use crate::{ChunkId, Result, SerialNum, StoreError};
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

impl Inner {
    /// Block until chunk `chunk_id` has been handed to the OS
    pub(super) fn wait_for_chunk_written(&self, chunk_id: ChunkId) -> Result<()> {
        let mut shared = self.lock.lock();
        while shared.first_chunk_id_to_be_written <= chunk_id {
            Self::check_fault(&shared)?;
            self.cond.wait(&mut shared);
        }
        Ok(())
    }

    /// Whether there is written data worth an fsync for `serial_num`
    ///
    /// The oldest pending run must be covered by `serial_num` and lie within
    /// the `dat_file_len` bytes the caller knows to be written; past that the
    /// flush policy decides.
    pub(super) fn need_flush_locked(
        &self,
        shared: &Shared,
        serial_num: SerialNum,
        dat_file_len: u64,
    ) -> bool {
        let Some(front) = shared.pending_chunks.front() else {
            return false;
        };
        if front.last_serial > serial_num || front.dat_end() > dat_file_len {
            return false;
        }
        let unsynced = shared.pending_dat + shared.pending_idx;
        let lag = serial_num.saturating_sub(shared.last_persisted_serial);
        self.config.flush_policy.should_flush(unsynced, lag)
    }

    pub(super) fn flush_pending_chunks(&self, serial_num: SerialNum) -> Result<bool> {
        let mut sync_state = self.flush_lock.lock();
        let need = {
            let shared = self.lock.lock();
            Self::check_fault(&shared)?;
            self.need_flush_locked(&shared, serial_num, shared.data_file_len)
        };
        if !need {
            return Ok(false);
        }
        self.sync_locked(&mut sync_state)?;
        Ok(true)
    }

    /// Fsync everything written so far, regardless of policy
    pub(super) fn sync_pending_chunks(&self) -> Result<()> {
        let mut sync_state = self.flush_lock.lock();
        self.sync_locked(&mut sync_state)
    }

    /// Fsync both files and retire pending runs in FIFO order up to the
    /// newest one present when the sync started
    fn sync_locked(&self, sync_state: &mut SyncState) -> Result<()> {
        let newest = {
            let shared = self.lock.lock();
            Self::check_fault(&shared)?;
            shared.pending_chunks.back().cloned()
        };
        let Some(newest) = newest else {
            return Ok(());
        };

        let synced = self
            .dat_file
            .sync_data()
            .and_then(|_| self.idx_file.sync_data());
        let mut shared = self.lock.lock();
        if let Err(e) = synced {
            let e = StoreError::Io(e);
            self.record_fault(&mut shared, format!("fsync failed: {}", e));
            return Err(e);
        }

        sync_state.syncs += 1;
        while let Some(done) = shared.pending_chunks.pop_front() {
            shared.pending_dat -= done.dat_len;
            shared.pending_idx -= done.idx_len;
            shared.last_persisted_serial = shared.last_persisted_serial.max(done.last_serial);
            if Arc::ptr_eq(&done, &newest) {
                break;
            }
        }
        shared.modification_time = Utc::now();
        self.cond.notify_all();

        debug!(
            last_chunk_id = newest.last_chunk_id,
            last_persisted_serial = shared.last_persisted_serial,
            syncs = sync_state.syncs,
            "chunks.synced"
        );
        Ok(())
    }
}

use super::*;
use crate::executor::{ManualExecutor, ThreadPoolExecutor};
use crate::LidInfoWithLid;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashMap;
use tempfile::TempDir;

/// 40-byte payloads against a 64-byte limit put one entry in each chunk
const PAYLOAD: usize = 40;

fn small_chunks() -> WriterConfig {
    WriterConfig {
        max_chunk_bytes: 64,
        ..WriterConfig::default()
    }
}

fn manual_segment(
    dir: &TempDir,
    config: WriterConfig,
) -> (WriteableFileChunk, Arc<ManualExecutor>) {
    let executor = Arc::new(ManualExecutor::new());
    let segment =
        WriteableFileChunk::open(dir.path().join("seg"), 0, config, executor.clone(), None)
            .unwrap();
    (segment, executor)
}

fn pooled_segment(dir: &TempDir, config: WriterConfig) -> WriteableFileChunk {
    let executor = Arc::new(ThreadPoolExecutor::new(4, "test-compress").unwrap());
    WriteableFileChunk::open(dir.path().join("seg"), 0, config, executor, None).unwrap()
}

fn payload(lid: Lid) -> Vec<u8> {
    format!("{:0width$}", lid, width = PAYLOAD).into_bytes()
}

fn read(segment: &WriteableFileChunk, lid: Lid, info: LidInfo) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    segment
        .read(lid, info, &mut buf)
        .unwrap()
        .map(|len| {
            assert_eq!(len, buf.len());
            buf
        })
}

fn assert_contiguous(metas: &[crate::chunk::ChunkMeta]) {
    let mut offset = 0;
    for (i, meta) in metas.iter().enumerate() {
        assert_eq!(meta.chunk_id as usize, i);
        assert_eq!(meta.offset, offset);
        offset = meta.end();
    }
}

#[test]
fn test_append_is_readable_immediately() {
    let temp_dir = TempDir::new().unwrap();
    let (segment, executor) = manual_segment(&temp_dir, WriterConfig::default());

    let a = segment.append(1, 10, b"alpha").unwrap();
    let b = segment.append(2, 11, b"beta").unwrap();
    assert_eq!(a.chunk_id, 0);
    assert_eq!(b.chunk_id, 0);
    assert_eq!(executor.submitted(), 0);

    assert_eq!(read(&segment, 10, a), Some(b"alpha".to_vec()));
    assert_eq!(read(&segment, 11, b), Some(b"beta".to_vec()));
    assert_eq!(read(&segment, 12, b), None);
    assert_eq!(segment.serial_num(), 2);
}

#[test]
fn test_out_of_order_compression_is_written_in_id_order() {
    let temp_dir = TempDir::new().unwrap();
    let (segment, executor) = manual_segment(&temp_dir, small_chunks());
    let empty_footprint = segment.disk_footprint();

    let handles: Vec<LidInfo> = (0..3)
        .map(|lid| segment.append(lid as u64 + 1, lid, &payload(lid)).unwrap())
        .collect();
    assert_eq!(
        handles.iter().map(|h| h.chunk_id).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert_eq!(executor.submitted(), 2);

    // Chunk 1 finishes first and has to wait for chunk 0
    executor.run(1);
    assert!(segment.chunk_metas().is_empty());
    assert_eq!(segment.disk_footprint(), empty_footprint);
    assert_eq!(read(&segment, 1, handles[1]), Some(payload(1)));
    assert_eq!(read(&segment, 0, handles[0]), Some(payload(0)));

    executor.run(0);
    let metas = segment.chunk_metas();
    assert_eq!(metas.len(), 2);
    assert_contiguous(&metas);

    segment.flush(false, 3).unwrap();
    assert_eq!(executor.submitted(), 3);
    executor.run(2);
    segment.flush(true, 3).unwrap();
    assert_eq!(segment.last_persisted_serial_num(), 3);

    let index = IndexFile::read(segment.idx_path()).unwrap();
    assert_eq!(index.chunk_metas(), segment.chunk_metas());
    assert!(index.validate().is_ok());
    assert_eq!(
        std::fs::metadata(segment.data_path()).unwrap().len(),
        index.data_len()
    );

    for (lid, info) in handles.iter().enumerate() {
        assert_eq!(read(&segment, lid as Lid, *info), Some(payload(lid as Lid)));
    }
}

#[test]
fn test_random_completion_orders() {
    for seed in 0..8u64 {
        let temp_dir = TempDir::new().unwrap();
        let (segment, executor) = manual_segment(&temp_dir, small_chunks());

        let handles: Vec<LidInfo> = (0..12)
            .map(|lid| segment.append(lid as u64 + 1, lid, &payload(lid)).unwrap())
            .collect();
        segment.flush(false, 12).unwrap();

        let mut order: Vec<usize> = (0..executor.submitted()).collect();
        order.shuffle(&mut StdRng::seed_from_u64(seed));
        for index in order {
            executor.run(index);
        }

        let metas = segment.chunk_metas();
        assert_eq!(metas.len(), 12);
        assert_contiguous(&metas);
        for (lid, info) in handles.iter().enumerate() {
            assert_eq!(read(&segment, lid as Lid, *info), Some(payload(lid as Lid)));
        }

        segment.wait_for_disk_to_catch_up_to_now().unwrap();
        assert_eq!(segment.last_persisted_serial_num(), 12);
    }
}

#[test]
fn test_blocking_flush_makes_entries_durable() {
    let temp_dir = TempDir::new().unwrap();
    let segment = pooled_segment(
        &temp_dir,
        WriterConfig {
            max_chunk_bytes: 512,
            ..WriterConfig::default()
        },
    );

    for lid in 0..200 {
        segment.append(lid as u64 + 1, lid, &payload(lid)).unwrap();
    }
    segment.flush(true, 200).unwrap();

    assert_eq!(segment.last_persisted_serial_num(), 200);
    let stats = segment.stats();
    assert_eq!(stats.chunks_in_flight, 0);
    assert_eq!(stats.pending_chunks, 0);

    let index = IndexFile::read(segment.idx_path()).unwrap();
    let entries: u32 = index.records.iter().map(|r| r.meta.entry_count).sum();
    assert_eq!(entries, 200);
    assert_eq!(
        segment.disk_footprint(),
        index.file_len + std::fs::metadata(segment.data_path()).unwrap().len()
    );
}

#[test]
fn test_flush_beyond_serial_forces_sync_point() {
    let temp_dir = TempDir::new().unwrap();
    let segment = pooled_segment(&temp_dir, WriterConfig::default());

    segment.flush(true, 50).unwrap();

    assert_eq!(segment.serial_num(), 50);
    assert_eq!(segment.last_persisted_serial_num(), 50);
    let metas = segment.chunk_metas();
    assert_eq!(metas.len(), 1);
    assert_eq!(metas[0].entry_count, 0);
    assert_eq!(metas[0].last_serial, 50);
}

#[test]
fn test_set_serial_num_never_regresses() {
    let temp_dir = TempDir::new().unwrap();
    let (segment, _executor) = manual_segment(&temp_dir, WriterConfig::default());

    segment.set_serial_num(100);
    segment.set_serial_num(40);
    assert_eq!(segment.serial_num(), 100);

    assert!(matches!(
        segment.append(99, 1, b"late"),
        Err(StoreError::InvalidState(_))
    ));
    segment.append(100, 1, b"on time").unwrap();
}

#[test]
fn test_freeze_rejects_appends() {
    let temp_dir = TempDir::new().unwrap();
    let segment = pooled_segment(&temp_dir, small_chunks());

    for lid in 0..5 {
        segment.append(lid as u64 + 1, lid, &payload(lid)).unwrap();
    }
    segment.freeze().unwrap();
    assert!(segment.is_frozen());
    assert_eq!(segment.last_persisted_serial_num(), 5);
    let footprint = segment.disk_footprint();

    assert!(matches!(
        segment.append(6, 6, b"too late"),
        Err(StoreError::InvalidState(_))
    ));
    // No forced sync point is written after freeze
    segment.flush(true, 1000).unwrap();
    segment.freeze().unwrap();
    assert_eq!(segment.disk_footprint(), footprint);
    assert_eq!(segment.chunk_metas().len(), 5);
}

#[test]
fn test_flush_with_concurrent_appends() {
    let temp_dir = TempDir::new().unwrap();
    let segment = pooled_segment(
        &temp_dir,
        WriterConfig {
            max_chunk_bytes: 256,
            ..WriterConfig::default()
        },
    );

    std::thread::scope(|scope| {
        scope.spawn(|| {
            for lid in 0..2000 {
                segment.append(lid as u64 + 1, lid, &payload(lid)).unwrap();
            }
        });

        for _ in 0..20 {
            let serial_num = segment.serial_num();
            segment.flush(true, serial_num).unwrap();
            assert!(segment.last_persisted_serial_num() >= serial_num);
        }
    });

    segment.flush(true, 2000).unwrap();
    assert_eq!(segment.last_persisted_serial_num(), 2000);
    assert_contiguous(&segment.chunk_metas());
}

#[test]
fn test_flush_pending_chunks_follows_policy() {
    let temp_dir = TempDir::new().unwrap();
    let config = WriterConfig {
        flush_policy: FlushPolicy {
            max_unsynced_bytes: 1 << 20,
            max_serial_lag: 1000,
        },
        ..small_chunks()
    };
    let (segment, executor) = manual_segment(&temp_dir, config);

    segment.append(1, 1, &payload(1)).unwrap();
    segment.append(2, 2, &payload(2)).unwrap();
    executor.run(0);
    let dat_len = std::fs::metadata(segment.data_path()).unwrap().len();

    // Front run covers serial 1
    assert!(!segment.need_flush_pending_chunks(0, dat_len));
    // Covered, but below both thresholds
    assert!(!segment.need_flush_pending_chunks(1, dat_len));
    assert!(!segment.flush_pending_chunks(1).unwrap());
    // Caller has not seen the bytes yet
    assert!(!segment.need_flush_pending_chunks(2000, dat_len - 1));
    assert!(segment.need_flush_pending_chunks(2000, dat_len));

    assert!(segment.flush_pending_chunks(2000).unwrap());
    assert_eq!(segment.last_persisted_serial_num(), 1);
    assert!(!segment.need_flush_pending_chunks(2000, dat_len));
}

#[test]
fn test_eager_policy_syncs_anything_covered() {
    let temp_dir = TempDir::new().unwrap();
    let (segment, executor) = manual_segment(&temp_dir, small_chunks());

    segment.append(1, 1, &payload(1)).unwrap();
    segment.append(2, 2, &payload(2)).unwrap();
    executor.run(0);

    assert!(segment.flush_pending_chunks(1).unwrap());
    assert_eq!(segment.last_persisted_serial_num(), 1);
    assert!(!segment.flush_pending_chunks(2).unwrap());
}

#[test]
fn test_fault_stops_writes() {
    let temp_dir = TempDir::new().unwrap();
    let (segment, executor) = manual_segment(&temp_dir, small_chunks());

    segment.append(1, 1, &payload(1)).unwrap();
    segment.append(2, 2, &payload(2)).unwrap();
    segment.inner.set_fault("injected".into());

    assert!(matches!(
        segment.append(3, 3, b"x"),
        Err(StoreError::Faulted(_))
    ));
    assert!(matches!(
        segment.flush(true, 2),
        Err(StoreError::Faulted(_))
    ));

    // Compression finishing after the fault writes nothing
    executor.run_all();
    assert!(segment.chunk_metas().is_empty());
    assert!(segment.flush(false, 2).unwrap_err().is_fatal());
}

#[test]
fn test_compression_failure_faults_segment() {
    let temp_dir = TempDir::new().unwrap();
    let (segment, executor) = manual_segment(&temp_dir, small_chunks());

    let first = segment.append(1, 1, &payload(1)).unwrap();
    segment.append(2, 2, &payload(2)).unwrap();
    segment.inner.failures.compression.store(true, Ordering::SeqCst);
    executor.run(0);

    assert!(matches!(
        segment.flush(true, 2),
        Err(StoreError::Faulted(_))
    ));
    assert!(segment.chunk_metas().is_empty());
    assert_eq!(file_len(segment.data_path()).unwrap(), 0);
    assert!(!segment.inner.lock.lock().write_task_running);
    // The chunk that failed to compress is still served from memory
    assert_eq!(read(&segment, 1, first), Some(payload(1)));
}

#[test]
fn test_write_failure_wakes_blocked_flush() {
    let temp_dir = TempDir::new().unwrap();
    let (segment, executor) = manual_segment(&temp_dir, small_chunks());

    let handles: Vec<LidInfo> = (1..=2)
        .map(|lid| segment.append(lid as u64, lid, &payload(lid)).unwrap())
        .collect();
    segment.flush(false, 2).unwrap();
    assert_eq!(executor.submitted(), 2);
    segment.inner.failures.write.store(true, Ordering::SeqCst);

    let waited = std::thread::scope(|scope| {
        let waiter = scope.spawn(|| segment.wait_for_disk_to_catch_up_to_now());
        std::thread::sleep(std::time::Duration::from_millis(50));
        executor.run(1);
        executor.run(0);
        waiter.join().unwrap()
    });
    assert!(matches!(waited, Err(StoreError::Faulted(_))));

    // Neither the failed run nor anything after it reached the files
    {
        let shared = segment.inner.lock.lock();
        assert!(!shared.write_task_running);
        assert!(shared.chunk_info.is_empty());
        assert!(shared.pending_chunks.is_empty());
        assert_eq!(shared.data_file_len, 0);
    }
    assert_eq!(file_len(segment.data_path()).unwrap(), 0);
    let header_len = file_len(segment.idx_path()).unwrap();
    assert_eq!(segment.disk_footprint(), header_len);

    // Chunks stuck in the write queue stay readable
    for (lid, info) in (1..=2).zip(&handles) {
        assert_eq!(read(&segment, lid, *info), Some(payload(lid)));
    }
    assert!(matches!(
        segment.flush(true, 2),
        Err(StoreError::Faulted(_))
    ));
}

#[test]
fn test_reopen_resumes_segment() {
    let temp_dir = TempDir::new().unwrap();
    let mut handles = Vec::new();
    let metas = {
        let segment = pooled_segment(&temp_dir, small_chunks());
        for lid in 0..10 {
            handles.push((lid, segment.append(lid as u64 + 1, lid, &payload(lid)).unwrap()));
        }
        segment.flush(true, 10).unwrap();
        segment.chunk_metas()
    };

    let segment = pooled_segment(&temp_dir, small_chunks());
    assert_eq!(segment.chunk_metas(), metas);
    assert_eq!(segment.serial_num(), 10);
    assert_eq!(segment.last_persisted_serial_num(), 10);

    let mut lid_map: HashMap<Lid, LidInfo> = HashMap::new();
    assert_eq!(segment.update_lid_map(&mut lid_map, 0), 10);
    for (lid, info) in &handles {
        assert_eq!(lid_map[lid], *info);
        assert_eq!(read(&segment, *lid, *info), Some(payload(*lid)));
    }

    // Only chunks newer than the given serial number are reported
    let mut newer: HashMap<Lid, LidInfo> = HashMap::new();
    assert_eq!(segment.update_lid_map(&mut newer, 7), 3);

    let info = segment.append(11, 100, b"after reopen").unwrap();
    assert_eq!(info.chunk_id, 10);
    segment.flush(true, 11).unwrap();

    let index = IndexFile::read(segment.idx_path()).unwrap();
    assert_eq!(index.records.len(), 11);
    assert!(index.validate().is_ok());
}

#[test]
fn test_reopen_rejects_mismatched_data_file() {
    let temp_dir = TempDir::new().unwrap();
    {
        let segment = pooled_segment(&temp_dir, small_chunks());
        segment.append(1, 1, &payload(1)).unwrap();
        segment.freeze().unwrap();

        let mut file = OpenOptions::new()
            .append(true)
            .open(segment.data_path())
            .unwrap();
        std::io::Write::write_all(&mut file, b"garbage").unwrap();
    }

    let executor = Arc::new(ThreadPoolExecutor::new(1, "test-compress").unwrap());
    let result = WriteableFileChunk::open(
        temp_dir.path().join("seg"),
        0,
        small_chunks(),
        executor,
        None,
    );
    assert!(matches!(result, Err(StoreError::Corruption(_))));
}

#[test]
fn test_footprints_and_stats() {
    let temp_dir = TempDir::new().unwrap();
    let executor = Arc::new(ManualExecutor::new());
    let bucketizer: Arc<dyn Bucketizer> = Arc::new(|lid: Lid| u64::from(lid % 2));
    let segment = WriteableFileChunk::open(
        temp_dir.path().join("seg"),
        0,
        small_chunks(),
        executor.clone(),
        Some(bucketizer),
    )
    .unwrap();

    let empty_memory = segment.memory_footprint();
    for lid in 0..4 {
        segment.append(lid as u64 + 1, lid, &payload(lid)).unwrap();
    }
    assert!(segment.memory_footprint() > empty_memory);
    // Nothing is written yet, so only the bucket map counts as metadata
    assert!(segment.chunk_metas().is_empty());
    assert!(segment.memory_meta_footprint() > 0);

    segment.flush(false, 4).unwrap();
    executor.run_all();
    let opened = segment.modification_time();
    segment.wait_for_disk_to_catch_up_to_now().unwrap();
    assert!(segment.modification_time() >= opened);

    let stats = segment.stats();
    assert_eq!(stats.chunks_written, 4);
    assert_eq!(stats.chunks_in_flight, 0);
    assert_eq!(stats.last_persisted_serial, 4);
    assert_eq!(stats.num_buckets, 2);
    assert!((stats.bucket_spread - 1.0).abs() < f64::EPSILON);
    assert!(stats.memory_meta_footprint > 0);
    assert_eq!(stats.disk_footprint, segment.disk_footprint());

    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["chunks_written"], 4);
}

#[test]
fn test_reads_race_with_sealing() {
    let temp_dir = TempDir::new().unwrap();
    let segment = pooled_segment(
        &temp_dir,
        WriterConfig {
            max_chunk_bytes: 128,
            ..WriterConfig::default()
        },
    );
    let published: parking_lot::Mutex<Vec<LidInfoWithLid>> = parking_lot::Mutex::new(Vec::new());
    let done = AtomicBool::new(false);
    let total = 3000u32;

    let reads: usize = std::thread::scope(|scope| {
        let readers: Vec<_> = (0..3u64)
            .map(|seed| {
                let (segment, published, done) = (&segment, &published, &done);
                scope.spawn(move || {
                    let mut rng = StdRng::seed_from_u64(seed);
                    let mut reads = 0;
                    let mut buf = Vec::new();
                    while !done.load(Ordering::SeqCst) {
                        let sample: Vec<LidInfoWithLid> = {
                            let published = published.lock();
                            published.choose_multiple(&mut rng, 16).copied().collect()
                        };
                        for item in &sample {
                            let len = segment.read(item.lid, item.info, &mut buf).unwrap();
                            assert_eq!(len, Some(PAYLOAD));
                            assert_eq!(buf, payload(item.lid));
                        }

                        let mut seen = 0;
                        segment
                            .read_batch(&sample, &mut |lid: Lid, data: &[u8]| {
                                assert_eq!(data, &payload(lid)[..]);
                                seen += 1;
                            })
                            .unwrap();
                        assert_eq!(seen, sample.len());
                        reads += sample.len() * 2;
                    }
                    reads
                })
            })
            .collect();

        for lid in 0..total {
            let info = segment.append(lid as u64 + 1, lid, &payload(lid)).unwrap();
            published.lock().push(LidInfoWithLid::new(lid, info));
            if lid % 500 == 499 {
                segment.flush(false, lid as u64 + 1).unwrap();
            }
        }
        segment.flush(true, total as u64).unwrap();
        done.store(true, Ordering::SeqCst);
        readers.into_iter().map(|r| r.join().unwrap()).sum()
    });

    assert!(reads > 0);
    assert_eq!(segment.last_persisted_serial_num(), total as u64);
    assert_contiguous(&segment.chunk_metas());
    for item in published.lock().iter().step_by(97) {
        assert_eq!(read(&segment, item.lid, item.info), Some(payload(item.lid)));
    }
}

#[test]
fn test_entry_size_leaves_room_for_frame() {
    assert!(check_entry_size(1, 0).is_ok());
    assert!(check_entry_size(1, MAX_ENTRY_BYTES).is_ok());
    assert!(matches!(
        check_entry_size(1, MAX_ENTRY_BYTES + 1),
        Err(StoreError::InvalidState(_))
    ));
    // A lone maximal entry produces a frame of exactly u32::MAX bytes
    assert_eq!(
        MAX_ENTRY_BYTES + ENTRY_HEADER_SIZE + ChunkFrame::HEADER_SIZE + ChunkFrame::TRAILER_SIZE,
        u32::MAX as usize
    );
}

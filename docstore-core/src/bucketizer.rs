//! Bucket density sampling
//!
//! Documents map to buckets through a caller-supplied [`Bucketizer`]. Each
//! sealed chunk is sampled once; the computer tracks how many distinct
//! buckets a chunk touches on average, which tells the layers above how well
//! the segment is clustered.

use crate::{Lid, LidMeta};
use std::collections::{HashMap, HashSet};

/// Maps a lid to the bucket that owns it
pub trait Bucketizer: Send + Sync {
    fn bucket_of(&self, lid: Lid) -> u64;
}

impl<F> Bucketizer for F
where
    F: Fn(Lid) -> u64 + Send + Sync,
{
    fn bucket_of(&self, lid: Lid) -> u64 {
        self(lid)
    }
}

/// Accumulates bucket statistics over the sealed chunks of a segment
#[derive(Debug, Default, Clone)]
pub struct BucketDensityComputer {
    /// Entry count per bucket
    buckets: HashMap<u64, u64>,
    /// Sum over chunks of distinct buckets in that chunk
    chunk_bucket_sum: u64,
    chunks: u64,
}

impl BucketDensityComputer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sample one sealed chunk
    pub fn record_chunk(&mut self, bucketizer: &dyn Bucketizer, lids: &[LidMeta]) {
        if lids.is_empty() {
            return;
        }
        let mut distinct = HashSet::new();
        for meta in lids {
            let bucket = bucketizer.bucket_of(meta.lid);
            *self.buckets.entry(bucket).or_insert(0) += 1;
            distinct.insert(bucket);
        }
        self.chunk_bucket_sum += distinct.len() as u64;
        self.chunks += 1;
    }

    /// Number of distinct buckets seen
    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Average number of distinct buckets per sampled chunk
    pub fn bucket_spread(&self) -> f64 {
        if self.chunks == 0 {
            return 0.0;
        }
        self.chunk_bucket_sum as f64 / self.chunks as f64
    }

    pub fn memory_footprint(&self) -> usize {
        self.buckets.capacity() * std::mem::size_of::<(u64, u64)>()
    }
}

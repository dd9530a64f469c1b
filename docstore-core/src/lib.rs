//! DocStore Core - Append-Only Segment Storage for Document Payloads
//!
//! Each segment is a data file of compressed chunks plus an index file
//! describing them. Writers append `(serial number, lid, payload)` entries;
//! readers fetch payloads back through the handle returned by the append,
//! whether the entry is still in memory or already on disk.
//!
//! # Architecture
//!
//! - **Chunk**: in-memory accumulation buffer, sealed when full
//! - **Compression**: sealed chunks are compressed on an [`executor::Executor`]
//! - **Writeback**: compressed chunks are written strictly in chunk id order
//! - **Durability**: written chunks are fsynced and retired oldest first
//!
//! [`WriteableFileChunk`] ties these together for one segment.

pub mod bucketizer;
pub mod chunk;
pub mod compression;
pub mod executor;
pub mod filechunk;
pub mod header;
pub mod index;

mod error;
mod types;

pub use error::{Result, StoreError};
pub use filechunk::{FlushPolicy, SegmentStats, WriteableFileChunk, WriterConfig, MAX_ENTRY_BYTES};
pub use types::*;

/// DocStore version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Seal the active chunk beyond this many body bytes (64KB)
    pub const MAX_CHUNK_BYTES: usize = 0x10000;

    /// Initial buffer capacity of a fresh chunk (4KB)
    pub const INITIAL_CHUNK_CAPACITY: usize = 4 * 1024;

    /// Compression worker threads
    pub const COMPRESSION_THREADS: usize = 4;

    /// Default compression level
    pub const COMPRESSION_LEVEL: u8 = 9;

    /// Keep compressed output only below this percentage of the input
    pub const COMPRESSION_THRESHOLD: u8 = 60;
}

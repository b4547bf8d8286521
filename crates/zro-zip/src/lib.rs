#![forbid(unsafe_code)]
//! Shared cluster decompression for the zro read path.
//!
//! File pages are attached to per-cluster works ([`WorkBuilder`]), works
//! are deduplicated through the [`WorkgroupRegistry`], compressed pages are
//! read in merged batches or served from the [`CompressedPageCache`], and
//! each cluster is decompressed once into every page that waits on it.
//! [`ZipContext`] is the entry point.

pub mod cache;
pub mod config;
mod context;
pub mod decompressor;
mod frontend;
pub mod online;
pub mod pagevec;
pub mod registry;
pub mod stats;
mod submit;
mod unzip;
pub mod work;

pub use cache::{CacheStats, CompressedPageCache, MigrateMode, ScanOutcome};
pub use config::{CacheStrategy, DecompressPolicy, ThresholdPolicy, ZipConfig};
pub use context::{ZipBackends, ZipContext};
pub use decompressor::{
    ClusterFormat, Decompressor, DecompressorRegistry, Lz4Decompressor, PlainCopy,
};
pub use pagevec::{
    CARRIER_CHUNK_LEN, INLINE_PAGEVECS, PageType, PageVec, PageVecChunk, PageVecEntry,
};
pub use registry::{Link, RegistryStats, Workgroup, WorkgroupRegistry};
pub use stats::{BufferPath, ZipCounters, ZipStats};
pub use work::{WorkBuilder, WorkRole};

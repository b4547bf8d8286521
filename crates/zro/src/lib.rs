#![forbid(unsafe_code)]
//! zro public API facade.
//!
//! Re-exports the read path from the member crates through one stable
//! interface. Downstream consumers (harness, tools) depend on this crate.

pub use zro_block::{
    BlockDevice, BlockMetaAccessor, BlockReader, ByteBlockDevice, ByteDevice, DeviceBlockReader,
    FileByteDevice, MappingId, MemByteDevice, MemPageCache, Page, PageCache, PageOwner, PagePool,
    ReadCompletion, ReadRequest, ReaderStats, ThreadedBlockReader,
};
pub use zro_error::{Result, ZroError};
pub use zro_extent::{ExtentIndexResolver, MappingDescriptor, ResolverOptions, ZipInode};
pub use zro_ondisk::{ClusterIndexRecord, ClusterType};
pub use zro_types::{
    BLOCK_SIZE, BlockNumber, ClusterGeometry, InodeNumber, PAGE_SIZE, PageIndex,
};
pub use zro_zip::{
    CARRIER_CHUNK_LEN, CacheStrategy, ClusterFormat, DecompressPolicy, Decompressor,
    DecompressorRegistry, INLINE_PAGEVECS, Lz4Decompressor, MigrateMode, PlainCopy,
    ThresholdPolicy, ZipBackends, ZipConfig, ZipContext, ZipStats,
};

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Page granularity of every cache and destination buffer.
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Metadata and compressed-data block size. Blocks and pages coincide.
pub const BLOCK_SHIFT: u32 = PAGE_SHIFT;
pub const BLOCK_SIZE: usize = 1 << BLOCK_SHIFT;

/// Largest supported physical cluster (1 MiB).
pub const MAX_CLUSTER_BITS: u8 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// Node id of an inode (its metadata slot number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

/// Index of a page within some owner (a file or the compressed-page cache).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageIndex(pub u64);

/// Logical cluster number within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterNumber(pub u64);

/// Validated physical cluster geometry.
///
/// A cluster is `1 << cluster_bits` bytes and always spans a whole number of
/// pages, so `cluster_bits` must be at least [`PAGE_SHIFT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterGeometry {
    cluster_bits: u8,
}

impl ClusterGeometry {
    pub fn new(cluster_bits: u8) -> Result<Self, ParseError> {
        if u32::from(cluster_bits) < PAGE_SHIFT || cluster_bits > MAX_CLUSTER_BITS {
            return Err(ParseError::InvalidField {
                field: "cluster_bits",
                reason: "must be in PAGE_SHIFT..=20",
            });
        }
        Ok(Self { cluster_bits })
    }

    #[must_use]
    pub fn bits(self) -> u32 {
        u32::from(self.cluster_bits)
    }

    #[must_use]
    pub fn cluster_size(self) -> u64 {
        1_u64 << self.cluster_bits
    }

    /// Number of pages (and blocks) making up one physical cluster.
    #[must_use]
    pub fn cluster_pages(self) -> usize {
        1_usize << (self.bits() - PAGE_SHIFT)
    }

    /// Logical cluster containing `offset`.
    #[must_use]
    pub fn cluster_of(self, offset: u64) -> ClusterNumber {
        ClusterNumber(offset >> self.cluster_bits)
    }

    /// Byte position of `offset` inside its cluster.
    #[must_use]
    pub fn offset_in_cluster(self, offset: u64) -> u64 {
        offset & (self.cluster_size() - 1)
    }

    /// First byte of logical cluster `lcn`, `None` on overflow.
    #[must_use]
    pub fn cluster_start(self, lcn: ClusterNumber) -> Option<u64> {
        lcn.0.checked_mul(self.cluster_size())
    }
}

impl Default for ClusterGeometry {
    fn default() -> Self {
        Self {
            cluster_bits: PAGE_SHIFT as u8,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ClusterNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lcn {}", self.0)
    }
}

impl BlockNumber {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Byte address of this block, `None` on overflow.
    #[must_use]
    pub fn to_byte_offset(self) -> Option<u64> {
        self.0.checked_mul(BLOCK_SIZE as u64)
    }

    /// Block containing byte address `offset`.
    #[must_use]
    pub fn containing(offset: u64) -> Self {
        Self(offset >> BLOCK_SHIFT)
    }
}

impl PageIndex {
    /// First byte covered by this page, `None` on overflow.
    #[must_use]
    pub fn byte_offset(self) -> Option<u64> {
        self.0.checked_mul(PAGE_SIZE as u64)
    }
}

impl ClusterNumber {
    #[must_use]
    pub fn checked_sub(self, count: u64) -> Option<Self> {
        self.0.checked_sub(count).map(Self)
    }
}

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` on overflow
/// or if `alignment` is invalid.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

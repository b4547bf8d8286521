#![forbid(unsafe_code)]
//! On-disk structures of the variable-length-extent (VLE) cluster index.
//!
//! Every compressed inode carries, right after its inode body and inline
//! xattrs (8-byte aligned) and a 16-byte extent header, one 8-byte
//! [`ClusterIndexRecord`] per logical cluster:
//!
//! ```text
//! 0        2            4                     8
//! +--------+------------+---------------------+
//! | advise | clusterofs | blkaddr / delta[2]  |
//! +--------+------------+---------------------+
//! ```
//!
//! All fields are little-endian. The low two bits of `advise` are the
//! [`ClusterType`]; bits 4..8 are only meaningful for the compatibility
//! type and extend its previous-cluster count.

use serde::{Deserialize, Serialize};
use zro_types::{BLOCK_SHIFT, InodeNumber, ParseError, align_up, read_le_u16, read_le_u32};

/// Size of one encoded [`ClusterIndexRecord`].
pub const CLUSTER_INDEX_RECORD_SIZE: usize = 8;
/// Size of the extent header preceding the record array.
pub const EXTENT_HEADER_SIZE: u64 = 16;
/// Alignment of the record area after inode body + inline xattrs.
pub const EXTENT_ALIGN: u64 = 8;
/// Inode slots are `1 << ISLOT_BITS` bytes; a nid indexes slots.
pub const ISLOT_BITS: u32 = 5;

const CLUSTER_TYPE_BITS: u16 = 2;
const COMPAT_COUNT_SHIFT: u16 = 4;
const COMPAT_COUNT_BITS: u16 = 4;

/// Kind of a logical cluster, from the low bits of `advise`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterType {
    /// Starts an uncompressed extent.
    Plain,
    /// Starts a compressed extent.
    Head,
    /// Continuation cluster; `delta[0]` points back to its head.
    NonHead,
    /// Compatibility head packing a previous-cluster count into spare bits.
    Compat,
}

impl ClusterType {
    #[must_use]
    pub fn from_bits(bits: u16) -> Self {
        match bits & ((1 << CLUSTER_TYPE_BITS) - 1) {
            0 => Self::Plain,
            1 => Self::Head,
            2 => Self::NonHead,
            _ => Self::Compat,
        }
    }

    #[must_use]
    pub fn to_bits(self) -> u16 {
        match self {
            Self::Plain => 0,
            Self::Head => 1,
            Self::NonHead => 2,
            Self::Compat => 3,
        }
    }
}

/// One decoded extent-index record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterIndexRecord {
    pub advise: u16,
    pub clusterofs: u16,
    /// Raw union word: `blkaddr` for heads, `delta[0] | delta[1] << 16` otherwise.
    pub payload: u32,
}

impl ClusterIndexRecord {
    /// Head of a compressed extent starting `clusterofs` bytes into its
    /// logical cluster, stored at physical block `blkaddr`.
    #[must_use]
    pub fn head(clusterofs: u16, blkaddr: u32) -> Self {
        Self {
            advise: ClusterType::Head.to_bits(),
            clusterofs,
            payload: blkaddr,
        }
    }

    /// Head of an uncompressed extent.
    #[must_use]
    pub fn plain(clusterofs: u16, blkaddr: u32) -> Self {
        Self {
            advise: ClusterType::Plain.to_bits(),
            clusterofs,
            payload: blkaddr,
        }
    }

    /// Continuation cluster `back` clusters after its head.
    #[must_use]
    pub fn nonhead(back: u16, forward: u16) -> Self {
        Self {
            advise: ClusterType::NonHead.to_bits(),
            clusterofs: 0,
            payload: u32::from(back) | (u32::from(forward) << 16),
        }
    }

    /// Compatibility record whose extent head lies `previous` clusters back.
    ///
    /// The low nibble of `previous` is stored as a multiple of `cluster_size`
    /// added to `clusterofs`, the next nibble in bits 4..8 of `advise`.
    /// Returns `None` when the count does not fit that packing.
    #[must_use]
    pub fn compat(clusterofs: u16, previous: u64, cluster_size: u64, blkaddr: u32) -> Option<Self> {
        let high = previous >> COMPAT_COUNT_SHIFT;
        if high >= 1 << COMPAT_COUNT_BITS || u64::from(clusterofs) >= cluster_size {
            return None;
        }
        let packed = (previous & 0xF)
            .checked_mul(cluster_size)?
            .checked_add(u64::from(clusterofs))?;
        Some(Self {
            advise: ClusterType::Compat.to_bits() | ((high as u16) << COMPAT_COUNT_SHIFT),
            clusterofs: u16::try_from(packed).ok()?,
            payload: blkaddr,
        })
    }

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < CLUSTER_INDEX_RECORD_SIZE {
            return Err(ParseError::InsufficientData {
                needed: CLUSTER_INDEX_RECORD_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            advise: read_le_u16(bytes, 0)?,
            clusterofs: read_le_u16(bytes, 2)?,
            payload: read_le_u32(bytes, 4)?,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; CLUSTER_INDEX_RECORD_SIZE] {
        let mut out = [0_u8; CLUSTER_INDEX_RECORD_SIZE];
        out[0..2].copy_from_slice(&self.advise.to_le_bytes());
        out[2..4].copy_from_slice(&self.clusterofs.to_le_bytes());
        out[4..8].copy_from_slice(&self.payload.to_le_bytes());
        out
    }

    #[must_use]
    pub fn cluster_type(&self) -> ClusterType {
        ClusterType::from_bits(self.advise)
    }

    /// Physical block of a head/plain/compat record.
    #[must_use]
    pub fn blkaddr(&self) -> u32 {
        self.payload
    }

    /// Distance back to the head cluster (NONHEAD only).
    #[must_use]
    pub fn delta0(&self) -> u16 {
        (self.payload & 0xFFFF) as u16
    }

    /// Distance forward to the next head cluster (NONHEAD only).
    #[must_use]
    pub fn delta1(&self) -> u16 {
        (self.payload >> 16) as u16
    }

    /// Number of logical clusters the compatibility record says precede its
    /// extent head.
    #[must_use]
    pub fn compat_previous_clusters(&self, cluster_size: u64) -> u64 {
        let high = (self.advise >> COMPAT_COUNT_SHIFT) & ((1 << COMPAT_COUNT_BITS) - 1);
        (u64::from(self.clusterofs) / cluster_size) | (u64::from(high) << COMPAT_COUNT_SHIFT)
    }
}

/// Byte address of inode slot `nid` in a metadata area starting at block
/// `meta_blkaddr`.
#[must_use]
pub fn inode_location(meta_blkaddr: u32, nid: InodeNumber) -> Option<u64> {
    let base = u64::from(meta_blkaddr).checked_shl(BLOCK_SHIFT)?;
    base.checked_add(nid.0.checked_mul(1 << ISLOT_BITS)?)
}

/// Byte address of record 0 of an inode's extent index.
#[must_use]
pub fn extent_index_base(
    meta_blkaddr: u32,
    nid: InodeNumber,
    inode_isize: u16,
    xattr_isize: u16,
) -> Option<u64> {
    let body = align_up(
        u64::from(inode_isize) + u64::from(xattr_isize),
        EXTENT_ALIGN,
    )?;
    inode_location(meta_blkaddr, nid)?
        .checked_add(body)?
        .checked_add(EXTENT_HEADER_SIZE)
}

/// Byte address of the record describing logical cluster `lcn`.
#[must_use]
pub fn record_address(index_base: u64, lcn: u64) -> Option<u64> {
    index_base.checked_add(lcn.checked_mul(CLUSTER_INDEX_RECORD_SIZE as u64)?)
}

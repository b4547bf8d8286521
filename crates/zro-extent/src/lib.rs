#![forbid(unsafe_code)]
//! Extent index resolution for VLE-compressed inodes.
//!
//! [`ExtentIndexResolver::map_blocks`] turns a logical byte offset into a
//! [`MappingDescriptor`]: the logical extent containing it (clipped to the
//! current logical cluster), the physical cluster holding its data and
//! whether that cluster is compressed.
//!
//! # Design
//!
//! Each logical cluster has one [`ClusterIndexRecord`]. A HEAD or PLAIN
//! record starts a new extent `clusterofs` bytes into its cluster; bytes
//! before that still belong to the previous extent. A NONHEAD record points
//! back to an earlier record through `delta[0]`. Resolving an offset that is
//! not covered by a head in its own cluster therefore walks backward until a
//! head is found. The walk is an explicit loop bounded by
//! [`MAX_HEAD_WALK`]; every NONHEAD hop must strictly decrease the logical
//! cluster number.
//!
//! The metadata page holding the current record stays locked while it is
//! decoded and is kept in a [`MetaCursor`] afterwards, so consecutive calls
//! touching the same metadata block do not go back to the page cache.
//!
//! # Walking mode
//!
//! A descriptor with a non-zero `logical_length` is extended instead of
//! re-derived: the resolver reads the record at `logical_offset +
//! logical_length` and adds that cluster's logical contribution.
//!
//! # Logging
//!
//! Target `zro::extent`: `map_blocks_enter` / `map_blocks_exit` at TRACE,
//! corrupt records at ERROR.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, trace};
use zro_block::{BlockMetaAccessor, Page};
use zro_error::{Result, ZroError};
use zro_ondisk::{
    CLUSTER_INDEX_RECORD_SIZE, ClusterIndexRecord, ClusterType, extent_index_base, record_address,
};
use zro_types::{
    BLOCK_SHIFT, BLOCK_SIZE, BlockNumber, ClusterGeometry, InodeNumber, PageIndex, ensure_slice,
};

/// Upper bound on records visited while looking for an extent head.
pub const MAX_HEAD_WALK: u32 = 4096;

/// Resolver behaviour switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverOptions {
    /// Accept the compatibility cluster type (type 3) that packs a
    /// previous-cluster count into spare bits. Rejected as corruption when
    /// disabled.
    pub compat_previous_clusters: bool,
}

/// Read-side view of a compressed inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZipInode {
    pub nid: InodeNumber,
    /// File size in bytes.
    pub size: u64,
    /// Byte address of the record describing logical cluster 0.
    pub index_base: u64,
}

impl ZipInode {
    /// Derive the index location from the inode's on-disk layout.
    pub fn from_layout(
        meta_blkaddr: u32,
        nid: InodeNumber,
        size: u64,
        inode_isize: u16,
        xattr_isize: u16,
    ) -> Result<Self> {
        let index_base = extent_index_base(meta_blkaddr, nid, inode_isize, xattr_isize)
            .ok_or_else(|| ZroError::Format(format!("extent index of nid {nid} overflows")))?;
        Ok(Self {
            nid,
            size,
            index_base,
        })
    }
}

/// One resolved (or partially resolved) logical range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingDescriptor {
    pub logical_offset: u64,
    pub logical_length: u64,
    pub physical_offset: u64,
    pub physical_length: u64,
    pub compressed: bool,
    pub mapped: bool,
}

impl MappingDescriptor {
    /// A fresh request for the extent containing `offset`.
    #[must_use]
    pub fn starting_at(offset: u64) -> Self {
        Self {
            logical_offset: offset,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn logical_end(&self) -> u64 {
        self.logical_offset.saturating_add(self.logical_length)
    }

    #[must_use]
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.logical_offset && offset < self.logical_end()
    }

    /// First physical block of the mapped cluster.
    #[must_use]
    pub fn physical_block(&self) -> BlockNumber {
        BlockNumber::containing(self.physical_offset)
    }
}

/// Metadata page remembered between resolver calls.
#[derive(Debug, Default)]
pub struct MetaCursor {
    page: Option<Arc<Page>>,
}

impl MetaCursor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block number of the remembered page, if any.
    #[must_use]
    pub fn block(&self) -> Option<BlockNumber> {
        self.page.as_ref().map(|p| BlockNumber(p.index().0))
    }

    pub fn release(&mut self) {
        self.page = None;
    }
}

/// Unlocks the held metadata page on drop.
struct HeldMeta(Arc<Page>);

impl Drop for HeldMeta {
    fn drop(&mut self) {
        self.0.unlock();
    }
}

/// Decodes cluster-index records into mappings.
#[derive(Debug)]
pub struct ExtentIndexResolver {
    meta: Arc<BlockMetaAccessor>,
    geometry: ClusterGeometry,
    options: ResolverOptions,
}

impl ExtentIndexResolver {
    #[must_use]
    pub fn new(
        meta: Arc<BlockMetaAccessor>,
        geometry: ClusterGeometry,
        options: ResolverOptions,
    ) -> Self {
        Self {
            meta,
            geometry,
            options,
        }
    }

    #[must_use]
    pub fn geometry(&self) -> ClusterGeometry {
        self.geometry
    }

    /// Resolve `offset` from scratch.
    pub fn resolve(&self, inode: &ZipInode, offset: u64) -> Result<MappingDescriptor> {
        let mut map = MappingDescriptor::starting_at(offset);
        let mut cursor = MetaCursor::new();
        self.map_blocks(inode, &mut map, &mut cursor)?;
        Ok(map)
    }

    /// Resolve or extend `map` in place.
    ///
    /// With `map.logical_length == 0` the extent containing
    /// `map.logical_offset` is derived. Otherwise the descriptor is in
    /// walking mode and only its length grows.
    pub fn map_blocks(
        &self,
        inode: &ZipInode,
        map: &mut MappingDescriptor,
        cursor: &mut MetaCursor,
    ) -> Result<()> {
        trace!(
            target: "zro::extent",
            event = "map_blocks_enter",
            nid = inode.nid.0,
            la = map.logical_offset,
            llen = map.logical_length
        );
        let mut walk = Walk {
            resolver: self,
            inode,
            cursor,
            held: None,
        };
        let result = walk.map(map);
        drop(walk);
        trace!(
            target: "zro::extent",
            event = "map_blocks_exit",
            nid = inode.nid.0,
            la = map.logical_offset,
            llen = map.logical_length,
            pa = map.physical_offset,
            mapped = map.mapped,
            compressed = map.compressed,
            ok = result.is_ok()
        );
        result
    }
}

/// Where the head of the extent covering the requested offset lives.
enum HeadLookup {
    /// The requested offset is exactly the head's start.
    Exact { pblk: u32 },
    /// The head is in the requested cluster, before the requested offset.
    Here { ofs: u64, pblk: u32 },
    /// The head is in an earlier cluster; walk back from `lcn`.
    Before { lcn: u64 },
}

struct Walk<'a> {
    resolver: &'a ExtentIndexResolver,
    inode: &'a ZipInode,
    cursor: &'a mut MetaCursor,
    held: Option<HeldMeta>,
}

impl Walk<'_> {
    fn corrupt(&self, block: BlockNumber, lcn: u64, detail: String) -> ZroError {
        error!(
            target: "zro::extent",
            event = "corrupt_index",
            nid = self.inode.nid.0,
            lcn,
            block = block.0,
            detail = %detail
        );
        ZroError::corruption(block.0, detail)
    }

    /// Decode the record of logical cluster `lcn`, keeping its metadata page locked.
    fn record(&mut self, lcn: u64) -> Result<(ClusterIndexRecord, BlockNumber)> {
        let addr = record_address(self.inode.index_base, lcn).ok_or_else(|| {
            ZroError::corruption(0, format!("record address of lcn {lcn} overflows"))
        })?;
        let block = BlockNumber(addr >> BLOCK_SHIFT);
        let offset = (addr & (BLOCK_SIZE as u64 - 1)) as usize;

        let reusable = self
            .held
            .as_ref()
            .is_some_and(|held| held.0.index() == PageIndex(block.0));
        if !reusable {
            self.held = None;
            let page = match self.cursor.page.take() {
                Some(page) if page.index() == PageIndex(block.0) => {
                    page.lock();
                    page
                }
                _ => self.resolver.meta.get_block(block)?,
            };
            self.cursor.page = Some(Arc::clone(&page));
            self.held = Some(HeldMeta(page));
        }

        let Some(held) = self.held.as_ref() else {
            return Err(ZroError::corruption(block.0, "metadata page not held"));
        };
        let parsed = held.0.with_data(|data| {
            ensure_slice(data, offset, CLUSTER_INDEX_RECORD_SIZE)
                .and_then(ClusterIndexRecord::parse_from_bytes)
        });
        match parsed {
            Ok(rec) => Ok((rec, block)),
            Err(err) => Err(self.corrupt(block, lcn, err.to_string())),
        }
    }

    /// Bytes of logical cluster `lcn` that precede the extent starting in it.
    fn logical_cluster_ofs(
        &self,
        rec: &ClusterIndexRecord,
        block: BlockNumber,
        lcn: u64,
    ) -> Result<u64> {
        let cluster_size = self.resolver.geometry.cluster_size();
        match rec.cluster_type() {
            ClusterType::NonHead => Ok(cluster_size),
            ClusterType::Compat if !self.resolver.options.compat_previous_clusters => Err(
                self.corrupt(block, lcn, format!("unknown cluster type 3 at lcn {lcn}")),
            ),
            ClusterType::Compat if rec.compat_previous_clusters(cluster_size) != 0 => {
                Ok(cluster_size)
            }
            ClusterType::Compat | ClusterType::Plain | ClusterType::Head => {
                Ok(u64::from(rec.clusterofs))
            }
        }
    }

    fn map(&mut self, map: &mut MappingDescriptor) -> Result<()> {
        let geometry = self.resolver.geometry;
        let cluster_size = geometry.cluster_size();
        let bits = geometry.bits();
        let initial = map.logical_length == 0;

        if map.logical_offset >= self.inode.size {
            map.logical_length = map.logical_offset + 1 - self.inode.size;
            map.logical_offset = self.inode.size;
            map.compressed = false;
            map.mapped = false;
            return Ok(());
        }

        let ofs = map
            .logical_offset
            .checked_add(map.logical_length)
            .ok_or_else(|| ZroError::Format("mapping end overflows".into()))?;
        let mut lcn = ofs >> bits;
        let ofs_rem = geometry.offset_in_cluster(ofs);

        let (rec, block) = self.record(lcn)?;
        let clusterofs = self.logical_cluster_ofs(&rec, block, lcn)?;

        if !initial {
            map.logical_length += clusterofs;
            return Ok(());
        }

        let mut compressed = true;
        let mut end = (lcn + 1) << bits;

        let lookup = match rec.cluster_type() {
            ClusterType::NonHead => HeadLookup::Before { lcn },
            kind => {
                if kind == ClusterType::Plain && ofs_rem >= clusterofs {
                    compressed = !compressed;
                }
                if kind == ClusterType::Compat && rec.compat_previous_clusters(cluster_size) != 0
                {
                    lcn = lcn.checked_sub(1).ok_or_else(|| {
                        self.corrupt(block, 0, "previous clusters before lcn 0".to_owned())
                    })?;
                    HeadLookup::Before { lcn }
                } else if ofs_rem == clusterofs {
                    HeadLookup::Exact {
                        pblk: rec.blkaddr(),
                    }
                } else if ofs_rem > clusterofs {
                    HeadLookup::Here {
                        ofs: (lcn << bits) | clusterofs,
                        pblk: rec.blkaddr(),
                    }
                } else {
                    if lcn == 0 {
                        return Err(self.corrupt(
                            block,
                            lcn,
                            "extent starts before logical cluster 0".to_owned(),
                        ));
                    }
                    end = (lcn << bits) | clusterofs;
                    lcn -= 1;
                    HeadLookup::Before { lcn }
                }
            }
        };

        let (la, pblk) = match lookup {
            HeadLookup::Exact { pblk } => (map.logical_offset, pblk),
            HeadLookup::Here { ofs, pblk } => (ofs, pblk),
            HeadLookup::Before { lcn } => {
                let (ofs, pblk, plain) = self.extent_head(lcn)?;
                if plain {
                    compressed = !compressed;
                }
                (ofs, pblk)
            }
        };

        let logical_length = end.checked_sub(la).ok_or_else(|| {
            self.corrupt(block, lcn, format!("extent head {la} lies past its end {end}"))
        })?;
        let physical_offset = BlockNumber(u64::from(pblk))
            .to_byte_offset()
            .ok_or_else(|| self.corrupt(block, lcn, format!("blkaddr {pblk} overflows")))?;

        map.logical_offset = la;
        map.logical_length = logical_length;
        map.physical_offset = physical_offset;
        map.physical_length = cluster_size;
        map.compressed = compressed;
        map.mapped = true;
        Ok(())
    }

    /// Walk back from `lcn` to the record that starts its extent.
    ///
    /// Returns the head's logical start, its physical block and whether a
    /// PLAIN head was found (which flips the compressed flag).
    fn extent_head(&mut self, mut lcn: u64) -> Result<(u64, u32, bool)> {
        let geometry = self.resolver.geometry;
        let cluster_size = geometry.cluster_size();
        let mut plain = false;

        for _ in 0..MAX_HEAD_WALK {
            let (rec, block) = self.record(lcn)?;
            match rec.cluster_type() {
                ClusterType::NonHead => {
                    let delta = u64::from(rec.delta0());
                    if delta == 0 || delta > lcn {
                        return Err(self.corrupt(
                            block,
                            lcn,
                            format!("invalid NONHEAD delta {delta} at lcn {lcn}"),
                        ));
                    }
                    lcn -= delta;
                    continue;
                }
                ClusterType::Compat if !self.resolver.options.compat_previous_clusters => {
                    return Err(self.corrupt(
                        block,
                        lcn,
                        format!("unknown cluster type 3 at lcn {lcn}"),
                    ));
                }
                ClusterType::Compat => {
                    let previous = rec.compat_previous_clusters(cluster_size);
                    lcn = lcn.checked_sub(previous).ok_or_else(|| {
                        self.corrupt(
                            block,
                            lcn,
                            format!("previous cluster count {previous} exceeds lcn {lcn}"),
                        )
                    })?;
                }
                ClusterType::Plain => plain = true,
                ClusterType::Head => {}
            }
            let ofs = (lcn << geometry.bits()) + (u64::from(rec.clusterofs) & (cluster_size - 1));
            return Ok((ofs, rec.blkaddr(), plain));
        }

        let block = self.cursor.block().unwrap_or(BlockNumber(0));
        Err(self.corrupt(
            block,
            lcn,
            format!("extent head not found within {MAX_HEAD_WALK} records"),
        ))
    }
}

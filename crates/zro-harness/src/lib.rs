#![forbid(unsafe_code)]
//! Test images and fixtures for the zro read path.
//!
//! [`ImageBuilder`] lays out a complete image in memory:
//!
//! ```text
//! block 0        reserved (zero)
//! block 1..M     inode slots; each file's extent index follows its slot
//! block M..      one physical cluster per extent, in file order
//! ```
//!
//! Compressed clusters hold one LZ4 block right-aligned behind zero
//! padding. An extent whose LZ4 form does not fit its cluster is stored
//! plain. [`Mounted`] wires a built image to a [`ZipContext`] over a
//! [`FaultyDevice`], so tests can fail individual block reads.

use anyhow::{Context, Result, bail, ensure};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use zro::{
    BLOCK_SIZE, BlockDevice, BlockMetaAccessor, BlockNumber, BlockReader, ByteBlockDevice,
    ClusterGeometry, ClusterIndexRecord, DeviceBlockReader, InodeNumber, MemByteDevice, PAGE_SIZE,
    Page, PageIndex, ThreadedBlockReader, ZipBackends, ZipConfig, ZipContext, ZipInode, ZroError,
};

/// Metadata area start.
pub const META_BLKADDR: u32 = 1;
/// On-disk inode body size (compact layout).
pub const INODE_ISIZE: u16 = 32;
const SLOT_SIZE: u64 = 32;
/// Inode body (aligned) plus extent header.
const INDEX_PREFIX: u64 = 48;

/// One extent as laid out on the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentLayout {
    pub logical_start: u64,
    pub logical_end: u64,
    pub blkaddr: u32,
    pub compressed: bool,
}

/// One file as laid out on the image.
#[derive(Debug, Clone)]
pub struct FileLayout {
    pub inode: ZipInode,
    pub extents: Vec<ExtentLayout>,
    pub data: Vec<u8>,
}

impl FileLayout {
    /// Expected content of page `index`: file bytes, zero past EOF.
    #[must_use]
    pub fn expected_page(&self, index: u64) -> Vec<u8> {
        let mut page = vec![0_u8; PAGE_SIZE];
        let start = usize::try_from(index)
            .ok()
            .and_then(|i| i.checked_mul(PAGE_SIZE))
            .unwrap_or(usize::MAX);
        if start < self.data.len() {
            let end = (start + PAGE_SIZE).min(self.data.len());
            page[..end - start].copy_from_slice(&self.data[start..end]);
        }
        page
    }

    /// Pages covering the file.
    #[must_use]
    pub fn page_count(&self) -> u64 {
        self.data.len().div_ceil(PAGE_SIZE) as u64
    }

    /// The extent holding logical byte `offset`.
    #[must_use]
    pub fn extent_at(&self, offset: u64) -> Option<&ExtentLayout> {
        self.extents
            .iter()
            .find(|ext| offset >= ext.logical_start && offset < ext.logical_end)
    }
}

/// A built image.
#[derive(Debug, Clone)]
pub struct Image {
    pub bytes: Vec<u8>,
    pub geometry: ClusterGeometry,
    pub files: Vec<FileLayout>,
}

impl Image {
    #[must_use]
    pub fn block_count(&self) -> u64 {
        (self.bytes.len() / BLOCK_SIZE) as u64
    }
}

#[derive(Debug, Clone)]
struct FileSpec {
    data: Vec<u8>,
    starts: Vec<u64>,
    force_plain: bool,
}

/// Builds [`Image`]s.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    geometry: ClusterGeometry,
    files: Vec<FileSpec>,
}

impl ImageBuilder {
    pub fn new(cluster_bits: u8) -> Result<Self> {
        let geometry = ClusterGeometry::new(cluster_bits)
            .with_context(|| format!("cluster bits {cluster_bits}"))?;
        Ok(Self {
            geometry,
            files: Vec::new(),
        })
    }

    #[must_use]
    pub fn geometry(&self) -> ClusterGeometry {
        self.geometry
    }

    /// Add a file with one extent per logical cluster. Returns its index.
    pub fn add_file(&mut self, data: Vec<u8>) -> usize {
        let cluster_size = self.geometry.cluster_size();
        let starts = (0..data.len() as u64).step_by(cluster_size as usize).collect();
        self.push(data, starts, false)
    }

    /// Like [`add_file`](Self::add_file) but every extent stored plain.
    pub fn add_plain_file(&mut self, data: Vec<u8>) -> usize {
        let cluster_size = self.geometry.cluster_size();
        let starts = (0..data.len() as u64).step_by(cluster_size as usize).collect();
        self.push(data, starts, true)
    }

    /// Add a file whose extents start at `starts`. The first start must be
    /// 0, starts must increase, lie inside the file and fall into distinct
    /// logical clusters.
    pub fn add_file_with_extents(&mut self, data: Vec<u8>, starts: Vec<u64>) -> Result<usize> {
        let size = data.len() as u64;
        if size > 0 {
            ensure!(starts.first() == Some(&0), "first extent must start at 0");
        }
        let bits = self.geometry.bits();
        for pair in starts.windows(2) {
            ensure!(pair[0] < pair[1], "extent starts must increase: {pair:?}");
            ensure!(
                pair[0] >> bits != pair[1] >> bits,
                "extents {pair:?} start in one logical cluster"
            );
        }
        if let Some(last) = starts.last() {
            ensure!(*last < size.max(1), "extent start {last} past EOF {size}");
        }
        Ok(self.push(data, starts, false))
    }

    fn push(&mut self, data: Vec<u8>, starts: Vec<u64>, force_plain: bool) -> usize {
        self.files.push(FileSpec {
            data,
            starts,
            force_plain,
        });
        self.files.len() - 1
    }

    pub fn build(&self) -> Result<Image> {
        let geometry = self.geometry;
        let cluster_size = geometry.cluster_size();
        let cluster_blocks = geometry.cluster_pages() as u64;

        let mut nid = 0_u64;
        let mut slots = Vec::with_capacity(self.files.len());
        for spec in &self.files {
            let clusters = (spec.data.len() as u64).div_ceil(cluster_size);
            slots.push(nid);
            nid += (INDEX_PREFIX + clusters * 8).div_ceil(SLOT_SIZE);
        }
        let meta_blocks = (nid * SLOT_SIZE).div_ceil(BLOCK_SIZE as u64).max(1);
        let mut next_block = u64::from(META_BLKADDR) + meta_blocks;

        let mut clusters = Vec::new();
        let mut files = Vec::with_capacity(self.files.len());
        for (spec, nid) in self.files.iter().zip(slots) {
            let size = spec.data.len() as u64;
            let inode = ZipInode::from_layout(META_BLKADDR, InodeNumber(nid), size, INODE_ISIZE, 0)
                .with_context(|| format!("layout of nid {nid}"))?;
            let mut extents = Vec::with_capacity(spec.starts.len());
            for (i, start) in spec.starts.iter().copied().enumerate() {
                let end = spec.starts.get(i + 1).copied().unwrap_or(size);
                let content = &spec.data[to_usize(start)?..to_usize(end)?];
                let (cluster, compressed) = encode_cluster(content, cluster_size, spec.force_plain)
                    .with_context(|| format!("extent {start}..{end} of nid {nid}"))?;
                let blkaddr = u32::try_from(next_block).context("image too large")?;
                next_block += cluster_blocks;
                clusters.push(cluster);
                extents.push(ExtentLayout {
                    logical_start: start,
                    logical_end: end,
                    blkaddr,
                    compressed,
                });
            }
            files.push(FileLayout {
                inode,
                extents,
                data: spec.data.clone(),
            });
        }

        let mut bytes = vec![0_u8; to_usize(next_block)? * BLOCK_SIZE];
        for file in &files {
            for (lcn, record) in index_records(file, geometry)?.iter().enumerate() {
                let at = to_usize(file.inode.index_base)? + lcn * 8;
                bytes[at..at + 8].copy_from_slice(&record.to_bytes());
            }
        }
        let data_start = to_usize(u64::from(META_BLKADDR) + meta_blocks)? * BLOCK_SIZE;
        for (i, cluster) in clusters.iter().enumerate() {
            let at = data_start + i * cluster.len();
            bytes[at..at + cluster.len()].copy_from_slice(cluster);
        }
        Ok(Image {
            bytes,
            geometry,
            files,
        })
    }
}

fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value).with_context(|| format!("{value} does not fit usize"))
}

/// Encode one extent into a physical cluster.
fn encode_cluster(content: &[u8], cluster_size: u64, force_plain: bool) -> Result<(Vec<u8>, bool)> {
    let cluster_size = to_usize(cluster_size)?;
    let mut cluster = vec![0_u8; cluster_size];
    if !force_plain {
        let block = lz4_flex::block::compress(content);
        if !block.is_empty() && block.len() <= cluster_size {
            cluster[cluster_size - block.len()..].copy_from_slice(&block);
            return Ok((cluster, true));
        }
    }
    if content.len() > cluster_size {
        bail!(
            "{} bytes neither compress into nor fit a {cluster_size}-byte cluster",
            content.len()
        );
    }
    cluster[..content.len()].copy_from_slice(content);
    Ok((cluster, false))
}

/// One record per logical cluster of `file`.
fn index_records(file: &FileLayout, geometry: ClusterGeometry) -> Result<Vec<ClusterIndexRecord>> {
    let bits = geometry.bits();
    let clusters = (file.data.len() as u64).div_ceil(geometry.cluster_size());
    let mut records = Vec::new();
    let mut head_lcn = 0_u64;
    let mut extents = file.extents.iter().peekable();
    for lcn in 0..clusters {
        match extents.next_if(|ext| ext.logical_start >> bits == lcn) {
            Some(ext) => {
                head_lcn = lcn;
                let clusterofs = u16::try_from(geometry.offset_in_cluster(ext.logical_start))
                    .context("clusterofs overflows")?;
                records.push(if ext.compressed {
                    ClusterIndexRecord::head(clusterofs, ext.blkaddr)
                } else {
                    ClusterIndexRecord::plain(clusterofs, ext.blkaddr)
                });
            }
            None => {
                let back = u16::try_from(lcn - head_lcn).context("NONHEAD delta overflows")?;
                let forward = extents
                    .peek()
                    .map_or(0, |ext| (ext.logical_start >> bits).saturating_sub(lcn));
                let forward = u16::try_from(forward).unwrap_or(u16::MAX);
                records.push(ClusterIndexRecord::nonhead(back, forward));
            }
        }
    }
    Ok(records)
}

/// Deterministic, compressible file content. The period is prime so a
/// misplaced page never matches its neighbour.
#[must_use]
pub fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| u8::try_from(i % 97).unwrap_or(0).wrapping_mul(3).wrapping_add(seed))
        .collect()
}

/// Deterministic content LZ4 cannot shrink.
#[must_use]
pub fn noise(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state.to_le_bytes()[0]
        })
        .collect()
}

/// Block device that fails reads of selected blocks.
#[derive(Debug)]
pub struct FaultyDevice {
    inner: ByteBlockDevice<MemByteDevice>,
    failing: Mutex<HashSet<u64>>,
    reads: AtomicU64,
}

impl FaultyDevice {
    pub fn new(bytes: Vec<u8>) -> Result<Self> {
        Ok(Self {
            inner: ByteBlockDevice::new(MemByteDevice::new(bytes))?,
            failing: Mutex::new(HashSet::new()),
            reads: AtomicU64::new(0),
        })
    }

    pub fn fail_block(&self, block: u64) {
        self.failing.lock().insert(block);
    }

    pub fn heal_all(&self) {
        self.failing.lock().clear();
    }

    /// Block reads served or failed so far.
    #[must_use]
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }
}

impl BlockDevice for FaultyDevice {
    fn read_block_into(&self, block: BlockNumber, buf: &mut [u8]) -> zro::Result<()> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if self.failing.lock().contains(&block.0) {
            return Err(ZroError::Io(std::io::Error::other(format!(
                "injected failure at block {block}"
            ))));
        }
        self.inner.read_block_into(block, buf)
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }
}

/// How compressed clusters are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderKind {
    /// Completion runs on the submitting thread.
    Inline,
    /// Completion runs on a pool with this many threads.
    Threaded(usize),
}

/// A built image behind a live [`ZipContext`].
pub struct Mounted {
    pub context: ZipContext,
    pub device: Arc<FaultyDevice>,
    pub reader: Arc<dyn BlockReader>,
    pub image: Image,
}

impl Mounted {
    pub fn new(image: Image, config: ZipConfig, kind: ReaderKind) -> Result<Self> {
        let device = Arc::new(FaultyDevice::new(image.bytes.clone())?);
        let reader: Arc<dyn BlockReader> = match kind {
            ReaderKind::Inline => Arc::new(DeviceBlockReader::new(device.clone())),
            ReaderKind::Threaded(threads) => {
                Arc::new(ThreadedBlockReader::new(device.clone(), threads)?)
            }
        };
        let meta = Arc::new(BlockMetaAccessor::new(device.clone()));
        let context = ZipContext::new(
            config,
            image.geometry,
            ZipBackends::new(Arc::clone(&reader), meta),
        )?;
        Ok(Self {
            context,
            device,
            reader,
            image,
        })
    }

    #[must_use]
    pub fn file(&self, file: usize) -> &FileLayout {
        &self.image.files[file]
    }

    /// A fresh, locked destination page of `file`.
    #[must_use]
    pub fn locked_page(&self, file: usize, index: u64) -> Arc<Page> {
        let page = Page::for_file(self.file(file).inode.nid, PageIndex(index));
        page.lock();
        page
    }

    /// Read one page through `read_page`.
    pub fn read_page(&self, file: usize, index: u64) -> zro::Result<Vec<u8>> {
        let page = self.locked_page(file, index);
        self.context
            .read_page(&self.file(file).inode, Arc::clone(&page))?;
        Ok(page.to_vec())
    }

    /// Read `indices` through `read_pages` and wait for every page.
    pub fn read_pages(&self, file: usize, indices: &[u64]) -> (zro::Result<()>, Vec<Arc<Page>>) {
        let pages: Vec<Arc<Page>> = indices
            .iter()
            .map(|index| self.locked_page(file, *index))
            .collect();
        let result = self.context.read_pages(&self.file(file).inode, pages.clone());
        for page in &pages {
            page.wait_unlocked();
        }
        (result, pages)
    }

    /// Read the whole file page by page and trim it to its size.
    pub fn read_file(&self, file: usize) -> zro::Result<Vec<u8>> {
        let layout = self.file(file);
        let mut out = Vec::with_capacity(layout.data.len());
        for index in 0..layout.page_count() {
            out.extend_from_slice(&self.read_page(file, index)?);
        }
        out.truncate(layout.data.len());
        Ok(out)
    }
}

impl std::fmt::Debug for Mounted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mounted")
            .field("context", &self.context)
            .field("files", &self.image.files.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zro::{ClusterType, ExtentIndexResolver, ResolverOptions};

    #[test]
    fn layout_places_index_and_clusters() {
        let mut builder = ImageBuilder::new(12).expect("builder");
        let a = builder.add_file(pattern(1, 3 * PAGE_SIZE));
        let b = builder.add_plain_file(pattern(2, 100));
        let image = builder.build().expect("build");

        let fa = &image.files[a];
        let fb = &image.files[b];
        assert_eq!(fa.extents.len(), 3);
        assert_eq!(fa.extents[0].blkaddr + 1, fa.extents[1].blkaddr);
        assert!(fa.extents.iter().all(|ext| ext.compressed));
        assert!(!fb.extents[0].compressed);
        assert_eq!(fb.extents[0].blkaddr, fa.extents[2].blkaddr + 1);
        assert_eq!(image.block_count(), u64::from(fb.extents[0].blkaddr) + 1);
        assert!(fb.inode.index_base > fa.inode.index_base + 3 * 8);
    }

    #[test]
    fn records_point_back_to_heads() {
        let mut builder = ImageBuilder::new(12).expect("builder");
        let f = builder
            .add_file_with_extents(pattern(3, 4 * PAGE_SIZE), vec![0, 6000])
            .expect("extents");
        let image = builder.build().expect("build");
        let records = index_records(&image.files[f], image.geometry).expect("records");

        let types: Vec<ClusterType> = records.iter().map(ClusterIndexRecord::cluster_type).collect();
        assert_eq!(
            types,
            vec![
                ClusterType::Head,
                ClusterType::Head,
                ClusterType::NonHead,
                ClusterType::NonHead
            ]
        );
        assert_eq!(records[1].clusterofs, 6000 - 4096);
        assert_eq!(records[3].delta0(), 2);
    }

    #[test]
    fn resolver_reads_built_index() {
        let mut builder = ImageBuilder::new(12).expect("builder");
        let f = builder
            .add_file_with_extents(pattern(4, 4 * PAGE_SIZE), vec![0, 6000])
            .expect("extents");
        let image = builder.build().expect("build");
        let device = Arc::new(FaultyDevice::new(image.bytes.clone()).expect("device"));
        let resolver = ExtentIndexResolver::new(
            Arc::new(BlockMetaAccessor::new(device)),
            image.geometry,
            ResolverOptions::default(),
        );
        let file = &image.files[f];

        let map = resolver.resolve(&file.inode, 5000).expect("resolve");
        assert_eq!(map.logical_offset, 0);
        assert_eq!(map.logical_length, 6000);
        assert_eq!(map.physical_block().0, u64::from(file.extents[0].blkaddr));

        let map = resolver.resolve(&file.inode, 15_000).expect("resolve");
        assert_eq!(map.logical_offset, 6000);
        assert_eq!(map.logical_length, 16_384 - 6000);
        assert!(map.compressed);
        assert_eq!(map.physical_block().0, u64::from(file.extents[1].blkaddr));
    }

    #[test]
    fn builder_rejects_bad_extents() {
        let mut builder = ImageBuilder::new(12).expect("builder");
        assert!(builder.add_file_with_extents(pattern(0, 8192), vec![100]).is_err());
        assert!(
            builder
                .add_file_with_extents(pattern(0, 8192), vec![0, 10])
                .is_err()
        );
        let f = builder.add_plain_file(noise(7, 2 * 4096 + 1));
        assert_eq!(f, 0);
        assert_eq!(builder.build().expect("build").files[0].extents.len(), 3);

        builder
            .add_file_with_extents(noise(9, 8192), vec![0])
            .expect("accepted");
        let err = builder.build().expect_err("incompressible two-cluster extent");
        assert!(format!("{err:#}").contains("neither compress"));
    }

    #[test]
    fn faulty_device_injects_and_heals() {
        let dev = FaultyDevice::new(vec![5_u8; 2 * BLOCK_SIZE]).expect("device");
        let mut buf = vec![0_u8; BLOCK_SIZE];
        dev.fail_block(1);
        assert!(dev.read_block_into(BlockNumber(1), &mut buf).is_err());
        dev.read_block_into(BlockNumber(0), &mut buf).expect("block 0");
        dev.heal_all();
        dev.read_block_into(BlockNumber(1), &mut buf).expect("healed");
        assert!(buf.iter().all(|b| *b == 5));
        assert_eq!(dev.reads(), 3);
    }
}

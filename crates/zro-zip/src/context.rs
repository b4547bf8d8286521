//! Per-filesystem decompression context and its public entry points.

use crate::cache::{CompressedPageCache, MigrateMode};
use crate::config::{DecompressPolicy, ThresholdPolicy, ZipConfig};
use crate::decompressor::DecompressorRegistry;
use crate::frontend::ReadSession;
use crate::registry::WorkgroupRegistry;
use crate::stats::{ZipCounters, ZipStats};
use crate::submit;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};
use zro_block::{BlockMetaAccessor, BlockReader, MemPageCache, Page, PageCache};
use zro_error::{Result, ZroError};
use zro_extent::{ExtentIndexResolver, ZipInode};
use zro_types::{ClusterGeometry, PageIndex};

/// External collaborators of a [`ZipContext`].
pub struct ZipBackends {
    /// Reads compressed clusters.
    pub reader: Arc<dyn BlockReader>,
    /// Reads extent index metadata.
    pub meta: Arc<BlockMetaAccessor>,
    /// Backing store of the managed compressed-page cache.
    pub managed_cache: Arc<dyn PageCache>,
    pub decompressors: DecompressorRegistry,
    /// Foreground/background choice for multi-page reads; `None` uses the
    /// configured page threshold.
    pub policy: Option<Arc<dyn DecompressPolicy>>,
}

impl ZipBackends {
    /// Backends with an in-memory managed cache and the default decompressors.
    #[must_use]
    pub fn new(reader: Arc<dyn BlockReader>, meta: Arc<BlockMetaAccessor>) -> Self {
        Self {
            reader,
            meta,
            managed_cache: Arc::new(MemPageCache::new()),
            decompressors: DecompressorRegistry::default(),
            policy: None,
        }
    }
}

/// State shared by every read, completion callback and background worker.
pub(crate) struct ZipShared {
    pub(crate) config: ZipConfig,
    pub(crate) geometry: ClusterGeometry,
    pub(crate) resolver: ExtentIndexResolver,
    pub(crate) registry: WorkgroupRegistry,
    pub(crate) cache: CompressedPageCache,
    pub(crate) reader: Arc<dyn BlockReader>,
    pub(crate) decompressors: DecompressorRegistry,
    pub(crate) policy: Arc<dyn DecompressPolicy>,
    pub(crate) workers: rayon::ThreadPool,
    /// Shared output buffer for medium-sized decompressions.
    pub(crate) scratch: Mutex<Vec<u8>>,
    pub(crate) counters: ZipCounters,
}

impl ZipShared {
    pub(crate) fn cluster_pages(&self) -> usize {
        self.geometry.cluster_pages()
    }
}

/// Compressed read path of one mounted image.
pub struct ZipContext {
    shared: Arc<ZipShared>,
}

impl ZipContext {
    pub fn new(config: ZipConfig, geometry: ClusterGeometry, backends: ZipBackends) -> Result<Self> {
        if config.max_batch_pages == 0 {
            return Err(ZroError::Format("max_batch_pages must be positive".into()));
        }
        let threads = config.effective_worker_threads();
        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("zro-unzip-{i}"))
            .build()
            .map_err(|err| ZroError::Format(format!("decompression workers: {err}")))?;
        let policy = backends
            .policy
            .unwrap_or_else(|| Arc::new(ThresholdPolicy::from_config(&config)));
        let resolver = ExtentIndexResolver::new(backends.meta, geometry, config.resolver);

        info!(
            target: "zro::zip::frontend",
            event = "context_ready",
            cluster_bits = geometry.bits(),
            workers = threads,
            cache_strategy = ?config.cache_strategy
        );
        Ok(Self {
            shared: Arc::new(ZipShared {
                geometry,
                resolver,
                registry: WorkgroupRegistry::new(),
                cache: CompressedPageCache::new(backends.managed_cache),
                reader: backends.reader,
                decompressors: backends.decompressors,
                policy,
                workers,
                scratch: Mutex::new(Vec::new()),
                counters: ZipCounters::new(),
                config,
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ZipConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn geometry(&self) -> ClusterGeometry {
        self.shared.geometry
    }

    #[must_use]
    pub fn resolver(&self) -> &ExtentIndexResolver {
        &self.shared.resolver
    }

    #[must_use]
    pub fn managed_cache(&self) -> &Arc<dyn PageCache> {
        self.shared.cache.managed()
    }

    /// Fill one locked file page and wait for it. Returns the error that
    /// failed the page, if any; the page is unlocked either way.
    pub fn read_page(&self, inode: &ZipInode, page: Arc<Page>) -> Result<()> {
        let mut session = ReadSession::new(&self.shared, page.index());
        let built = session.read_page(inode, &page);
        let head = session.finish();
        submit::submit_and_unzip(&self.shared, head, session.pool_mut(), true);

        page.wait_unlocked();
        debug!(
            target: "zro::zip::frontend",
            event = "read_page",
            nid = inode.nid.0,
            index = page.index().0,
            uptodate = page.is_uptodate()
        );
        built?;
        if page.has_error() || !page.is_uptodate() {
            warn!(
                target: "zro::zip::frontend",
                event = "page_failed",
                nid = inode.nid.0,
                index = page.index().0
            );
            return Err(ZroError::Io(std::io::Error::other(format!(
                "page {} of nid {} failed to decompress",
                page.index().0,
                inode.nid
            ))));
        }
        Ok(())
    }

    /// Fill a batch of locked file pages (read-ahead). Small batches, and
    /// batches not started by asynchronous read-ahead, decompress before
    /// returning; others finish on the worker pool and unlock their pages
    /// when done. Returns the first error met while attaching pages only:
    /// read and decompression failures are recorded on the pages, so
    /// callers must check each page's error and uptodate state.
    pub fn read_pages(&self, inode: &ZipInode, mut pages: Vec<Arc<Page>>) -> Result<()> {
        if pages.is_empty() {
            return Ok(());
        }
        pages.sort_by_key(|page| page.index());
        let first = Arc::clone(&pages[0]);
        let sync = self.shared.policy.decompress_synchronously(pages.len()) && !first.is_readahead();

        let mut session = ReadSession::new(&self.shared, first.index());
        let mut first_err = None;
        for page in pages.iter().rev() {
            if let Err(err) = session.read_page(inode, page) {
                first_err.get_or_insert(err);
            }
        }
        let head = session.finish();
        submit::submit_and_unzip(&self.shared, head, session.pool_mut(), sync);

        debug!(
            target: "zro::zip::frontend",
            event = "read_pages",
            nid = inode.nid.0,
            first = first.index().0,
            count = pages.len(),
            sync
        );
        first_err.map_or(Ok(()), Err)
    }

    /// Reclaim up to `max` idle workgroups and their cached compressed pages.
    pub fn shrink(&self, max: usize) -> usize {
        let shared = &self.shared;
        shared
            .registry
            .shrink(max, |grp| shared.cache.try_free_all_cached(grp))
    }

    /// Release one compressed page from the managed cache if its workgroup
    /// is idle.
    pub fn try_free_cached_page(&self, page: &Arc<Page>) -> bool {
        self.shared.cache.try_free_cached_page(page)
    }

    /// Move a managed compressed page to a new frame.
    pub fn migrate_cached_page(&self, old: &Arc<Page>, new: &Arc<Page>, mode: MigrateMode) -> Result<()> {
        self.shared.cache.migrate(old, new, mode)
    }

    /// The managed page for physical block `index`, if resident.
    #[must_use]
    pub fn cached_page(&self, index: PageIndex) -> Option<Arc<Page>> {
        self.shared.cache.managed().lookup(index)
    }

    #[must_use]
    pub fn workgroup_count(&self) -> usize {
        self.shared.registry.len()
    }

    #[must_use]
    pub fn stats(&self) -> ZipStats {
        self.shared
            .counters
            .snapshot(self.shared.registry.stats(), self.shared.cache.stats())
    }
}

impl std::fmt::Debug for ZipContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZipContext")
            .field("geometry", &self.shared.geometry)
            .field("config", &self.shared.config)
            .field("workgroups", &self.shared.registry.len())
            .finish_non_exhaustive()
    }
}

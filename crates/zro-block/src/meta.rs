//! Metadata block access through a page cache.

use crate::cache::{MemPageCache, PageCache};
use crate::page::Page;
use crate::BlockDevice;
use std::sync::Arc;
use tracing::{trace, warn};
use zro_error::Result;
use zro_types::{BlockNumber, PageIndex};

/// Reads metadata blocks into cached pages and hands them out locked.
///
/// The caller owns the lock of the returned page and must `unlock()` it when
/// done decoding. Keeping the `Arc` around lets a later call for the same
/// block skip the cache lookup.
pub struct BlockMetaAccessor {
    device: Arc<dyn BlockDevice>,
    cache: Arc<dyn PageCache>,
}

impl BlockMetaAccessor {
    #[must_use]
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self::with_cache(device, Arc::new(MemPageCache::new()))
    }

    #[must_use]
    pub fn with_cache(device: Arc<dyn BlockDevice>, cache: Arc<dyn PageCache>) -> Self {
        Self { device, cache }
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<dyn PageCache> {
        &self.cache
    }

    /// Return block `block` as a locked, up-to-date page.
    pub fn get_block(&self, block: BlockNumber) -> Result<Arc<Page>> {
        let index = PageIndex(block.0);
        loop {
            let page = match self.cache.lookup(index) {
                Some(page) => {
                    page.lock();
                    page
                }
                None => {
                    let page = Arc::new(Page::new(index));
                    page.lock();
                    if !self.cache.insert(index, &page) {
                        // Lost an insertion race; use the winner.
                        page.unlock();
                        continue;
                    }
                    page
                }
            };

            if page.is_uptodate() {
                trace!(target: "zro::block", event = "meta_hit", block = block.0);
                return Ok(page);
            }

            let filled = page.with_data_mut(|buf| self.device.read_block_into(block, buf));
            match filled {
                Ok(()) => {
                    page.set_uptodate();
                    trace!(target: "zro::block", event = "meta_read", block = block.0);
                    return Ok(page);
                }
                Err(err) => {
                    warn!(
                        target: "zro::block",
                        event = "meta_read_failed",
                        block = block.0,
                        error = %err
                    );
                    page.set_error();
                    self.cache.evict(index);
                    page.unlock();
                    return Err(err);
                }
            }
        }
    }
}

impl std::fmt::Debug for BlockMetaAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockMetaAccessor")
            .field("cached_blocks", &self.cache.len())
            .finish_non_exhaustive()
    }
}

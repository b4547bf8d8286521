//! Attaching file pages to cluster works.
//!
//! A [`ReadSession`] lives for one `read_page`/`read_pages` call. Pages are
//! fed to it from the highest offset down: each page is cut at extent
//! boundaries, from its end towards its start, and every part is queued on
//! the work of the cluster that produces it. The session keeps the last
//! mapping, so consecutive pages of one extent resolve it only once.

use crate::config::CacheStrategy;
use crate::context::ZipShared;
use crate::online;
use crate::pagevec::PageType;
use crate::registry::Link;
use crate::work::{WorkBuilder, WorkRole};
use std::sync::Arc;
use tracing::{trace, warn};
use zro_block::{Page, PagePool};
use zro_error::{Result, ZroError};
use zro_extent::{MappingDescriptor, MetaCursor, ZipInode};
use zro_types::{PAGE_SIZE, PageIndex};

/// Largest number of works one destination page may be split across.
const MAX_PAGE_PARTS: u32 = 2;

pub(crate) struct ReadSession<'a> {
    shared: &'a Arc<ZipShared>,
    map: MappingDescriptor,
    cursor: MetaCursor,
    builder: WorkBuilder,
    owned_head: Link,
    /// True until the session leaves the first cluster it entered.
    initial: bool,
    /// Clusters starting before this offset are cached under read-around.
    cached_zone_la: u64,
    pool: PagePool,
}

impl<'a> ReadSession<'a> {
    pub(crate) fn new(shared: &'a Arc<ZipShared>, first: PageIndex) -> Self {
        Self {
            shared,
            map: MappingDescriptor::default(),
            cursor: MetaCursor::new(),
            builder: WorkBuilder::new(),
            owned_head: Link::Tail,
            initial: true,
            cached_zone_la: first.byte_offset().unwrap_or(u64::MAX),
            pool: PagePool::new(),
        }
    }

    /// Queue every part of the locked file `page`. On error the page is
    /// marked failed; it is released once every queued part completes.
    pub(crate) fn read_page(&mut self, inode: &ZipInode, page: &Arc<Page>) -> Result<()> {
        online::init(page);
        let result = self.attach(inode, page);
        if let Err(err) = &result {
            page.set_error();
            warn!(
                target: "zro::zip::frontend",
                event = "attach_failed",
                nid = inode.nid.0,
                index = page.index().0,
                error = %err
            );
        }
        online::endio(page);
        result
    }

    fn attach(&mut self, inode: &ZipInode, page: &Arc<Page>) -> Result<()> {
        let shared = self.shared;
        let offset = page
            .index()
            .byte_offset()
            .ok_or_else(|| ZroError::Format(format!("page {} offset overflows", page.index().0)))?;
        let page_size = PAGE_SIZE as u64;
        let mut tight = self.builder.role() >= WorkRole::PrimaryTerminal;
        let mut end = page_size;
        let mut parts = 0_u32;

        while end > 0 {
            let pos = offset + end - 1;
            let begin = if self.map.contains(pos) {
                self.map.mapped && !self.builder.is_active()
            } else {
                if self.builder.end(&shared.registry) {
                    self.initial = false;
                }
                self.map = MappingDescriptor::starting_at(pos);
                shared
                    .resolver
                    .map_blocks(inode, &mut self.map, &mut self.cursor)?;
                self.map.mapped
            };

            if begin {
                self.builder.begin(
                    &shared.registry,
                    &self.map,
                    shared.cluster_pages(),
                    &mut self.owned_head,
                )?;
                self.scan_cache();
                tight &= self.builder.role() >= WorkRole::PrimaryTerminal;
            }

            let la = self.map.logical_offset;
            let cur = end - (offset + end - la).min(end);
            if self.map.mapped {
                let page_type = if cur > 0 {
                    PageType::Head
                } else if parts == 0 || tight {
                    PageType::Exclusive
                } else {
                    PageType::TailShared
                };
                if cur > 0 {
                    tight &= self.builder.role() >= WorkRole::PrimaryFollowed;
                }
                self.add_page(page, page_type)?;

                let index = usize::try_from(page.index().0 - la / page_size)
                    .map_err(|_| ZroError::Format("destination index overflows".into()))?;
                online::fixup(page, index, true);
                parts += 1;
                if parts > MAX_PAGE_PARTS {
                    return Err(ZroError::corruption(
                        self.map.physical_block().0,
                        format!(
                            "page {} of nid {} split into {parts} parts",
                            page.index().0,
                            inode.nid
                        ),
                    ));
                }
                self.builder.note_page_index(index);
                trace!(
                    target: "zro::zip::frontend",
                    event = "page_part",
                    index = page.index().0,
                    la,
                    cur,
                    page_type = ?page_type
                );
            } else {
                page.zero_range(to_usize(cur), to_usize(end));
            }

            self.map.logical_length = offset + cur - la;
            end = cur;
        }
        Ok(())
    }

    /// Pre-fill the active work's compressed slots from the managed cache.
    fn scan_cache(&mut self) {
        let shared = self.shared;
        if shared.config.cache_strategy == CacheStrategy::Disabled {
            return;
        }
        let Some(window) = self.builder.scan_window() else {
            return;
        };
        let reserve =
            shared
                .config
                .caches_cluster(self.initial, self.map.logical_offset, self.cached_zone_la);
        let outcome = shared.cache.scan(&window, reserve, &mut self.pool);
        self.builder.apply_scan(outcome.skip, outcome.complete);
    }

    /// Queue `page`, adding staging carrier pages while the page vector
    /// asks for one.
    fn add_page(&mut self, page: &Arc<Page>, page_type: PageType) -> Result<()> {
        while !self.builder.add_page(page, page_type)? {
            let carrier = self.pool.take_staging();
            if !self.builder.add_page(&carrier, PageType::Exclusive)? {
                self.pool.put(carrier);
                return Err(ZroError::Format("page vector refused a carrier page".into()));
            }
        }
        Ok(())
    }

    /// Leave the current work and hand over the chain this session built.
    pub(crate) fn finish(&mut self) -> Link {
        self.builder.end(&self.shared.registry);
        self.cursor.release();
        std::mem::replace(&mut self.owned_head, Link::Tail)
    }

    pub(crate) fn pool_mut(&mut self) -> &mut PagePool {
        &mut self.pool
    }
}

fn to_usize(value: u64) -> usize {
    usize::try_from(value).unwrap_or(PAGE_SIZE)
}

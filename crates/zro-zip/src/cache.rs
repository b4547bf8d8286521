//! Managed cache of compressed pages.
//!
//! # Design
//!
//! Compressed pages that should outlive one read are inserted into a
//! dedicated [`PageCache`] (the "managed" cache) keyed by physical block.
//! While such a page also sits in a workgroup slot it is *tagged* with that
//! workgroup, which lets page reclaim and migration find the slot that
//! references the page.
//!
//! Ordering rules:
//!
//! - the page lock is taken before the work lock (migration);
//! - with the work lock held, page locks are only ever *tried*;
//! - slot contents change only by compare-and-swap.

use crate::registry::{RefState, SlotEntry, SlotReplace, Workgroup};
use crate::work::ScanWindow;
use crossbeam_epoch as epoch;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};
use zro_block::{MappingId, Page, PageCache, PageOwner, PagePool};
use zro_error::{Result, ZroError};
use zro_types::PageIndex;

/// How hard a migration may wait for the work lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateMode {
    Async,
    Sync,
}

/// Outcome of [`CompressedPageCache::scan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Slots before the first one left empty; in-place reuse starts there.
    pub skip: usize,
    /// Every slot of the window is now backed by a cached or reserved page.
    pub complete: bool,
}

struct CacheTag {
    page: Weak<Page>,
    grp: Weak<Workgroup>,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    inserted: AtomicU64,
    released: AtomicU64,
    migrated: AtomicU64,
}

/// Counters of the managed cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CacheStats {
    /// Compressed pages found up to date, so no I/O was issued for them.
    pub hits: u64,
    pub inserted: u64,
    /// Pages released by reclaim.
    pub released: u64,
    pub migrated: u64,
    pub resident: usize,
}

pub struct CompressedPageCache {
    managed: Arc<dyn PageCache>,
    tags: Mutex<HashMap<PageIndex, CacheTag>>,
    counters: CacheCounters,
}

impl CompressedPageCache {
    #[must_use]
    pub fn new(managed: Arc<dyn PageCache>) -> Self {
        Self {
            managed,
            tags: Mutex::new(HashMap::new()),
            counters: CacheCounters::default(),
        }
    }

    #[must_use]
    pub fn managed(&self) -> &Arc<dyn PageCache> {
        &self.managed
    }

    #[must_use]
    pub fn mapping(&self) -> MappingId {
        self.managed.mapping()
    }

    /// Whether `page` currently lives in the managed cache.
    #[must_use]
    pub fn is_managed(&self, page: &Page) -> bool {
        page.owner() == PageOwner::Cache(self.mapping())
    }

    fn tag(&self, page: &Arc<Page>, grp: &Arc<Workgroup>) {
        self.tags.lock().insert(
            page.index(),
            CacheTag {
                page: Arc::downgrade(page),
                grp: Arc::downgrade(grp),
            },
        );
    }

    fn is_tagged(&self, page: &Arc<Page>) -> bool {
        self.tags
            .lock()
            .get(&page.index())
            .is_some_and(|tag| std::ptr::eq(tag.page.as_ptr(), Arc::as_ptr(page)))
    }

    fn untag(&self, page: &Arc<Page>) {
        let mut tags = self.tags.lock();
        if tags
            .get(&page.index())
            .is_some_and(|tag| std::ptr::eq(tag.page.as_ptr(), Arc::as_ptr(page)))
        {
            tags.remove(&page.index());
        }
    }

    /// Workgroup a tagged page belongs to.
    #[must_use]
    pub fn owner_of(&self, page: &Arc<Page>) -> Option<Arc<Workgroup>> {
        let tags = self.tags.lock();
        let tag = tags.get(&page.index())?;
        if !std::ptr::eq(tag.page.as_ptr(), Arc::as_ptr(page)) {
            return None;
        }
        tag.grp.upgrade()
    }

    /// Remove `page` from the managed cache if it is still the resident page.
    fn evict_if_resident(&self, page: &Arc<Page>) {
        let index = page.index();
        if self
            .managed
            .lookup(index)
            .is_some_and(|resident| Arc::ptr_eq(&resident, page))
        {
            self.managed.evict(index);
        }
    }

    /// Insert a locked page at `index`; on failure the page stays private.
    fn add_to_managed(&self, page: &Arc<Page>, index: PageIndex) -> bool {
        if self.managed.insert(index, page) {
            self.counters.inserted.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Fill the empty slots of `window` with pages already in the managed
    /// cache or, with `reserve`, with pages reserved for it.
    ///
    /// A slot that stays empty ends the prefix the caller may skip; the
    /// remaining slots are still filled where possible.
    pub fn scan(&self, window: &ScanWindow, reserve: bool, pool: &mut PagePool) -> ScanOutcome {
        let grp = &window.grp;
        let base = grp.key();
        let mut complete = true;
        let mut skip = 0;
        let mut found = 0_usize;

        for i in 0..window.deficit {
            let slot_index = window.cursor + i;
            let Some(slot) = grp.slot(slot_index) else {
                break;
            };
            if !slot.is_empty() {
                continue;
            }
            let index = PageIndex(base.0 + slot_index as u64);

            let (entry, fresh) = if let Some(page) = self.managed.lookup(index) {
                found += 1;
                (
                    SlotEntry::Page {
                        page,
                        just_found: true,
                    },
                    None,
                )
            } else if reserve {
                let page = pool.take();
                page.set_owner(PageOwner::Preallocated);
                (
                    SlotEntry::Page {
                        page: Arc::clone(&page),
                        just_found: false,
                    },
                    Some(page),
                )
            } else {
                if complete {
                    skip = i;
                }
                complete = false;
                continue;
            };

            if !slot.try_fill(entry) {
                if let Some(page) = fresh {
                    pool.put(page);
                }
            }
        }

        trace!(
            target: "zro::zip::cache",
            event = "scan",
            key = base.0,
            reserve,
            found,
            skip,
            complete
        );
        ScanOutcome { skip, complete }
    }

    /// Decide which page backs slot `nr` of `grp` for submission.
    ///
    /// Returns `None` when the slot holds an up-to-date cached page and no
    /// I/O is needed; otherwise the returned page is to be read. Managed
    /// pages are returned locked; the read completion unlocks them.
    pub fn reserve_slot(
        &self,
        grp: &Arc<Workgroup>,
        nr: usize,
        pool: &mut PagePool,
    ) -> Option<Arc<Page>> {
        let slot = grp.slot(nr)?;
        let index = PageIndex(grp.key().0 + nr as u64);
        let locked = Some(Arc::new(SlotEntry::MigrateLocked));

        loop {
            let previous = slot.swap(locked.clone());
            let mut tocache = false;

            if let Some(entry) = previous.as_ref() {
                let page = match entry.as_ref() {
                    SlotEntry::Page { page, .. } => Arc::clone(page),
                    SlotEntry::MigrateLocked => {
                        warn!(
                            target: "zro::zip::cache",
                            event = "slot_already_locked",
                            key = grp.key().0,
                            slot = nr
                        );
                        slot.store(previous);
                        return None;
                    }
                };

                match page.owner() {
                    PageOwner::Preallocated => {
                        slot.store(Some(Arc::new(SlotEntry::Page {
                            page: Arc::clone(&page),
                            just_found: false,
                        })));
                        page.lock();
                        if self.add_to_managed(&page, index) {
                            self.tag(&page, grp);
                        } else {
                            page.unlock();
                            page.set_owner(PageOwner::Staging);
                        }
                        return Some(page);
                    }
                    PageOwner::File(_) | PageOwner::Staging => {
                        slot.store(previous);
                        return Some(page);
                    }
                    PageOwner::Cache(_) | PageOwner::Detached => {
                        page.lock();
                        if self.is_managed(&page) {
                            slot.store(previous);
                            if !self.is_tagged(&page) {
                                self.tag(&page, grp);
                            }
                            if page.is_uptodate() {
                                page.unlock();
                                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                                return None;
                            }
                            // Drop the error left by an earlier failed read.
                            page.clear_flags();
                            return Some(page);
                        }
                        // Truncated out of the cache since the scan found it.
                        tocache = true;
                        page.unlock();
                    }
                }
            }

            let page = pool.take_staging();
            let installed = Some(Arc::new(SlotEntry::Page {
                page: Arc::clone(&page),
                just_found: false,
            }));
            if !slot.compare_and_set(&locked, installed) {
                pool.put(page);
                continue;
            }
            if tocache {
                page.lock();
                if self.add_to_managed(&page, index) {
                    self.tag(&page, grp);
                } else {
                    page.unlock();
                    page.set_owner(PageOwner::Staging);
                }
            }
            return Some(page);
        }
    }

    /// Release every cached compressed page of a frozen, idle workgroup.
    /// A workgroup that is not frozen is busy and left untouched.
    pub fn try_free_all_cached(&self, grp: &Arc<Workgroup>) -> Result<()> {
        if !grp.is_frozen() {
            return Err(ZroError::Busy);
        }
        let Some(_work) = grp.try_lock_work() else {
            return Err(ZroError::Busy);
        };
        for slot in grp.slots() {
            let Some(entry) = slot.load() else {
                continue;
            };
            let Some(page) = entry.page() else {
                return Err(ZroError::Busy);
            };
            if !page.try_lock() {
                return Err(ZroError::Busy);
            }
            if !self.is_managed(page) {
                page.unlock();
                continue;
            }
            slot.clear();
            self.untag(page);
            self.evict_if_resident(page);
            page.unlock();
            self.counters.released.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Detach one cached compressed page from its workgroup and drop it from
    /// the managed cache. Fails while the workgroup is referenced or the page
    /// is locked.
    pub fn try_free_cached_page(&self, page: &Arc<Page>) -> bool {
        let _guard = epoch::pin();
        if !page.try_lock() {
            return false;
        }
        let released = self.owner_of(page).is_some_and(|grp| {
            if !grp.try_freeze(1) {
                return false;
            }
            let slot = grp.slots().iter().find(|slot| slot.holds(page));
            if let Some(slot) = slot {
                slot.clear();
            }
            grp.unfreeze(1);
            slot.is_some()
        });
        if released {
            self.untag(page);
            self.evict_if_resident(page);
            self.counters.released.fetch_add(1, Ordering::Relaxed);
        }
        page.unlock();
        debug!(
            target: "zro::zip::cache",
            event = "free_cached_page",
            index = page.index().0,
            released
        );
        released
    }

    /// Move the contents and cache position of `old` to `new`, updating the
    /// workgroup slot that references `old`.
    pub fn migrate(&self, old: &Arc<Page>, new: &Arc<Page>, mode: MigrateMode) -> Result<()> {
        if !old.try_lock() {
            if mode == MigrateMode::Async {
                return Err(ZroError::Again);
            }
            old.lock();
        }
        let result = self.migrate_locked(old, new, mode);
        old.unlock();
        if result.is_ok() {
            self.counters.migrated.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            target: "zro::zip::cache",
            event = "migrate",
            index = old.index().0,
            ok = result.is_ok()
        );
        result
    }

    fn migrate_locked(&self, old: &Arc<Page>, new: &Arc<Page>, mode: MigrateMode) -> Result<()> {
        let Some(grp) = self.owner_of(old) else {
            if !self.managed.replace(old, new) {
                return Err(ZroError::Again);
            }
            Self::copy_page(old, new);
            return Ok(());
        };

        let _work = match grp.try_lock_work() {
            Some(work) => work,
            None if mode == MigrateMode::Async => return Err(ZroError::Again),
            None => grp.lock_work(),
        };
        if grp.ref_state() == RefState::Frozen {
            return Err(ZroError::Busy);
        }
        if !self.managed.replace(old, new) {
            return Err(ZroError::Again);
        }

        let mut moved = false;
        let mut contended = false;
        for slot in grp.slots() {
            match slot.replace_page(old, new) {
                SlotReplace::Replaced => {
                    moved = true;
                    break;
                }
                SlotReplace::Locked => contended = true,
                SlotReplace::Other => {}
            }
        }
        if !moved && contended {
            warn!(
                target: "zro::zip::cache",
                event = "migrate_slot_contended",
                key = grp.key().0,
                index = old.index().0
            );
        }

        self.untag(old);
        if moved {
            self.tag(new, &grp);
        }
        Self::copy_page(old, new);
        Ok(())
    }

    fn copy_page(old: &Page, new: &Page) {
        new.copy_from(old);
        if old.is_uptodate() {
            new.set_uptodate();
        }
        if old.has_error() {
            new.set_error();
        }
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            inserted: self.counters.inserted.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            migrated: self.counters.migrated.load(Ordering::Relaxed),
            resident: self.managed.len(),
        }
    }
}

impl std::fmt::Debug for CompressedPageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressedPageCache")
            .field("mapping", &self.mapping())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompressor::ClusterFormat;
    use crate::registry::{Link, WorkgroupRegistry};
    use zro_block::MemPageCache;
    use zro_types::BlockNumber;

    fn cache() -> CompressedPageCache {
        CompressedPageCache::new(Arc::new(MemPageCache::new()))
    }

    fn group(registry: &WorkgroupRegistry, key: u64, pages: usize) -> Arc<Workgroup> {
        let (grp, work, _) = registry.find_or_create(BlockNumber(key), || {
            Workgroup::new(BlockNumber(key), pages, 0, ClusterFormat::Lz4, 0, Link::Nil)
        });
        drop(work);
        registry.release(&grp);
        grp
    }

    fn window(grp: &Arc<Workgroup>) -> ScanWindow {
        ScanWindow {
            grp: Arc::clone(grp),
            cursor: 0,
            deficit: grp.cluster_pages(),
        }
    }

    fn cached_page(cache: &CompressedPageCache, index: u64, uptodate: bool) -> Arc<Page> {
        let page = Arc::new(Page::new(PageIndex(index)));
        assert!(cache.managed().insert(PageIndex(index), &page));
        if uptodate {
            page.set_uptodate();
        }
        page
    }

    #[test]
    fn scan_reserves_and_finds() {
        let registry = WorkgroupRegistry::new();
        let cache = cache();
        let grp = group(&registry, 100, 3);
        let resident = cached_page(&cache, 101, true);
        let mut pool = PagePool::new();

        let outcome = cache.scan(&window(&grp), true, &mut pool);
        assert_eq!(outcome, ScanOutcome { skip: 0, complete: true });
        assert!(grp.slot(1).expect("slot").holds(&resident));
        assert_eq!(
            grp.slot(0).expect("slot").page().expect("reserved").owner(),
            PageOwner::Preallocated
        );
    }

    #[test]
    fn scan_without_reserve_stops_at_first_gap() {
        let registry = WorkgroupRegistry::new();
        let cache = cache();
        let grp = group(&registry, 200, 3);
        cached_page(&cache, 200, true);
        cached_page(&cache, 202, true);
        let mut pool = PagePool::new();

        let outcome = cache.scan(&window(&grp), false, &mut pool);
        assert_eq!(outcome, ScanOutcome { skip: 1, complete: false });
        assert!(grp.slot(1).expect("slot").is_empty());
        assert!(!grp.slot(2).expect("slot").is_empty());
    }

    #[test]
    fn uptodate_cached_page_needs_no_io() {
        let registry = WorkgroupRegistry::new();
        let cache = cache();
        let grp = group(&registry, 300, 2);
        let resident = cached_page(&cache, 300, true);
        let mut pool = PagePool::new();
        cache.scan(&window(&grp), true, &mut pool);

        assert!(cache.reserve_slot(&grp, 0, &mut pool).is_none());
        assert!(!resident.is_locked());
        assert_eq!(cache.stats().hits, 1);
        assert!(Arc::ptr_eq(
            &cache.owner_of(&resident).expect("tagged"),
            &grp
        ));

        let reserved = cache.reserve_slot(&grp, 1, &mut pool).expect("needs io");
        assert!(reserved.is_locked());
        assert!(cache.is_managed(&reserved));
        assert_eq!(reserved.index(), PageIndex(301));
        reserved.unlock();
    }

    #[test]
    fn empty_slot_gets_staging_page() {
        let registry = WorkgroupRegistry::new();
        let cache = cache();
        let grp = group(&registry, 400, 1);
        let mut pool = PagePool::new();

        let page = cache.reserve_slot(&grp, 0, &mut pool).expect("staging");
        assert_eq!(page.owner(), PageOwner::Staging);
        assert!(grp.slot(0).expect("slot").holds(&page));
        assert!(!page.is_locked());
    }

    #[test]
    fn truncated_page_is_replaced_and_recached() {
        let registry = WorkgroupRegistry::new();
        let cache = cache();
        let grp = group(&registry, 500, 1);
        let stale = cached_page(&cache, 500, false);
        let mut pool = PagePool::new();
        cache.scan(&window(&grp), false, &mut pool);
        cache.managed().evict(PageIndex(500));

        let page = cache.reserve_slot(&grp, 0, &mut pool).expect("io");
        assert!(!Arc::ptr_eq(&page, &stale));
        assert!(cache.is_managed(&page));
        assert!(page.is_locked());
        page.unlock();
    }

    #[test]
    fn free_all_cached_clears_slots() {
        let registry = WorkgroupRegistry::new();
        let cache = cache();
        let grp = group(&registry, 600, 2);
        let mut pool = PagePool::new();
        cache.scan(&window(&grp), true, &mut pool);
        for nr in 0..2 {
            let page = cache.reserve_slot(&grp, nr, &mut pool).expect("io");
            page.set_uptodate();
            page.unlock();
        }
        assert_eq!(cache.managed().len(), 2);

        let freed = registry.shrink(usize::MAX, |grp| cache.try_free_all_cached(grp));
        assert_eq!(freed, 1);
        assert!(cache.managed().is_empty());
        assert!(grp.slots().iter().all(|slot| slot.is_empty()));
        assert_eq!(cache.stats().released, 2);
    }

    #[test]
    fn free_all_cached_is_busy_while_page_locked() {
        let registry = WorkgroupRegistry::new();
        let cache = cache();
        let grp = group(&registry, 700, 1);
        let mut pool = PagePool::new();
        cache.scan(&window(&grp), true, &mut pool);
        let page = cache.reserve_slot(&grp, 0, &mut pool).expect("io");

        assert_eq!(registry.shrink(usize::MAX, |grp| cache.try_free_all_cached(grp)), 0);
        assert_eq!(registry.len(), 1);
        page.unlock();
        assert!(matches!(grp.ref_state(), RefState::Live(1)));
    }

    #[test]
    fn free_all_cached_leaves_referenced_workgroup_alone() {
        let registry = WorkgroupRegistry::new();
        let cache = cache();
        let grp = group(&registry, 650, 2);
        let mut pool = PagePool::new();
        cache.scan(&window(&grp), true, &mut pool);
        let pages: Vec<Arc<Page>> = (0..2)
            .map(|nr| {
                let page = cache.reserve_slot(&grp, nr, &mut pool).expect("io");
                page.set_uptodate();
                page.unlock();
                page
            })
            .collect();

        let reader = registry.find(BlockNumber(650)).expect("live");
        assert!(matches!(cache.try_free_all_cached(&grp), Err(ZroError::Busy)));
        assert!(!grp.try_freeze(1));
        assert_eq!(registry.shrink(usize::MAX, |grp| cache.try_free_all_cached(grp)), 0);

        for (nr, page) in pages.iter().enumerate() {
            assert!(grp.slot(nr).expect("slot").holds(page));
            assert!(Arc::ptr_eq(&cache.owner_of(page).expect("tagged"), &grp));
        }
        assert_eq!(cache.managed().len(), 2);
        assert_eq!(cache.stats().released, 0);
        assert_eq!(grp.ref_state(), RefState::Live(2));
        registry.release(&reader);
    }

    #[test]
    fn free_single_cached_page() {
        let registry = WorkgroupRegistry::new();
        let cache = cache();
        let grp = group(&registry, 800, 1);
        let mut pool = PagePool::new();
        cache.scan(&window(&grp), true, &mut pool);
        let page = cache.reserve_slot(&grp, 0, &mut pool).expect("io");
        assert!(!cache.try_free_cached_page(&page));
        page.unlock();

        let extra = registry.find(BlockNumber(800)).expect("live");
        assert!(!cache.try_free_cached_page(&page));
        registry.release(&extra);

        assert!(cache.try_free_cached_page(&page));
        assert!(grp.slot(0).expect("slot").is_empty());
        assert!(cache.managed().is_empty());
        assert!(cache.owner_of(&page).is_none());
    }

    #[test]
    fn migrate_moves_slot_and_tag() {
        let registry = WorkgroupRegistry::new();
        let cache = cache();
        let grp = group(&registry, 900, 1);
        let mut pool = PagePool::new();
        cache.scan(&window(&grp), true, &mut pool);
        let old = cache.reserve_slot(&grp, 0, &mut pool).expect("io");
        old.write_at(0, b"cluster");
        old.set_uptodate();
        old.unlock();

        let new = Arc::new(Page::new(PageIndex(0)));
        cache.migrate(&old, &new, MigrateMode::Sync).expect("migrate");
        assert!(grp.slot(0).expect("slot").holds(&new));
        assert!(cache.owner_of(&old).is_none());
        assert!(Arc::ptr_eq(&cache.owner_of(&new).expect("tag"), &grp));
        assert!(new.is_uptodate());
        new.with_data(|d| assert_eq!(&d[..7], b"cluster"));
        assert!(Arc::ptr_eq(
            &cache.managed().lookup(PageIndex(900)).expect("resident"),
            &new
        ));
    }

    #[test]
    fn async_migrate_backs_off_on_locked_work() {
        let registry = WorkgroupRegistry::new();
        let cache = cache();
        let grp = group(&registry, 1000, 1);
        let mut pool = PagePool::new();
        cache.scan(&window(&grp), true, &mut pool);
        let old = cache.reserve_slot(&grp, 0, &mut pool).expect("io");
        old.unlock();

        let work = grp.lock_work();
        let new = Arc::new(Page::new(PageIndex(0)));
        assert!(matches!(
            cache.migrate(&old, &new, MigrateMode::Async),
            Err(ZroError::Again)
        ));
        drop(work);

        assert!(grp.try_freeze(1));
        assert!(matches!(
            cache.migrate(&old, &new, MigrateMode::Sync),
            Err(ZroError::Busy)
        ));
        grp.unfreeze(1);
    }
}

//! Page-cache abstraction keyed by page index within one mapping.

use crate::page::{MappingId, Page, PageOwner};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;
use zro_types::PageIndex;

/// One address space of cached pages (metadata blocks, managed compressed
/// pages, ...). Page locking is done on the [`Page`] itself.
pub trait PageCache: Send + Sync {
    /// Identity stamped into [`PageOwner::Cache`] for resident pages.
    fn mapping(&self) -> MappingId;

    /// Find the page resident at `index`.
    fn lookup(&self, index: PageIndex) -> Option<Arc<Page>>;

    /// Insert `page` at `index`. Returns `false` if the slot is occupied.
    ///
    /// On success the page's owner and index are updated.
    fn insert(&self, index: PageIndex, page: &Arc<Page>) -> bool;

    /// Remove the page resident at `index`, detaching it (truncation).
    fn evict(&self, index: PageIndex) -> Option<Arc<Page>>;

    /// Put `new` in place of `old` when `old` is still resident at its
    /// index. Used by page migration.
    fn replace(&self, old: &Arc<Page>, new: &Arc<Page>) -> bool;

    /// Snapshot of all resident pages.
    fn pages(&self) -> Vec<Arc<Page>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hash-map backed [`PageCache`].
#[derive(Debug)]
pub struct MemPageCache {
    mapping: MappingId,
    pages: RwLock<HashMap<PageIndex, Arc<Page>>>,
}

impl MemPageCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            mapping: MappingId::fresh(),
            pages: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemPageCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PageCache for MemPageCache {
    fn mapping(&self) -> MappingId {
        self.mapping
    }

    fn lookup(&self, index: PageIndex) -> Option<Arc<Page>> {
        self.pages.read().get(&index).cloned()
    }

    fn insert(&self, index: PageIndex, page: &Arc<Page>) -> bool {
        let mut pages = self.pages.write();
        if pages.contains_key(&index) {
            return false;
        }
        page.set_index(index);
        page.set_owner(PageOwner::Cache(self.mapping));
        pages.insert(index, Arc::clone(page));
        drop(pages);
        trace!(
            target: "zro::block",
            event = "page_cache_insert",
            mapping = self.mapping.0,
            index = index.0
        );
        true
    }

    fn evict(&self, index: PageIndex) -> Option<Arc<Page>> {
        let page = self.pages.write().remove(&index)?;
        page.set_owner(PageOwner::Detached);
        trace!(
            target: "zro::block",
            event = "page_cache_evict",
            mapping = self.mapping.0,
            index = index.0
        );
        Some(page)
    }

    fn replace(&self, old: &Arc<Page>, new: &Arc<Page>) -> bool {
        let index = old.index();
        let mut pages = self.pages.write();
        match pages.get(&index) {
            Some(resident) if Arc::ptr_eq(resident, old) => {
                new.set_index(index);
                new.set_owner(PageOwner::Cache(self.mapping));
                pages.insert(index, Arc::clone(new));
                drop(pages);
                old.set_owner(PageOwner::Detached);
                true
            }
            _ => false,
        }
    }

    fn pages(&self) -> Vec<Arc<Page>> {
        self.pages.read().values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.pages.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_lookup_evict() {
        let cache = MemPageCache::new();
        let page = Arc::new(Page::new(PageIndex(0)));

        assert!(cache.insert(PageIndex(7), &page));
        assert_eq!(page.index(), PageIndex(7));
        assert_eq!(page.owner(), PageOwner::Cache(cache.mapping()));

        let found = cache.lookup(PageIndex(7)).expect("resident");
        assert!(Arc::ptr_eq(&found, &page));

        let other = Arc::new(Page::new(PageIndex(0)));
        assert!(!cache.insert(PageIndex(7), &other));
        assert_eq!(other.owner(), PageOwner::Detached);

        let evicted = cache.evict(PageIndex(7)).expect("evicted");
        assert!(Arc::ptr_eq(&evicted, &page));
        assert_eq!(page.owner(), PageOwner::Detached);
        assert!(cache.is_empty());
    }

    #[test]
    fn replace_swaps_resident_page() {
        let cache = MemPageCache::new();
        let old = Arc::new(Page::new(PageIndex(0)));
        let new = Arc::new(Page::new(PageIndex(0)));
        assert!(cache.insert(PageIndex(2), &old));

        assert!(cache.replace(&old, &new));
        assert_eq!(new.index(), PageIndex(2));
        assert_eq!(old.owner(), PageOwner::Detached);
        assert!(Arc::ptr_eq(
            &cache.lookup(PageIndex(2)).expect("resident"),
            &new
        ));

        // `old` is no longer resident, a second replace is refused.
        assert!(!cache.replace(&old, &new));
    }
}

//! Ordered per-work vector of destination pages.
//!
//! Entries live in chunks: a small inline chunk, then chunks of
//! [`CARRIER_CHUNK_LEN`] entries. Every chunk after the inline one is owned
//! by a carrier, the first EXCLUSIVE page of the chunk before it. A chunk
//! that has no EXCLUSIVE entry yet refuses to use its last slot for any
//! other page type; the caller then adds a staging page (which is
//! EXCLUSIVE) to carry the next chunk and retries.
//!
//! Consumers drain chunk by chunk: a carrier may only be released once the
//! chunk it carries has been read.

use std::sync::Arc;
use zro_block::Page;
use zro_types::PAGE_SIZE;

/// Entries stored inline in the work itself.
pub const INLINE_PAGEVECS: usize = 3;
/// Entries one carrier page holds.
pub const CARRIER_CHUNK_LEN: usize = PAGE_SIZE / std::mem::size_of::<u64>();

/// How a destination page relates to the work it is queued on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageType {
    /// The page belongs to this work only.
    Exclusive,
    /// The page's leading bytes belong to a work that follows this one.
    TailShared,
    /// The page holds the first decompressed bytes of this work.
    Head,
}

#[derive(Debug, Clone)]
pub struct PageVecEntry {
    pub page: Arc<Page>,
    pub page_type: PageType,
}

/// One run of entries and the page that carries it. The inline chunk has
/// no carrier.
#[derive(Debug, Clone)]
pub struct PageVecChunk {
    pub carrier: Option<Arc<Page>>,
    pub entries: Vec<PageVecEntry>,
}

impl PageVecChunk {
    fn capacity(&self) -> usize {
        if self.carrier.is_some() {
            CARRIER_CHUNK_LEN
        } else {
            INLINE_PAGEVECS
        }
    }

    fn first_exclusive(&self) -> Option<&Arc<Page>> {
        self.entries
            .iter()
            .find(|entry| entry.page_type == PageType::Exclusive)
            .map(|entry| &entry.page)
    }
}

#[derive(Debug, Default)]
pub struct PageVec {
    chunks: Vec<PageVecChunk>,
}

impl PageVec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.iter().map(|chunk| chunk.entries.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(|chunk| chunk.entries.is_empty())
    }

    /// The chunk the next entry lands in, opening a carried chunk when the
    /// last one is full. `None` if a full chunk has nothing to carry on.
    fn open_chunk(&mut self) -> Option<&mut PageVecChunk> {
        let full = self
            .chunks
            .last()
            .is_none_or(|last| last.entries.len() >= last.capacity());
        if full {
            let carrier = match self.chunks.last() {
                None => None,
                Some(last) => Some(Arc::clone(last.first_exclusive()?)),
            };
            self.chunks.push(PageVecChunk {
                carrier,
                entries: Vec::new(),
            });
        }
        self.chunks.last_mut()
    }

    /// Append `page`. Returns `false` when a carrier page must be queued first.
    pub fn enqueue(&mut self, page: &Arc<Page>, page_type: PageType) -> bool {
        let Some(chunk) = self.open_chunk() else {
            return false;
        };
        if page_type != PageType::Exclusive
            && chunk.entries.len() + 1 == chunk.capacity()
            && chunk.first_exclusive().is_none()
        {
            return false;
        }
        chunk.entries.push(PageVecEntry {
            page: Arc::clone(page),
            page_type,
        });
        true
    }

    /// Pages carrying chunks after the inline one, in order.
    #[must_use]
    pub fn carriers(&self) -> Vec<Arc<Page>> {
        self.chunks
            .iter()
            .filter_map(|chunk| chunk.carrier.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageVecEntry> {
        self.chunks.iter().flat_map(|chunk| chunk.entries.iter())
    }

    /// Remove every chunk, in insertion order.
    pub fn drain_chunks(&mut self) -> Vec<PageVecChunk> {
        std::mem::take(&mut self.chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zro_types::PageIndex;

    fn page(i: u64) -> Arc<Page> {
        Arc::new(Page::new(PageIndex(i)))
    }

    #[test]
    fn preserves_insertion_order() {
        let mut vec = PageVec::new();
        let pages: Vec<_> = (0..3).map(page).collect();
        assert!(vec.enqueue(&pages[0], PageType::Head));
        assert!(vec.enqueue(&pages[1], PageType::Exclusive));
        assert!(vec.enqueue(&pages[2], PageType::TailShared));
        let order: Vec<u64> = vec.iter().map(|e| e.page.index().0).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(vec.len(), 3);
    }

    #[test]
    fn last_inline_slot_needs_a_carrier() {
        let mut vec = PageVec::new();
        assert!(vec.enqueue(&page(0), PageType::Head));
        assert!(vec.enqueue(&page(1), PageType::TailShared));
        assert!(!vec.enqueue(&page(2), PageType::TailShared));

        let staging = page(99);
        assert!(vec.enqueue(&staging, PageType::Exclusive));
        assert!(vec.enqueue(&page(2), PageType::TailShared));
        assert_eq!(vec.len(), 4);
        let carriers = vec.carriers();
        assert_eq!(carriers.len(), 1);
        assert!(Arc::ptr_eq(&carriers[0], &staging));

        let chunks = vec.drain_chunks();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].carrier.is_none());
        assert_eq!(chunks[0].entries.len(), INLINE_PAGEVECS);
        assert_eq!(chunks[1].entries[0].page.index(), PageIndex(2));
        assert!(vec.is_empty());
    }

    #[test]
    fn exclusive_entry_already_carries_next_chunk() {
        let mut vec = PageVec::new();
        let first = page(0);
        assert!(vec.enqueue(&first, PageType::Exclusive));
        assert!(vec.enqueue(&page(1), PageType::Head));
        assert!(vec.enqueue(&page(2), PageType::TailShared));
        assert!(vec.enqueue(&page(3), PageType::Head));
        assert!(Arc::ptr_eq(&vec.carriers()[0], &first));
    }

    #[test]
    fn carrier_chunks_apply_the_same_rule() {
        let mut vec = PageVec::new();
        for i in 0..INLINE_PAGEVECS {
            assert!(vec.enqueue(&page(i as u64), PageType::Exclusive));
        }
        for i in 0..CARRIER_CHUNK_LEN - 1 {
            assert!(vec.enqueue(&page(100 + i as u64), PageType::Head));
        }
        assert!(!vec.enqueue(&page(7), PageType::Head));
        assert!(vec.enqueue(&page(8), PageType::Exclusive));
        assert_eq!(vec.carriers().len(), 1);
        assert!(vec.enqueue(&page(9), PageType::Head));
        let carriers = vec.carriers();
        assert_eq!(carriers.len(), 2);
        assert_eq!(carriers[1].index(), PageIndex(8));

        let sizes: Vec<usize> = vec
            .drain_chunks()
            .iter()
            .map(|chunk| chunk.entries.len())
            .collect();
        assert_eq!(sizes, vec![INLINE_PAGEVECS, CARRIER_CHUNK_LEN, 1]);
    }

    #[test]
    fn drain_empties_the_vector() {
        let mut vec = PageVec::new();
        assert!(vec.enqueue(&page(0), PageType::Exclusive));
        let drained = vec.drain_chunks();
        assert_eq!(drained.len(), 1);
        assert!(vec.is_empty());
        assert_eq!(vec.len(), 0);
    }
}

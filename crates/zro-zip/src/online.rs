//! Destination ("online") page accounting.
//!
//! A file page handed to the read path may be split between two works: its
//! tail bytes start the next extent while its head bytes finish the
//! previous one. The page's private word tracks how many parts are still
//! pending (low bits) and the page's index within the work that covers its
//! head bytes (high bits). The page is finalized, marked up to date unless
//! an error was recorded, and unlocked, when the last part completes.

use std::sync::atomic::Ordering;
use tracing::error;
use zro_block::Page;

const COUNT_BITS: u32 = 16;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;

/// Start tracking `page`; the caller holds the first pending part.
pub fn init(page: &Page) {
    page.private_word().store(1, Ordering::Release);
}

/// Record the page's `index` within a work and, with `down`, one more
/// pending part. An index already recorded is kept when `index` is 0.
pub fn fixup(page: &Page, index: usize, down: bool) {
    let word = page.private_word();
    let _ = word.fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
        let id = old >> COUNT_BITS;
        if id != 0 && index == 0 {
            return None;
        }
        Some(((index as u64) << COUNT_BITS) | ((old & COUNT_MASK) + u64::from(down)))
    });
}

/// Index recorded by [`fixup`].
#[must_use]
pub fn index(page: &Page) -> usize {
    usize::try_from(page.private_word().load(Ordering::Acquire) >> COUNT_BITS).unwrap_or(usize::MAX)
}

/// Pending parts of `page`.
#[must_use]
pub fn pending(page: &Page) -> u64 {
    page.private_word().load(Ordering::Acquire) & COUNT_MASK
}

/// Complete one part; the last one finalizes the page.
pub fn endio(page: &Page) {
    let word = page.private_word();
    let prev = word.fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
        (old & COUNT_MASK != 0).then(|| old - 1)
    });
    match prev {
        Ok(old) if old & COUNT_MASK == 1 => {
            word.store(0, Ordering::Release);
            if !page.has_error() {
                page.set_uptodate();
            }
            page.unlock();
        }
        Ok(_) => {}
        Err(_) => {
            error!(
                target: "zro::zip::unzip",
                event = "online_page_underflow",
                index = page.index().0
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zro_types::PageIndex;

    #[test]
    fn single_part_page_finalizes_on_endio() {
        let page = Page::new(PageIndex(3));
        page.lock();
        init(&page);
        endio(&page);
        assert!(page.is_uptodate());
        assert!(!page.is_locked());
        assert_eq!(pending(&page), 0);
    }

    #[test]
    fn split_page_waits_for_both_works() {
        let page = Page::new(PageIndex(9));
        page.lock();
        init(&page);
        // Tail bytes: head page of the following work.
        fixup(&page, 0, true);
        // Head bytes: page 4 of the preceding work.
        fixup(&page, 4, true);
        assert_eq!(index(&page), 4);
        assert_eq!(pending(&page), 3);

        endio(&page);
        endio(&page);
        assert!(page.is_locked());
        endio(&page);
        assert!(page.is_uptodate());
        assert!(!page.is_locked());
    }

    #[test]
    fn zero_index_does_not_override_recorded_index() {
        let page = Page::new(PageIndex(0));
        init(&page);
        fixup(&page, 2, true);
        fixup(&page, 0, true);
        assert_eq!(index(&page), 2);
        assert_eq!(pending(&page), 2);
    }

    #[test]
    fn errored_page_is_unlocked_but_not_uptodate() {
        let page = Page::new(PageIndex(1));
        page.lock();
        init(&page);
        page.set_error();
        endio(&page);
        assert!(!page.is_uptodate());
        assert!(!page.is_locked());
    }
}

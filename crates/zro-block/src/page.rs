//! Page frames shared between the page caches and the decompression pipeline.
//!
//! A [`Page`] is one [`PAGE_SIZE`] buffer plus the state the read path needs:
//! a sleeping lock that may be released from a different thread than the one
//! that took it (I/O completion unlocks pages locked by the submitter), the
//! `UPTODATE`/`ERROR` flags, the owner it currently belongs to, and one
//! private word that the owner may use for bookkeeping.

use parking_lot::{Condvar, Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use zro_types::{InodeNumber, PAGE_SIZE, PageIndex};

const FLAG_UPTODATE: u32 = 1 << 0;
const FLAG_ERROR: u32 = 1 << 1;
const FLAG_READAHEAD: u32 = 1 << 2;

/// Identity of one page-cache mapping (the metadata cache, the managed
/// compressed-page cache, a file's cache).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingId(pub u64);

impl MappingId {
    /// Allocate a process-unique mapping id.
    #[must_use]
    pub fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Who a page currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOwner {
    /// Not attached anywhere (fresh, or truncated out of a cache).
    Detached,
    /// Temporary pool page; never inserted into a shared cache.
    Staging,
    /// Reserved for the managed cache but not inserted yet.
    Preallocated,
    /// Destination page of a file read.
    File(InodeNumber),
    /// Resident in the page cache identified by the mapping.
    Cache(MappingId),
}

pub struct Page {
    index: AtomicU64,
    data: RwLock<Box<[u8]>>,
    flags: AtomicU32,
    locked: Mutex<bool>,
    unlocked: Condvar,
    owner: Mutex<PageOwner>,
    private: AtomicU64,
}

impl Page {
    #[must_use]
    pub fn new(index: PageIndex) -> Self {
        Self {
            index: AtomicU64::new(index.0),
            data: RwLock::new(vec![0_u8; PAGE_SIZE].into_boxed_slice()),
            flags: AtomicU32::new(0),
            locked: Mutex::new(false),
            unlocked: Condvar::new(),
            owner: Mutex::new(PageOwner::Detached),
            private: AtomicU64::new(0),
        }
    }

    /// A destination page of file `ino` at `index`.
    #[must_use]
    pub fn for_file(ino: InodeNumber, index: PageIndex) -> Arc<Self> {
        let page = Self::new(index);
        page.set_owner(PageOwner::File(ino));
        Arc::new(page)
    }

    #[must_use]
    pub fn index(&self) -> PageIndex {
        PageIndex(self.index.load(Ordering::Acquire))
    }

    pub fn set_index(&self, index: PageIndex) {
        self.index.store(index.0, Ordering::Release);
    }

    // ── Lock ────────────────────────────────────────────────────────────────

    /// Block until the page lock is acquired.
    pub fn lock(&self) {
        let mut locked = self.locked.lock();
        while *locked {
            self.unlocked.wait(&mut locked);
        }
        *locked = true;
    }

    /// Acquire the page lock without sleeping.
    #[must_use]
    pub fn try_lock(&self) -> bool {
        let mut locked = self.locked.lock();
        if *locked {
            return false;
        }
        *locked = true;
        true
    }

    /// Release the page lock. May be called from any thread.
    pub fn unlock(&self) {
        let mut locked = self.locked.lock();
        debug_assert!(*locked, "unlocking an unlocked page");
        *locked = false;
        drop(locked);
        self.unlocked.notify_all();
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        *self.locked.lock()
    }

    /// Sleep until nobody holds the page lock.
    pub fn wait_unlocked(&self) {
        let mut locked = self.locked.lock();
        while *locked {
            self.unlocked.wait(&mut locked);
        }
    }

    // ── Flags ───────────────────────────────────────────────────────────────

    #[must_use]
    pub fn is_uptodate(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_UPTODATE != 0
    }

    pub fn set_uptodate(&self) {
        self.flags.fetch_or(FLAG_UPTODATE, Ordering::AcqRel);
    }

    #[must_use]
    pub fn has_error(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_ERROR != 0
    }

    pub fn set_error(&self) {
        self.flags.fetch_or(FLAG_ERROR, Ordering::AcqRel);
    }

    /// Whether the page was marked as the start of an asynchronous read-ahead window.
    #[must_use]
    pub fn is_readahead(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_READAHEAD != 0
    }

    pub fn set_readahead(&self) {
        self.flags.fetch_or(FLAG_READAHEAD, Ordering::AcqRel);
    }

    /// Drop every flag (used when a pool page is handed out again).
    pub fn clear_flags(&self) {
        self.flags.store(0, Ordering::Release);
    }

    // ── Ownership ───────────────────────────────────────────────────────────

    #[must_use]
    pub fn owner(&self) -> PageOwner {
        *self.owner.lock()
    }

    pub fn set_owner(&self, owner: PageOwner) {
        *self.owner.lock() = owner;
    }

    /// Owner-defined bookkeeping word.
    #[must_use]
    pub fn private_word(&self) -> &AtomicU64 {
        &self.private
    }

    // ── Contents ────────────────────────────────────────────────────────────

    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let data = self.data.read();
        f(&data)
    }

    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = self.data.write();
        f(&mut data)
    }

    /// Overwrite `bytes.len()` bytes starting at `offset`.
    pub fn write_at(&self, offset: usize, bytes: &[u8]) {
        self.with_data_mut(|data| data[offset..offset + bytes.len()].copy_from_slice(bytes));
    }

    /// Zero the byte range `start..end`.
    pub fn zero_range(&self, start: usize, end: usize) {
        self.with_data_mut(|data| data[start..end].fill(0));
    }

    /// Copy the full contents of `other` into this page.
    pub fn copy_from(&self, other: &Self) {
        let src = other.data.read();
        self.data.write().copy_from_slice(&src);
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.with_data(<[u8]>::to_vec)
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("index", &self.index())
            .field("owner", &self.owner())
            .field("uptodate", &self.is_uptodate())
            .field("error", &self.has_error())
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// Free list of pages owned by one read operation (or one background
/// decompression pass). Staging pages come from here and go back here.
#[derive(Debug, Default)]
pub struct PagePool {
    free: Vec<Arc<Page>>,
    allocated: usize,
}

impl PagePool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a free page, allocating when the pool is empty. The page is
    /// unlocked, flagless and [`PageOwner::Detached`].
    pub fn take(&mut self) -> Arc<Page> {
        if let Some(page) = self.free.pop() {
            page.clear_flags();
            page.private_word().store(0, Ordering::Release);
            return page;
        }
        self.allocated += 1;
        Arc::new(Page::new(PageIndex(0)))
    }

    /// Take a page and mark it as a staging page.
    pub fn take_staging(&mut self) -> Arc<Page> {
        let page = self.take();
        page.set_owner(PageOwner::Staging);
        page
    }

    /// Hand a page back to the free list.
    pub fn put(&mut self, page: Arc<Page>) {
        page.set_owner(PageOwner::Detached);
        self.free.push(page);
    }

    /// Return `page` to the pool if it is a staging page; report whether it was.
    pub fn gather_if_staging(&mut self, page: &Arc<Page>) -> bool {
        if page.owner() != PageOwner::Staging {
            return false;
        }
        self.put(Arc::clone(page));
        true
    }

    #[must_use]
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Pages this pool had to allocate because the free list was empty.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.allocated
    }
}

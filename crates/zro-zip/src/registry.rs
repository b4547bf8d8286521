//! Workgroups and the registry that makes them unique per physical cluster.
//!
//! # Design
//!
//! A [`Workgroup`] owns the compressed-page slots of one physical cluster
//! and the single [`WorkState`] that collects its destination pages. The
//! registry maps the cluster's first block to the live workgroup so that
//! concurrent readers of the same cluster join one work instead of
//! decompressing it twice.
//!
//! Lookups are lock-free with respect to reclamation: the shard lock is held
//! only long enough to clone the `Arc`, the reference count is then taken
//! with a CAS that refuses to resurrect a workgroup at zero and spins while
//! it is frozen. A workgroup whose count drops to zero is unlinked and its
//! registry reference is retired through `crossbeam-epoch`, so any reader
//! pinned before the unlink finishes with it first.
//!
//! Freezing replaces the count with [`FROZEN`] for as long as the shrinker
//! (or a cache page release) inspects the slots; it only succeeds when the
//! registry holds the sole reference.

use crate::decompressor::ClusterFormat;
use crate::pagevec::PageVec;
use arc_swap::{ArcSwap, ArcSwapOption};
use crossbeam_epoch as epoch;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tracing::{debug, error, info};
use zro_block::Page;
use zro_error::Result;
use zro_types::BlockNumber;

/// Reference-count value of a frozen workgroup.
pub const FROZEN: u32 = u32::MAX;

const SHARDS: usize = 16;

/// Spin briefly, then yield, while another thread holds a workgroup frozen.
fn backoff(spins: &mut u32) {
    if *spins < 64 {
        std::hint::spin_loop();
    } else {
        std::thread::yield_now();
    }
    *spins = spins.saturating_add(1);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefState {
    Live(u32),
    Frozen,
}

/// Contents of one compressed-page slot.
#[derive(Debug)]
pub enum SlotEntry {
    /// Placeholder installed while a submitter decides which page backs the slot.
    MigrateLocked,
    /// A compressed page. `just_found` marks a page picked up from the
    /// managed cache by a scan, before submission has looked at it.
    Page { page: Arc<Page>, just_found: bool },
}

impl SlotEntry {
    #[must_use]
    pub fn page(&self) -> Option<&Arc<Page>> {
        match self {
            Self::MigrateLocked => None,
            Self::Page { page, .. } => Some(page),
        }
    }
}

/// Result of [`CompressedSlot::replace_page`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotReplace {
    Replaced,
    /// The slot is being claimed by a submitter.
    Locked,
    Other,
}

fn same_entry(a: &Option<Arc<SlotEntry>>, b: &Option<Arc<SlotEntry>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

/// One compressed-page slot, updated only by compare-and-swap.
#[derive(Debug, Default)]
pub struct CompressedSlot(ArcSwapOption<SlotEntry>);

impl CompressedSlot {
    #[must_use]
    pub fn load(&self) -> Option<Arc<SlotEntry>> {
        self.0.load_full()
    }

    /// The page in the slot, if it holds one.
    #[must_use]
    pub fn page(&self) -> Option<Arc<Page>> {
        self.load().and_then(|entry| entry.page().cloned())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.load().is_none()
    }

    #[must_use]
    pub fn holds(&self, page: &Arc<Page>) -> bool {
        self.0
            .load()
            .as_ref()
            .and_then(|entry| entry.page())
            .is_some_and(|held| Arc::ptr_eq(held, page))
    }

    pub fn store(&self, entry: Option<Arc<SlotEntry>>) {
        self.0.store(entry);
    }

    pub fn clear(&self) {
        self.0.store(None);
    }

    /// Install `entry` if the slot is empty.
    pub fn try_fill(&self, entry: SlotEntry) -> bool {
        let current: Option<Arc<SlotEntry>> = None;
        let prev = self.0.compare_and_swap(&current, Some(Arc::new(entry)));
        prev.is_none()
    }

    /// Unconditionally install `entry`, returning what was there.
    pub fn swap(&self, entry: Option<Arc<SlotEntry>>) -> Option<Arc<SlotEntry>> {
        self.0.swap(entry)
    }

    /// Install `new` if the slot still holds `current`.
    pub fn compare_and_set(
        &self,
        current: &Option<Arc<SlotEntry>>,
        new: Option<Arc<SlotEntry>>,
    ) -> bool {
        let prev = self.0.compare_and_swap(current, new);
        same_entry(&*prev, current)
    }

    /// Swap `old` for `new` if the slot holds `old`.
    pub fn replace_page(&self, old: &Arc<Page>, new: &Arc<Page>) -> SlotReplace {
        let current = self.load();
        match current.as_deref() {
            Some(SlotEntry::MigrateLocked) => SlotReplace::Locked,
            Some(SlotEntry::Page { page, .. }) if Arc::ptr_eq(page, old) => {
                let replacement = Arc::new(SlotEntry::Page {
                    page: Arc::clone(new),
                    just_found: false,
                });
                if self.compare_and_set(&current, Some(replacement)) {
                    SlotReplace::Replaced
                } else {
                    SlotReplace::Other
                }
            }
            _ => SlotReplace::Other,
        }
    }
}

/// Link from one workgroup to the next in a submission chain.
#[derive(Clone)]
pub enum Link {
    /// Not part of any chain.
    Nil,
    /// Last element of a chain that is still open for hooking.
    Tail,
    /// Last element of a chain that has been submitted.
    TailClosed,
    Grp(Arc<Workgroup>),
}

impl Link {
    /// Identity comparison (workgroups compare by pointer).
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) | (Self::Tail, Self::Tail) | (Self::TailClosed, Self::TailClosed) => {
                true
            }
            (Self::Grp(a), Self::Grp(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    #[must_use]
    pub fn is_end(&self) -> bool {
        matches!(self, Self::Tail | Self::TailClosed)
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => f.write_str("Nil"),
            Self::Tail => f.write_str("Tail"),
            Self::TailClosed => f.write_str("TailClosed"),
            Self::Grp(grp) => write!(f, "Grp({})", grp.key().0),
        }
    }
}

/// Destination-page collection of one workgroup, guarded by the work lock.
#[derive(Debug, Default)]
pub struct WorkState {
    /// Byte offset of the extent's first logical byte within its first page.
    pub pageofs: usize,
    /// Destination pages the work spans.
    pub nr_pages: usize,
    pub pagevec: PageVec,
}

/// Owned guard on a workgroup's work lock.
pub type WorkGuard = ArcMutexGuard<RawMutex, WorkState>;

pub struct Workgroup {
    key: BlockNumber,
    refcount: AtomicU32,
    llen: AtomicU64,
    format: ClusterFormat,
    slots: Box<[CompressedSlot]>,
    next: ArcSwap<Link>,
    work: Arc<Mutex<WorkState>>,
    reclaimed: AtomicBool,
}

impl Workgroup {
    /// A workgroup with one reference held by the caller.
    #[must_use]
    pub fn new(
        key: BlockNumber,
        cluster_pages: usize,
        llen: u64,
        format: ClusterFormat,
        pageofs: usize,
        next: Link,
    ) -> Self {
        Self {
            key,
            refcount: AtomicU32::new(1),
            llen: AtomicU64::new(llen),
            format,
            slots: (0..cluster_pages).map(|_| CompressedSlot::default()).collect(),
            next: ArcSwap::from_pointee(next),
            work: Arc::new(Mutex::new(WorkState {
                pageofs,
                ..WorkState::default()
            })),
            reclaimed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn key(&self) -> BlockNumber {
        self.key
    }

    #[must_use]
    pub fn format(&self) -> ClusterFormat {
        self.format
    }

    #[must_use]
    pub fn cluster_pages(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn slots(&self) -> &[CompressedSlot] {
        &self.slots
    }

    #[must_use]
    pub fn slot(&self, index: usize) -> Option<&CompressedSlot> {
        self.slots.get(index)
    }

    /// Decompressed bytes the work has to produce.
    #[must_use]
    pub fn llen(&self) -> u64 {
        self.llen.load(Ordering::Acquire)
    }

    /// Raise `llen` to at least `llen`.
    pub fn grow_llen(&self, llen: u64) {
        self.llen.fetch_max(llen, Ordering::AcqRel);
    }

    #[must_use]
    pub fn ref_state(&self) -> RefState {
        match self.refcount.load(Ordering::Acquire) {
            FROZEN => RefState::Frozen,
            n => RefState::Live(n),
        }
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.ref_state() == RefState::Frozen
    }

    /// Take a reference unless the count already reached zero.
    fn try_get(&self) -> bool {
        let mut spins = 0;
        loop {
            let current = self.refcount.load(Ordering::Acquire);
            match current {
                FROZEN => backoff(&mut spins),
                0 => return false,
                n => {
                    if self
                        .refcount
                        .compare_exchange_weak(n, n + 1, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return true;
                    }
                }
            }
        }
    }

    /// Drop one reference; returns the remaining count.
    fn put(&self) -> u32 {
        let mut spins = 0;
        loop {
            let current = self.refcount.load(Ordering::Acquire);
            match current {
                FROZEN => backoff(&mut spins),
                0 => {
                    error!(
                        target: "zro::zip::registry",
                        event = "refcount_underflow",
                        key = self.key.0
                    );
                    return 0;
                }
                n => {
                    if self
                        .refcount
                        .compare_exchange_weak(n, n - 1, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return n - 1;
                    }
                }
            }
        }
    }

    /// Freeze the count if it equals `expected`.
    pub fn try_freeze(&self, expected: u32) -> bool {
        self.refcount
            .compare_exchange(expected, FROZEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Restore a frozen count to `value`.
    pub fn unfreeze(&self, value: u32) {
        debug_assert!(self.is_frozen(), "unfreezing a live workgroup");
        self.refcount.store(value, Ordering::Release);
    }

    #[must_use]
    pub fn next(&self) -> Link {
        Link::clone(&self.next.load())
    }

    pub(crate) fn store_next(&self, next: Link) {
        self.next.store(Arc::new(next));
    }

    /// Replace `next` with `new` if it currently is `expected`; returns the
    /// value observed (equal to `expected` on success).
    pub(crate) fn cas_next(&self, expected: &Link, new: Link) -> Link {
        let new = Arc::new(new);
        loop {
            let current = self.next.load_full();
            if !current.same(expected) {
                return Link::clone(&current);
            }
            let prev = self.next.compare_and_swap(&current, Arc::clone(&new));
            if Arc::ptr_eq(&*prev, &current) {
                return Link::clone(&current);
            }
        }
    }

    /// Block until the work lock is held.
    #[must_use]
    pub fn lock_work(&self) -> WorkGuard {
        self.work.lock_arc()
    }

    #[must_use]
    pub fn try_lock_work(&self) -> Option<WorkGuard> {
        self.work.try_lock_arc()
    }
}

impl fmt::Debug for Workgroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workgroup")
            .field("key", &self.key)
            .field("refcount", &self.ref_state())
            .field("llen", &self.llen())
            .field("format", &self.format)
            .field("cluster_pages", &self.slots.len())
            .finish_non_exhaustive()
    }
}

/// Registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub created: u64,
    /// Registrations that lost to a concurrent creator.
    pub registration_races: u64,
    /// Workgroups retired through deferred reclamation.
    pub reclaims: u64,
    pub live: usize,
}

type Shard = RwLock<HashMap<BlockNumber, Arc<Workgroup>>>;

/// Physical cluster start → live workgroup.
pub struct WorkgroupRegistry {
    shards: Box<[Shard]>,
    created: AtomicU64,
    races: AtomicU64,
    reclaims: AtomicU64,
}

impl Default for WorkgroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkgroupRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            created: AtomicU64::new(0),
            races: AtomicU64::new(0),
            reclaims: AtomicU64::new(0),
        }
    }

    fn shard(&self, key: BlockNumber) -> &Shard {
        let idx = usize::try_from(key.0 % SHARDS as u64).unwrap_or(0);
        &self.shards[idx]
    }

    /// Find the live workgroup for `key` and take a reference on it.
    #[must_use]
    pub fn find(&self, key: BlockNumber) -> Option<Arc<Workgroup>> {
        let _guard = epoch::pin();
        let grp = self.shard(key).read().get(&key).cloned()?;
        grp.try_get().then_some(grp)
    }

    /// Publish `grp` unless `key` is taken. The registry's own reference is
    /// added before the workgroup becomes visible.
    pub fn register(&self, grp: &Arc<Workgroup>) -> bool {
        let mut map = self.shard(grp.key()).write();
        if map.contains_key(&grp.key()) {
            return false;
        }
        grp.refcount.fetch_add(1, Ordering::AcqRel);
        map.insert(grp.key(), Arc::clone(grp));
        drop(map);
        true
    }

    /// Return the workgroup for `key` with its work locked, creating it with
    /// `make` when none is live. The boolean is true for a new workgroup,
    /// which is locked before any other thread can see it.
    pub fn find_or_create(
        &self,
        key: BlockNumber,
        make: impl Fn() -> Workgroup,
    ) -> (Arc<Workgroup>, WorkGuard, bool) {
        let mut spins = 0;
        loop {
            if let Some(grp) = self.find(key) {
                let work = grp.lock_work();
                return (grp, work, false);
            }

            let grp = Arc::new(make());
            let work = grp.lock_work();
            if self.register(&grp) {
                self.created.fetch_add(1, Ordering::Relaxed);
                debug!(
                    target: "zro::zip::registry",
                    event = "workgroup_created",
                    key = key.0,
                    cluster_pages = grp.cluster_pages()
                );
                return (grp, work, true);
            }

            self.races.fetch_add(1, Ordering::Relaxed);
            debug!(
                target: "zro::zip::registry",
                event = "registration_race",
                key = key.0
            );
            drop(work);
            drop(grp);
            backoff(&mut spins);
        }
    }

    /// Drop a reference taken by [`find`](Self::find) or creation. The last
    /// one unlinks the workgroup and retires it.
    pub fn release(&self, grp: &Arc<Workgroup>) {
        if grp.put() == 0 {
            self.unregister(grp);
            self.defer_reclaim(Arc::clone(grp));
        }
    }

    fn unregister(&self, grp: &Arc<Workgroup>) -> bool {
        let mut map = self.shard(grp.key()).write();
        if map.get(&grp.key()).is_some_and(|live| Arc::ptr_eq(live, grp)) {
            map.remove(&grp.key());
            return true;
        }
        false
    }

    fn defer_reclaim(&self, grp: Arc<Workgroup>) {
        if grp.reclaimed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.reclaims.fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "zro::zip::registry",
            event = "workgroup_retired",
            key = grp.key().0
        );
        let guard = epoch::pin();
        guard.defer(move || drop(grp));
        guard.flush();
    }

    /// Reclaim up to `max` idle workgroups. `free_cached` runs on each
    /// frozen candidate and must release its cached compressed pages; a
    /// failure leaves the workgroup in place.
    pub fn shrink(&self, max: usize, free_cached: impl Fn(&Arc<Workgroup>) -> Result<()>) -> usize {
        let mut freed = 0_usize;
        'shards: for shard in &self.shards {
            let candidates: Vec<Arc<Workgroup>> = shard.read().values().cloned().collect();
            for grp in candidates {
                if freed >= max {
                    break 'shards;
                }
                if !grp.try_freeze(1) {
                    continue;
                }
                if let Err(err) = free_cached(&grp) {
                    grp.unfreeze(1);
                    debug!(
                        target: "zro::zip::registry",
                        event = "shrink_skip",
                        key = grp.key().0,
                        error = %err
                    );
                    continue;
                }
                self.unregister(&grp);
                grp.refcount.store(0, Ordering::Release);
                self.defer_reclaim(grp);
                freed += 1;
            }
        }
        info!(
            target: "zro::zip::registry",
            event = "shrink",
            freed,
            remaining = self.len()
        );
        freed
    }

    /// Live workgroups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            created: self.created.load(Ordering::Relaxed),
            registration_races: self.races.load(Ordering::Relaxed),
            reclaims: self.reclaims.load(Ordering::Relaxed),
            live: self.len(),
        }
    }
}

impl fmt::Debug for WorkgroupRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkgroupRegistry")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use zro_error::ZroError;
    use zro_types::PageIndex;

    fn make(key: u64) -> impl Fn() -> Workgroup {
        move || Workgroup::new(BlockNumber(key), 4, 4096, ClusterFormat::Lz4, 0, Link::Nil)
    }

    #[test]
    fn created_workgroup_is_locked_and_referenced_twice() {
        let registry = WorkgroupRegistry::new();
        let (grp, work, created) = registry.find_or_create(BlockNumber(7), make(7));
        assert!(created);
        assert!(grp.try_lock_work().is_none());
        assert_eq!(grp.ref_state(), RefState::Live(2));
        drop(work);

        let (again, work, created) = registry.find_or_create(BlockNumber(7), make(7));
        assert!(!created);
        assert!(Arc::ptr_eq(&grp, &again));
        assert_eq!(grp.ref_state(), RefState::Live(3));
        drop(work);

        registry.release(&again);
        registry.release(&grp);
        assert_eq!(registry.len(), 1);
        registry.release(&grp);
        assert!(registry.is_empty());
        assert!(registry.find(BlockNumber(7)).is_none());
        assert_eq!(registry.stats().reclaims, 1);
    }

    #[test]
    fn concurrent_creators_share_one_workgroup() {
        let registry = Arc::new(WorkgroupRegistry::new());
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let (grp, work, created) = registry.find_or_create(BlockNumber(42), make(42));
                    drop(work);
                    (grp, created)
                })
            })
            .collect();

        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .collect();
        assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);
        let first = &results[0].0;
        assert!(results.iter().all(|(grp, _)| Arc::ptr_eq(grp, first)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.stats().created, 1);
        assert_eq!(first.ref_state(), RefState::Live(9));
    }

    #[test]
    fn freeze_requires_exact_count() {
        let grp = Workgroup::new(BlockNumber(1), 1, 0, ClusterFormat::Plain, 0, Link::Nil);
        assert!(grp.try_get());
        assert!(!grp.try_freeze(1));
        assert!(grp.try_freeze(2));
        assert!(grp.is_frozen());
        grp.unfreeze(2);
        assert_eq!(grp.ref_state(), RefState::Live(2));
    }

    #[test]
    fn find_waits_for_unfreeze() {
        let registry = Arc::new(WorkgroupRegistry::new());
        let (grp, work, _) = registry.find_or_create(BlockNumber(3), make(3));
        drop(work);
        registry.release(&grp);
        assert!(grp.try_freeze(1));

        let finder = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.find(BlockNumber(3)).is_some())
        };
        thread::sleep(std::time::Duration::from_millis(10));
        grp.unfreeze(1);
        assert!(finder.join().expect("join"));
    }

    #[test]
    fn shrink_skips_referenced_and_failed_workgroups() {
        let registry = WorkgroupRegistry::new();
        for key in 0..3 {
            let (grp, work, _) = registry.find_or_create(BlockNumber(key), make(key));
            drop(work);
            if key != 0 {
                registry.release(&grp);
            }
        }

        let freed = registry.shrink(usize::MAX, |grp| {
            if grp.key() == BlockNumber(2) {
                Err(ZroError::Busy)
            } else {
                Ok(())
            }
        });
        assert_eq!(freed, 1);
        assert_eq!(registry.len(), 2);
        assert!(registry.find(BlockNumber(1)).is_none());

        let busy = registry.find(BlockNumber(2)).expect("unfrozen after failure");
        assert_eq!(busy.ref_state(), RefState::Live(2));
        registry.release(&busy);
    }

    #[test]
    fn shrink_honours_budget() {
        let registry = WorkgroupRegistry::new();
        for key in 0..5 {
            let (grp, work, _) = registry.find_or_create(BlockNumber(key), make(key));
            drop(work);
            registry.release(&grp);
        }
        assert_eq!(registry.shrink(2, |_| Ok(())), 2);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn next_cas_reports_observed_link() {
        let grp = Workgroup::new(BlockNumber(1), 1, 0, ClusterFormat::Plain, 0, Link::Tail);
        let observed = grp.cas_next(&Link::Nil, Link::TailClosed);
        assert!(observed.same(&Link::Tail));
        let observed = grp.cas_next(&Link::Tail, Link::TailClosed);
        assert!(observed.same(&Link::Tail));
        assert!(grp.next().same(&Link::TailClosed));
    }

    #[test]
    fn slot_updates_are_compare_and_swap() {
        let slot = CompressedSlot::default();
        let a = Arc::new(Page::new(PageIndex(1)));
        let b = Arc::new(Page::new(PageIndex(2)));
        assert!(slot.try_fill(SlotEntry::Page {
            page: Arc::clone(&a),
            just_found: false,
        }));
        assert!(!slot.try_fill(SlotEntry::MigrateLocked));
        assert!(slot.holds(&a));

        assert_eq!(slot.replace_page(&b, &a), SlotReplace::Other);
        assert_eq!(slot.replace_page(&a, &b), SlotReplace::Replaced);
        assert!(slot.holds(&b));

        let previous = slot.swap(Some(Arc::new(SlotEntry::MigrateLocked)));
        assert_eq!(slot.replace_page(&b, &a), SlotReplace::Locked);
        let locked = slot.load();
        assert!(!slot.compare_and_set(&None, None));
        assert!(slot.compare_and_set(&locked, previous));
        assert!(slot.holds(&b));
        slot.clear();
        assert!(slot.is_empty());
    }
}

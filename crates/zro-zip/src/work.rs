//! Per-read work builder: attaches destination pages to cluster works and
//! links the works a read touches into one submission chain.
//!
//! # Design
//!
//! A read operation owns a chain head (`owned_head`), initially
//! [`Link::Tail`]. Entering a cluster either creates its workgroup, which is
//! hooked at the front of the chain, or claims an existing one:
//!
//! - `next == Nil`: the work belongs to no chain; it is hooked and the read
//!   becomes responsible for submitting it ([`WorkRole::PrimaryFollowed`]).
//! - `next == Tail`: the work ends someone else's open chain; that chain is
//!   extended with ours ([`WorkRole::PrimaryTerminal`]).
//! - otherwise the work is already inside a chain owned by another read and
//!   only its pages are queued ([`WorkRole::Primary`]).
//!
//! Roles are ordered; the frontend only relies on `>=` comparisons.

use crate::decompressor::ClusterFormat;
use crate::pagevec::PageType;
use crate::registry::{Link, SlotEntry, WorkGuard, Workgroup, WorkgroupRegistry};
use std::sync::Arc;
use tracing::{trace, warn};
use zro_block::Page;
use zro_error::{Result, ZroError};
use zro_extent::MappingDescriptor;
use zro_types::{BLOCK_SIZE, BlockNumber, PAGE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkRole {
    /// Pages are queued but compressed slots must not be borrowed.
    Secondary,
    Primary,
    /// The work closed another read's chain, which now continues into ours.
    PrimaryTerminal,
    /// The work is hooked into this read's own chain.
    PrimaryFollowed,
}

/// Hook `grp` into the chain rooted at `owned_head` if it is free.
pub(crate) fn try_to_claim(grp: &Arc<Workgroup>, owned_head: &mut Link, hosted: &mut bool) -> WorkRole {
    loop {
        let next = grp.next();
        match next {
            Link::Nil => {
                let observed = grp.cas_next(&Link::Nil, owned_head.clone());
                if !observed.same(&Link::Nil) {
                    continue;
                }
                *owned_head = Link::Grp(Arc::clone(grp));
                *hosted = true;
                return WorkRole::PrimaryFollowed;
            }
            Link::Tail => {
                let observed = grp.cas_next(&Link::Tail, owned_head.clone());
                if !observed.same(&Link::Tail) {
                    continue;
                }
                *owned_head = Link::Tail;
                return WorkRole::PrimaryTerminal;
            }
            _ => return WorkRole::Primary,
        }
    }
}

struct ActiveWork {
    grp: Arc<Workgroup>,
    work: WorkGuard,
    /// Next compressed slot a destination page may be borrowed for.
    cursor: usize,
    /// Slots left to borrow.
    deficit: usize,
}

impl ActiveWork {
    /// Use an exclusive destination page as a compressed page (in-place I/O).
    fn try_reuse_as_compressed(&mut self, page: &Arc<Page>) -> bool {
        while self.deficit > 0 {
            self.deficit -= 1;
            let index = self.cursor;
            self.cursor += 1;
            let Some(slot) = self.grp.slot(index) else {
                return false;
            };
            if slot.try_fill(SlotEntry::Page {
                page: Arc::clone(page),
                just_found: false,
            }) {
                return true;
            }
        }
        false
    }
}

/// Compressed slots a cache scan may fill, with the workgroup they belong to.
#[derive(Debug, Clone)]
pub struct ScanWindow {
    pub grp: Arc<Workgroup>,
    pub cursor: usize,
    pub deficit: usize,
}

pub struct WorkBuilder {
    role: WorkRole,
    hosted: bool,
    active: Option<ActiveWork>,
    /// Workgroup closing this read's chain, which must not be claimed again.
    segment_tail: Option<BlockNumber>,
}

impl Default for WorkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            role: WorkRole::PrimaryFollowed,
            hosted: false,
            active: None,
            segment_tail: None,
        }
    }

    #[must_use]
    pub fn role(&self) -> WorkRole {
        self.role
    }

    /// Whether the chain holds the builder's reference on the active work.
    #[must_use]
    pub fn hosted(&self) -> bool {
        self.hosted
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    #[must_use]
    pub fn workgroup(&self) -> Option<&Arc<Workgroup>> {
        self.active.as_ref().map(|active| &active.grp)
    }

    /// Enter the work of the cluster described by `map`, creating its
    /// workgroup if needed, and lock it until [`end`](Self::end).
    pub fn begin(
        &mut self,
        registry: &WorkgroupRegistry,
        map: &MappingDescriptor,
        cluster_pages: usize,
        owned_head: &mut Link,
    ) -> Result<WorkRole> {
        if self.active.is_some() {
            return Err(ZroError::Format("work builder entered twice".into()));
        }
        if map.physical_offset % BLOCK_SIZE as u64 != 0 {
            return Err(ZroError::corruption(
                map.physical_block().0,
                format!("unaligned physical extent {:#x}", map.physical_offset),
            ));
        }
        if matches!(owned_head, Link::Nil | Link::TailClosed) {
            return Err(ZroError::Format(format!(
                "invalid chain head {owned_head:?}"
            )));
        }

        let key = map.physical_block();
        let pageofs = usize::try_from(map.logical_offset % PAGE_SIZE as u64).unwrap_or(0);
        let chain_was_open = matches!(owned_head, Link::Tail);

        let (grp, work, created) = registry.find_or_create(key, || {
            Workgroup::new(
                key,
                cluster_pages,
                map.logical_length,
                ClusterFormat::from_compressed(map.compressed),
                pageofs,
                owned_head.clone(),
            )
        });

        if !created && work.pageofs != pageofs {
            let expected = work.pageofs;
            drop(work);
            registry.release(&grp);
            warn!(
                target: "zro::zip::work",
                event = "pageofs_mismatch",
                key = key.0,
                expected,
                found = pageofs
            );
            return Err(ZroError::corruption(
                key.0,
                format!("extent starts at page offset {pageofs}, work expects {expected}"),
            ));
        }

        self.hosted = false;
        self.role = if created {
            *owned_head = Link::Grp(Arc::clone(&grp));
            self.hosted = true;
            WorkRole::PrimaryFollowed
        } else {
            grp.grow_llen(map.logical_length);
            if self.segment_tail == Some(key) {
                WorkRole::Primary
            } else {
                try_to_claim(&grp, owned_head, &mut self.hosted)
            }
        };

        match self.role {
            WorkRole::PrimaryFollowed if chain_was_open => self.segment_tail = Some(key),
            WorkRole::PrimaryTerminal => self.segment_tail = None,
            _ => {}
        }

        let deficit = if self.role >= WorkRole::Primary {
            grp.cluster_pages()
        } else {
            0
        };
        trace!(
            target: "zro::zip::work",
            event = "work_begin",
            key = key.0,
            created,
            role = ?self.role,
            hosted = self.hosted
        );
        self.active = Some(ActiveWork {
            grp,
            work,
            cursor: 0,
            deficit,
        });
        Ok(self.role)
    }

    /// Queue `page` on the active work. `Ok(false)` asks the caller to add
    /// an exclusive staging page first and retry.
    pub fn add_page(&mut self, page: &Arc<Page>, page_type: PageType) -> Result<bool> {
        let role = self.role;
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| ZroError::Format("no active work".into()))?;
        if role >= WorkRole::Primary
            && page_type == PageType::Exclusive
            && active.try_reuse_as_compressed(page)
        {
            return Ok(true);
        }
        Ok(active.work.pagevec.enqueue(page, page_type))
    }

    /// Record that the work covers destination page `index` (0-based).
    pub fn note_page_index(&mut self, index: usize) {
        if let Some(active) = self.active.as_mut() {
            active.work.nr_pages = active.work.nr_pages.max(index + 1);
        }
    }

    /// Slots a cache scan may fill, for terminal or followed works.
    #[must_use]
    pub fn scan_window(&self) -> Option<ScanWindow> {
        if self.role < WorkRole::PrimaryTerminal {
            return None;
        }
        self.active.as_ref().map(|active| ScanWindow {
            grp: Arc::clone(&active.grp),
            cursor: active.cursor,
            deficit: active.deficit,
        })
    }

    /// Account for a cache scan. In-place reuse resumes `skip` slots
    /// further; a window the cache filled completely no longer needs this
    /// read's pages, so the work drops to [`WorkRole::Primary`].
    pub fn apply_scan(&mut self, skip: usize, complete: bool) {
        if let Some(active) = self.active.as_mut() {
            let skip = skip.min(active.deficit);
            active.cursor += skip;
            active.deficit -= skip;
        }
        if complete {
            self.role = WorkRole::Primary;
        }
    }

    /// Leave the active work. Returns whether one was active.
    pub fn end(&mut self, registry: &WorkgroupRegistry) -> bool {
        let Some(active) = self.active.take() else {
            return false;
        };
        drop(active.work);
        if !self.hosted {
            registry.release(&active.grp);
        }
        true
    }
}

impl std::fmt::Debug for WorkBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkBuilder")
            .field("role", &self.role)
            .field("hosted", &self.hosted)
            .field("active", &self.workgroup().map(|grp| grp.key()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RefState;
    use zro_types::PageIndex;

    fn map(block: u64, la: u64) -> MappingDescriptor {
        MappingDescriptor {
            logical_offset: la,
            logical_length: 8192,
            physical_offset: block * BLOCK_SIZE as u64,
            physical_length: 2 * BLOCK_SIZE as u64,
            compressed: true,
            mapped: true,
        }
    }

    fn page(i: u64) -> Arc<Page> {
        Arc::new(Page::new(PageIndex(i)))
    }

    #[test]
    fn created_work_is_hosted_at_chain_head() {
        let registry = WorkgroupRegistry::new();
        let mut head = Link::Tail;
        let mut builder = WorkBuilder::new();

        let role = builder.begin(&registry, &map(10, 0), 2, &mut head).expect("begin");
        assert_eq!(role, WorkRole::PrimaryFollowed);
        assert!(builder.hosted());
        let grp = Arc::clone(builder.workgroup().expect("active"));
        assert!(head.same(&Link::Grp(Arc::clone(&grp))));
        assert!(grp.next().same(&Link::Tail));

        assert!(builder.end(&registry));
        assert!(!builder.end(&registry));
        assert_eq!(grp.ref_state(), RefState::Live(2));
    }

    #[test]
    fn exclusive_pages_fill_compressed_slots_first() {
        let registry = WorkgroupRegistry::new();
        let mut head = Link::Tail;
        let mut builder = WorkBuilder::new();
        builder.begin(&registry, &map(20, 0), 2, &mut head).expect("begin");

        let pages: Vec<_> = (0..3).map(page).collect();
        for p in &pages {
            assert!(builder.add_page(p, PageType::Exclusive).expect("add"));
        }
        let grp = Arc::clone(builder.workgroup().expect("active"));
        assert!(grp.slot(0).expect("slot").holds(&pages[0]));
        assert!(grp.slot(1).expect("slot").holds(&pages[1]));
        builder.end(&registry);
        assert_eq!(grp.lock_work().pagevec.len(), 1);
    }

    #[test]
    fn second_read_terminates_first_chain() {
        let registry = WorkgroupRegistry::new();
        let mut head_a = Link::Tail;
        let mut a = WorkBuilder::new();
        a.begin(&registry, &map(30, 0), 2, &mut head_a).expect("begin a");
        let grp = Arc::clone(a.workgroup().expect("active"));
        a.end(&registry);

        let mut head_b = Link::Tail;
        let mut b = WorkBuilder::new();
        let role = b.begin(&registry, &map(30, 0), 2, &mut head_b).expect("begin b");
        assert_eq!(role, WorkRole::PrimaryTerminal);
        assert!(!b.hosted());
        assert!(head_b.same(&Link::Tail));
        // b's (empty) chain now continues after a's tail.
        assert!(grp.next().same(&Link::Tail));
        b.end(&registry);

        let mut head_c = Link::Tail;
        let mut c = WorkBuilder::new();
        let role = c.begin(&registry, &map(30, 0), 2, &mut head_c).expect("begin c");
        assert_eq!(role, WorkRole::PrimaryTerminal);
        c.end(&registry);
        assert_eq!(grp.ref_state(), RefState::Live(2));
    }

    #[test]
    fn chained_work_is_only_primary() {
        let registry = WorkgroupRegistry::new();
        let mut head = Link::Tail;
        let mut a = WorkBuilder::new();
        a.begin(&registry, &map(40, 0), 1, &mut head).expect("first");
        a.end(&registry);
        a.begin(&registry, &map(41, 8192), 1, &mut head).expect("second");
        a.end(&registry);

        // Cluster 41 heads the first chain and links to cluster 40.
        let mut other_head = Link::Tail;
        let mut b = WorkBuilder::new();
        let role = b
            .begin(&registry, &map(41, 8192), 1, &mut other_head)
            .expect("join");
        assert_eq!(role, WorkRole::Primary);
        b.end(&registry);

        let mut third_head = Link::Tail;
        let role = b
            .begin(&registry, &map(40, 0), 1, &mut third_head)
            .expect("join inner");
        assert_eq!(role, WorkRole::PrimaryTerminal);
        b.end(&registry);
    }

    #[test]
    fn own_segment_tail_is_not_reclaimed() {
        let registry = WorkgroupRegistry::new();
        let mut head = Link::Tail;
        let mut builder = WorkBuilder::new();
        builder.begin(&registry, &map(50, 0), 1, &mut head).expect("first");
        builder.end(&registry);
        builder.begin(&registry, &map(51, 4096), 1, &mut head).expect("second");
        builder.end(&registry);

        let role = builder.begin(&registry, &map(50, 0), 1, &mut head).expect("again");
        assert_eq!(role, WorkRole::Primary);
        builder.end(&registry);
    }

    #[test]
    fn scan_window_requires_terminal_role() {
        let registry = WorkgroupRegistry::new();
        let mut head = Link::Tail;
        let mut builder = WorkBuilder::new();
        builder.begin(&registry, &map(60, 0), 4, &mut head).expect("begin");
        let window = builder.scan_window().expect("followed work scans");
        assert_eq!((window.cursor, window.deficit), (0, 4));
        builder.apply_scan(1, true);
        assert_eq!(builder.role(), WorkRole::Primary);
        assert!(builder.scan_window().is_none());
        builder.end(&registry);
    }

    #[test]
    fn joining_with_another_page_offset_is_corruption() {
        let registry = WorkgroupRegistry::new();
        let mut head_a = Link::Tail;
        let mut a = WorkBuilder::new();
        a.begin(&registry, &map(70, 0), 2, &mut head_a).expect("create");
        let grp = Arc::clone(a.workgroup().expect("active"));
        a.end(&registry);

        let mut head_b = Link::Tail;
        let mut b = WorkBuilder::new();
        let err = b
            .begin(&registry, &map(70, 100), 2, &mut head_b)
            .expect_err("pageofs clash");
        assert!(matches!(err, ZroError::Corruption { block: 70, .. }));
        assert!(!b.is_active());
        assert!(head_b.same(&Link::Tail));
        assert!(grp.next().same(&Link::Tail));
        assert_eq!(grp.ref_state(), RefState::Live(2));
        assert_eq!(grp.lock_work().pageofs, 0);
    }

    #[test]
    fn only_one_of_two_joiners_hosts_the_chain() {
        let registry = WorkgroupRegistry::new();
        let first = page(0);
        let last = page(3);

        let mut head_a = Link::Tail;
        let mut a = WorkBuilder::new();
        let role_a = a.begin(&registry, &map(80, 0), 1, &mut head_a).expect("a");
        a.add_page(&last, PageType::TailShared).expect("queue a");
        let grp = Arc::clone(a.workgroup().expect("active"));

        // The joiner blocks on the work lock until the first reader leaves.
        let (role_b, hosted_b, head_b) = std::thread::scope(|scope| {
            let handle = scope.spawn(|| {
                let mut head_b = Link::Tail;
                let mut b = WorkBuilder::new();
                let role = b.begin(&registry, &map(80, 0), 1, &mut head_b).expect("b");
                b.add_page(&first, PageType::TailShared).expect("queue b");
                let hosted = b.hosted();
                b.end(&registry);
                (role, hosted, head_b)
            });
            a.end(&registry);
            handle.join().expect("joiner")
        });

        assert_eq!(role_a, WorkRole::PrimaryFollowed);
        assert!(a.hosted());
        assert_eq!(role_b, WorkRole::PrimaryTerminal);
        assert!(!hosted_b);
        // Only the first reader has a chain to submit.
        assert!(head_a.same(&Link::Grp(Arc::clone(&grp))));
        assert!(head_b.same(&Link::Tail));
        // The joiner's reference is gone; the hosting one remains.
        assert_eq!(grp.ref_state(), RefState::Live(2));
        assert_eq!(grp.lock_work().pagevec.len(), 2);
    }

    #[test]
    fn add_page_without_work_fails() {
        let mut builder = WorkBuilder::new();
        assert!(builder.add_page(&page(0), PageType::Exclusive).is_err());
    }
}

//! Submission of a read's workgroup chain.
//!
//! # Design
//!
//! The chain a read built is closed first (its open tail becomes
//! [`Link::TailClosed`]) so nobody can extend it any more. Every compressed
//! slot of every workgroup is then backed by a page: cached and up to date
//! (no I/O), or a page to read. Pages of consecutive physical blocks are
//! merged into one [`ReadRequest`] until a gap, a cached page or
//! `max_batch_pages` forces a new one.
//!
//! Workgroups that needed no I/O at all are relinked into a separate chain
//! that is decompressed immediately. The rest share one [`UnzipIo`], whose
//! pending-request counter reaches zero after the last completion: a
//! foreground submitter waits for that, a background submission hands the
//! chain to the worker pool from the last completion callback.

use crate::context::ZipShared;
use crate::registry::{Link, Workgroup};
use crate::unzip;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, error, trace, warn};
use zro_block::{MappingId, PageOwner, PagePool, ReadCompletion, ReadRequest};
use zro_types::BlockNumber;

enum Completion {
    Foreground { done: Mutex<bool>, cv: Condvar },
    Background(Arc<ZipShared>),
}

/// Completion state of one submission.
pub(crate) struct UnzipIo {
    pending: AtomicI64,
    head: Mutex<Link>,
    completion: Completion,
}

impl UnzipIo {
    fn new(shared: &Arc<ZipShared>, foreground: bool) -> Self {
        let completion = if foreground {
            Completion::Foreground {
                done: Mutex::new(false),
                cv: Condvar::new(),
            }
        } else {
            Completion::Background(Arc::clone(shared))
        };
        Self {
            pending: AtomicI64::new(0),
            head: Mutex::new(Link::TailClosed),
            completion,
        }
    }

    /// Adjust the pending-request count; the update reaching zero completes
    /// the submission.
    fn kickoff(self: &Arc<Self>, delta: i64) {
        let now = self.pending.fetch_add(delta, Ordering::AcqRel) + delta;
        if now != 0 {
            return;
        }
        match &self.completion {
            Completion::Foreground { done, cv } => {
                *done.lock() = true;
                cv.notify_all();
            }
            Completion::Background(shared) => {
                let io = Arc::clone(self);
                let worker_shared = Arc::clone(shared);
                shared.workers.spawn(move || {
                    let mut pool = PagePool::new();
                    let head = io.take_head();
                    unzip::unzip_all(&worker_shared, head, &mut pool);
                    worker_shared.counters.record_background_run();
                });
            }
        }
    }

    /// Block until every request of a foreground submission completed.
    fn wait(&self) {
        if let Completion::Foreground { done, cv } = &self.completion {
            let mut done = done.lock();
            while !*done {
                cv.wait(&mut done);
            }
        }
    }

    fn take_head(&self) -> Link {
        std::mem::replace(&mut *self.head.lock(), Link::TailClosed)
    }
}

/// Result of [`submit_all`].
pub(crate) struct Submission {
    /// Workgroups whose compressed pages were all cached.
    pub(crate) noio: Link,
    pub(crate) io: Arc<UnzipIo>,
    pub(crate) batches: usize,
}

/// Accumulates pages of consecutive blocks into read requests.
struct Batcher<'a> {
    shared: &'a Arc<ZipShared>,
    io: &'a Arc<UnzipIo>,
    mapping: MappingId,
    current: Option<ReadRequest>,
    batches: usize,
}

impl Batcher<'_> {
    fn add(&mut self, block: BlockNumber, page: Arc<zro_block::Page>) {
        let request = self.current.get_or_insert_with(|| ReadRequest {
            start: block,
            pages: Vec::new(),
        });
        if request.pages.is_empty() {
            self.batches += 1;
        }
        request.pages.push(page);
        if request.pages.len() >= self.shared.config.max_batch_pages {
            self.flush();
        }
    }

    fn flush(&mut self) {
        let Some(request) = self.current.take() else {
            return;
        };
        let pages = request.pages.len();
        trace!(
            target: "zro::zip::submit",
            event = "batch_flush",
            start = request.start.0,
            pages
        );
        self.shared.counters.record_batch(pages);
        let io = Arc::clone(self.io);
        let shared = Arc::clone(self.shared);
        let mapping = self.mapping;
        self.shared.reader.submit(
            request,
            Box::new(move |completion| read_endio(&shared, &io, mapping, completion)),
        );
    }
}

/// Completion of one read request: record per-page outcomes, release the
/// managed pages and count the request done.
fn read_endio(shared: &ZipShared, io: &Arc<UnzipIo>, mapping: MappingId, completion: ReadCompletion) {
    let start = completion.start;
    for (page, result) in completion.pages {
        let managed = page.owner() == PageOwner::Cache(mapping);
        match result {
            Ok(()) if managed => page.set_uptodate(),
            Ok(()) => {}
            Err(err) => {
                page.set_error();
                shared.counters.record_read_error();
                warn!(
                    target: "zro::zip::submit",
                    event = "read_failed",
                    start = start.0,
                    index = page.index().0,
                    error = %err
                );
            }
        }
        if managed {
            page.unlock();
        }
    }
    io.kickoff(-1);
}

/// Relink `groups` into a closed chain and return its head.
fn relink(groups: &[Arc<Workgroup>]) -> Link {
    let mut next = Link::TailClosed;
    for grp in groups.iter().rev() {
        grp.store_next(next);
        next = Link::Grp(Arc::clone(grp));
    }
    next
}

/// Close and collect the chain starting at `first`.
fn close_chain(first: Arc<Workgroup>) -> Vec<Arc<Workgroup>> {
    let mut groups = Vec::new();
    let mut grp = first;
    loop {
        let observed = grp.cas_next(&Link::Tail, Link::TailClosed);
        groups.push(Arc::clone(&grp));
        match observed {
            Link::Grp(next) => grp = next,
            Link::Tail => return groups,
            other => {
                error!(
                    target: "zro::zip::submit",
                    event = "broken_chain",
                    key = grp.key().0,
                    next = ?other
                );
                return groups;
            }
        }
    }
}

/// Back every compressed slot of the chain rooted at `owned_head` with a
/// page and issue the reads. Returns `None` for an empty chain.
pub(crate) fn submit_all(
    shared: &Arc<ZipShared>,
    owned_head: Link,
    pool: &mut PagePool,
    foreground: bool,
) -> Option<Submission> {
    let first = match owned_head {
        Link::Grp(grp) => grp,
        Link::Tail => return None,
        other => {
            error!(
                target: "zro::zip::submit",
                event = "invalid_chain_head",
                head = ?other
            );
            return None;
        }
    };

    let groups = close_chain(first);
    let io = Arc::new(UnzipIo::new(shared, foreground));
    let mut batcher = Batcher {
        shared,
        io: &io,
        mapping: shared.cache.mapping(),
        current: None,
        batches: 0,
    };
    let mut io_groups = Vec::new();
    let mut noio_groups = Vec::new();
    let mut last_block: Option<u64> = None;
    let mut force_submit = false;

    for grp in groups {
        let first_block = grp.key().0;
        force_submit |= last_block.is_none_or(|last| last.checked_add(1) != Some(first_block));
        let mut noio = 0;

        for nr in 0..grp.cluster_pages() {
            let Some(page) = shared.cache.reserve_slot(&grp, nr, pool) else {
                force_submit = true;
                noio += 1;
                continue;
            };
            if force_submit {
                batcher.flush();
            }
            let block = first_block + nr as u64;
            batcher.add(BlockNumber(block), page);
            force_submit = false;
            last_block = Some(block);
        }

        if noio == grp.cluster_pages() {
            shared.counters.record_noio();
            noio_groups.push(grp);
        } else {
            io_groups.push(grp);
        }
    }
    batcher.flush();
    let batches = batcher.batches;

    *io.head.lock() = relink(&io_groups);
    let noio = relink(&noio_groups);
    debug!(
        target: "zro::zip::submit",
        event = "chain_submitted",
        io_groups = io_groups.len(),
        noio_groups = noio_groups.len(),
        batches,
        foreground
    );

    if foreground || batches > 0 {
        io.kickoff(i64::try_from(batches).unwrap_or(i64::MAX));
    }
    Some(Submission { noio, io, batches })
}

/// Submit the chain, decompress what needs no I/O and, in the foreground,
/// wait for the reads and decompress the rest.
pub(crate) fn submit_and_unzip(
    shared: &Arc<ZipShared>,
    owned_head: Link,
    pool: &mut PagePool,
    foreground: bool,
) {
    let Some(submission) = submit_all(shared, owned_head, pool, foreground) else {
        return;
    };
    unzip::unzip_all(shared, submission.noio, pool);
    if !foreground {
        return;
    }
    submission.io.wait();
    let head = submission.io.take_head();
    trace!(
        target: "zro::zip::submit",
        event = "foreground_unzip",
        batches = submission.batches
    );
    unzip::unzip_all(shared, head, pool);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompressor::ClusterFormat;

    fn grp(key: u64) -> Arc<Workgroup> {
        Arc::new(Workgroup::new(
            BlockNumber(key),
            1,
            0,
            ClusterFormat::Plain,
            0,
            Link::Nil,
        ))
    }

    #[test]
    fn relink_builds_closed_chain_in_order() {
        let groups = vec![grp(1), grp(2), grp(3)];
        let head = relink(&groups);
        let mut keys = Vec::new();
        let mut cursor = head;
        while let Link::Grp(g) = cursor {
            keys.push(g.key().0);
            cursor = g.next();
        }
        assert_eq!(keys, vec![1, 2, 3]);
        assert!(cursor.same(&Link::TailClosed));
        assert!(relink(&[]).same(&Link::TailClosed));
    }

    #[test]
    fn close_chain_follows_hooked_chains() {
        let a = grp(1);
        let b = grp(2);
        let c = grp(3);
        a.store_next(Link::Grp(Arc::clone(&b)));
        b.store_next(Link::Grp(Arc::clone(&c)));
        c.store_next(Link::Tail);

        let groups = close_chain(Arc::clone(&a));
        assert_eq!(groups.len(), 3);
        assert!(c.next().same(&Link::TailClosed));
        assert!(a.next().same(&Link::Grp(b)));
    }
}

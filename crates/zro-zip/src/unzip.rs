//! Decompression of a workgroup's work into its destination pages.
//!
//! Output goes through one contiguous buffer covering the work's window
//! (`pageofs` plus the decompressed length) and is then scattered to the
//! destination pages. Small windows use a per-thread buffer, medium ones
//! the shared scratch buffer when it is free, anything else a private
//! allocation.

use crate::context::ZipShared;
use crate::online;
use crate::pagevec::PageType;
use crate::registry::{Link, Workgroup};
use crate::stats::BufferPath;
use std::cell::RefCell;
use std::sync::Arc;
use tracing::{error, trace, warn};
use zro_block::{Page, PageOwner, PagePool};
use zro_error::{Result, ZroError};
use zro_types::PAGE_SIZE;

thread_local! {
    static INLINE_BUFFER: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

type Sink<'a> = dyn FnMut(&mut [u8]) -> Result<()> + 'a;

/// Decompress every workgroup of a closed chain.
pub(crate) fn unzip_all(shared: &ZipShared, head: Link, pool: &mut PagePool) {
    let mut cursor = head;
    loop {
        let grp = match cursor {
            Link::Grp(grp) => grp,
            Link::TailClosed => return,
            other => {
                error!(
                    target: "zro::zip::unzip",
                    event = "unterminated_chain",
                    next = ?other
                );
                return;
            }
        };
        cursor = grp.next();
        if let Err(err) = unzip(shared, &grp, pool) {
            warn!(
                target: "zro::zip::unzip",
                event = "unzip_failed",
                key = grp.key().0,
                error = %err
            );
        }
    }
}

fn note(failure: &mut Option<ZroError>, err: ZroError) {
    if failure.is_none() {
        *failure = Some(err);
    }
}

/// Put `page` at `index`; a clash or an out-of-range index fails the work
/// and completes the page's part here.
fn place(
    pages: &mut [Option<Arc<Page>>],
    index: usize,
    page: Arc<Page>,
    grp: &Workgroup,
    failure: &mut Option<ZroError>,
) {
    match pages.get_mut(index) {
        Some(slot @ None) => *slot = Some(page),
        Some(Some(_)) | None => {
            error!(
                target: "zro::zip::unzip",
                event = "page_index_mismatch",
                key = grp.key().0,
                index,
                nr_pages = pages.len()
            );
            note(
                failure,
                ZroError::corruption(
                    grp.key().0,
                    format!("destination index {index} of {} pages reused or out of range", pages.len()),
                ),
            );
            page.set_error();
            online::endio(&page);
        }
    }
}

fn unzip(shared: &ZipShared, grp: &Arc<Workgroup>, pool: &mut PagePool) -> Result<()> {
    let mut work = grp.lock_work();
    let key = grp.key();
    let nr_pages = work.nr_pages;
    let pageofs = work.pageofs;
    let chunks = work.pagevec.drain_chunks();

    let mut failure = None;
    if nr_pages == 0 {
        note(
            &mut failure,
            ZroError::corruption(key.0, "work has no destination pages"),
        );
    }
    let mut pages: Vec<Option<Arc<Page>>> = vec![None; nr_pages];
    for chunk in chunks {
        for entry in chunk.entries {
            // Staging entries only carry the chunk after them.
            if entry.page.owner() == PageOwner::Staging {
                continue;
            }
            let index = if entry.page_type == PageType::Head {
                0
            } else {
                online::index(&entry.page)
            };
            place(&mut pages, index, entry.page, grp, &mut failure);
        }
        if let Some(carrier) = chunk.carrier {
            pool.gather_if_staging(&carrier);
        }
    }

    let mut inputs = Vec::with_capacity(grp.cluster_pages());
    for (nr, slot) in grp.slots().iter().enumerate() {
        let block = key.0 + nr as u64;
        let Some(page) = slot.page() else {
            note(
                &mut failure,
                ZroError::corruption(block, "compressed page missing at decompression"),
            );
            continue;
        };
        if page.has_error() || (shared.cache.is_managed(&page) && !page.is_uptodate()) {
            note(&mut failure, ZroError::ReadFailed { block });
        }
        if matches!(page.owner(), PageOwner::File(_)) {
            // Destination page that doubled as compressed input.
            place(&mut pages, online::index(&page), Arc::clone(&page), grp, &mut failure);
        }
        inputs.push(page);
    }

    let result = match failure {
        Some(err) => Err(err),
        None => decompress(shared, grp, &inputs, &pages, pageofs),
    };
    drop(inputs);

    for slot in grp.slots() {
        let Some(page) = slot.page() else {
            continue;
        };
        if shared.cache.is_managed(&page) {
            continue;
        }
        slot.clear();
        pool.gather_if_staging(&page);
    }

    let missing = pages.iter().filter(|page| page.is_none()).count();
    if missing > 0 {
        trace!(
            target: "zro::zip::unzip",
            event = "sparse_window",
            key = key.0,
            missing,
            nr_pages
        );
    }
    for page in pages.into_iter().flatten() {
        if result.is_err() {
            page.set_error();
        }
        online::endio(&page);
    }

    work.nr_pages = 0;
    grp.store_next(Link::Nil);
    drop(work);
    shared.registry.release(grp);

    shared.counters.record_decompression(result.is_ok());
    trace!(
        target: "zro::zip::unzip",
        event = "unzip",
        key = key.0,
        nr_pages,
        pageofs,
        ok = result.is_ok()
    );
    result
}

fn decompress(
    shared: &ZipShared,
    grp: &Workgroup,
    inputs: &[Arc<Page>],
    pages: &[Option<Arc<Page>>],
    pageofs: usize,
) -> Result<()> {
    let window = pages.len() * PAGE_SIZE;
    let llen = usize::try_from(grp.llen()).unwrap_or(usize::MAX);
    let outlen = window.saturating_sub(pageofs).min(llen);

    let mut input = Vec::with_capacity(inputs.len() * PAGE_SIZE);
    for page in inputs {
        page.with_data(|data| input.extend_from_slice(data));
    }
    let decompressor = shared.decompressors.get(grp.format())?;

    let mut sink = |out: &mut [u8]| -> Result<()> {
        decompressor.decompress(&input, out)?;
        scatter(out, pages, pageofs);
        Ok(())
    };
    match decompress_inline(shared, outlen, &mut sink) {
        Err(ZroError::NotSupported(_)) => decompress_general(shared, outlen, &mut sink),
        other => other,
    }
}

/// Per-thread buffer for windows up to `onstack_pages`.
fn decompress_inline(shared: &ZipShared, outlen: usize, sink: &mut Sink<'_>) -> Result<()> {
    let limit = shared.config.onstack_pages * PAGE_SIZE;
    if outlen > limit {
        return Err(ZroError::NotSupported(format!(
            "inline window of {outlen} bytes exceeds {limit}"
        )));
    }
    shared.counters.record_buffer(BufferPath::Inline);
    INLINE_BUFFER.with(|buffer| {
        let mut buffer = buffer.borrow_mut();
        buffer.clear();
        buffer.resize(outlen, 0);
        sink(&mut buffer)
    })
}

/// Shared scratch buffer when it is large enough and free, else the heap.
fn decompress_general(shared: &ZipShared, outlen: usize, sink: &mut Sink<'_>) -> Result<()> {
    if outlen <= shared.config.global_scratch_pages * PAGE_SIZE {
        if let Some(mut scratch) = shared.scratch.try_lock() {
            shared.counters.record_buffer(BufferPath::Scratch);
            scratch.clear();
            scratch.resize(outlen, 0);
            return sink(&mut scratch);
        }
    }
    shared.counters.record_buffer(BufferPath::Heap);
    let mut buffer = vec![0_u8; outlen];
    sink(&mut buffer)
}

/// Copy output byte `k` to window offset `pageofs + k`.
fn scatter(out: &[u8], pages: &[Option<Arc<Page>>], pageofs: usize) {
    let out_end = pageofs.saturating_add(out.len());
    for (nr, page) in pages.iter().enumerate() {
        let Some(page) = page else {
            continue;
        };
        let page_start = nr.saturating_mul(PAGE_SIZE);
        let lo = page_start.max(pageofs);
        let hi = page_start.saturating_add(PAGE_SIZE).min(out_end);
        if lo >= hi {
            continue;
        }
        page.write_at(lo - page_start, &out[lo - pageofs..hi - pageofs]);
    }
}

//! Batched block reads with completion callbacks.
//!
//! # Design
//!
//! A [`ReadRequest`] names a starting block and a run of pages that receive
//! consecutive blocks. The reader fills the pages and invokes the callback
//! exactly once with a [`ReadCompletion`] carrying one result per page.
//! The callback may run on the submitting thread ([`DeviceBlockReader`]) or
//! on a dedicated completion thread ([`ThreadedBlockReader`]); it must never
//! block.

use crate::BlockDevice;
use crate::page::Page;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{trace, warn};
use zro_error::{Result, ZroError};
use zro_types::BlockNumber;

/// Pages to fill from consecutive blocks starting at `start`.
#[derive(Debug)]
pub struct ReadRequest {
    pub start: BlockNumber,
    pub pages: Vec<Arc<Page>>,
}

/// Outcome of a [`ReadRequest`]: the same pages, in order, each with its result.
#[derive(Debug)]
pub struct ReadCompletion {
    pub start: BlockNumber,
    pub pages: Vec<(Arc<Page>, Result<()>)>,
}

impl ReadCompletion {
    #[must_use]
    pub fn failed_pages(&self) -> usize {
        self.pages.iter().filter(|(_, res)| res.is_err()).count()
    }
}

pub type ReadCallback = Box<dyn FnOnce(ReadCompletion) + Send + 'static>;

/// Reader statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    /// Requests submitted.
    pub requests: u64,
    /// Blocks requested.
    pub blocks: u64,
    /// Blocks whose read failed.
    pub failed_blocks: u64,
}

/// Batched block read submission.
pub trait BlockReader: Send + Sync {
    /// Submit `request`; `on_complete` runs exactly once when every page
    /// has been attempted.
    fn submit(&self, request: ReadRequest, on_complete: ReadCallback);

    /// Current statistics.
    fn stats(&self) -> ReaderStats;
}

fn fill_pages(device: &dyn BlockDevice, request: ReadRequest) -> (ReadCompletion, u64) {
    let start = request.start;
    let mut failed = 0_u64;
    let pages = request
        .pages
        .into_iter()
        .zip(0_u64..)
        .map(|(page, i)| {
            let result = start
                .checked_add(i)
                .ok_or_else(|| ZroError::Format("block number overflow".into()))
                .and_then(|block| {
                    page.with_data_mut(|buf| device.read_block_into(block, buf))
                        .map_err(|err| {
                            warn!(
                                target: "zro::block",
                                event = "block_read_failed",
                                block = block.0,
                                error = %err
                            );
                            ZroError::ReadFailed { block: block.0 }
                        })
                });
            if result.is_err() {
                failed += 1;
            }
            (page, result)
        })
        .collect();
    (
        ReadCompletion { start, pages },
        failed,
    )
}

/// Reads synchronously and completes on the submitting thread.
pub struct DeviceBlockReader {
    device: Arc<dyn BlockDevice>,
    stats: Mutex<ReaderStats>,
}

impl DeviceBlockReader {
    #[must_use]
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self {
            device,
            stats: Mutex::new(ReaderStats::default()),
        }
    }
}

impl BlockReader for DeviceBlockReader {
    fn submit(&self, request: ReadRequest, on_complete: ReadCallback) {
        let blocks = request.pages.len() as u64;
        trace!(
            target: "zro::block",
            event = "read_submit",
            start = request.start.0,
            blocks
        );
        let (completion, failed) = fill_pages(self.device.as_ref(), request);
        {
            let mut stats = self.stats.lock();
            stats.requests += 1;
            stats.blocks += blocks;
            stats.failed_blocks += failed;
        }
        on_complete(completion);
    }

    fn stats(&self) -> ReaderStats {
        *self.stats.lock()
    }
}

impl std::fmt::Debug for DeviceBlockReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBlockReader")
            .field("stats", &*self.stats.lock())
            .finish_non_exhaustive()
    }
}

/// Reads on a small completion pool, so callbacks run on a thread other
/// than the submitter's.
pub struct ThreadedBlockReader {
    device: Arc<dyn BlockDevice>,
    pool: rayon::ThreadPool,
    stats: Arc<Mutex<ReaderStats>>,
}

impl ThreadedBlockReader {
    pub fn new(device: Arc<dyn BlockDevice>, threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("zro-bio-{i}"))
            .build()
            .map_err(|err| ZroError::Format(format!("completion pool: {err}")))?;
        Ok(Self {
            device,
            pool,
            stats: Arc::new(Mutex::new(ReaderStats::default())),
        })
    }
}

impl BlockReader for ThreadedBlockReader {
    fn submit(&self, request: ReadRequest, on_complete: ReadCallback) {
        let device = Arc::clone(&self.device);
        let stats = Arc::clone(&self.stats);
        self.pool.spawn(move || {
            let blocks = request.pages.len() as u64;
            let (completion, failed) = fill_pages(device.as_ref(), request);
            {
                let mut stats = stats.lock();
                stats.requests += 1;
                stats.blocks += blocks;
                stats.failed_blocks += failed;
            }
            on_complete(completion);
        });
    }

    fn stats(&self) -> ReaderStats {
        *self.stats.lock()
    }
}

impl std::fmt::Debug for ThreadedBlockReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedBlockReader")
            .field("threads", &self.pool.current_num_threads())
            .field("stats", &*self.stats.lock())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ByteBlockDevice, MemByteDevice};
    use std::sync::mpsc;
    use zro_types::{BLOCK_SIZE, PageIndex};

    fn device(blocks: usize) -> Arc<dyn BlockDevice> {
        let mut image = vec![0_u8; blocks * BLOCK_SIZE];
        for (i, chunk) in image.chunks_mut(BLOCK_SIZE).enumerate() {
            chunk.fill(u8::try_from(i).expect("small index"));
        }
        Arc::new(ByteBlockDevice::new(MemByteDevice::new(image)).expect("device"))
    }

    fn pages(n: usize) -> Vec<Arc<Page>> {
        (0..n).map(|_| Arc::new(Page::new(PageIndex(0)))).collect()
    }

    #[test]
    fn device_reader_completes_inline() {
        let reader = DeviceBlockReader::new(device(4));
        let (tx, rx) = mpsc::channel();
        reader.submit(
            ReadRequest {
                start: BlockNumber(1),
                pages: pages(2),
            },
            Box::new(move |done| tx.send(done).expect("send")),
        );
        let done = rx.try_recv().expect("completed inline");
        assert_eq!(done.failed_pages(), 0);
        done.pages[0].0.with_data(|d| assert!(d.iter().all(|b| *b == 1)));
        done.pages[1].0.with_data(|d| assert!(d.iter().all(|b| *b == 2)));
        assert_eq!(
            reader.stats(),
            ReaderStats {
                requests: 1,
                blocks: 2,
                failed_blocks: 0
            }
        );
    }

    #[test]
    fn out_of_range_blocks_fail_individually() {
        let reader = DeviceBlockReader::new(device(2));
        let (tx, rx) = mpsc::channel();
        reader.submit(
            ReadRequest {
                start: BlockNumber(1),
                pages: pages(2),
            },
            Box::new(move |done| tx.send(done).expect("send")),
        );
        let done = rx.recv().expect("completion");
        assert!(done.pages[0].1.is_ok());
        assert!(matches!(
            done.pages[1].1,
            Err(ZroError::ReadFailed { block: 2 })
        ));
        assert_eq!(reader.stats().failed_blocks, 1);
    }

    #[test]
    fn threaded_reader_completes_off_thread() {
        let reader = ThreadedBlockReader::new(device(3), 1).expect("reader");
        let (tx, rx) = mpsc::channel();
        let submitter = std::thread::current().id();
        reader.submit(
            ReadRequest {
                start: BlockNumber(2),
                pages: pages(1),
            },
            Box::new(move |done| {
                tx.send((done, std::thread::current().id())).expect("send");
            }),
        );
        let (done, completer) = rx.recv().expect("completion");
        assert_ne!(completer, submitter);
        done.pages[0].0.with_data(|d| assert!(d.iter().all(|b| *b == 2)));
        assert_eq!(reader.stats().blocks, 1);
    }
}

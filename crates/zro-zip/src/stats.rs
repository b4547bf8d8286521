//! Pipeline counters.

use crate::cache::CacheStats;
use crate::registry::RegistryStats;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Which output buffer a decompression used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferPath {
    /// Per-thread buffer for small windows.
    Inline,
    /// The shared scratch buffer.
    Scratch,
    /// A private allocation.
    Heap,
}

/// Live counters, updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct ZipCounters {
    pub io_batches: AtomicU64,
    pub compressed_pages_read: AtomicU64,
    pub read_errors: AtomicU64,
    /// Workgroups that needed no I/O at all.
    pub noio_workgroups: AtomicU64,
    pub decompressions: AtomicU64,
    pub decompress_failures: AtomicU64,
    pub inline_buffers: AtomicU64,
    pub scratch_buffers: AtomicU64,
    pub heap_buffers: AtomicU64,
    pub background_runs: AtomicU64,
}

impl ZipCounters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_batch(&self, pages: usize) {
        self.io_batches.fetch_add(1, Ordering::Relaxed);
        self.compressed_pages_read
            .fetch_add(pages as u64, Ordering::Relaxed);
    }

    pub fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_noio(&self) {
        self.noio_workgroups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decompression(&self, ok: bool) {
        self.decompressions.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.decompress_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_buffer(&self, path: BufferPath) {
        let counter = match path {
            BufferPath::Inline => &self.inline_buffers,
            BufferPath::Scratch => &self.scratch_buffers,
            BufferPath::Heap => &self.heap_buffers,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_background_run(&self) {
        self.background_runs.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self, registry: RegistryStats, cache: CacheStats) -> ZipStats {
        ZipStats {
            registry,
            cache,
            io_batches: self.io_batches.load(Ordering::Relaxed),
            compressed_pages_read: self.compressed_pages_read.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            noio_workgroups: self.noio_workgroups.load(Ordering::Relaxed),
            decompressions: self.decompressions.load(Ordering::Relaxed),
            decompress_failures: self.decompress_failures.load(Ordering::Relaxed),
            inline_buffers: self.inline_buffers.load(Ordering::Relaxed),
            scratch_buffers: self.scratch_buffers.load(Ordering::Relaxed),
            heap_buffers: self.heap_buffers.load(Ordering::Relaxed),
            background_runs: self.background_runs.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZipStats {
    pub registry: RegistryStats,
    pub cache: CacheStats,
    /// Block-read requests issued.
    pub io_batches: u64,
    pub compressed_pages_read: u64,
    pub read_errors: u64,
    pub noio_workgroups: u64,
    pub decompressions: u64,
    pub decompress_failures: u64,
    pub inline_buffers: u64,
    pub scratch_buffers: u64,
    pub heap_buffers: u64,
    /// Decompression passes run on the worker pool.
    pub background_runs: u64,
}

impl ZipStats {
    /// Fraction of compressed pages served by the managed cache.
    #[must_use]
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache.hits + self.compressed_pages_read;
        if total == 0 {
            return 0.0;
        }
        self.cache.hits as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_records() {
        let counters = ZipCounters::new();
        counters.record_batch(4);
        counters.record_batch(1);
        counters.record_decompression(true);
        counters.record_decompression(false);
        counters.record_buffer(BufferPath::Scratch);

        let stats = counters.snapshot(RegistryStats::default(), CacheStats::default());
        assert_eq!(stats.io_batches, 2);
        assert_eq!(stats.compressed_pages_read, 5);
        assert_eq!(stats.decompressions, 2);
        assert_eq!(stats.decompress_failures, 1);
        assert_eq!(stats.scratch_buffers, 1);
        assert_eq!(stats.heap_buffers, 0);
    }

    #[test]
    fn hit_rate_handles_empty_and_mixed() {
        let mut stats = ZipStats::default();
        assert!(stats.cache_hit_rate().abs() < f64::EPSILON);
        stats.cache.hits = 1;
        stats.compressed_pages_read = 3;
        assert!((stats.cache_hit_rate() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn stats_serialize() {
        let stats = ZipStats {
            io_batches: 7,
            ..ZipStats::default()
        };
        let json = serde_json::to_string(&stats).expect("serialize");
        assert!(json.contains("\"io_batches\":7"));
        let back: ZipStats = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, stats);
    }
}

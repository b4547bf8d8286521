//! Tunables of the decompression pipeline.

use serde::{Deserialize, Serialize};
use zro_extent::ResolverOptions;

/// Which compressed clusters keep their pages in the managed cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    /// Every compressed page is a staging page, dropped after decompression.
    Disabled,
    /// Cache the compressed pages of the first cluster a read touches.
    ReadAhead,
    /// Also cache every cluster that lies before the read's starting offset.
    #[default]
    ReadAround,
}

/// Pipeline configuration. Every field has a usable default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZipConfig {
    pub cache_strategy: CacheStrategy,
    /// Read-ahead batches up to this many pages decompress on the caller's
    /// thread.
    pub max_sync_decompress_pages: usize,
    /// Background decompression threads; 0 picks `n + n/4` of the available
    /// parallelism.
    pub worker_threads: usize,
    /// Largest number of blocks in one read request.
    pub max_batch_pages: usize,
    /// Capacity of the shared decompression scratch buffer, in pages.
    pub global_scratch_pages: usize,
    /// Outputs up to this many pages use the per-thread fast buffer.
    pub onstack_pages: usize,
    pub resolver: ResolverOptions,
}

impl Default for ZipConfig {
    fn default() -> Self {
        Self {
            cache_strategy: CacheStrategy::default(),
            max_sync_decompress_pages: 3,
            worker_threads: 0,
            max_batch_pages: 256,
            global_scratch_pages: 2048,
            onstack_pages: 32,
            resolver: ResolverOptions::default(),
        }
    }
}

/// Upper bound on automatically sized worker pools.
const MAX_AUTO_WORKERS: usize = 32;

impl ZipConfig {
    /// Number of background workers to spawn.
    #[must_use]
    pub fn effective_worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        (cpus + cpus / 4).clamp(1, MAX_AUTO_WORKERS)
    }

    /// Whether `cluster_la` qualifies for managed caching in a read that
    /// starts at `cached_zone_la`. `initial` is true for the first cluster
    /// the read touches.
    #[must_use]
    pub fn caches_cluster(&self, initial: bool, cluster_la: u64, cached_zone_la: u64) -> bool {
        match self.cache_strategy {
            CacheStrategy::Disabled => false,
            CacheStrategy::ReadAhead => initial,
            CacheStrategy::ReadAround => initial || cluster_la < cached_zone_la,
        }
    }
}

/// Chooses between foreground and background decompression for a batch.
pub trait DecompressPolicy: Send + Sync {
    fn decompress_synchronously(&self, nr_pages: usize) -> bool;
}

/// Decompress small batches in the foreground.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdPolicy {
    pub max_sync_pages: usize,
}

impl ThresholdPolicy {
    #[must_use]
    pub fn from_config(config: &ZipConfig) -> Self {
        Self {
            max_sync_pages: config.max_sync_decompress_pages,
        }
    }
}

impl DecompressPolicy for ThresholdPolicy {
    fn decompress_synchronously(&self, nr_pages: usize) -> bool {
        nr_pages <= self.max_sync_pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_json() {
        let config = ZipConfig::default();
        let json = serde_json::to_string(&config).expect("serialize");
        let back: ZipConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, config);
        assert!(json.contains("\"read_around\""));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: ZipConfig =
            serde_json::from_str(r#"{"cache_strategy":"disabled","worker_threads":2}"#)
                .expect("deserialize");
        assert_eq!(config.cache_strategy, CacheStrategy::Disabled);
        assert_eq!(config.effective_worker_threads(), 2);
        assert_eq!(config.max_batch_pages, 256);
        assert!(!config.resolver.compat_previous_clusters);
    }

    #[test]
    fn auto_worker_count_is_bounded() {
        let n = ZipConfig::default().effective_worker_threads();
        assert!((1..=MAX_AUTO_WORKERS).contains(&n));
    }

    #[test]
    fn caching_selection_follows_strategy() {
        let mut config = ZipConfig::default();
        assert!(config.caches_cluster(true, 100, 0));
        assert!(config.caches_cluster(false, 0, 4096));
        assert!(!config.caches_cluster(false, 8192, 4096));

        config.cache_strategy = CacheStrategy::ReadAhead;
        assert!(!config.caches_cluster(false, 0, 4096));
        assert!(config.caches_cluster(true, 0, 0));

        config.cache_strategy = CacheStrategy::Disabled;
        assert!(!config.caches_cluster(true, 0, 4096));
    }

    #[test]
    fn threshold_policy() {
        let policy = ThresholdPolicy::from_config(&ZipConfig::default());
        assert!(policy.decompress_synchronously(3));
        assert!(!policy.decompress_synchronously(4));
    }
}

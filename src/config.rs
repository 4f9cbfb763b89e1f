//! Engine configuration.

/// When writes reach the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Fsync after every committing write. Power-loss safe.
    Always,
    /// Fsync once either bound is crossed, measured per collection.
    /// Process-crash safe; a power cut can lose the open window.
    Batch { interval_ms: u64, ops: u32 },
    /// Fsync only at flush and shutdown.
    Never,
}

impl SyncPolicy {
    pub fn batch() -> Self {
        SyncPolicy::Batch {
            interval_ms: 200,
            ops: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Process-wide page cache capacity, in pages.
    pub page_cache_pages: usize,
    /// Serve page reads from a read-only mapping when possible.
    pub use_mmap: bool,
    pub sync_policy: SyncPolicy,
    /// Pages added per file extension.
    pub growth_chunk_pages: u64,
    /// Worker threads for multi-collection fan-out; 0 means the CPU count.
    pub search_workers: usize,
    /// Result cache capacity in entries; 0 disables the cache.
    pub result_cache_entries: usize,
    /// Result cache entry lifetime.
    pub result_cache_ttl_ms: u64,
    /// Per-record cap on encoded metadata bytes.
    pub max_metadata_bytes: usize,
    /// Write a `free.list` checkpoint beside each data file at flush.
    pub free_list_checkpoint: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_cache_pages: 4096,
            use_mmap: true,
            sync_policy: SyncPolicy::Always,
            growth_chunk_pages: 64,
            search_workers: 0,
            result_cache_entries: 1024,
            result_cache_ttl_ms: 60_000,
            max_metadata_bytes: 16 * 1024,
            free_list_checkpoint: true,
        }
    }
}

impl Config {
    /// Every write is durable before the call returns.
    pub fn durable() -> Self {
        Self {
            sync_policy: SyncPolicy::Always,
            ..Self::default()
        }
    }

    /// Batched fsync; the sweet spot for steady ingest.
    pub fn balanced() -> Self {
        Self {
            sync_policy: SyncPolicy::batch(),
            page_cache_pages: 16 * 1024,
            ..Self::default()
        }
    }

    /// Bulk loading: sync only on flush, large cache, no result caching.
    pub fn throughput() -> Self {
        Self {
            sync_policy: SyncPolicy::Never,
            page_cache_pages: 64 * 1024,
            result_cache_entries: 0,
            ..Self::default()
        }
    }
}

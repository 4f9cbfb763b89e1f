//! Process-wide page cache.
//!
//! One bounded LRU shared by every open collection, keyed by
//! `(file_id, page_id)`. Frames pinned by an active operation are skipped at
//! eviction; dirty frames are written back to their owning file before being
//! dropped. The capacity cap is enforced by eviction on every insert.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use lru::LruCache;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, trace};

use crate::error::Result;
use crate::types::{FileId, PageId};

pub type CacheKey = (FileId, PageId);

/// Destination for dirty frames evicted before their owner's next sync.
pub(crate) trait WriteBack: Send + Sync {
    fn write_back(&self, page_id: PageId, data: &[u8]) -> Result<()>;
}

/// One cached page image. The buffer always holds a sealed page: header
/// stamped and checksum current.
pub struct Frame {
    data: RwLock<Vec<u8>>,
    dirty: AtomicBool,
    pins: AtomicU32,
}

impl Frame {
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: RwLock::new(data),
            dirty: AtomicBool::new(false),
            pins: AtomicU32::new(0),
        })
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read()
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }
}

/// Keeps a frame resident while an operation reads from it.
pub struct PinnedFrame {
    frame: Arc<Frame>,
}

impl PinnedFrame {
    pub fn new(frame: Arc<Frame>) -> Self {
        frame.pins.fetch_add(1, Ordering::AcqRel);
        Self { frame }
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }
}

impl Drop for PinnedFrame {
    fn drop(&mut self) {
        self.frame.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Default)]
struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    writebacks: AtomicU64,
}

/// Point-in-time view of page-cache counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PageCacheStats {
    pub capacity: usize,
    pub resident: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writebacks: u64,
}

pub struct PageCache {
    capacity: usize,
    inner: Mutex<LruCache<CacheKey, Arc<Frame>>>,
    files: Mutex<FxHashMap<FileId, Weak<dyn WriteBack>>>,
    metrics: CacheMetrics,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(LruCache::unbounded()),
            files: Mutex::new(FxHashMap::default()),
            metrics: CacheMetrics::default(),
        }
    }

    pub(crate) fn register_file(&self, file_id: FileId, sink: Weak<dyn WriteBack>) {
        self.files.lock().insert(file_id, sink);
    }

    pub(crate) fn unregister_file(&self, file_id: FileId) {
        self.files.lock().remove(&file_id);
    }

    pub fn get(&self, key: CacheKey) -> Option<Arc<Frame>> {
        let mut inner = self.inner.lock();
        match inner.get(&key) {
            Some(frame) => {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(frame))
            }
            None => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Inserts (or replaces) the frame for `key`, then evicts LRU entries
    /// until the cache is back under capacity. Pinned frames are passed over;
    /// dirty frames are written back to their file first.
    pub fn insert(&self, key: CacheKey, frame: Arc<Frame>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.put(key, frame);
        self.evict_locked(&mut inner)
    }

    fn evict_locked(&self, inner: &mut LruCache<CacheKey, Arc<Frame>>) -> Result<()> {
        let mut pinned = Vec::new();
        let mut attempts = inner.len();
        while inner.len() > self.capacity && attempts > 0 {
            attempts -= 1;
            let Some((key, frame)) = inner.pop_lru() else {
                break;
            };
            if frame.is_pinned() {
                pinned.push((key, frame));
                continue;
            }
            if frame.is_dirty() {
                self.write_back(key, &frame)?;
            }
            self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
            trace!(file = key.0 .0, page = key.1 .0, "evicted page");
        }
        for (key, frame) in pinned {
            inner.put(key, frame);
        }
        Ok(())
    }

    fn write_back(&self, key: CacheKey, frame: &Frame) -> Result<()> {
        let sink = self.files.lock().get(&key.0).and_then(Weak::upgrade);
        match sink {
            Some(sink) => {
                let data = frame.read();
                sink.write_back(key.1, &data)?;
                frame.clear_dirty();
                self.metrics.writebacks.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                // Owner already closed; its shutdown flush covered this page.
                debug!(file = key.0 .0, page = key.1 .0, "dropping orphan dirty page");
            }
        }
        Ok(())
    }

    pub fn remove(&self, key: CacheKey) {
        self.inner.lock().pop(&key);
    }

    /// Drops every cached page of `file_id`. With `flush_dirty` the dirty
    /// ones are written back first; otherwise they are discarded, which is
    /// what dropping a collection wants.
    pub fn evict_file(&self, file_id: FileId, flush_dirty: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let keys: Vec<CacheKey> = inner
            .iter()
            .map(|(key, _)| *key)
            .filter(|(fid, _)| *fid == file_id)
            .collect();
        for key in keys {
            if let Some(frame) = inner.pop(&key) {
                if flush_dirty && frame.is_dirty() {
                    self.write_back(key, &frame)?;
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PageCacheStats {
        PageCacheStats {
            capacity: self.capacity,
            resident: self.len(),
            hits: self.metrics.hits.load(Ordering::Relaxed),
            misses: self.metrics.misses.load(Ordering::Relaxed),
            evictions: self.metrics.evictions.load(Ordering::Relaxed),
            writebacks: self.metrics.writebacks.load(Ordering::Relaxed),
        }
    }
}

//! One open collection: meta page, vector store, and index under a single
//! reader-writer lock.
//!
//! Searches take the read side; insert, upsert, delete, and compact take the
//! write side. Every committing write advances the collection epoch. The
//! flush path never holds the write lock across an fsync: dirty state is
//! staged into the page cache under the lock, then the pagers sync on shared
//! handles after it is released, and only then is the epoch committed.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::{Config, SyncPolicy};
use crate::error::{CorruptionKind, Result, VettoreError};
use crate::index::{CollectionIndex, FlatIndex, HnswIndex, VectorSet};
use crate::model::{
    now_nanos, CollectionSpec, HnswParams, IndexKind, Metadata, SearchHit, SearchRequest,
    VectorRecord, MAX_SEARCH_K,
};
use crate::pager::cache::PageCache;
use crate::pager::io::FileHandle;
use crate::pager::{Pager, PagerOptions};
use crate::types::page::{seal_page, verify_page};
use crate::types::{Epoch, FileId, PageHeader, PageId, PageKind, Slot, PAGE_HDR_LEN};

pub const META_FILE: &str = "collection.meta";
pub const VECTORS_FILE: &str = "vectors.data";
pub const INDEX_FILE: &str = "index.data";
pub const FREELIST_FILE: &str = "free.list";

/// `collection.meta` is always one 4 KiB page, whatever the data page size.
const META_FILE_SIZE: usize = 4096;

/// Oversampling factor applied when a metadata filter must be satisfied
/// from approximate candidates.
const FILTER_OVERSAMPLE: usize = 4;

/// Everything sealed into or tracked by the collection meta page.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CollectionMeta {
    pub spec: CollectionSpec,
    pub created_at: u64,
    pub last_modified: u64,
    pub vector_count: u64,
    pub tombstone_count: u64,
    pub epoch: u64,
    pub entry_slot: Option<Slot>,
    pub top_level: u8,
}

fn encode_meta_page(meta: &CollectionMeta) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(128);
    payload.extend_from_slice(&(meta.spec.name.len() as u16).to_le_bytes());
    payload.extend_from_slice(meta.spec.name.as_bytes());
    payload.extend_from_slice(&meta.spec.page_size.to_le_bytes());
    payload.extend_from_slice(&(meta.spec.dimensions as u32).to_le_bytes());
    payload.push(meta.spec.metric.to_tag());
    payload.push(meta.spec.index.to_tag());
    payload.extend_from_slice(&(meta.spec.hnsw.m as u32).to_le_bytes());
    payload.extend_from_slice(&(meta.spec.hnsw.ef_construction as u32).to_le_bytes());
    payload.extend_from_slice(&(meta.spec.hnsw.ef_search as u32).to_le_bytes());
    payload.push(meta.spec.hnsw.max_level);
    payload.extend_from_slice(&meta.spec.hnsw.seed.to_le_bytes());
    payload.extend_from_slice(&meta.created_at.to_le_bytes());
    payload.extend_from_slice(&meta.last_modified.to_le_bytes());
    payload.extend_from_slice(&meta.vector_count.to_le_bytes());
    payload.extend_from_slice(&meta.tombstone_count.to_le_bytes());
    payload.extend_from_slice(&meta.epoch.to_le_bytes());
    payload.push(u8::from(meta.entry_slot.is_some()));
    payload.extend_from_slice(&meta.entry_slot.unwrap_or(Slot(0)).0.to_le_bytes());
    payload.push(meta.top_level);
    let mut page = vec![0u8; META_FILE_SIZE];
    page[PAGE_HDR_LEN..PAGE_HDR_LEN + payload.len()].copy_from_slice(&payload);
    let mut header = PageHeader::new(PageKind::Meta);
    header.payload_len = payload.len() as u32;
    seal_page(&mut page, header)?;
    Ok(page)
}

fn decode_meta_page(page: &[u8]) -> Result<CollectionMeta> {
    let bad = || VettoreError::corruption(PageId(0), CorruptionKind::BadState);
    let header = verify_page(page, PageId(0))?;
    if header.kind != PageKind::Meta {
        return Err(VettoreError::corruption(PageId(0), CorruptionKind::BadHeader));
    }
    let payload = &page[PAGE_HDR_LEN..PAGE_HDR_LEN + header.payload_len as usize];
    let mut reader = crate::codec::Reader::new(payload);
    let name_len = reader.u16()? as usize;
    let name = reader.str(name_len)?;
    let page_size = reader.u32()?;
    let dimensions = reader.u32()? as usize;
    let metric = crate::distance::Metric::from_tag(reader.u8()?).ok_or_else(bad)?;
    let index = IndexKind::from_tag(reader.u8()?).ok_or_else(bad)?;
    let m = reader.u32()? as usize;
    let ef_construction = reader.u32()? as usize;
    let ef_search = reader.u32()? as usize;
    let max_level = reader.u8()?;
    let seed = reader.u64()?;
    let created_at = reader.u64()?;
    let last_modified = reader.u64()?;
    let vector_count = reader.u64()?;
    let tombstone_count = reader.u64()?;
    let epoch = reader.u64()?;
    let has_entry = reader.u8()? != 0;
    let entry_raw = reader.u64()?;
    let top_level = reader.u8()?;
    Ok(CollectionMeta {
        spec: CollectionSpec {
            name,
            dimensions,
            metric,
            index,
            page_size,
            hnsw: HnswParams {
                m,
                ef_construction,
                ef_search,
                max_level,
                seed,
            },
        },
        created_at,
        last_modified,
        vector_count,
        tombstone_count,
        epoch,
        entry_slot: has_entry.then_some(Slot(entry_raw)),
        top_level,
    })
}

fn write_meta_file(path: &Path, page: &[u8]) -> Result<()> {
    let handle = FileHandle::open_rw(path)?;
    handle.write_all_at(0, page)?;
    handle.sync_data()?;
    Ok(())
}

/// Reads and validates a `collection.meta` page without opening data files.
pub(crate) fn read_collection_meta(path: &Path) -> Result<CollectionMeta> {
    read_meta_file(path)
}

fn read_meta_file(path: &Path) -> Result<CollectionMeta> {
    let handle = FileHandle::open_rw(path)?;
    let mut page = vec![0u8; META_FILE_SIZE];
    handle
        .read_exact_at(0, &mut page)
        .map_err(|_| VettoreError::corruption(PageId(0), CorruptionKind::Truncated))?;
    decode_meta_page(&page)
}

fn metadata_matches(metadata: &Metadata, filter: &Metadata) -> bool {
    filter
        .iter()
        .all(|(key, expected)| metadata.get(key) == Some(expected))
}

#[derive(Default)]
struct OpCounters {
    inserts: AtomicU64,
    deletes: AtomicU64,
    searches: AtomicU64,
}

/// Public description of one collection.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionInfo {
    pub name: String,
    pub dimensions: usize,
    pub metric: crate::distance::Metric,
    pub index: IndexKind,
    pub page_size: u32,
    pub vector_count: u64,
    pub tombstone_count: u64,
    pub created_at: u64,
    pub last_modified: u64,
    pub epoch: u64,
}

/// Per-collection counter snapshot reported by engine stats.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionStats {
    #[serde(flatten)]
    pub info: CollectionInfo,
    pub inserts: u64,
    pub deletes: u64,
    pub searches: u64,
}

struct CollectionInner {
    store: crate::store::VectorStore,
    vectors: VectorSet,
    index: CollectionIndex,
    created_at: u64,
    last_modified: u64,
    epoch: u64,
    pending_ops: u32,
    last_sync: Instant,
}

pub struct Collection {
    spec: CollectionSpec,
    dir: PathBuf,
    config: Config,
    cache: Arc<PageCache>,
    file_ids: Arc<AtomicU64>,
    committed_epoch: AtomicU64,
    counters: OpCounters,
    inner: RwLock<CollectionInner>,
}

impl Collection {
    fn pager_options(&self) -> PagerOptions {
        PagerOptions {
            page_size: self.spec.page_size,
            use_mmap: self.config.use_mmap,
            growth_chunk: self.config.growth_chunk_pages,
        }
    }

    fn next_file_id(&self) -> FileId {
        FileId(self.file_ids.fetch_add(1, Ordering::Relaxed))
    }

    /// Creates the directory, seals the spec into `collection.meta`, and
    /// initializes empty data files.
    pub(crate) fn create(
        dir: PathBuf,
        spec: CollectionSpec,
        cache: Arc<PageCache>,
        config: Config,
        file_ids: Arc<AtomicU64>,
    ) -> Result<Self> {
        spec.validate()?;
        std::fs::create_dir_all(&dir)?;
        let opts = PagerOptions {
            page_size: spec.page_size,
            use_mmap: config.use_mmap,
            growth_chunk: config.growth_chunk_pages,
        };
        let vectors_id = FileId(file_ids.fetch_add(1, Ordering::Relaxed));
        let pager = Pager::create(dir.join(VECTORS_FILE), vectors_id, Arc::clone(&cache), opts)?;
        let store =
            crate::store::VectorStore::new(pager, spec.dimensions, config.max_metadata_bytes);
        let index = match spec.index {
            IndexKind::Flat => CollectionIndex::Flat(FlatIndex::new(spec.metric)),
            IndexKind::Hnsw => {
                let index_id = FileId(file_ids.fetch_add(1, Ordering::Relaxed));
                let index_pager =
                    Pager::create(dir.join(INDEX_FILE), index_id, Arc::clone(&cache), opts)?;
                CollectionIndex::Hnsw(HnswIndex::new(spec.metric, spec.hnsw, index_pager))
            }
        };
        let created_at = now_nanos();
        let meta = CollectionMeta {
            spec: spec.clone(),
            created_at,
            last_modified: created_at,
            vector_count: 0,
            tombstone_count: 0,
            epoch: 0,
            entry_slot: None,
            top_level: 0,
        };
        write_meta_file(&dir.join(META_FILE), &encode_meta_page(&meta)?)?;
        info!(collection = %spec.name, index = spec.index.as_str(), "created collection");
        Ok(Self {
            spec,
            dir,
            config,
            cache,
            file_ids,
            committed_epoch: AtomicU64::new(0),
            counters: OpCounters::default(),
            inner: RwLock::new(CollectionInner {
                store,
                vectors: VectorSet::new(),
                index,
                created_at,
                last_modified: created_at,
                epoch: 0,
                pending_ops: 0,
                last_sync: Instant::now(),
            }),
        })
    }

    /// Opens an existing collection directory, rebuilding the HNSW graph
    /// from the store when its persisted pages fail validation.
    pub(crate) fn open(
        dir: PathBuf,
        cache: Arc<PageCache>,
        config: Config,
        file_ids: Arc<AtomicU64>,
    ) -> Result<Self> {
        let meta = read_meta_file(&dir.join(META_FILE))?;
        let spec = meta.spec.clone();
        let opts = PagerOptions {
            page_size: spec.page_size,
            use_mmap: config.use_mmap,
            growth_chunk: config.growth_chunk_pages,
        };
        let vectors_id = FileId(file_ids.fetch_add(1, Ordering::Relaxed));
        let pager = Pager::open(dir.join(VECTORS_FILE), vectors_id, Arc::clone(&cache), opts)?;
        let store =
            crate::store::VectorStore::open(pager, spec.dimensions, config.max_metadata_bytes)?;
        // Damaged slots stay resident in the store's maps so reads against
        // them report corruption; they are left out of the search set.
        let mut vectors = VectorSet::new();
        for entry in store.iter_live() {
            match entry {
                Ok((slot, record)) => {
                    vectors.insert(slot, Arc::from(record.vector.into_boxed_slice()));
                }
                Err(err @ VettoreError::UnsupportedVersion(_)) => return Err(err),
                Err(err) => warn!(%err, "skipping unreadable record"),
            }
        }
        for slot in store.dead_slots() {
            match store.get_tombstoned(slot) {
                Ok(record) => {
                    vectors.insert(slot, Arc::from(record.vector.into_boxed_slice()));
                    vectors.mark_dead(slot);
                }
                Err(err @ VettoreError::UnsupportedVersion(_)) => return Err(err),
                Err(err) => warn!(slot = slot.0, %err, "skipping unreadable tombstone"),
            }
        }
        let index = match spec.index {
            IndexKind::Flat => CollectionIndex::Flat(FlatIndex::new(spec.metric)),
            IndexKind::Hnsw => Self::open_hnsw(
                &dir, &spec, &meta, &vectors, &cache, opts, &file_ids,
            )?,
        };
        debug!(collection = %spec.name, vectors = vectors.live_count(), "opened collection");
        Ok(Self {
            spec,
            dir,
            config,
            cache,
            file_ids,
            committed_epoch: AtomicU64::new(meta.epoch),
            counters: OpCounters::default(),
            inner: RwLock::new(CollectionInner {
                store,
                vectors,
                index,
                created_at: meta.created_at,
                last_modified: meta.last_modified,
                epoch: meta.epoch,
                pending_ops: 0,
                last_sync: Instant::now(),
            }),
        })
    }

    fn open_hnsw(
        dir: &Path,
        spec: &CollectionSpec,
        meta: &CollectionMeta,
        vectors: &VectorSet,
        cache: &Arc<PageCache>,
        opts: PagerOptions,
        file_ids: &Arc<AtomicU64>,
    ) -> Result<CollectionIndex> {
        let path = dir.join(INDEX_FILE);
        let load_attempt = (|| {
            let pager = Pager::open(
                &path,
                FileId(file_ids.fetch_add(1, Ordering::Relaxed)),
                Arc::clone(cache),
                opts,
            )?;
            HnswIndex::load(
                spec.metric,
                spec.hnsw,
                pager,
                vectors,
                meta.entry_slot,
                meta.top_level,
            )
        })();
        match load_attempt {
            Ok(index) => Ok(CollectionIndex::Hnsw(index)),
            Err(err @ VettoreError::UnsupportedVersion(_)) => Err(err),
            Err(err) => {
                warn!(collection = %spec.name, %err, "index load failed, rebuilding from store");
                std::fs::remove_file(&path).ok();
                let pager = Pager::create(
                    &path,
                    FileId(file_ids.fetch_add(1, Ordering::Relaxed)),
                    Arc::clone(cache),
                    opts,
                )?;
                let rebuilt = HnswIndex::rebuild(
                    spec.metric,
                    spec.hnsw,
                    pager,
                    vectors,
                    &CancelToken::new(),
                )?;
                Ok(CollectionIndex::Hnsw(rebuilt))
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &CollectionSpec {
        &self.spec
    }

    /// Epoch a newly started read observes.
    pub fn current_epoch(&self) -> Epoch {
        Epoch(self.inner.read().epoch)
    }

    /// Last epoch known durable on disk.
    pub fn committed_epoch(&self) -> Epoch {
        Epoch(self.committed_epoch.load(Ordering::Acquire))
    }

    fn validate_record(&self, record: &VectorRecord) -> Result<()> {
        if record.id.is_empty() {
            return Err(VettoreError::InvalidSpec(
                "record id must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn insert(&self, mut record: VectorRecord) -> Result<()> {
        self.validate_record(&record)?;
        {
            let mut inner = self.inner.write();
            if record.created_at == 0 {
                record.created_at = now_nanos();
            }
            let slot = inner.store.insert(&record)?;
            let CollectionInner { vectors, index, .. } = &mut *inner;
            vectors.insert(slot, Arc::from(record.vector.into_boxed_slice()));
            index.insert(slot, vectors)?;
            inner.epoch += 1;
            inner.last_modified = record.created_at;
            inner.pending_ops += 1;
        }
        self.counters.inserts.fetch_add(1, Ordering::Relaxed);
        self.after_write()
    }

    pub fn upsert(&self, mut record: VectorRecord) -> Result<()> {
        self.validate_record(&record)?;
        {
            let mut inner = self.inner.write();
            record.created_at = now_nanos();
            let (slot, replaced) = inner.store.upsert(&record)?;
            let CollectionInner { vectors, index, .. } = &mut *inner;
            if let Some(old_slot) = replaced {
                vectors.mark_dead(old_slot);
                index.remove(old_slot);
            }
            vectors.insert(slot, Arc::from(record.vector.into_boxed_slice()));
            index.insert(slot, vectors)?;
            inner.epoch += 1;
            inner.last_modified = record.created_at;
            inner.pending_ops += 1;
        }
        self.counters.inserts.fetch_add(1, Ordering::Relaxed);
        self.after_write()
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        {
            let mut inner = self.inner.write();
            let slot = inner.store.delete(id)?;
            let CollectionInner { vectors, index, .. } = &mut *inner;
            vectors.mark_dead(slot);
            index.remove(slot);
            inner.epoch += 1;
            inner.last_modified = now_nanos();
            inner.pending_ops += 1;
        }
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.after_write()
    }

    pub fn get(&self, id: &str) -> Result<VectorRecord> {
        self.inner.read().store.get(id)
    }

    /// Ranked nearest-neighbor search over a consistent snapshot.
    pub fn search(
        &self,
        request: &SearchRequest,
        token: &CancelToken,
    ) -> Result<Vec<SearchHit>> {
        request.validate()?;
        if request.query.len() != self.spec.dimensions {
            return Err(VettoreError::DimensionMismatch {
                expected: self.spec.dimensions,
                actual: request.query.len(),
            });
        }
        let inner = self.inner.read();
        token.check()?;
        let ef_search = request.ef_search.unwrap_or(self.spec.hnsw.ef_search);
        let fetch = if request.filter.is_empty() {
            request.k
        } else {
            request
                .k
                .saturating_mul(FILTER_OVERSAMPLE)
                .min(MAX_SEARCH_K)
        };
        let candidates =
            inner
                .index
                .search(&request.query, fetch, ef_search, &inner.vectors, token)?;
        let mut hits = Vec::with_capacity(request.k.min(candidates.len()));
        for candidate in candidates {
            if hits.len() == request.k {
                break;
            }
            token.check()?;
            let record = inner.store.get_by_slot(candidate.slot)?;
            if !metadata_matches(&record.metadata, &request.filter) {
                continue;
            }
            let score = self.spec.metric.score(candidate.distance);
            if let Some(min_score) = request.min_score {
                if score < min_score {
                    continue;
                }
            }
            hits.push(SearchHit {
                collection: self.spec.name.clone(),
                id: record.id,
                distance: candidate.distance,
                score,
                metadata: request.include_metadata.then_some(record.metadata),
                slot: candidate.slot.0,
            });
        }
        self.counters.searches.fetch_add(1, Ordering::Relaxed);
        Ok(hits)
    }

    fn after_write(&self) -> Result<()> {
        match self.config.sync_policy {
            SyncPolicy::Always => self.flush(),
            SyncPolicy::Batch { interval_ms, ops } => {
                let due = {
                    let inner = self.inner.read();
                    inner.pending_ops >= ops
                        || inner.last_sync.elapsed() >= Duration::from_millis(interval_ms)
                };
                if due {
                    self.flush()
                } else {
                    Ok(())
                }
            }
            SyncPolicy::Never => Ok(()),
        }
    }

    fn build_meta(&self, inner: &CollectionInner) -> CollectionMeta {
        let (entry_slot, top_level) = inner.index.hnsw_meta().unwrap_or((None, 0));
        CollectionMeta {
            spec: self.spec.clone(),
            created_at: inner.created_at,
            last_modified: inner.last_modified,
            vector_count: inner.store.vector_count(),
            tombstone_count: inner.store.tombstone_count(),
            epoch: inner.epoch,
            entry_slot,
            top_level,
        }
    }

    /// Makes every staged write durable and commits the epoch. Dirty state
    /// is staged under the write lock; fsync runs after it is released.
    pub fn flush(&self) -> Result<()> {
        let (store_pager, index_pager, meta_page, staged_epoch) = {
            let mut inner = self.inner.write();
            {
                let CollectionInner { index, .. } = &mut *inner;
                index.persist()?;
            }
            inner.pending_ops = 0;
            inner.last_sync = Instant::now();
            let meta_page = encode_meta_page(&self.build_meta(&inner))?;
            (
                inner.store.pager_handle(),
                inner.index.pager_handle(),
                meta_page,
                inner.epoch,
            )
        };
        store_pager.sync()?;
        if let Some(index_pager) = &index_pager {
            index_pager.sync()?;
        }
        write_meta_file(&self.dir.join(META_FILE), &meta_page)?;
        if self.config.free_list_checkpoint {
            store_pager.write_free_checkpoint(&self.dir.join(FREELIST_FILE))?;
        }
        self.committed_epoch.store(staged_epoch, Ordering::Release);
        Ok(())
    }

    /// Copies live records into a fresh file, swaps it in, and rebuilds the
    /// index. The one operation that physically reclaims tombstones.
    pub fn compact(&self, token: &CancelToken) -> Result<()> {
        {
            let mut inner = self.inner.write();
            token.check()?;
            let dead = inner.store.dead_slots();
            let opts = self.pager_options();
            let scratch_path = self.dir.join(format!("{VECTORS_FILE}.compact"));
            if scratch_path.exists() {
                std::fs::remove_file(&scratch_path)?;
            }
            let scratch = Pager::create(
                &scratch_path,
                self.next_file_id(),
                Arc::clone(&self.cache),
                opts,
            )?;
            let reopen_path = self.dir.join(VECTORS_FILE);
            let reopen_cache = Arc::clone(&self.cache);
            let reopen_id = self.next_file_id();
            inner.store.compact(
                scratch,
                move || Pager::open(reopen_path, reopen_id, reopen_cache, opts),
                token,
            )?;
            {
                let CollectionInner { vectors, .. } = &mut *inner;
                for slot in dead {
                    vectors.remove(slot);
                }
            }
            if self.spec.index == IndexKind::Hnsw {
                let index_path = self.dir.join(INDEX_FILE);
                std::fs::remove_file(&index_path).ok();
                let pager = Pager::create(
                    &index_path,
                    self.next_file_id(),
                    Arc::clone(&self.cache),
                    opts,
                )?;
                let CollectionInner {
                    vectors, index, ..
                } = &mut *inner;
                *index = CollectionIndex::Hnsw(HnswIndex::rebuild(
                    self.spec.metric,
                    self.spec.hnsw,
                    pager,
                    vectors,
                    token,
                )?);
            }
            inner.epoch += 1;
            inner.last_modified = now_nanos();
        }
        self.flush()
    }

    /// Walks every page of every backing file, validating checksums.
    pub fn verify(&self) -> Result<u64> {
        let inner = self.inner.read();
        let mut pages = inner.store.verify()?;
        if let Some(index_pager) = inner.index.pager_handle() {
            pages += index_pager.verify()?;
        }
        Ok(pages)
    }

    pub fn info(&self) -> CollectionInfo {
        let inner = self.inner.read();
        CollectionInfo {
            name: self.spec.name.clone(),
            dimensions: self.spec.dimensions,
            metric: self.spec.metric,
            index: self.spec.index,
            page_size: self.spec.page_size,
            vector_count: inner.store.vector_count(),
            tombstone_count: inner.store.tombstone_count(),
            created_at: inner.created_at,
            last_modified: inner.last_modified,
            epoch: inner.epoch,
        }
    }

    pub fn stats(&self) -> CollectionStats {
        CollectionStats {
            info: self.info(),
            inserts: self.counters.inserts.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            searches: self.counters.searches.load(Ordering::Relaxed),
        }
    }

    /// Drops this collection's pages from the shared cache without writing
    /// them back; the files are about to be deleted.
    pub(crate) fn discard_cache(&self) -> Result<()> {
        let inner = self.inner.read();
        inner.store.pager().release_cache(false)?;
        if let Some(index_pager) = inner.index.pager_handle() {
            index_pager.release_cache(false)?;
        }
        Ok(())
    }
}

//! Process-scoped engine: owns the shared caches and every collection
//! handle. There are no globals; tests run several engines side by side.
//!
//! Collections are discovered at open by scanning `data_dir` for
//! `<name>/collection.meta` and opened lazily on first use. A collection
//! that reports corruption or an unsupported format is quarantined
//! in-memory: subsequent operations fail fast with the same error until an
//! operator intervenes.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::collection::{
    Collection, CollectionInfo, CollectionMeta, CollectionStats, META_FILE,
};
use crate::config::Config;
use crate::error::{CorruptionKind, Result, VettoreError};
use crate::model::{validate_name, CollectionSpec, SearchHit, SearchRequest, VectorRecord};
use crate::pager::cache::{PageCache, PageCacheStats};
use crate::search::{ResultCacheStats, SearchExecutor};
use crate::types::PageId;

/// Why a collection was taken out of service.
#[derive(Debug, Clone)]
enum QuarantineCause {
    Corruption { page_id: PageId, kind: CorruptionKind },
    UnsupportedVersion(u16),
}

impl QuarantineCause {
    fn from_error(err: &VettoreError) -> Option<Self> {
        match err {
            VettoreError::Corruption { page_id, kind } => Some(Self::Corruption {
                page_id: *page_id,
                kind: *kind,
            }),
            VettoreError::UnsupportedVersion(version) => {
                Some(Self::UnsupportedVersion(*version))
            }
            _ => None,
        }
    }

    fn to_error(&self) -> VettoreError {
        match self {
            Self::Corruption { page_id, kind } => VettoreError::Corruption {
                page_id: *page_id,
                kind: *kind,
            },
            Self::UnsupportedVersion(version) => VettoreError::UnsupportedVersion(*version),
        }
    }
}

enum CollectionState {
    /// Meta header loaded; data files untouched.
    Discovered(Box<CollectionMeta>),
    Open(Arc<Collection>),
    Quarantined(QuarantineCause),
}

/// Aggregate counters exposed to the collaborator layer.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub total_vectors: u64,
    pub total_tombstones: u64,
    pub collections: Vec<CollectionStats>,
    pub page_cache: PageCacheStats,
    pub result_cache: ResultCacheStats,
}

pub struct Engine {
    data_dir: PathBuf,
    config: Config,
    page_cache: Arc<PageCache>,
    executor: SearchExecutor,
    file_ids: Arc<AtomicU64>,
    collections: RwLock<FxHashMap<String, CollectionState>>,
}

fn info_from_meta(meta: &CollectionMeta) -> CollectionInfo {
    CollectionInfo {
        name: meta.spec.name.clone(),
        dimensions: meta.spec.dimensions,
        metric: meta.spec.metric,
        index: meta.spec.index,
        page_size: meta.spec.page_size,
        vector_count: meta.vector_count,
        tombstone_count: meta.tombstone_count,
        created_at: meta.created_at,
        last_modified: meta.last_modified,
        epoch: meta.epoch,
    }
}

impl Engine {
    /// Opens (creating if needed) a data directory and discovers its
    /// collections without opening their data files.
    pub fn open(data_dir: impl AsRef<Path>, config: Config) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;
        let executor = SearchExecutor::new(
            config.search_workers,
            config.result_cache_entries,
            Duration::from_millis(config.result_cache_ttl_ms),
        )?;
        let engine = Self {
            page_cache: Arc::new(PageCache::new(config.page_cache_pages)),
            executor,
            file_ids: Arc::new(AtomicU64::new(1)),
            collections: RwLock::new(FxHashMap::default()),
            data_dir,
            config,
        };
        engine.discover()?;
        Ok(engine)
    }

    fn discover(&self) -> Result<()> {
        let mut map = self.collections.write();
        for entry in std::fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let meta_path = entry.path().join(META_FILE);
            if !meta_path.exists() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match crate::collection::read_collection_meta(&meta_path) {
                Ok(meta) if meta.spec.name == name => {
                    map.insert(name, CollectionState::Discovered(Box::new(meta)));
                }
                Ok(_) => {
                    warn!(collection = %name, "meta page names a different collection");
                    map.insert(
                        name,
                        CollectionState::Quarantined(QuarantineCause::Corruption {
                            page_id: PageId(0),
                            kind: CorruptionKind::BadState,
                        }),
                    );
                }
                Err(err) => match QuarantineCause::from_error(&err) {
                    Some(cause) => {
                        warn!(collection = %name, %err, "quarantining at discovery");
                        map.insert(name, CollectionState::Quarantined(cause));
                    }
                    None => return Err(err),
                },
            }
        }
        info!(collections = map.len(), dir = %self.data_dir.display(), "engine open");
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn collection_dir(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    /// Returns the live handle, opening the collection lazily.
    fn handle(&self, name: &str) -> Result<Arc<Collection>> {
        {
            let map = self.collections.read();
            match map.get(name) {
                None => return Err(VettoreError::NotFound("collection")),
                Some(CollectionState::Open(collection)) => return Ok(Arc::clone(collection)),
                Some(CollectionState::Quarantined(cause)) => return Err(cause.to_error()),
                Some(CollectionState::Discovered(_)) => {}
            }
        }
        let mut map = self.collections.write();
        match map.get(name) {
            Some(CollectionState::Open(collection)) => return Ok(Arc::clone(collection)),
            Some(CollectionState::Quarantined(cause)) => return Err(cause.to_error()),
            Some(CollectionState::Discovered(_)) => {}
            None => return Err(VettoreError::NotFound("collection")),
        }
        match Collection::open(
            self.collection_dir(name),
            Arc::clone(&self.page_cache),
            self.config.clone(),
            Arc::clone(&self.file_ids),
        ) {
            Ok(collection) => {
                let collection = Arc::new(collection);
                map.insert(
                    name.to_string(),
                    CollectionState::Open(Arc::clone(&collection)),
                );
                Ok(collection)
            }
            Err(err) => {
                if let Some(cause) = QuarantineCause::from_error(&err) {
                    warn!(collection = %name, %err, "quarantining at open");
                    map.insert(name.to_string(), CollectionState::Quarantined(cause));
                }
                Err(err)
            }
        }
    }

    /// Runs one operation against a collection, quarantining it when the
    /// operation reports unrecoverable damage.
    fn run_op<T>(
        &self,
        name: &str,
        op: impl FnOnce(&Arc<Collection>) -> Result<T>,
    ) -> Result<T> {
        let collection = self.handle(name)?;
        match op(&collection) {
            Err(err) if err.quarantines() => {
                if let Some(cause) = QuarantineCause::from_error(&err) {
                    warn!(collection = %name, %err, "quarantining after failed operation");
                    self.collections
                        .write()
                        .insert(name.to_string(), CollectionState::Quarantined(cause));
                }
                Err(err)
            }
            other => other,
        }
    }

    fn invalidate(&self, name: &str) {
        self.executor.result_cache().invalidate_collection(name);
    }

    pub fn create_collection(&self, spec: CollectionSpec) -> Result<()> {
        spec.validate()?;
        let mut map = self.collections.write();
        if map.contains_key(&spec.name) {
            return Err(VettoreError::AlreadyExists("collection"));
        }
        let dir = self.collection_dir(&spec.name);
        if dir.exists() {
            return Err(VettoreError::AlreadyExists("collection"));
        }
        let name = spec.name.clone();
        let collection = Collection::create(
            dir,
            spec,
            Arc::clone(&self.page_cache),
            self.config.clone(),
            Arc::clone(&self.file_ids),
        )?;
        map.insert(name, CollectionState::Open(Arc::new(collection)));
        Ok(())
    }

    pub fn drop_collection(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let removed = self
            .collections
            .write()
            .remove(name)
            .ok_or(VettoreError::NotFound("collection"))?;
        if let CollectionState::Open(collection) = &removed {
            collection.discard_cache()?;
        }
        std::fs::remove_dir_all(self.collection_dir(name))?;
        self.invalidate(name);
        info!(collection = %name, "dropped");
        Ok(())
    }

    /// Metadata for every known, non-quarantined collection, sorted by name.
    pub fn list_collections(&self) -> Vec<CollectionInfo> {
        let map = self.collections.read();
        let mut infos: Vec<CollectionInfo> = map
            .values()
            .filter_map(|state| match state {
                CollectionState::Open(collection) => Some(collection.info()),
                CollectionState::Discovered(meta) => Some(info_from_meta(meta)),
                CollectionState::Quarantined(_) => None,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn insert(&self, name: &str, record: VectorRecord) -> Result<()> {
        let result = self.run_op(name, |collection| collection.insert(record));
        if result.is_ok() {
            self.invalidate(name);
        }
        result
    }

    pub fn upsert(&self, name: &str, record: VectorRecord) -> Result<()> {
        let result = self.run_op(name, |collection| collection.upsert(record));
        if result.is_ok() {
            self.invalidate(name);
        }
        result
    }

    pub fn delete(&self, name: &str, id: &str) -> Result<()> {
        let result = self.run_op(name, |collection| collection.delete(id));
        if result.is_ok() {
            self.invalidate(name);
        }
        result
    }

    pub fn get(&self, name: &str, id: &str) -> Result<VectorRecord> {
        self.run_op(name, |collection| collection.get(id))
    }

    pub fn search(
        &self,
        name: &str,
        request: &SearchRequest,
        token: &CancelToken,
    ) -> Result<Vec<SearchHit>> {
        self.run_op(name, |collection| {
            self.executor
                .search(collection, request, token)
                .map(|hits| hits.as_ref().clone())
        })
    }

    /// Parallel fan-out across `names` with a globally merged top-`k`.
    pub fn search_multi(
        &self,
        names: &[&str],
        request: &SearchRequest,
        token: &CancelToken,
    ) -> Result<Vec<SearchHit>> {
        let mut collections = Vec::with_capacity(names.len());
        for name in names {
            collections.push(self.handle(name)?);
        }
        self.executor.search_multi(&collections, request, token)
    }

    pub fn compact(&self, name: &str, token: &CancelToken) -> Result<()> {
        let result = self.run_op(name, |collection| collection.compact(token));
        if result.is_ok() {
            self.invalidate(name);
        }
        result
    }

    /// Checksum-walks a collection's backing files.
    pub fn verify(&self, name: &str) -> Result<u64> {
        self.run_op(name, |collection| collection.verify())
    }

    pub fn stats(&self) -> EngineStats {
        let map = self.collections.read();
        let mut collections: Vec<CollectionStats> = map
            .values()
            .filter_map(|state| match state {
                CollectionState::Open(collection) => Some(collection.stats()),
                CollectionState::Discovered(meta) => Some(CollectionStats {
                    info: info_from_meta(meta),
                    inserts: 0,
                    deletes: 0,
                    searches: 0,
                }),
                CollectionState::Quarantined(_) => None,
            })
            .collect();
        collections.sort_by(|a, b| a.info.name.cmp(&b.info.name));
        EngineStats {
            total_vectors: collections.iter().map(|c| c.info.vector_count).sum(),
            total_tombstones: collections.iter().map(|c| c.info.tombstone_count).sum(),
            collections,
            page_cache: self.page_cache.stats(),
            result_cache: self.executor.result_cache().stats(),
        }
    }

    /// Flushes every open collection.
    pub fn flush(&self) -> Result<()> {
        let open: Vec<Arc<Collection>> = {
            let map = self.collections.read();
            map.values()
                .filter_map(|state| match state {
                    CollectionState::Open(collection) => Some(Arc::clone(collection)),
                    _ => None,
                })
                .collect()
        };
        for collection in open {
            collection.flush()?;
        }
        Ok(())
    }

    /// Flushes and releases everything. Dropping the engine without calling
    /// this still writes dirty pages back, but without a durability barrier.
    pub fn close(self) -> Result<()> {
        self.flush()?;
        self.collections.write().clear();
        info!(dir = %self.data_dir.display(), "engine closed");
        Ok(())
    }
}

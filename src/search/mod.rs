//! Search execution: per-collection dispatch, parallel multi-collection
//! fan-out, and the shared result cache.
//!
//! Fan-out runs on a bounded rayon pool sized to the CPU count by default.
//! Results merge under the same global ordering every index uses (distance,
//! then slot, then collection name) and a canceled query returns nothing
//! rather than a partial ranking.

pub mod cache;

use std::cmp::Ordering as CmpOrdering;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use ordered_float::OrderedFloat;
use rayon::prelude::*;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::collection::Collection;
use crate::error::{Result, VettoreError};
use crate::model::{SearchHit, SearchRequest};
use cache::{fingerprint, Claim, ResultCache};

pub use cache::ResultCacheStats;

pub struct SearchExecutor {
    pool: rayon::ThreadPool,
    cache: ResultCache,
}

impl SearchExecutor {
    pub fn new(workers: usize, cache_entries: usize, cache_ttl: Duration) -> Result<Self> {
        let workers = if workers == 0 {
            num_cpus::get()
        } else {
            workers
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|index| format!("vettore-search-{index}"))
            .build()
            .map_err(|err| VettoreError::Io(io::Error::new(io::ErrorKind::Other, err)))?;
        debug!(workers, "search pool ready");
        Ok(Self {
            pool,
            cache: ResultCache::new(cache_entries, cache_ttl),
        })
    }

    pub fn result_cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Single-collection search with result caching. Concurrent identical
    /// misses coalesce onto one computation.
    pub fn search(
        &self,
        collection: &Arc<Collection>,
        request: &SearchRequest,
        token: &CancelToken,
    ) -> Result<Arc<Vec<SearchHit>>> {
        let ef_search = request
            .ef_search
            .unwrap_or(collection.spec().hnsw.ef_search);
        let key = fingerprint(
            collection.name(),
            collection.current_epoch(),
            collection.spec().metric,
            request,
            ef_search,
        );
        if let Some(hits) = self.cache.get(key) {
            return Ok(hits);
        }
        loop {
            match self.cache.claim(key) {
                Claim::Uncached => {
                    return Ok(Arc::new(collection.search(request, token)?));
                }
                Claim::Leader(guard) => {
                    let hits = Arc::new(collection.search(request, token)?);
                    self.cache.insert(key, collection.name(), Arc::clone(&hits));
                    drop(guard);
                    return Ok(hits);
                }
                Claim::Follower(flight) => {
                    self.cache.wait(&flight, token)?;
                    if let Some(hits) = self.cache.get(key) {
                        return Ok(hits);
                    }
                    // Leader failed or its entry was already evicted; take
                    // the lead on the next turn of the loop.
                }
            }
        }
    }

    /// Fans one query out across collections in parallel, then merges the
    /// per-collection rankings into a global top-`k`.
    pub fn search_multi(
        &self,
        collections: &[Arc<Collection>],
        request: &SearchRequest,
        token: &CancelToken,
    ) -> Result<Vec<SearchHit>> {
        let per_collection: Vec<Result<Arc<Vec<SearchHit>>>> = self.pool.install(|| {
            collections
                .par_iter()
                .map(|collection| {
                    token.check()?;
                    self.search(collection, request, token)
                })
                .collect()
        });
        let mut merged: Vec<SearchHit> = Vec::new();
        for result in per_collection {
            merged.extend_from_slice(&result?);
        }
        token.check()?;
        merged.sort_by(|a, b| global_order(a, b));
        merged.truncate(request.k);
        Ok(merged)
    }
}

/// Global ranking across collections: distance, then slot, then collection
/// name, so merged results are fully deterministic.
fn global_order(a: &SearchHit, b: &SearchHit) -> CmpOrdering {
    OrderedFloat(a.distance)
        .cmp(&OrderedFloat(b.distance))
        .then(a.slot.cmp(&b.slot))
        .then(a.collection.cmp(&b.collection))
}

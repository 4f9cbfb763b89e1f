//! Bounded search-result cache with request coalescing.
//!
//! Entries are keyed by an xxh64 fingerprint of the full request identity,
//! collection epoch included, so a stale entry can never match a fresh
//! query. On top of the epoch in the key, mutations purge a collection's
//! entries eagerly to bound memory. Concurrent misses on one fingerprint
//! coalesce: a single leader computes while followers wait and reuse its
//! result.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::trace;
use xxhash_rust::xxh64::Xxh64;

use crate::cancel::CancelToken;
use crate::codec;
use crate::distance::Metric;
use crate::error::Result;
use crate::model::{SearchHit, SearchRequest};
use crate::types::Epoch;

const FINGERPRINT_SEED: u64 = 0x5644_5642;
const FOLLOWER_WAIT_SLICE: Duration = Duration::from_millis(10);

/// Stable hash of everything that can change a search response.
pub fn fingerprint(
    collection: &str,
    epoch: Epoch,
    metric: Metric,
    request: &SearchRequest,
    ef_search: usize,
) -> u64 {
    let mut hasher = Xxh64::new(FINGERPRINT_SEED);
    hasher.update(&(collection.len() as u32).to_le_bytes());
    hasher.update(collection.as_bytes());
    hasher.update(&epoch.0.to_le_bytes());
    hasher.update(&[metric.to_tag()]);
    for value in &request.query {
        hasher.update(&value.to_le_bytes());
    }
    hasher.update(&(request.k as u64).to_le_bytes());
    hasher.update(&(ef_search as u64).to_le_bytes());
    hasher.update(&codec::encode_metadata(&request.filter));
    match request.min_score {
        Some(score) => hasher.update(&score.to_le_bytes()),
        None => hasher.update(&f32::NAN.to_le_bytes()),
    }
    hasher.update(&[u8::from(request.include_metadata)]);
    hasher.digest()
}

struct CacheEntry {
    hits: Arc<Vec<SearchHit>>,
    collection: String,
    inserted: Instant,
}

/// In-flight computation marker waiters block on.
pub struct Flight {
    done: Mutex<bool>,
    cond: Condvar,
}

/// Outcome of claiming a fingerprint for computation.
pub enum Claim {
    /// Caching disabled; compute without coalescing.
    Uncached,
    /// This caller computes; drop the guard (after `insert`) to wake waiters.
    Leader(FlightGuard),
    /// Another caller is computing the same request.
    Follower(Arc<Flight>),
}

pub struct FlightGuard {
    fingerprint: u64,
    flight: Arc<Flight>,
    owner: Arc<FlightTable>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.owner.inflight.lock().remove(&self.fingerprint);
        *self.flight.done.lock() = true;
        self.flight.cond.notify_all();
    }
}

#[derive(Default)]
struct FlightTable {
    inflight: Mutex<FxHashMap<u64, Arc<Flight>>>,
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    coalesced: AtomicU64,
}

/// Point-in-time view of result-cache counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ResultCacheStats {
    pub capacity: usize,
    pub resident: usize,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub coalesced: u64,
}

pub struct ResultCache {
    capacity: usize,
    ttl: Duration,
    entries: Mutex<LruCache<u64, CacheEntry>>,
    flights: Arc<FlightTable>,
    counters: CacheCounters,
}

impl ResultCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let lru_capacity = NonZeroUsize::new(capacity.max(1)).expect("non-zero after max");
        Self {
            capacity,
            ttl,
            entries: Mutex::new(LruCache::new(lru_capacity)),
            flights: Arc::new(FlightTable::default()),
            counters: CacheCounters::default(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.capacity > 0
    }

    pub fn get(&self, fingerprint: u64) -> Option<Arc<Vec<SearchHit>>> {
        if !self.enabled() {
            return None;
        }
        let mut entries = self.entries.lock();
        let fresh = match entries.get(&fingerprint) {
            Some(entry) if entry.inserted.elapsed() <= self.ttl => {
                Some(Arc::clone(&entry.hits))
            }
            Some(_) | None => None,
        };
        match fresh {
            Some(hits) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(hits)
            }
            None => {
                entries.pop(&fingerprint);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, fingerprint: u64, collection: &str, hits: Arc<Vec<SearchHit>>) {
        if !self.enabled() {
            return;
        }
        self.entries.lock().put(
            fingerprint,
            CacheEntry {
                hits,
                collection: collection.to_string(),
                inserted: Instant::now(),
            },
        );
    }

    /// Purges every entry belonging to `collection`; called whenever its
    /// epoch advances.
    pub fn invalidate_collection(&self, collection: &str) {
        if !self.enabled() {
            return;
        }
        let mut entries = self.entries.lock();
        let stale: Vec<u64> = entries
            .iter()
            .filter(|(_, entry)| entry.collection == collection)
            .map(|(fingerprint, _)| *fingerprint)
            .collect();
        let count = stale.len() as u64;
        for fingerprint in stale {
            entries.pop(&fingerprint);
        }
        if count > 0 {
            self.counters
                .invalidations
                .fetch_add(count, Ordering::Relaxed);
            trace!(collection, count, "invalidated cached results");
        }
    }

    /// Claims the right to compute `fingerprint`, coalescing with any
    /// in-flight computation of the same request.
    pub fn claim(&self, fingerprint: u64) -> Claim {
        if !self.enabled() {
            return Claim::Uncached;
        }
        let mut inflight = self.flights.inflight.lock();
        if let Some(flight) = inflight.get(&fingerprint) {
            self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            return Claim::Follower(Arc::clone(flight));
        }
        let flight = Arc::new(Flight {
            done: Mutex::new(false),
            cond: Condvar::new(),
        });
        inflight.insert(fingerprint, Arc::clone(&flight));
        Claim::Leader(FlightGuard {
            fingerprint,
            flight,
            owner: Arc::clone(&self.flights),
        })
    }

    /// Blocks until the in-flight leader finishes or the token fires.
    pub fn wait(&self, flight: &Flight, token: &CancelToken) -> Result<()> {
        let mut done = flight.done.lock();
        while !*done {
            token.check()?;
            flight.cond.wait_for(&mut done, FOLLOWER_WAIT_SLICE);
        }
        Ok(())
    }

    pub fn stats(&self) -> ResultCacheStats {
        ResultCacheStats {
            capacity: self.capacity,
            resident: self.entries.lock().len(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
        }
    }
}

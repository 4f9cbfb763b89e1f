//! Nearest-neighbor indexes.
//!
//! Both index kinds operate over a [`VectorSet`], the in-memory table of a
//! collection's vectors keyed by slot. Tombstoned slots keep their vector in
//! the set (marked dead) so graph traversal can pass through them; only
//! compaction drops them for good. The two kinds share a capability set and
//! are dispatched through the [`CollectionIndex`] tagged variant.

pub mod flat;
pub mod hnsw;

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use ordered_float::OrderedFloat;
use rustc_hash::FxHashMap;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::types::Slot;

pub use flat::FlatIndex;
pub use hnsw::HnswIndex;

struct VectorEntry {
    data: Arc<[f32]>,
    live: bool,
}

/// In-memory vector table for one collection.
#[derive(Default)]
pub struct VectorSet {
    map: FxHashMap<Slot, VectorEntry>,
    live: usize,
}

impl VectorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, slot: Slot, data: Arc<[f32]>) {
        if self
            .map
            .insert(slot, VectorEntry { data, live: true })
            .map_or(true, |old| !old.live)
        {
            self.live += 1;
        }
    }

    /// Keeps the vector resident but hides it from results.
    pub fn mark_dead(&mut self, slot: Slot) {
        if let Some(entry) = self.map.get_mut(&slot) {
            if entry.live {
                entry.live = false;
                self.live -= 1;
            }
        }
    }

    /// Drops the vector entirely; used when compaction reclaims tombstones.
    pub fn remove(&mut self, slot: Slot) {
        if let Some(entry) = self.map.remove(&slot) {
            if entry.live {
                self.live -= 1;
            }
        }
    }

    pub fn get(&self, slot: Slot) -> Option<&[f32]> {
        self.map.get(&slot).map(|entry| entry.data.as_ref())
    }

    pub fn is_live(&self, slot: Slot) -> bool {
        self.map.get(&slot).map_or(false, |entry| entry.live)
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn iter_live(&self) -> impl Iterator<Item = (Slot, &[f32])> {
        self.map
            .iter()
            .filter(|(_, entry)| entry.live)
            .map(|(slot, entry)| (*slot, entry.data.as_ref()))
    }

    pub fn live_slots_sorted(&self) -> Vec<Slot> {
        let mut slots: Vec<Slot> = self
            .map
            .iter()
            .filter(|(_, entry)| entry.live)
            .map(|(slot, _)| *slot)
            .collect();
        slots.sort_unstable();
        slots
    }
}

/// One scored index result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub slot: Slot,
    pub distance: f32,
}

#[derive(PartialEq, Eq)]
struct TopKEntry(OrderedFloat<f32>, Slot);

impl Ord for TopKEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0).then(self.1.cmp(&other.1))
    }
}

impl PartialOrd for TopKEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Bounded accumulator of the `k` best candidates under the deterministic
/// ordering: smaller distance wins, exact ties go to the smaller slot.
pub struct TopK {
    k: usize,
    heap: BinaryHeap<TopKEntry>,
}

impl TopK {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    pub fn push(&mut self, candidate: Candidate) {
        let entry = TopKEntry(OrderedFloat(candidate.distance), candidate.slot);
        if self.heap.len() < self.k {
            self.heap.push(entry);
        } else if let Some(worst) = self.heap.peek() {
            if entry < *worst {
                self.heap.pop();
                self.heap.push(entry);
            }
        }
    }

    pub fn into_sorted(self) -> Vec<Candidate> {
        let mut entries = self.heap.into_sorted_vec();
        entries.truncate(self.k);
        entries
            .into_iter()
            .map(|TopKEntry(distance, slot)| Candidate {
                slot,
                distance: distance.into_inner(),
            })
            .collect()
    }
}

/// Uniform operation surface over the two index kinds.
pub enum CollectionIndex {
    Flat(FlatIndex),
    Hnsw(HnswIndex),
}

impl CollectionIndex {
    pub fn insert(&mut self, slot: Slot, vectors: &VectorSet) -> Result<()> {
        match self {
            CollectionIndex::Flat(_) => Ok(()),
            CollectionIndex::Hnsw(index) => index.insert(slot, vectors),
        }
    }

    /// Soft delete. The HNSW graph keeps its edges and skips the slot at
    /// yield time; liveness is tracked by the [`VectorSet`].
    pub fn remove(&mut self, _slot: Slot) {}

    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        ef_search: usize,
        vectors: &VectorSet,
        token: &CancelToken,
    ) -> Result<Vec<Candidate>> {
        match self {
            CollectionIndex::Flat(index) => index.search(query, k, vectors, token),
            CollectionIndex::Hnsw(index) => index.search(query, k, ef_search, vectors, token),
        }
    }

    /// Stages dirty index state into the page cache without a durability
    /// barrier. Flat keeps no state beyond the store itself.
    pub fn persist(&mut self) -> Result<()> {
        match self {
            CollectionIndex::Flat(_) => Ok(()),
            CollectionIndex::Hnsw(index) => index.persist_dirty(),
        }
    }

    /// Shared pager handle for the fsync phase, when this index has one.
    pub fn pager_handle(&self) -> Option<std::sync::Arc<crate::pager::Pager>> {
        match self {
            CollectionIndex::Flat(_) => None,
            CollectionIndex::Hnsw(index) => Some(index.pager_handle()),
        }
    }

    /// Entry point and top level to record in the collection meta page.
    pub fn hnsw_meta(&self) -> Option<(Option<Slot>, u8)> {
        match self {
            CollectionIndex::Flat(_) => None,
            CollectionIndex::Hnsw(index) => Some((index.entry_point(), index.top_level())),
        }
    }
}

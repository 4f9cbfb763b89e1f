//! Hierarchical navigable small-world graph.
//!
//! Nodes live in a slot-indexed table; edges are slot ids, never references,
//! which keeps the cyclic graph trivially persistable. Levels are drawn from
//! a ChaCha8 PRNG seeded per slot so a rebuild of the same data produces the
//! same graph. Deletion is soft: the graph keeps its edges and traversal
//! passes through dead slots without yielding them; compaction rebuilds.
//!
//! Persistence serializes dirty nodes into `index.data` page chains; the
//! entry point and top level are recorded in the collection meta page by the
//! layer above. A load that trips over damaged pages makes the caller
//! rebuild the graph from the vector store.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use ordered_float::OrderedFloat;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::codec::{self, HnswNodeWire};
use crate::distance::Metric;
use crate::error::{CorruptionKind, Result, VettoreError};
use crate::index::{Candidate, TopK, VectorSet};
use crate::model::HnswParams;
use crate::pager::Pager;
use crate::types::{PageId, PageKind, Slot};

type NeighborList = SmallVec<[Slot; 16]>;
type Scored = (OrderedFloat<f32>, Slot);

struct HnswNode {
    /// `neighbors[l]` is the level-`l` list; the node's level is the last index.
    neighbors: Vec<NeighborList>,
}

impl HnswNode {
    fn level(&self) -> u8 {
        (self.neighbors.len() - 1) as u8
    }
}

pub struct HnswIndex {
    metric: Metric,
    params: HnswParams,
    pager: Arc<Pager>,
    nodes: FxHashMap<Slot, HnswNode>,
    node_pages: FxHashMap<Slot, PageId>,
    dirty: FxHashSet<Slot>,
    entry: Option<Slot>,
    top_level: u8,
}

impl HnswIndex {
    pub fn new(metric: Metric, params: HnswParams, pager: Pager) -> Self {
        Self {
            metric,
            params,
            pager: Arc::new(pager),
            nodes: FxHashMap::default(),
            node_pages: FxHashMap::default(),
            dirty: FxHashSet::default(),
            entry: None,
            top_level: 0,
        }
    }

    /// Loads the persisted graph. Any validation failure is returned to the
    /// caller, whose recovery path is a rebuild from the vector store.
    pub fn load(
        metric: Metric,
        params: HnswParams,
        pager: Pager,
        vectors: &VectorSet,
        entry: Option<Slot>,
        top_level: u8,
    ) -> Result<Self> {
        let mut index = Self::new(metric, params, pager);
        let total = index.pager.page_count();
        for page_no in 1..total {
            let page_id = PageId(page_no);
            let page = index.pager.read(page_id)?;
            if page.header.kind != PageKind::HnswNode || !page.header.is_chain_head() {
                continue;
            }
            let bytes = index.pager.read_chain(page_id)?;
            let wire = codec::decode_hnsw_node(&bytes).map_err(|err| codec::at_page(err, page_id))?;
            if wire.neighbors.is_empty() || vectors.get(wire.slot).is_none() {
                return Err(VettoreError::corruption(page_id, CorruptionKind::BadState));
            }
            let node = HnswNode {
                neighbors: wire
                    .neighbors
                    .into_iter()
                    .map(NeighborList::from_vec)
                    .collect(),
            };
            index.nodes.insert(wire.slot, node);
            index.node_pages.insert(wire.slot, page_id);
        }
        index.entry = entry;
        index.top_level = top_level;
        index.check_consistency()?;
        debug!(nodes = index.nodes.len(), "hnsw graph loaded");
        Ok(index)
    }

    fn check_consistency(&self) -> Result<()> {
        let inconsistent = VettoreError::corruption(PageId(0), CorruptionKind::BadState);
        match self.entry {
            None if !self.nodes.is_empty() => return Err(inconsistent),
            Some(entry) if !self.nodes.contains_key(&entry) => return Err(inconsistent),
            _ => {}
        }
        for node in self.nodes.values() {
            for list in &node.neighbors {
                for neighbor in list {
                    if !self.nodes.contains_key(neighbor) {
                        return Err(VettoreError::corruption(
                            PageId(0),
                            CorruptionKind::BadState,
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Builds a fresh graph from every live vector, in slot order so the
    /// result is reproducible.
    pub fn rebuild(
        metric: Metric,
        params: HnswParams,
        pager: Pager,
        vectors: &VectorSet,
        token: &CancelToken,
    ) -> Result<Self> {
        let mut index = Self::new(metric, params, pager);
        let slots = vectors.live_slots_sorted();
        for slot in &slots {
            token.check()?;
            index.insert(*slot, vectors)?;
        }
        info!(nodes = slots.len(), "hnsw graph rebuilt");
        Ok(index)
    }

    pub fn entry_point(&self) -> Option<Slot> {
        self.entry
    }

    pub fn top_level(&self) -> u8 {
        self.top_level
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn assign_level(&self, slot: Slot) -> u8 {
        let mut rng = ChaCha8Rng::seed_from_u64(self.params.seed ^ slot.0);
        let uniform: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
        let level = (-uniform.ln() * self.params.ml()).floor();
        (level as u64).min(self.params.max_level as u64) as u8
    }

    fn bound_at(&self, level: u8) -> usize {
        if level == 0 {
            self.params.m0()
        } else {
            self.params.m
        }
    }

    /// One-hop greedy walk at a single level, deterministic under ties.
    fn greedy_descent(
        &self,
        query: &[f32],
        mut current: Scored,
        level: u8,
        vectors: &VectorSet,
    ) -> Scored {
        loop {
            let mut improved = false;
            let neighbors = self
                .nodes
                .get(&current.1)
                .and_then(|node| node.neighbors.get(level as usize));
            let Some(neighbors) = neighbors else {
                return current;
            };
            for &neighbor in neighbors {
                let Some(vector) = vectors.get(neighbor) else {
                    continue;
                };
                let distance = OrderedFloat(self.metric.distance(query, vector));
                if (distance, neighbor) < current {
                    current = (distance, neighbor);
                    improved = true;
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Best-first expansion at one level with a candidate list of size `ef`.
    /// Dead slots participate in navigation; callers filter them at yield.
    fn search_layer(
        &self,
        query: &[f32],
        entries: &[Scored],
        ef: usize,
        level: u8,
        vectors: &VectorSet,
        token: &CancelToken,
    ) -> Result<Vec<Scored>> {
        let mut visited: FxHashSet<Slot> = entries.iter().map(|&(_, slot)| slot).collect();
        let mut candidates: BinaryHeap<Reverse<Scored>> =
            entries.iter().map(|&scored| Reverse(scored)).collect();
        let mut best: BinaryHeap<Scored> = entries.iter().copied().collect();
        while best.len() > ef {
            best.pop();
        }
        while let Some(Reverse(current)) = candidates.pop() {
            token.check()?;
            if best.len() >= ef {
                if let Some(&worst) = best.peek() {
                    if current > worst {
                        break;
                    }
                }
            }
            let neighbors = self
                .nodes
                .get(&current.1)
                .and_then(|node| node.neighbors.get(level as usize));
            let Some(neighbors) = neighbors else {
                continue;
            };
            for &neighbor in neighbors {
                if !visited.insert(neighbor) {
                    continue;
                }
                let Some(vector) = vectors.get(neighbor) else {
                    continue;
                };
                let scored = (
                    OrderedFloat(self.metric.distance(query, vector)),
                    neighbor,
                );
                let admit = match best.peek() {
                    Some(&worst) if best.len() >= ef => scored < worst,
                    _ => true,
                };
                if admit {
                    candidates.push(Reverse(scored));
                    best.push(scored);
                    if best.len() > ef {
                        best.pop();
                    }
                }
            }
        }
        Ok(best.into_sorted_vec())
    }

    /// Greedy diversity selection: a candidate is kept only if every already
    /// chosen neighbor is at least as far from it as the query is. Leftover
    /// capacity is refilled with the nearest rejected candidates.
    fn select_diverse(
        &self,
        candidates: &[Scored],
        bound: usize,
        vectors: &VectorSet,
    ) -> NeighborList {
        let mut chosen = NeighborList::new();
        for &(distance, candidate) in candidates {
            if chosen.len() >= bound {
                break;
            }
            let Some(candidate_vec) = vectors.get(candidate) else {
                continue;
            };
            let diverse = chosen.iter().all(|&neighbor| match vectors.get(neighbor) {
                Some(neighbor_vec) => {
                    OrderedFloat(self.metric.distance(candidate_vec, neighbor_vec)) >= distance
                }
                None => true,
            });
            if diverse {
                chosen.push(candidate);
            }
        }
        if chosen.len() < bound {
            for &(_, candidate) in candidates {
                if chosen.len() >= bound {
                    break;
                }
                if !chosen.contains(&candidate) && vectors.get(candidate).is_some() {
                    chosen.push(candidate);
                }
            }
        }
        chosen
    }

    fn add_back_edge(&mut self, from: Slot, to: Slot, level: u8, vectors: &VectorSet) {
        let bound = self.bound_at(level);
        let overflow = {
            let Some(node) = self.nodes.get_mut(&from) else {
                return;
            };
            let Some(list) = node.neighbors.get_mut(level as usize) else {
                return;
            };
            if list.contains(&to) {
                return;
            }
            list.push(to);
            list.len() > bound
        };
        self.dirty.insert(from);
        if !overflow {
            return;
        }
        let Some(from_vec) = vectors.get(from) else {
            return;
        };
        let list: NeighborList = self
            .nodes
            .get(&from)
            .and_then(|node| node.neighbors.get(level as usize))
            .cloned()
            .unwrap_or_default();
        let mut rescored: Vec<Scored> = list
            .iter()
            .filter_map(|&slot| {
                vectors
                    .get(slot)
                    .map(|vector| (OrderedFloat(self.metric.distance(from_vec, vector)), slot))
            })
            .collect();
        rescored.sort_unstable();
        let pruned = self.select_diverse(&rescored, bound, vectors);
        if let Some(node) = self.nodes.get_mut(&from) {
            node.neighbors[level as usize] = pruned;
        }
    }

    /// Links one new slot into the graph. The slot's vector must already be
    /// resident in `vectors`.
    pub fn insert(&mut self, slot: Slot, vectors: &VectorSet) -> Result<()> {
        let query = vectors
            .get(slot)
            .ok_or(VettoreError::NotFound("vector for slot"))?;
        let level = self.assign_level(slot);
        let mut node = HnswNode {
            neighbors: vec![NeighborList::new(); level as usize + 1],
        };
        let Some(entry) = self.entry else {
            self.nodes.insert(slot, node);
            self.entry = Some(slot);
            self.top_level = level;
            self.dirty.insert(slot);
            return Ok(());
        };
        let entry_vec = vectors
            .get(entry)
            .ok_or(VettoreError::NotFound("entry point vector"))?;
        let mut current = (OrderedFloat(self.metric.distance(query, entry_vec)), entry);
        if self.top_level > level {
            for descent_level in ((level + 1)..=self.top_level).rev() {
                current = self.greedy_descent(query, current, descent_level, vectors);
            }
        }
        let token = CancelToken::new();
        let mut entries = vec![current];
        for link_level in (0..=level.min(self.top_level)).rev() {
            let found = self.search_layer(
                query,
                &entries,
                self.params.ef_construction,
                link_level,
                vectors,
                &token,
            )?;
            let selected = self.select_diverse(&found, self.bound_at(link_level), vectors);
            for &neighbor in &selected {
                self.add_back_edge(neighbor, slot, link_level, vectors);
            }
            node.neighbors[link_level as usize] = selected;
            entries = found;
        }
        self.nodes.insert(slot, node);
        if level > self.top_level {
            self.top_level = level;
            self.entry = Some(slot);
        }
        self.dirty.insert(slot);
        Ok(())
    }

    /// Approximate top-`k`: greedy descent to level 1, then a best-first
    /// sweep of level 0 sized `max(ef, k)`. Dead slots are skipped at yield.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        ef_search: usize,
        vectors: &VectorSet,
        token: &CancelToken,
    ) -> Result<Vec<Candidate>> {
        let Some(entry) = self.entry else {
            return Ok(Vec::new());
        };
        let Some(entry_vec) = vectors.get(entry) else {
            return Ok(Vec::new());
        };
        let mut current = (OrderedFloat(self.metric.distance(query, entry_vec)), entry);
        for level in (1..=self.top_level).rev() {
            token.check()?;
            current = self.greedy_descent(query, current, level, vectors);
        }
        let ef = ef_search.max(k);
        let found = self.search_layer(query, &[current], ef, 0, vectors, token)?;
        let mut top = TopK::new(k);
        for (distance, slot) in found {
            if vectors.is_live(slot) {
                top.push(Candidate {
                    slot,
                    distance: distance.into_inner(),
                });
            }
        }
        Ok(top.into_sorted())
    }

    /// Encodes dirty nodes into their page chains. Rewritten nodes free the
    /// old chain first so pages recycle. No fsync happens here; callers sync
    /// the pager outside the collection write lock.
    pub fn persist_dirty(&mut self) -> Result<()> {
        let mut slots: Vec<Slot> = self.dirty.iter().copied().collect();
        slots.sort_unstable();
        for slot in &slots {
            let Some(node) = self.nodes.get(slot) else {
                continue;
            };
            let wire = HnswNodeWire {
                slot: *slot,
                neighbors: node.neighbors.iter().map(|list| list.to_vec()).collect(),
            };
            let bytes = codec::encode_hnsw_node(&wire);
            if let Some(old_head) = self.node_pages.remove(slot) {
                self.pager.free_chain(old_head)?;
            }
            let head = self.pager.write_chain(PageKind::HnswNode, &bytes)?;
            self.node_pages.insert(*slot, head);
        }
        self.dirty.clear();
        Ok(())
    }

    /// Persists dirty nodes and issues the durability barrier.
    pub fn sync(&mut self) -> Result<()> {
        self.persist_dirty()?;
        self.pager.sync()
    }

    pub fn pager(&self) -> &Pager {
        &self.pager
    }

    /// Shared handle used to sync outside the collection lock.
    pub fn pager_handle(&self) -> Arc<Pager> {
        Arc::clone(&self.pager)
    }
}
